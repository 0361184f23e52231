//! # Per-domain request slots
//!
//! Enforces the politeness contract: each domain gets its own slot with a
//! concurrency cap and a download delay, created lazily on the first request
//! to that domain and garbage-collected after a period of inactivity.
//!
//! The delay for a dispatch is sampled once per gap: when a slot has no
//! sampled delay it draws one (uniform in `[0.5, 1.5) × delay` when
//! `RANDOMIZE_DOWNLOAD_DELAY` is on, exactly `delay` otherwise) and holds it
//! until the next dispatch resets it. A slot with `concurrency <= 0` is
//! unlimited; a zero delay disables the gap check.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};

use crate::request::Request;
use crate::settings::Settings;

#[derive(Clone, Copy, Debug)]
struct SlotConfig {
    concurrency: i64,
    delay: Duration,
    randomize_delay: bool,
    max_queue_size: usize,
}

struct DomainSlot {
    config: SlotConfig,
    queue: VecDeque<Request>,
    active: i64,
    /// Nanoseconds since the manager epoch of the last dispatch. Zero means
    /// never dispatched.
    last_seen: u64,
    /// Delay sampled for the current gap, in nanoseconds. Zero means not
    /// yet sampled.
    last_delay: u64,
}

impl DomainSlot {
    fn new(config: SlotConfig) -> Self {
        DomainSlot {
            config,
            queue: VecDeque::new(),
            active: 0,
            last_seen: 0,
            last_delay: 0,
        }
    }

    fn sample_delay(&self) -> u64 {
        let base = self.config.delay.as_nanos() as u64;
        if self.config.randomize_delay && base > 0 {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
            (base as f64 * factor) as u64
        } else {
            base
        }
    }

    fn is_free(&self) -> bool {
        self.config.concurrency <= 0 || self.active < self.config.concurrency
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.active <= 0
    }

    fn is_queue_full(&self) -> bool {
        self.queue.len() >= self.config.max_queue_size
    }
}

pub struct RequestSlots {
    slots: Mutex<HashMap<String, DomainSlot>>,
    epoch: Instant,
    concurrent_requests: i64,
    defaults: SlotConfig,
    overrides: HashMap<String, SlotConfig>,
}

impl RequestSlots {
    pub fn new(settings: &Settings) -> Self {
        let concurrent_requests = settings.get_i64("CONCURRENT_REQUESTS", 16);
        let configured_queue_size =
            settings.get_i64("MAX_REQUEST_QUEUE_SIZE_PER_DOMAIN", concurrent_requests);
        let max_queue_size = if configured_queue_size <= 0 {
            16
        } else {
            configured_queue_size as usize
        };
        let defaults = SlotConfig {
            concurrency: settings.get_i64("CONCURRENT_REQUESTS_PER_DOMAIN", 1),
            delay: settings.get_duration_secs("DOWNLOAD_DELAY", 1.0),
            randomize_delay: settings.get_bool("RANDOMIZE_DOWNLOAD_DELAY", true),
            max_queue_size,
        };

        let mut overrides = HashMap::new();
        if let Some(serde_json::Value::Object(domains)) = settings.get("REQUEST_SLOTS") {
            for (domain, config) in domains {
                let concurrency = config
                    .get("concurrency")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(defaults.concurrency);
                let delay = config
                    .get("delay")
                    .and_then(|v| v.as_f64())
                    .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
                    .unwrap_or(defaults.delay);
                let randomize_delay = config
                    .get("randomize_delay")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(defaults.randomize_delay);
                let max_queue_size = if concurrency > 0 {
                    concurrency as usize
                } else {
                    max_queue_size
                };
                overrides.insert(
                    domain,
                    SlotConfig {
                        concurrency,
                        delay,
                        randomize_delay,
                        max_queue_size,
                    },
                );
            }
        }

        RequestSlots {
            slots: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            concurrent_requests,
            defaults,
            overrides,
        }
    }

    fn now_nanos(&self) -> u64 {
        // Offset by one so a dispatch at the very first instant still gets a
        // non-zero last_seen.
        self.epoch.elapsed().as_nanos() as u64 + 1
    }

    fn config_for(&self, domain: &str) -> SlotConfig {
        self.overrides.get(domain).copied().unwrap_or(self.defaults)
    }

    /// Queue a request in its domain slot, creating the slot on first use.
    pub fn push(&self, request: Request) {
        let domain = request.domain();
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(domain.clone())
            .or_insert_with(|| DomainSlot::new(self.config_for(&domain)));
        trace!(domain = %domain, queued = slot.queue.len() + 1, "request queued in domain slot");
        slot.queue.push_back(request);
    }

    /// Every request eligible for dispatch right now, across all slots.
    /// Dispatching updates the slot's pacing bookkeeping.
    pub fn pop(&self) -> Vec<Request> {
        let now = self.now_nanos();
        let mut popped = Vec::new();
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            if slot.last_delay == 0 {
                slot.last_delay = slot.sample_delay();
            }
            // last_seen == 0 means the slot has never dispatched; the gap
            // check only applies between dispatches.
            if !slot.config.delay.is_zero()
                && slot.last_seen > 0
                && now < slot.last_seen + slot.last_delay
            {
                continue;
            }
            if slot.is_free() {
                if let Some(request) = slot.queue.pop_front() {
                    slot.active += 1;
                    slot.last_seen = now;
                    slot.last_delay = 0;
                    popped.push(request);
                }
            }
        }
        popped
    }

    /// Release the concurrency token a dispatched request held.
    pub fn finish(&self, request: &Request) {
        let domain = request.domain();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&domain) {
            slot.active -= 1;
        }
    }

    /// Drop slots that have been idle longer than `age`.
    pub fn clear(&self, age: Duration) {
        let now = self.now_nanos();
        let age = age.as_nanos() as u64;
        let mut slots = self.slots.lock();
        slots.retain(|domain, slot| {
            let idle = slot.active <= 0
                && slot.queue.is_empty()
                && slot.last_seen + slot.config.delay.as_nanos() as u64 + age < now;
            if idle {
                debug!(domain = %domain, "idle domain slot removed");
            }
            !idle
        });
    }

    /// True when the global active total is under the cap, at least one
    /// non-empty slot has capacity, and no slot's queue is over-full.
    pub fn is_free(&self) -> bool {
        let slots = self.slots.lock();
        if self.concurrent_requests > 0 {
            let active: i64 = slots.values().map(|s| s.active).sum();
            if active >= self.concurrent_requests {
                return false;
            }
        }
        if slots.values().any(|s| s.is_queue_full()) {
            return false;
        }
        slots.values().any(|s| s.is_free() && !s.is_empty())
    }

    /// No slot has queued or in-flight requests.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().values().all(|s| s.is_empty())
    }

    pub fn active_total(&self) -> i64 {
        self.slots.lock().values().map(|s| s.active).sum()
    }

    pub fn close(&self) {
        let slots = self.slots.lock();
        debug!(domains = slots.len(), "request slots closed");
    }
}
