//! Extensions: optional components that observe the crawl through signals
//! without sitting in the data path. Built from the `EXTENSIONS` order map;
//! the order value doubles as the signal-subscription index, so an
//! extension can deliberately run before or after the engine's own
//! handlers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::CrawlError;
use crate::registry::Registry;
use crate::settings::Settings;
use crate::signal::{Signal, SignalKind, SignalManager, SignalPayload};
use crate::stats::Stats;

pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subscribe to whatever signals the extension cares about, at the
    /// given index.
    fn connect_signals(self: Arc<Self>, signals: &Arc<SignalManager>, index: i64);

    fn close(&self) {}
}

pub fn register_builtins(registry: &mut Registry) {
    registry
        .register_extension("core_stats", |_, stats| Arc::new(CoreStatsExtension::new(stats)))
        .expect("builtin registered twice");
    registry
        .register_extension("log_stats", |s, stats| Arc::new(LogStatsExtension::new(s, stats)))
        .expect("builtin registered twice");
}

pub struct ExtensionManager {
    extensions: Vec<(Arc<dyn Extension>, i64)>,
}

impl ExtensionManager {
    pub fn from_settings(
        settings: &Settings,
        stats: &Arc<Stats>,
        registry: &Registry,
    ) -> Result<Self, CrawlError> {
        let mut extensions = Vec::new();
        for (name, order) in settings.get_merged_order_map("EXTENSIONS") {
            let ctor = registry
                .extension(&name)
                .ok_or_else(|| CrawlError::Config(format!("unknown extension {name:?}")))?;
            extensions.push((ctor(settings, Arc::clone(stats)), order));
        }
        debug!(count = extensions.len(), "extensions built");
        Ok(ExtensionManager { extensions })
    }

    pub fn connect_all(&self, signals: &Arc<SignalManager>) {
        for (extension, order) in &self.extensions {
            Arc::clone(extension).connect_signals(signals, *order);
        }
    }

    pub fn close(&self) {
        for (extension, _) in &self.extensions {
            extension.close();
        }
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Records the core run metrics: start/finish times, finish reason, scraped
/// and dropped item counts, received response count.
pub struct CoreStatsExtension {
    stats: Arc<Stats>,
    start_time: AtomicI64,
}

impl CoreStatsExtension {
    pub fn new(stats: Arc<Stats>) -> Self {
        CoreStatsExtension {
            stats,
            start_time: AtomicI64::new(0),
        }
    }
}

impl Extension for CoreStatsExtension {
    fn name(&self) -> &'static str {
        "core_stats"
    }

    fn connect_signals(self: Arc<Self>, signals: &Arc<SignalManager>, index: i64) {
        let ext = Arc::clone(&self);
        signals.connect(SignalKind::SpiderOpened, index, move |_| {
            let ext = Arc::clone(&ext);
            async move {
                let now = unix_nanos();
                ext.start_time.store(now, Ordering::SeqCst);
                ext.stats.set_value("start_time", now);
                Ok(())
            }
        });

        let ext = Arc::clone(&self);
        signals.connect(SignalKind::SpiderClosed, index, move |signal: Signal| {
            let ext = Arc::clone(&ext);
            async move {
                if let SignalPayload::SpiderClosed { reason } = &signal.payload {
                    let finish = unix_nanos();
                    let start = ext.start_time.load(Ordering::SeqCst);
                    ext.stats.set_value("finish_time", finish);
                    ext.stats.set_value("finish_reason", reason.clone());
                    ext.stats.set_value(
                        "elapsed_time_seconds",
                        (finish - start) as f64 / 1_000_000_000.0,
                    );
                }
                Ok(())
            }
        });

        let ext = Arc::clone(&self);
        signals.connect(SignalKind::ItemScraped, index, move |_| {
            let ext = Arc::clone(&ext);
            async move {
                ext.stats.inc_value("item_scraped_count", 1, 0);
                Ok(())
            }
        });

        let ext = Arc::clone(&self);
        signals.connect(SignalKind::ItemDropped, index, move |signal: Signal| {
            let ext = Arc::clone(&ext);
            async move {
                ext.stats.inc_value("item_dropped_count", 1, 0);
                if let SignalPayload::ItemDropped { error, .. } = &signal.payload {
                    ext.stats.inc_value(
                        &format!("item_dropped_count/{}", error.reason()),
                        1,
                        0,
                    );
                }
                Ok(())
            }
        });

        let ext = self;
        signals.connect(SignalKind::ResponseLeftDownloader, index, move |_| {
            let ext = Arc::clone(&ext);
            async move {
                ext.stats.inc_value("response_received_count", 1, 0);
                Ok(())
            }
        });
    }
}

/// Logs a crawl-rate line every `LOG_STATS_INTERVAL` seconds and records
/// the final per-minute rates when the spider closes.
pub struct LogStatsExtension {
    stats: Arc<Stats>,
    interval: Duration,
    multiplier: f64,
    prev: Mutex<(i64, i64)>,
    quit: Mutex<Option<watch::Sender<bool>>>,
}

impl LogStatsExtension {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        let secs = settings.get_f64("LOG_STATS_INTERVAL", 60.0).max(0.001);
        LogStatsExtension {
            stats,
            interval: Duration::from_secs_f64(secs),
            multiplier: 60.0 / secs,
            prev: Mutex::new((0, 0)),
            quit: Mutex::new(None),
        }
    }

    fn log_rates(&self) {
        let pages = self.stats.get_int("response_received_count", 0);
        let items = self.stats.get_int("item_scraped_count", 0);
        let (prev_pages, prev_items) = {
            let mut prev = self.prev.lock();
            let out = *prev;
            *prev = (pages, items);
            out
        };
        let page_rate = (pages - prev_pages) as f64 * self.multiplier;
        let item_rate = (items - prev_items) as f64 * self.multiplier;
        info!(
            "Crawled {pages} pages (at {page_rate:.2} pages/min), \
             scraped {items} items (at {item_rate:.2} items/min)"
        );
    }

    fn record_final_rates(&self) {
        let start = self.stats.get_int("start_time", 0);
        let finish = self.stats.get_int("finish_time", 0);
        if finish == 0 || finish <= start {
            return;
        }
        let mins = (finish - start) as f64 / 1_000_000_000.0 / 60.0;
        self.stats.set_value(
            "responses_per_minute",
            self.stats.get_float("response_received_count", 0.0) / mins,
        );
        self.stats.set_value(
            "items_per_minute",
            self.stats.get_float("item_scraped_count", 0.0) / mins,
        );
    }
}

impl Extension for LogStatsExtension {
    fn name(&self) -> &'static str {
        "log_stats"
    }

    fn connect_signals(self: Arc<Self>, signals: &Arc<SignalManager>, index: i64) {
        let ext = Arc::clone(&self);
        signals.connect(SignalKind::SpiderOpened, index, move |_| {
            let ext = Arc::clone(&ext);
            async move {
                let (quit_tx, mut quit_rx) = watch::channel(false);
                *ext.quit.lock() = Some(quit_tx);
                let ext_task = Arc::clone(&ext);
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(ext_task.interval) => ext_task.log_rates(),
                            changed = quit_rx.changed() => {
                                if changed.is_err() || *quit_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                });
                Ok(())
            }
        });

        let ext = self;
        signals.connect(SignalKind::SpiderClosed, index, move |_| {
            let ext = Arc::clone(&ext);
            async move {
                ext.record_final_rates();
                if let Some(quit) = ext.quit.lock().take() {
                    let _ = quit.send(true);
                }
                Ok(())
            }
        });
    }

    fn close(&self) {
        if let Some(quit) = self.quit.lock().take() {
            let _ = quit.send(true);
        }
    }
}
