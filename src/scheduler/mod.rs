//! # Scheduler
//!
//! Holds the crawl frontier: a priority queue of pending requests and the
//! duplicate filter, guarded together by a single lock so an enqueue is
//! linearizable: the filter check and the push happen as one step.
//!
//! The queue pops the highest priority first; ties are broken by arrival
//! order, FIFO or LIFO depending on the `SCHEDULER_QUEUE` setting. Requests
//! flagged `dont_filter` bypass the dupe filter entirely (retries rely on
//! this).

pub mod dupefilter;
pub mod queue;

pub use dupefilter::{fingerprint, request_fingerprint, DupeFilter};
pub use queue::{PriorityQueue, TieBreak};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::request::Request;
use crate::settings::Settings;
use crate::stats::Stats;

struct SchedulerInner {
    queue: PriorityQueue<Request>,
    filter: DupeFilter,
}

pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    filter_enabled: bool,
    stats: Arc<Stats>,
}

impl Scheduler {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        let tie_break = match settings.get_str("SCHEDULER_QUEUE", "lifo").as_str() {
            "fifo" => TieBreak::Fifo,
            _ => TieBreak::Lifo,
        };
        Scheduler {
            inner: Mutex::new(SchedulerInner {
                queue: PriorityQueue::new(tie_break),
                filter: DupeFilter::new(Arc::clone(&stats)),
            }),
            filter_enabled: settings.get_bool("DUPE_FILTER_ENABLED", true),
            stats,
        }
    }

    /// Enqueue a request unless the dupe filter has already seen it.
    /// Returns whether the request was accepted.
    pub fn enqueue_request(&self, request: Request) -> bool {
        let mut inner = self.inner.lock();
        if self.filter_enabled && !request.dont_filter && inner.filter.request_seen(&request) {
            inner.filter.log_filtered(&request);
            return false;
        }
        debug!(url = %request.url, priority = request.priority, "request enqueued");
        let priority = request.priority;
        inner.queue.push(request, priority);
        self.stats.inc_value("scheduler/enqueued", 1, 0);
        true
    }

    /// Pop the highest-priority pending request.
    pub fn next_request(&self) -> Option<Request> {
        let request = self.inner.lock().queue.pop()?;
        self.stats.inc_value("scheduler/dequeued", 1, 0);
        debug!(url = %request.url, priority = request.priority, "request dequeued");
        Some(request)
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.inner.lock().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let inner = self.inner.lock();
        debug!(
            pending = inner.queue.len(),
            seen = inner.filter.len(),
            "scheduler closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler_with(settings: &Settings) -> (Scheduler, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        (Scheduler::new(settings, Arc::clone(&stats)), stats)
    }

    #[test]
    fn duplicate_requests_are_filtered() {
        let settings = Settings::with_defaults();
        let (scheduler, stats) = scheduler_with(&settings);

        assert!(scheduler.enqueue_request(Request::parse("https://example.com/").unwrap()));
        assert!(!scheduler.enqueue_request(Request::parse("https://example.com/").unwrap()));

        assert_eq!(stats.get_int("scheduler/enqueued", 0), 1);
        assert_eq!(stats.get_int("dupefilter/filtered", 0), 1);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn dont_filter_bypasses_the_filter() {
        let settings = Settings::with_defaults();
        let (scheduler, _) = scheduler_with(&settings);

        assert!(scheduler.enqueue_request(Request::parse("https://example.com/").unwrap()));
        assert!(scheduler.enqueue_request(
            Request::parse("https://example.com/")
                .unwrap()
                .with_dont_filter(true)
        ));
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn disabled_filter_accepts_duplicates() {
        let settings = Settings::with_defaults();
        settings.set("DUPE_FILTER_ENABLED", false);
        let (scheduler, stats) = scheduler_with(&settings);

        assert!(scheduler.enqueue_request(Request::parse("https://example.com/").unwrap()));
        assert!(scheduler.enqueue_request(Request::parse("https://example.com/").unwrap()));
        assert_eq!(stats.get_int("dupefilter/filtered", 0), 0);
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let settings = Settings::with_defaults();
        settings.set("SCHEDULER_QUEUE", "fifo");
        let (scheduler, _) = scheduler_with(&settings);

        for (path, priority) in [("a", 0), ("b", 5), ("c", 0), ("d", 5)] {
            let url = format!("https://example.com/{path}");
            scheduler
                .enqueue_request(Request::parse(&url).unwrap().with_priority(priority));
        }

        let order: Vec<String> = std::iter::from_fn(|| scheduler.next_request())
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(order, vec!["/b", "/d", "/a", "/c"]);
        assert!(!scheduler.has_pending_requests());
    }
}
