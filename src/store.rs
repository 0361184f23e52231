//! Optional request persistence.
//!
//! A [`RequestStore`] lets a crawl be seeded from (and reconciled against)
//! an external request table. The engine core never touches one directly;
//! the adapter is a collaborator the embedding application wires in, e.g.
//! by feeding [`store_starts`] to the spider as its starter stream.
//!
//! Statuses: 0 pending, 1 running, 2 done, 3 dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream;
use parking_lot::Mutex;

use crate::error::CrawlError;
use crate::request::Request;
use crate::scheduler::fingerprint;
use crate::spider::{ResultStream, SpiderYield};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreStatus {
    Pending = 0,
    Running = 1,
    Done = 2,
    Dropped = 3,
}

pub trait RequestStore: Send + Sync {
    /// Persist a request; returns its row id.
    fn add(&self, request: &Request) -> Result<u64, CrawlError>;

    /// Claim the oldest pending request, marking it running. The returned
    /// request carries its row id under the `request_store_id` context key.
    fn pop(&self) -> Result<Option<Request>, CrawlError>;

    fn done(&self, request: &Request) -> Result<(), CrawlError>;

    fn drop_request(&self, request: &Request) -> Result<(), CrawlError>;

    /// Move every row with status `from` to status `to`.
    fn set_status(&self, from: StoreStatus, to: StoreStatus) -> Result<(), CrawlError>;
}

/// Starter stream draining a store: pops pending requests until the store
/// runs dry. With `reset_running`, rows left running by a previous crash are
/// first returned to pending.
pub fn store_starts(store: Arc<dyn RequestStore>, reset_running: bool) -> ResultStream {
    if reset_running {
        if let Err(error) = store.set_status(StoreStatus::Running, StoreStatus::Pending) {
            tracing::error!(error = %error, "failed to reset running requests");
        }
    }
    Box::pin(stream::unfold(store, |store| async move {
        match store.pop() {
            Ok(Some(request)) => Some((SpiderYield::Request(request), store)),
            Ok(None) => None,
            Err(error) => {
                tracing::error!(error = %error, "request store pop failed");
                None
            }
        }
    }))
}

struct StoredRequest {
    id: u64,
    dict: serde_json::Value,
    fingerprint: String,
    status: StoreStatus,
}

/// In-memory store, mostly for tests and small resumable crawls.
#[derive(Default)]
pub struct MemoryRequestStore {
    rows: Mutex<Vec<StoredRequest>>,
    next_id: AtomicU64,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        MemoryRequestStore {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn status_of(&self, id: u64) -> Option<StoreStatus> {
        self.rows
            .lock()
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.status)
    }

    pub fn fingerprint_of(&self, id: u64) -> Option<String> {
        self.rows
            .lock()
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.fingerprint.clone())
    }

    fn update_by_ctx_id(&self, request: &Request, status: StoreStatus) -> Result<(), CrawlError> {
        let id = request.ctx.get_i64_or("request_store_id", -1);
        if id < 0 {
            return Err(CrawlError::Config(
                "request carries no request_store_id".to_string(),
            ));
        }
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|row| row.id == id as u64) {
            Some(row) => {
                row.status = status;
                Ok(())
            }
            None => Err(CrawlError::Config(format!("no stored request with id {id}"))),
        }
    }
}

impl RequestStore for MemoryRequestStore {
    fn add(&self, request: &Request) -> Result<u64, CrawlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rows.lock().push(StoredRequest {
            id,
            dict: request.to_dict(),
            fingerprint: fingerprint(request),
            status: StoreStatus::Pending,
        });
        Ok(id)
    }

    fn pop(&self) -> Result<Option<Request>, CrawlError> {
        let mut rows = self.rows.lock();
        let Some(row) = rows
            .iter_mut()
            .find(|row| row.status == StoreStatus::Pending)
        else {
            return Ok(None);
        };
        row.status = StoreStatus::Running;
        let request = Request::from_dict(&row.dict)?;
        request.ctx.set("request_store_id", row.id as i64);
        Ok(Some(request))
    }

    fn done(&self, request: &Request) -> Result<(), CrawlError> {
        self.update_by_ctx_id(request, StoreStatus::Done)
    }

    fn drop_request(&self, request: &Request) -> Result<(), CrawlError> {
        self.update_by_ctx_id(request, StoreStatus::Dropped)
    }

    fn set_status(&self, from: StoreStatus, to: StoreStatus) -> Result<(), CrawlError> {
        for row in self.rows.lock().iter_mut() {
            if row.status == from {
                row.status = to;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn pop_claims_pending_rows_in_order() {
        let store = MemoryRequestStore::new();
        let a = store
            .add(&Request::parse("https://example.com/a").unwrap())
            .unwrap();
        store
            .add(&Request::parse("https://example.com/b").unwrap())
            .unwrap();

        let popped = store.pop().unwrap().unwrap();
        assert_eq!(popped.url.path(), "/a");
        assert_eq!(store.status_of(a), Some(StoreStatus::Running));
        assert_eq!(store.fingerprint_of(a).unwrap().len(), 40);

        store.done(&popped).unwrap();
        assert_eq!(store.status_of(a), Some(StoreStatus::Done));
    }

    #[test]
    fn set_status_moves_whole_classes() {
        let store = MemoryRequestStore::new();
        let id = store
            .add(&Request::parse("https://example.com/a").unwrap())
            .unwrap();
        store.pop().unwrap();
        assert_eq!(store.status_of(id), Some(StoreStatus::Running));

        store
            .set_status(StoreStatus::Running, StoreStatus::Pending)
            .unwrap();
        assert_eq!(store.status_of(id), Some(StoreStatus::Pending));
    }

    #[tokio::test]
    async fn starts_stream_drains_the_store() {
        let store = Arc::new(MemoryRequestStore::new());
        for path in ["a", "b", "c"] {
            store
                .add(&Request::parse(&format!("https://example.com/{path}")).unwrap())
                .unwrap();
        }

        let yields: Vec<SpiderYield> = store_starts(Arc::clone(&store) as _, false).collect().await;
        assert_eq!(yields.len(), 3);
        assert!(store.pop().unwrap().is_none(), "store drained");
    }
}
