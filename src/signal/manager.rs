//! Priority-ordered pub/sub with completion tracking.
//!
//! Receivers subscribe to a [`SignalKind`] with an index: smaller indices
//! run first, receivers sharing an index run concurrently, and different
//! indices run strictly one group after another. A receiver may abort the
//! remaining groups of the signal it is handling by returning [`DropSignal`].
//!
//! The manager counts every accepted emission and every completed dispatch;
//! [`SignalManager::is_all_done`] is the engine's idle test.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use kanal::{AsyncReceiver, AsyncSender};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, trace};

use crate::settings::Settings;
use crate::signal::{Sender, Signal, SignalKind};
use crate::stats::Stats;

/// Sentinel returned by a receiver to abort the remaining index groups of
/// the signal being dispatched.
#[derive(Debug, Clone, Copy)]
pub struct DropSignal;

/// Handle returned by `connect`, used to disconnect by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverId(u64);

type ReceiverFn = Arc<dyn Fn(Signal) -> BoxFuture<'static, Result<(), DropSignal>> + Send + Sync>;

struct ReceiverEntry {
    id: u64,
    index: i64,
    senders: Vec<Sender>,
    receiver: ReceiverFn,
}

pub struct SignalManager {
    tx: AsyncSender<Signal>,
    rx: Mutex<Option<AsyncReceiver<Signal>>>,
    receivers: RwLock<HashMap<SignalKind, Vec<ReceiverEntry>>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
    completed: AtomicU64,
    running: AtomicBool,
    verbose_stats: bool,
    stats: Arc<Stats>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SignalManager {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        let (tx, rx) = kanal::unbounded_async();
        SignalManager {
            tx,
            rx: Mutex::new(Some(rx)),
            receivers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            emitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            verbose_stats: settings.get_bool("SIGNAL_VERBOSE_STATS", false),
            stats,
            loop_handle: Mutex::new(None),
        }
    }

    /// Register a receiver for `kind` at `index`.
    pub fn connect<F, Fut>(&self, kind: SignalKind, index: i64, receiver: F) -> ReceiverId
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DropSignal>> + Send + 'static,
    {
        self.connect_filtered(kind, index, &[], receiver)
    }

    /// Register a receiver that only sees signals from the given senders.
    /// An empty filter matches every sender.
    pub fn connect_filtered<F, Fut>(
        &self,
        kind: SignalKind,
        index: i64,
        senders: &[Sender],
        receiver: F,
    ) -> ReceiverId
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DropSignal>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver: ReceiverFn = Arc::new(move |signal| Box::pin(receiver(signal)));
        self.receivers
            .write()
            .entry(kind)
            .or_default()
            .push(ReceiverEntry {
                id,
                index,
                senders: senders.to_vec(),
                receiver,
            });
        ReceiverId(id)
    }

    /// Remove a receiver. Returns whether something was removed.
    pub fn disconnect(&self, id: ReceiverId, kind: SignalKind) -> bool {
        let mut receivers = self.receivers.write();
        if let Some(entries) = receivers.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|entry| entry.id != id.0);
            if entries.is_empty() {
                receivers.remove(&kind);
                return before > 0;
            }
            return entries.len() < before;
        }
        false
    }

    pub fn disconnect_all(&self) {
        self.receivers.write().clear();
    }

    /// Queue a signal for dispatch. Dropped silently when the manager is not
    /// running.
    pub async fn emit(&self, signal: Signal) {
        if !self.running.load(Ordering::SeqCst) {
            trace!(kind = signal.kind().as_str(), "signal dropped, manager not running");
            return;
        }
        self.emitted.fetch_add(1, Ordering::SeqCst);
        self.stats.inc_value("signal_manager/total/add", 1, 0);
        if self.verbose_stats {
            self.stats
                .inc_value(&format!("signal_manager/{}/add", signal.kind().as_str()), 1, 0);
        }
        if self.tx.send(signal).await.is_err() {
            // Closed between the running check and the send; rebalance.
            self.mark_done_without_kind();
        }
    }

    /// True when no emission is awaiting or undergoing dispatch.
    pub fn is_all_done(&self) -> bool {
        self.completed.load(Ordering::SeqCst) == self.emitted.load(Ordering::SeqCst)
    }

    /// Launch the dispatch loop. Must be called before the first emit.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Ok(signal) = rx.recv().await {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.dispatch(signal).await;
                });
            }
            trace!("signal dispatch loop finished");
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop accepting signals and wait until every in-flight dispatch has
    /// finished.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.tx.close();
        if let Some(handle) = self.loop_handle.lock().take() {
            let _ = handle.await;
        }
        while !self.is_all_done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        debug!("signal manager closed");
    }

    async fn dispatch(self: Arc<Self>, signal: Signal) {
        let kind = signal.kind();
        trace!(kind = kind.as_str(), sender = ?signal.sender, "dispatching signal");

        let groups: BTreeMap<i64, Vec<(Vec<Sender>, ReceiverFn)>> = {
            let receivers = self.receivers.read();
            let mut groups: BTreeMap<i64, Vec<(Vec<Sender>, ReceiverFn)>> = BTreeMap::new();
            if let Some(entries) = receivers.get(&kind) {
                for entry in entries {
                    groups
                        .entry(entry.index)
                        .or_default()
                        .push((entry.senders.clone(), Arc::clone(&entry.receiver)));
                }
            }
            groups
        };

        for (_, group) in groups {
            let aborted = Arc::new(AtomicBool::new(false));
            let mut tasks = JoinSet::new();
            for (senders, receiver) in group {
                if !senders.is_empty() && !senders.contains(&signal.sender) {
                    continue;
                }
                let signal = signal.clone();
                let aborted = Arc::clone(&aborted);
                tasks.spawn(async move {
                    if receiver(signal).await.is_err() {
                        aborted.store(true, Ordering::SeqCst);
                    }
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    error!(kind = kind.as_str(), error = %err, "signal receiver panicked");
                }
            }
            if aborted.load(Ordering::SeqCst) {
                debug!(kind = kind.as_str(), "signal dropped by receiver");
                break;
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        self.stats.inc_value("signal_manager/total/done", 1, 0);
        if self.verbose_stats {
            self.stats
                .inc_value(&format!("signal_manager/{}/done", kind.as_str()), 1, 0);
        }
    }

    fn mark_done_without_kind(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.stats.inc_value("signal_manager/total/done", 1, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalPayload;
    use tokio::sync::Barrier;

    fn manager() -> Arc<SignalManager> {
        let settings = Settings::with_defaults();
        Arc::new(SignalManager::new(&settings, Arc::new(Stats::new())))
    }

    fn idle_signal() -> Signal {
        Signal::new(Sender::Engine, SignalPayload::SpiderIdle)
    }

    async fn settle(manager: &SignalManager) {
        while !manager.is_all_done() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn lower_index_groups_complete_first() {
        let manager = manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in [500i64, 0, 1000] {
            let order = Arc::clone(&order);
            manager.connect(SignalKind::SpiderIdle, index, move |_| {
                let order = Arc::clone(&order);
                async move {
                    // Stagger so that raw spawn order alone cannot pass.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().push(index);
                    Ok(())
                }
            });
        }

        manager.start();
        manager.emit(idle_signal()).await;
        settle(&manager).await;
        assert_eq!(*order.lock(), vec![0, 500, 1000]);
        manager.close().await;
    }

    #[tokio::test]
    async fn same_index_receivers_run_concurrently() {
        let manager = manager();
        let barrier = Arc::new(Barrier::new(2));

        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            manager.connect(SignalKind::SpiderIdle, 0, move |_| {
                let barrier = Arc::clone(&barrier);
                async move {
                    // Deadlocks unless both receivers are in flight at once.
                    barrier.wait().await;
                    Ok(())
                }
            });
        }

        manager.start();
        manager.emit(idle_signal()).await;
        tokio::time::timeout(Duration::from_secs(5), settle(&manager))
            .await
            .expect("same-index receivers did not run concurrently");
        manager.close().await;
    }

    #[tokio::test]
    async fn drop_signal_aborts_remaining_groups() {
        let manager = manager();
        let later_ran = Arc::new(AtomicBool::new(false));

        manager.connect(SignalKind::SpiderIdle, 0, |_| async { Err(DropSignal) });
        {
            let later_ran = Arc::clone(&later_ran);
            manager.connect(SignalKind::SpiderIdle, 10, move |_| {
                let later_ran = Arc::clone(&later_ran);
                async move {
                    later_ran.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        manager.start();
        manager.emit(idle_signal()).await;
        settle(&manager).await;
        assert!(!later_ran.load(Ordering::SeqCst));
        manager.close().await;
    }

    #[tokio::test]
    async fn sender_filter_restricts_delivery() {
        let manager = manager();
        let hits = Arc::new(AtomicU64::new(0));

        {
            let hits = Arc::clone(&hits);
            manager.connect_filtered(
                SignalKind::SpiderIdle,
                0,
                &[Sender::Scheduler],
                move |_| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            );
        }

        manager.start();
        manager.emit(idle_signal()).await;
        manager
            .emit(Signal::new(Sender::Scheduler, SignalPayload::SpiderIdle))
            .await;
        settle(&manager).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn disconnect_removes_by_identity() {
        let manager = manager();
        let hits = Arc::new(AtomicU64::new(0));

        let id = {
            let hits = Arc::clone(&hits);
            manager.connect(SignalKind::SpiderIdle, 0, move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        assert!(manager.disconnect(id, SignalKind::SpiderIdle));
        assert!(!manager.disconnect(id, SignalKind::SpiderIdle));

        manager.start();
        manager.emit(idle_signal()).await;
        settle(&manager).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn is_all_done_tracks_in_flight_dispatches() {
        let manager = manager();
        manager.connect(SignalKind::SpiderIdle, 0, |_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });

        manager.start();
        assert!(manager.is_all_done());
        manager.emit(idle_signal()).await;
        assert!(!manager.is_all_done());
        settle(&manager).await;
        assert!(manager.is_all_done());
        manager.close().await;
    }
}
