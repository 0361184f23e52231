//! # Engine
//!
//! Owns the crawl lifecycle and drives three cooperating loops:
//!
//! 1. **Scheduler loop**: feeds requests out of the scheduler whenever the
//!    request, response and item slots have capacity; detects quiescence
//!    and announces `SpiderIdle`.
//! 2. **Downloader loop**: drains every per-domain slot that is eligible
//!    right now and hands the requests to the transport; garbage-collects
//!    idle slots while nothing is ready.
//! 3. **Item loop**: pops queued items into the pipeline while the item
//!    slot has free capacity.
//!
//! All engine logic between those loops is expressed as signal handlers:
//! every transition of the request/response/item state machine is a signal,
//! and the handler for one transition emits the next. The handler map is
//! wired in [`Engine::connect_handlers`]; `SpiderOpened` runs at index 0,
//! `SpiderClosed` at 1000, and everything else at 500 so extensions can
//! order themselves around the engine.
//!
//! The first operator interrupt stops the scheduler loop from feeding new
//! requests (in-flight work completes and drains); a second interrupt
//! force-closes the spider.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::downloader::{Downloader, HttpDownloader};
use crate::error::CrawlError;
use crate::extension::ExtensionManager;
use crate::middleware::{
    DownloadOutcome, DownloaderMiddlewareManager, ItemPipelineManager, SpiderMiddlewareManager,
};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::settings::Settings;
use crate::signal::{Sender, Signal, SignalKind, SignalManager, SignalPayload};
use crate::slot::{ItemSlot, QueuedItem, RequestSlots, ResponseSlot};
use crate::spider::{no_results, SharedResults, Spider, SpiderYield};
use crate::stats::Stats;
use crate::telemetry;

const SLOT_GC_AGE: Duration = Duration::from_secs(300);

pub struct Engine {
    spider: Arc<Spider>,
    settings: Arc<Settings>,
    stats: Arc<Stats>,
    signals: Arc<SignalManager>,
    scheduler: Arc<Scheduler>,
    request_slots: Arc<RequestSlots>,
    response_slot: Arc<ResponseSlot>,
    item_slot: Arc<ItemSlot>,
    downloader: Arc<dyn Downloader>,
    downloader_mw: Arc<DownloaderMiddlewareManager>,
    spider_mw: Arc<SpiderMiddlewareManager>,
    pipelines: Arc<ItemPipelineManager>,
    extensions: ExtensionManager,
    registry: Arc<Registry>,
    heartbeat: Duration,
    quit_tx: watch::Sender<bool>,
    feeding: AtomicBool,
    closing: AtomicBool,
    scheduler_tick: mpsc::Sender<()>,
    scheduler_tick_rx: Mutex<Option<mpsc::Receiver<()>>>,
    item_tick: mpsc::Sender<()>,
    item_tick_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Engine {
    /// Assemble an engine around the default HTTP transport.
    pub fn new(spider: Spider, registry: Registry) -> Result<Arc<Self>, CrawlError> {
        let downloader = Arc::new(HttpDownloader::from_settings(&spider.settings)?);
        Self::with_downloader(spider, registry, downloader)
    }

    /// Assemble an engine with an explicit transport (tests, replays,
    /// alternative protocols).
    pub fn with_downloader(
        spider: Spider,
        registry: Registry,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Arc<Self>, CrawlError> {
        let spider = Arc::new(spider);
        let settings = Arc::clone(&spider.settings);
        telemetry::init(&settings);

        let stats = Arc::new(Stats::new());
        let registry = Arc::new(registry);
        let signals = Arc::new(SignalManager::new(&settings, Arc::clone(&stats)));
        let scheduler = Arc::new(Scheduler::new(&settings, Arc::clone(&stats)));
        let downloader_mw = Arc::new(DownloaderMiddlewareManager::from_settings(
            &settings, &stats, &registry,
        )?);
        let spider_mw = Arc::new(SpiderMiddlewareManager::from_settings(
            &settings, &stats, &registry,
        )?);
        let pipelines = Arc::new(ItemPipelineManager::from_settings(
            &settings, &stats, &registry,
        )?);
        let extensions = ExtensionManager::from_settings(&settings, &stats, &registry)?;

        let (quit_tx, _) = watch::channel(false);
        let (scheduler_tick, scheduler_tick_rx) = mpsc::channel(1);
        let (item_tick, item_tick_rx) = mpsc::channel(1);

        Ok(Arc::new(Engine {
            request_slots: Arc::new(RequestSlots::new(&settings)),
            response_slot: Arc::new(ResponseSlot::new(&settings)),
            item_slot: Arc::new(ItemSlot::new(&settings)),
            spider,
            settings,
            stats,
            signals,
            scheduler,
            downloader,
            downloader_mw,
            spider_mw,
            pipelines,
            extensions,
            registry,
            heartbeat: Duration::from_millis(100),
            quit_tx,
            feeding: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            scheduler_tick,
            scheduler_tick_rx: Mutex::new(Some(scheduler_tick_rx)),
            item_tick,
            item_tick_rx: Mutex::new(Some(item_tick_rx)),
        }))
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn signals(&self) -> Arc<SignalManager> {
        Arc::clone(&self.signals)
    }

    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Run the crawl to completion. Blocks until the spider closes, either
    /// because the crawl went idle or an operator interrupted it twice.
    pub async fn run(self: &Arc<Self>) -> Result<(), CrawlError> {
        info!(spider = %self.spider.name, "engine starting");

        self.connect_handlers();
        self.extensions.connect_all(&self.signals);
        self.signals.start();
        self.pipelines.open_all().await?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move { engine.interrupt_loop().await }));
        }
        {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move { engine.downloader_loop().await }));
        }
        {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move { engine.item_loop().await }));
        }

        self.emit(Sender::Engine, SignalPayload::SpiderOpened).await;
        self.scheduler_loop().await;

        for task in tasks {
            let _ = task.await;
        }
        self.teardown().await;
        Ok(())
    }

    async fn emit(&self, sender: Sender, payload: SignalPayload) {
        self.signals.emit(Signal::new(sender, payload)).await;
    }

    fn trigger_scheduler(&self) {
        let _ = self.scheduler_tick.try_send(());
    }

    fn trigger_item(&self) {
        let _ = self.item_tick.try_send(());
    }

    fn quit_requested(&self) -> bool {
        *self.quit_tx.subscribe().borrow()
    }

    /// Quiescence test: nothing pending anywhere and no signal dispatch in
    /// flight.
    fn is_idle(&self) -> bool {
        !self.scheduler.has_pending_requests()
            && self.request_slots.is_empty()
            && self.item_slot.is_empty()
            && self.signals.is_all_done()
    }

    // ---- the three loops -------------------------------------------------

    async fn scheduler_loop(self: &Arc<Self>) {
        let mut tick_rx = self
            .scheduler_tick_rx
            .lock()
            .take()
            .expect("engine can only run once");
        let mut quit_rx = self.quit_tx.subscribe();

        loop {
            tokio::select! {
                _ = tick_rx.recv() => {
                    self.feed_from_scheduler().await;
                }
                _ = tokio::time::sleep(self.heartbeat) => {
                    if self.is_idle() {
                        self.emit(Sender::Engine, SignalPayload::SpiderIdle).await;
                    } else {
                        self.trigger_scheduler();
                    }
                }
                _ = quit_rx.changed() => {
                    if *quit_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("scheduler loop finished");
    }

    async fn feed_from_scheduler(&self) {
        if !self.feeding.load(Ordering::SeqCst) {
            return;
        }
        let downstream_ready = (self.request_slots.is_free() || self.request_slots.is_empty())
            && self.item_slot.is_free()
            && self.response_slot.is_free();
        if !downstream_ready {
            return;
        }
        if let Some(request) = self.scheduler.next_request() {
            self.emit(
                Sender::Scheduler,
                SignalPayload::RequestLeftScheduler { request },
            )
            .await;
            self.trigger_scheduler();
        }
    }

    async fn downloader_loop(self: &Arc<Self>) {
        let mut quit_rx = self.quit_tx.subscribe();
        loop {
            if self.quit_requested() {
                break;
            }
            let ready = self.request_slots.pop();
            if ready.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.heartbeat) => {
                        self.request_slots.clear(SLOT_GC_AGE);
                    }
                    _ = quit_rx.changed() => {
                        if *quit_rx.borrow() {
                            break;
                        }
                    }
                }
            } else {
                for request in ready {
                    self.emit(
                        Sender::Downloader,
                        SignalPayload::RequestReachedDownloader { request },
                    )
                    .await;
                }
            }
        }
        debug!("downloader loop finished");
    }

    async fn item_loop(self: &Arc<Self>) {
        let mut tick_rx = self
            .item_tick_rx
            .lock()
            .take()
            .expect("engine can only run once");
        let mut quit_rx = self.quit_tx.subscribe();

        loop {
            tokio::select! {
                _ = tick_rx.recv() => {
                    if let Some(queued) = self.item_slot.pop() {
                        self.emit(
                            Sender::Engine,
                            SignalPayload::ItemLeftEngine {
                                item: queued.item,
                                response: queued.response,
                            },
                        )
                        .await;
                    }
                    if self.item_slot.is_free() && !self.item_slot.is_empty() {
                        self.trigger_item();
                    }
                }
                _ = tokio::time::sleep(self.heartbeat) => {
                    if self.item_slot.is_free() && !self.item_slot.is_empty() {
                        self.trigger_item();
                    }
                }
                _ = quit_rx.changed() => {
                    if *quit_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("item loop finished");
    }

    async fn interrupt_loop(self: &Arc<Self>) {
        let mut quit_rx = self.quit_tx.subscribe();
        let mut count = 0u32;
        loop {
            tokio::select! {
                interrupted = tokio::signal::ctrl_c() => {
                    if interrupted.is_err() {
                        // No interrupt support in this environment; just
                        // wait for the quit flag.
                        let _ = quit_rx.changed().await;
                        break;
                    }
                    count += 1;
                    self.on_operator_interrupt(count).await;
                }
                _ = quit_rx.changed() => {
                    if *quit_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn on_operator_interrupt(&self, count: u32) {
        if count == 1 {
            info!("interrupt received, draining in-flight work");
            self.feeding.store(false, Ordering::SeqCst);
        } else {
            info!("second interrupt, forcing shutdown");
            self.emit(
                Sender::Engine,
                SignalPayload::SpiderClosed {
                    reason: "interrupted".to_string(),
                },
            )
            .await;
        }
    }

    async fn teardown(&self) {
        self.item_slot.close();
        self.response_slot.close();
        self.request_slots.close();
        self.downloader_mw.close();
        self.spider_mw.close();
        self.pipelines.close_all().await;
        self.extensions.close();
        self.downloader.close();
        self.scheduler.close();
        self.signals.close().await;
        self.spider.run_close_hook();
        info!(spider = %self.spider.name, "crawl finished\n{}", self.stats);
    }

    // ---- signal handlers -------------------------------------------------

    fn connect_handlers(self: &Arc<Self>) {
        macro_rules! handler {
            ($kind:ident, $index:expr, $method:ident) => {{
                let engine = Arc::clone(self);
                self.signals
                    .connect(SignalKind::$kind, $index, move |signal| {
                        let engine = Arc::clone(&engine);
                        async move {
                            engine.$method(signal).await;
                            Ok(())
                        }
                    });
            }};
        }

        handler!(SpiderOpened, 0, on_spider_opened);
        handler!(StartsLeftSpider, 500, on_starts_left_spider);
        handler!(StartsLeftSpiderMiddleware, 500, on_starts_left_spider_middleware);
        handler!(RequestLeftEngine, 500, on_request_left_engine);
        handler!(RequestLeftScheduler, 500, on_request_left_scheduler);
        handler!(
            RequestReachedDownloaderMiddleware,
            500,
            on_request_reached_downloader_middleware
        );
        handler!(RequestReachedDownloader, 500, on_request_reached_downloader);
        handler!(ResponseLeftDownloader, 500, on_response_left_downloader);
        handler!(
            ResponseLeftDownloaderMiddleware,
            500,
            on_response_left_downloader_middleware
        );
        handler!(
            ResponseReachedSpiderMiddleware,
            500,
            on_response_reached_spider_middleware
        );
        handler!(ResponseReachedSpider, 500, on_response_reached_spider);
        handler!(ResultsLeftSpider, 500, on_results_left_spider);
        handler!(ResultsLeftSpiderMiddleware, 500, on_results_left_spider_middleware);
        handler!(ItemLeftEngine, 500, on_item_left_engine);
        handler!(SpiderError, 500, on_spider_error);
        handler!(DownloaderError, 500, on_downloader_error);
        handler!(RequestErrback, 500, on_request_errback);
        handler!(SpiderIdle, 500, on_spider_idle);
        handler!(SpiderClosed, 1000, on_spider_closed);
    }

    async fn on_spider_opened(&self, _signal: Signal) {
        info!(spider = %self.spider.name, "spider opened");
        let starts = self.spider.take_starts().unwrap_or_else(no_results);
        self.emit(
            Sender::Engine,
            SignalPayload::StartsLeftSpider {
                starts: SharedResults::new(starts),
            },
        )
        .await;
    }

    async fn on_starts_left_spider(&self, signal: Signal) {
        let SignalPayload::StartsLeftSpider { starts } = signal.payload else {
            unreachable!("starts_left_spider handler got a foreign payload");
        };
        let Some(stream) = starts.take() else {
            warn!("starter sequence already consumed");
            return;
        };
        let processed = self.spider_mw.process_start_requests(stream);
        self.emit(
            Sender::ProcessStartRequests,
            SignalPayload::StartsLeftSpiderMiddleware {
                starts: SharedResults::new(processed),
            },
        )
        .await;
    }

    async fn on_starts_left_spider_middleware(&self, signal: Signal) {
        let SignalPayload::StartsLeftSpiderMiddleware { starts } = signal.payload else {
            unreachable!("starts_left_spider_middleware handler got a foreign payload");
        };
        let Some(mut stream) = starts.take() else {
            return;
        };
        while let Some(start) = stream.next().await {
            match start {
                SpiderYield::Request(request) => {
                    self.emit(
                        Sender::ProcessStartRequests,
                        SignalPayload::RequestLeftEngine { request },
                    )
                    .await;
                }
                SpiderYield::Item(item) => {
                    self.item_slot.push(QueuedItem {
                        item,
                        response: None,
                    });
                    self.trigger_item();
                }
            }
        }
    }

    async fn on_request_left_engine(&self, signal: Signal) {
        let SignalPayload::RequestLeftEngine { request } = signal.payload else {
            unreachable!("request_left_engine handler got a foreign payload");
        };
        self.scheduler.enqueue_request(request);
        self.trigger_scheduler();
    }

    async fn on_request_left_scheduler(&self, signal: Signal) {
        let SignalPayload::RequestLeftScheduler { request } = signal.payload else {
            unreachable!("request_left_scheduler handler got a foreign payload");
        };
        self.emit(
            Sender::Engine,
            SignalPayload::RequestReachedDownloaderMiddleware { request },
        )
        .await;
    }

    async fn on_request_reached_downloader_middleware(&self, signal: Signal) {
        let SignalPayload::RequestReachedDownloaderMiddleware { mut request } = signal.payload
        else {
            unreachable!("request_reached_downloader_middleware handler got a foreign payload");
        };
        match self.downloader_mw.process_request(&mut request).await {
            Ok(None) => self.request_slots.push(request),
            Ok(Some(DownloadOutcome::Request(next))) => {
                self.emit(
                    Sender::ProcessRequest,
                    SignalPayload::RequestLeftEngine { request: next },
                )
                .await;
            }
            Ok(Some(DownloadOutcome::Response(response))) => {
                self.emit(
                    Sender::ProcessRequest,
                    SignalPayload::ResponseLeftDownloader { request, response },
                )
                .await;
            }
            Err(failed) => {
                if failed.error.is_drop_request() {
                    info!(
                        url = %request.url,
                        middleware = failed.middleware,
                        error = %failed.error,
                        "request dropped by middleware"
                    );
                    self.emit(
                        Sender::ProcessRequest,
                        SignalPayload::RequestDropped {
                            request: request.clone(),
                            error: failed.error.clone(),
                        },
                    )
                    .await;
                } else {
                    error!(
                        url = %request.url,
                        middleware = failed.middleware,
                        error = %failed.error,
                        "process_request failed"
                    );
                }
                self.emit(
                    Sender::ProcessRequest,
                    SignalPayload::DownloaderError {
                        request,
                        error: failed.error,
                    },
                )
                .await;
            }
        }
    }

    async fn on_request_reached_downloader(&self, signal: Signal) {
        let SignalPayload::RequestReachedDownloader { request } = signal.payload else {
            unreachable!("request_reached_downloader handler got a foreign payload");
        };
        debug!(url = %request.url, method = %request.method, "downloading");
        let result = self.downloader.fetch(&request).await;
        self.request_slots.finish(&request);
        match result {
            Ok(response) => {
                self.emit(
                    Sender::Downloader,
                    SignalPayload::ResponseLeftDownloader { request, response },
                )
                .await;
            }
            Err(err) => {
                error!(url = %request.url, error = %err, "download failed");
                self.emit(
                    Sender::Downloader,
                    SignalPayload::DownloaderError {
                        request,
                        error: err,
                    },
                )
                .await;
            }
        }
    }

    async fn on_response_left_downloader(&self, signal: Signal) {
        let SignalPayload::ResponseLeftDownloader { request, response } = signal.payload else {
            unreachable!("response_left_downloader handler got a foreign payload");
        };
        let response_for_errback = response.clone();
        match self.downloader_mw.process_response(&request, response).await {
            Ok(DownloadOutcome::Request(next)) => {
                self.emit(
                    Sender::ProcessResponse,
                    SignalPayload::RequestLeftEngine { request: next },
                )
                .await;
            }
            Ok(DownloadOutcome::Response(response)) => {
                self.emit(
                    Sender::ProcessResponse,
                    SignalPayload::ResponseLeftDownloaderMiddleware { response },
                )
                .await;
            }
            Err(failed) => {
                if failed.error.is_drop_request() {
                    info!(
                        url = %request.url,
                        middleware = failed.middleware,
                        error = %failed.error,
                        "request dropped by response middleware"
                    );
                    self.emit(
                        Sender::ProcessResponse,
                        SignalPayload::RequestDropped {
                            request: request.clone(),
                            error: failed.error.clone(),
                        },
                    )
                    .await;
                } else {
                    error!(
                        url = %request.url,
                        middleware = failed.middleware,
                        error = %failed.error,
                        "process_response failed"
                    );
                }
                self.emit(
                    Sender::ProcessResponse,
                    SignalPayload::RequestErrback {
                        request,
                        response: Some(response_for_errback),
                        error: failed.error,
                    },
                )
                .await;
            }
        }
    }

    async fn on_response_left_downloader_middleware(&self, signal: Signal) {
        let SignalPayload::ResponseLeftDownloaderMiddleware { response } = signal.payload else {
            unreachable!("response_left_downloader_middleware handler got a foreign payload");
        };
        self.emit(
            Sender::Engine,
            SignalPayload::ResponseReachedSpiderMiddleware { response },
        )
        .await;
    }

    async fn on_response_reached_spider_middleware(&self, signal: Signal) {
        let SignalPayload::ResponseReachedSpiderMiddleware { response } = signal.payload else {
            unreachable!("response_reached_spider_middleware handler got a foreign payload");
        };
        match self.spider_mw.process_spider_input(&response) {
            Ok(()) => {
                self.emit(
                    Sender::ProcessSpiderInput,
                    SignalPayload::ResponseReachedSpider { response },
                )
                .await;
            }
            Err(failed) => {
                debug!(
                    url = %response.request.url,
                    status = response.status.as_u16(),
                    middleware = failed.middleware,
                    error = %failed.error,
                    "process_spider_input rejected response"
                );
                let request = response.request.clone();
                self.emit(
                    Sender::ProcessSpiderInput,
                    SignalPayload::RequestErrback {
                        request,
                        response: Some(response),
                        error: failed.error,
                    },
                )
                .await;
            }
        }
    }

    async fn on_response_reached_spider(&self, signal: Signal) {
        let SignalPayload::ResponseReachedSpider { response } = signal.payload else {
            unreachable!("response_reached_spider handler got a foreign payload");
        };

        let callback_name = if response.request.callback.is_empty() {
            self.spider.default_callback.clone()
        } else {
            response.request.callback.clone()
        };
        let Some(callback) = self.registry.callback(&callback_name) else {
            // An unregistered callback is a wiring bug, not a crawl error.
            panic!("callback {callback_name:?} is not registered");
        };

        self.response_slot.add(&response);
        let parse_attempt = {
            let response = response.clone();
            catch_unwind(AssertUnwindSafe(move || callback(response)))
        };
        match parse_attempt {
            Ok(results) => {
                self.emit(
                    Sender::Spider,
                    SignalPayload::ResultsLeftSpider {
                        response: Some(response.clone()),
                        results: SharedResults::new(results),
                        index: self.spider_mw.len() as isize - 1,
                    },
                )
                .await;
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(url = %response.request.url, error = %message, "callback panicked");
                self.emit(
                    Sender::Spider,
                    SignalPayload::SpiderError {
                        response: response.clone(),
                        error: CrawlError::Spider(message),
                    },
                )
                .await;
            }
        }
        self.response_slot.done(&response);
    }

    async fn on_results_left_spider(&self, signal: Signal) {
        let SignalPayload::ResultsLeftSpider {
            response,
            results,
            index,
        } = signal.payload
        else {
            unreachable!("results_left_spider handler got a foreign payload");
        };
        let Some(stream) = results.take() else {
            return;
        };
        match self
            .spider_mw
            .process_spider_output(response.as_ref(), stream, index)
        {
            Ok(processed) => {
                self.emit(
                    Sender::ProcessSpiderOutput,
                    SignalPayload::ResultsLeftSpiderMiddleware {
                        response,
                        results: SharedResults::new(processed),
                    },
                )
                .await;
            }
            Err(failed) => {
                panic!(
                    "spider middleware {:?} returned no stream from process_spider_output",
                    failed.middleware
                );
            }
        }
    }

    async fn on_results_left_spider_middleware(&self, signal: Signal) {
        let SignalPayload::ResultsLeftSpiderMiddleware { response, results } = signal.payload
        else {
            unreachable!("results_left_spider_middleware handler got a foreign payload");
        };
        let Some(mut stream) = results.take() else {
            return;
        };
        while let Some(result) = stream.next().await {
            match result {
                SpiderYield::Request(request) => {
                    self.emit(
                        Sender::ProcessSpiderOutput,
                        SignalPayload::RequestLeftEngine { request },
                    )
                    .await;
                }
                SpiderYield::Item(item) => {
                    self.item_slot.push(QueuedItem {
                        item,
                        response: response.clone(),
                    });
                    self.trigger_item();
                }
            }
        }
    }

    async fn on_item_left_engine(&self, signal: Signal) {
        let SignalPayload::ItemLeftEngine { item, response } = signal.payload else {
            unreachable!("item_left_engine handler got a foreign payload");
        };
        let result = self
            .pipelines
            .process_item(item.clone(), response.as_ref())
            .await;
        match result {
            Ok(processed) => {
                self.emit(
                    Sender::ItemPipeline,
                    SignalPayload::ItemScraped {
                        item: processed,
                        response,
                    },
                )
                .await;
            }
            Err(failed) if failed.error.is_drop_item() => {
                info!(pipeline = failed.middleware, error = %failed.error, "item dropped");
                self.emit(
                    Sender::ItemPipeline,
                    SignalPayload::ItemDropped {
                        item,
                        response,
                        error: failed.error,
                    },
                )
                .await;
            }
            Err(failed) => {
                error!(pipeline = failed.middleware, error = %failed.error, "process_item failed");
                self.emit(
                    Sender::ItemPipeline,
                    SignalPayload::ItemError {
                        item,
                        response,
                        error: failed.error,
                    },
                )
                .await;
            }
        }
        self.item_slot.finish();
    }

    async fn on_spider_error(&self, signal: Signal) {
        let SignalPayload::SpiderError { response, error } = signal.payload else {
            unreachable!("spider_error handler got a foreign payload");
        };
        match self.spider_mw.process_spider_error(&response, &error) {
            Some((results, index)) => {
                self.emit(
                    Sender::ProcessSpiderError,
                    SignalPayload::ResultsLeftSpider {
                        response: Some(response),
                        results: SharedResults::new(results),
                        index: index - 1,
                    },
                )
                .await;
            }
            None => {
                warn!(url = %response.request.url, error = %error, "spider error unhandled");
                let request = response.request.clone();
                self.emit(
                    Sender::ProcessSpiderError,
                    SignalPayload::ErrorUnhandled {
                        request: Some(request),
                        response: Some(response),
                        error,
                    },
                )
                .await;
            }
        }
    }

    async fn on_downloader_error(&self, signal: Signal) {
        let sender = signal.sender;
        let SignalPayload::DownloaderError { request, error } = signal.payload else {
            unreachable!("downloader_error handler got a foreign payload");
        };
        match self.downloader_mw.process_error(&request, &error).await {
            Some(DownloadOutcome::Request(next)) => {
                self.emit(
                    Sender::ProcessError,
                    SignalPayload::RequestLeftEngine { request: next },
                )
                .await;
            }
            Some(DownloadOutcome::Response(response)) => {
                self.emit(
                    Sender::ProcessError,
                    SignalPayload::ResponseLeftDownloader { request, response },
                )
                .await;
            }
            None => {
                warn!(url = %request.url, error = %error, "download error unhandled");
                if sender == Sender::ProcessRequest {
                    self.emit(
                        Sender::ProcessError,
                        SignalPayload::RequestErrback {
                            request,
                            response: None,
                            error,
                        },
                    )
                    .await;
                } else {
                    self.emit(
                        Sender::ProcessError,
                        SignalPayload::ErrorUnhandled {
                            request: Some(request),
                            response: None,
                            error,
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn on_request_errback(&self, signal: Signal) {
        let sender = signal.sender;
        let SignalPayload::RequestErrback {
            request,
            response,
            error,
        } = signal.payload
        else {
            unreachable!("request_errback handler got a foreign payload");
        };

        if request.errback.is_empty() {
            debug!(url = %request.url, error = %error, "no errback configured");
            if sender == Sender::ProcessSpiderInput {
                if let Some(response) = response {
                    self.emit(
                        Sender::RequestErrback,
                        SignalPayload::SpiderError { response, error },
                    )
                    .await;
                }
            }
            return;
        }

        let Some(errback) = self.registry.errback(&request.errback) else {
            panic!("errback {:?} is not registered", request.errback);
        };

        let attempt = {
            let request = request.clone();
            let response = response.clone();
            let error = error.clone();
            catch_unwind(AssertUnwindSafe(move || errback(request, response, error)))
        };
        match attempt {
            Ok(Some(results)) => {
                self.emit(
                    Sender::RequestErrback,
                    SignalPayload::ResultsLeftSpider {
                        response,
                        results: SharedResults::new(results),
                        index: self.spider_mw.len() as isize - 1,
                    },
                )
                .await;
            }
            Ok(None) => {}
            Err(panic) => {
                let message = panic_message(panic);
                error!(url = %request.url, error = %message, "errback panicked");
                if sender == Sender::ProcessSpiderInput {
                    if let Some(response) = response {
                        self.emit(
                            Sender::RequestErrback,
                            SignalPayload::SpiderError {
                                response,
                                error: CrawlError::Spider(message),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn on_spider_idle(&self, _signal: Signal) {
        debug!("crawl is idle");
        self.emit(
            Sender::Engine,
            SignalPayload::SpiderClosed {
                reason: "finished".to_string(),
            },
        )
        .await;
    }

    async fn on_spider_closed(&self, signal: Signal) {
        let SignalPayload::SpiderClosed { reason } = &signal.payload else {
            unreachable!("spider_closed handler got a foreign payload");
        };
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason = %reason, "spider closed");
        self.feeding.store(false, Ordering::SeqCst);
        let _ = self.quit_tx.send(true);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
