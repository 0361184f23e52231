//! # Signals
//!
//! Every state transition in the pipeline is announced as a typed signal on
//! an in-process bus, and the engine's own logic is written as signal
//! handlers. A signal is a closed sum of payload records plus a [`Sender`]
//! tag naming the component that emitted it; subscribers can filter on the
//! sender and order themselves with an index (see [`SignalManager`]).

mod manager;

pub use manager::{DropSignal, ReceiverId, SignalManager};

use crate::error::CrawlError;
use crate::request::Request;
use crate::response::Response;
use crate::spider::{Item, SharedResults};

/// Component that emitted a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sender {
    Engine,
    Spider,
    Scheduler,
    Downloader,
    ItemPipeline,
    ProcessStartRequests,
    ProcessRequest,
    ProcessResponse,
    ProcessError,
    ProcessSpiderInput,
    ProcessSpiderOutput,
    ProcessSpiderError,
    RequestErrback,
}

/// Subscription key: the kind of event, without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    SpiderOpened,
    StartsLeftSpider,
    StartsLeftSpiderMiddleware,
    RequestLeftEngine,
    RequestLeftScheduler,
    RequestReachedDownloaderMiddleware,
    RequestReachedDownloader,
    ResponseLeftDownloader,
    ResponseLeftDownloaderMiddleware,
    ResponseReachedSpiderMiddleware,
    ResponseReachedSpider,
    ResultsLeftSpider,
    ResultsLeftSpiderMiddleware,
    ItemLeftEngine,
    ItemScraped,
    ItemDropped,
    ItemError,
    SpiderError,
    DownloaderError,
    RequestDropped,
    RequestErrback,
    ErrorUnhandled,
    SpiderIdle,
    SpiderClosed,
}

impl SignalKind {
    /// Stable name used in stats keys (`signal_manager/{name}/add`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::SpiderOpened => "spider_opened",
            SignalKind::StartsLeftSpider => "starts_left_spider",
            SignalKind::StartsLeftSpiderMiddleware => "starts_left_spider_middleware",
            SignalKind::RequestLeftEngine => "request_left_engine",
            SignalKind::RequestLeftScheduler => "request_left_scheduler",
            SignalKind::RequestReachedDownloaderMiddleware => {
                "request_reached_downloader_middleware"
            }
            SignalKind::RequestReachedDownloader => "request_reached_downloader",
            SignalKind::ResponseLeftDownloader => "response_left_downloader",
            SignalKind::ResponseLeftDownloaderMiddleware => "response_left_downloader_middleware",
            SignalKind::ResponseReachedSpiderMiddleware => "response_reached_spider_middleware",
            SignalKind::ResponseReachedSpider => "response_reached_spider",
            SignalKind::ResultsLeftSpider => "results_left_spider",
            SignalKind::ResultsLeftSpiderMiddleware => "results_left_spider_middleware",
            SignalKind::ItemLeftEngine => "item_left_engine",
            SignalKind::ItemScraped => "item_scraped",
            SignalKind::ItemDropped => "item_dropped",
            SignalKind::ItemError => "item_error",
            SignalKind::SpiderError => "spider_error",
            SignalKind::DownloaderError => "downloader_error",
            SignalKind::RequestDropped => "request_dropped",
            SignalKind::RequestErrback => "request_errback",
            SignalKind::ErrorUnhandled => "error_unhandled",
            SignalKind::SpiderIdle => "spider_idle",
            SignalKind::SpiderClosed => "spider_closed",
        }
    }
}

/// Typed payload of a signal. Result streams ride in take-once
/// [`SharedResults`] cells so the whole payload stays `Clone` for fan-out.
#[derive(Clone, Debug)]
pub enum SignalPayload {
    SpiderOpened,
    StartsLeftSpider {
        starts: SharedResults,
    },
    StartsLeftSpiderMiddleware {
        starts: SharedResults,
    },
    RequestLeftEngine {
        request: Request,
    },
    RequestLeftScheduler {
        request: Request,
    },
    RequestReachedDownloaderMiddleware {
        request: Request,
    },
    RequestReachedDownloader {
        request: Request,
    },
    ResponseLeftDownloader {
        request: Request,
        response: Response,
    },
    ResponseLeftDownloaderMiddleware {
        response: Response,
    },
    ResponseReachedSpiderMiddleware {
        response: Response,
    },
    ResponseReachedSpider {
        response: Response,
    },
    ResultsLeftSpider {
        response: Option<Response>,
        results: SharedResults,
        /// Spider-middleware index output processing resumes from.
        index: isize,
    },
    ResultsLeftSpiderMiddleware {
        response: Option<Response>,
        results: SharedResults,
    },
    ItemLeftEngine {
        item: Item,
        response: Option<Response>,
    },
    ItemScraped {
        item: Item,
        response: Option<Response>,
    },
    ItemDropped {
        item: Item,
        response: Option<Response>,
        error: CrawlError,
    },
    ItemError {
        item: Item,
        response: Option<Response>,
        error: CrawlError,
    },
    SpiderError {
        response: Response,
        error: CrawlError,
    },
    DownloaderError {
        request: Request,
        error: CrawlError,
    },
    RequestDropped {
        request: Request,
        error: CrawlError,
    },
    RequestErrback {
        request: Request,
        response: Option<Response>,
        error: CrawlError,
    },
    ErrorUnhandled {
        request: Option<Request>,
        response: Option<Response>,
        error: CrawlError,
    },
    SpiderIdle,
    SpiderClosed {
        reason: String,
    },
}

/// A signal on the bus: who sent it, and what happened.
#[derive(Clone, Debug)]
pub struct Signal {
    pub sender: Sender,
    pub payload: SignalPayload,
}

impl Signal {
    pub fn new(sender: Sender, payload: SignalPayload) -> Self {
        Signal { sender, payload }
    }

    pub fn kind(&self) -> SignalKind {
        match &self.payload {
            SignalPayload::SpiderOpened => SignalKind::SpiderOpened,
            SignalPayload::StartsLeftSpider { .. } => SignalKind::StartsLeftSpider,
            SignalPayload::StartsLeftSpiderMiddleware { .. } => {
                SignalKind::StartsLeftSpiderMiddleware
            }
            SignalPayload::RequestLeftEngine { .. } => SignalKind::RequestLeftEngine,
            SignalPayload::RequestLeftScheduler { .. } => SignalKind::RequestLeftScheduler,
            SignalPayload::RequestReachedDownloaderMiddleware { .. } => {
                SignalKind::RequestReachedDownloaderMiddleware
            }
            SignalPayload::RequestReachedDownloader { .. } => SignalKind::RequestReachedDownloader,
            SignalPayload::ResponseLeftDownloader { .. } => SignalKind::ResponseLeftDownloader,
            SignalPayload::ResponseLeftDownloaderMiddleware { .. } => {
                SignalKind::ResponseLeftDownloaderMiddleware
            }
            SignalPayload::ResponseReachedSpiderMiddleware { .. } => {
                SignalKind::ResponseReachedSpiderMiddleware
            }
            SignalPayload::ResponseReachedSpider { .. } => SignalKind::ResponseReachedSpider,
            SignalPayload::ResultsLeftSpider { .. } => SignalKind::ResultsLeftSpider,
            SignalPayload::ResultsLeftSpiderMiddleware { .. } => {
                SignalKind::ResultsLeftSpiderMiddleware
            }
            SignalPayload::ItemLeftEngine { .. } => SignalKind::ItemLeftEngine,
            SignalPayload::ItemScraped { .. } => SignalKind::ItemScraped,
            SignalPayload::ItemDropped { .. } => SignalKind::ItemDropped,
            SignalPayload::ItemError { .. } => SignalKind::ItemError,
            SignalPayload::SpiderError { .. } => SignalKind::SpiderError,
            SignalPayload::DownloaderError { .. } => SignalKind::DownloaderError,
            SignalPayload::RequestDropped { .. } => SignalKind::RequestDropped,
            SignalPayload::RequestErrback { .. } => SignalKind::RequestErrback,
            SignalPayload::ErrorUnhandled { .. } => SignalKind::ErrorUnhandled,
            SignalPayload::SpiderIdle => SignalKind::SpiderIdle,
            SignalPayload::SpiderClosed { .. } => SignalKind::SpiderClosed,
        }
    }
}
