//! # Middleware stacks
//!
//! Three ordered plug-in stacks are consulted on well-defined pipeline
//! transitions:
//!
//! - **Downloader middleware** wraps the trip to the transport:
//!   `process_request` runs forward before the download, `process_response`
//!   and `process_error` run in reverse on the way back up.
//! - **Spider middleware** wraps the parse step: `process_spider_input`
//!   forward, `process_start_requests` / `process_spider_output` /
//!   `process_spider_error` in reverse. The stream-shaped hooks transform
//!   lazily; nothing is materialized until the engine drains the stream.
//! - **Item pipelines** run forward over each scraped item; a
//!   [`CrawlError::DropItem`] stops the chain.
//!
//! Each stack is built from a merged `{name: order}` map (lower order =
//! earlier in the forward direction); see [`manager`].

pub mod downloader;
pub mod manager;
pub mod spider;

pub use manager::{
    DownloaderMiddlewareManager, ItemPipelineManager, MiddlewareError, SpiderMiddlewareManager,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CrawlError;
use crate::request::Request;
use crate::response::Response;
use crate::spider::{Item, ResultStream};

/// What a downloader-middleware hook hands back to the engine: a substitute
/// request that re-enters scheduling, or a response that short-circuits the
/// download.
#[derive(Debug)]
pub enum DownloadOutcome {
    Request(Request),
    Response(Response),
}

/// A plug-in wrapping the downloader. All hooks default to pass-through.
#[async_trait]
pub trait DownloaderMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Forward pass before the download. `Ok(None)` continues the chain,
    /// anything else short-circuits.
    async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, CrawlError> {
        let _ = request;
        Ok(None)
    }

    /// Reverse pass over the downloaded response. Returning a request sends
    /// it back to the scheduler and stops the chain.
    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<DownloadOutcome, CrawlError> {
        let _ = request;
        Ok(DownloadOutcome::Response(response))
    }

    /// Reverse pass over a download error. The first middleware returning a
    /// value recovers the request.
    async fn process_error(
        &self,
        request: &Request,
        error: &CrawlError,
    ) -> Option<DownloadOutcome> {
        let _ = (request, error);
        None
    }

    fn close(&self) {}
}

/// A plug-in wrapping the parse step. Stream hooks take `Arc<Self>` so they
/// can move shared state into the transformed stream.
pub trait SpiderMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reverse pass over the starter sequence.
    fn process_start_requests(self: Arc<Self>, starts: ResultStream) -> ResultStream {
        starts
    }

    /// Forward pass before the response reaches its callback. An error
    /// routes the response to the errback path.
    fn process_spider_input(&self, response: &Response) -> Result<(), CrawlError> {
        let _ = response;
        Ok(())
    }

    /// Reverse pass over the callback's output stream. `None` is a fatal
    /// misconfiguration (a value is required here).
    fn process_spider_output(
        self: Arc<Self>,
        response: Option<Response>,
        results: ResultStream,
    ) -> Option<ResultStream> {
        let _ = response;
        Some(results)
    }

    /// Reverse pass over a spider failure; the first middleware returning a
    /// stream handles the error and re-enters output processing.
    fn process_spider_error(
        &self,
        response: &Response,
        error: &CrawlError,
    ) -> Option<ResultStream> {
        let _ = (response, error);
        None
    }

    fn close(&self) {}
}

/// A stage of the item pipeline.
#[async_trait]
pub trait ItemPipeline: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self) -> Result<(), CrawlError> {
        Ok(())
    }

    /// Transform the item or reject it with [`CrawlError::DropItem`].
    async fn process_item(
        &self,
        item: Item,
        response: Option<&Response>,
    ) -> Result<Item, CrawlError>;

    async fn close(&self) -> Result<(), CrawlError> {
        Ok(())
    }
}
