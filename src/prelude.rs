//! A "prelude" for users of the `spinneret` crate.
//!
//! Re-exports the types most crawls touch so a single import suffices:
//!
//! ```
//! use spinneret::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Engine,
    Registry,
    Settings,
    Spider,
    // Data model
    Request,
    Response,
    // Spider output helpers
    no_results,
    results,
    Item,
    ResultStream,
    SpiderYield,
    // Errors
    CrawlError,
    // Essential re-export for trait implementation
    async_trait,
};

pub use crate::downloader::Downloader;
pub use crate::middleware::{DownloaderMiddleware, ItemPipeline, SpiderMiddleware};
