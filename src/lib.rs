//! # spinneret
//!
//! A signal-driven web crawling engine.
//!
//! The [`Engine`] owns the crawl lifecycle: a priority [`Scheduler`] with
//! fingerprint deduplication, per-domain politeness slots, a bounded
//! download/parse/item pipeline, three middleware stacks, and a
//! priority-ordered signal bus that the engine's own state machine is
//! written against.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spinneret::prelude::*;
//!
//! let mut registry = Registry::with_builtins();
//! registry.register_callback("parse", |response| {
//!     // extract items and follow-up requests from `response`
//!     no_results()
//! })?;
//!
//! let spider = Spider::builder("quotes")
//!     .start_urls(["https://quotes.example.com/"])
//!     .default_callback("parse")
//!     .set("DOWNLOAD_DELAY", 2)
//!     .build();
//!
//! let engine = Engine::new(spider, registry)?;
//! engine.run().await?;
//! ```

pub mod context;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod extension;
pub mod middleware;
pub mod registry;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod slot;
pub mod spider;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use context::Ctx;
pub use downloader::{Downloader, HttpDownloader};
pub use engine::Engine;
pub use error::{CrawlError, TransportErrorKind};
pub use registry::Registry;
pub use request::Request;
pub use response::Response;
pub use scheduler::Scheduler;
pub use settings::Settings;
pub use signal::{DropSignal, Sender, Signal, SignalKind, SignalManager, SignalPayload};
pub use spider::{no_results, results, Item, ResultStream, Spider, SpiderYield};
pub use stats::Stats;

pub mod prelude;

pub use async_trait::async_trait;
pub use tokio;
