//! # Spider Module
//!
//! The crawl definition and the types a spider yields.
//!
//! ## Overview
//!
//! A `Spider` names the crawl, carries its settings, and produces the
//! starter sequence: a lazy stream of requests (and optionally pre-formed
//! items) that seeds the engine. Parsing callbacks are registered by name in
//! the [`Registry`](crate::registry::Registry) and referenced from requests,
//! so a spider definition is plain data plus a handful of names.
//!
//! ## Yields and streams
//!
//! Callbacks, errbacks and the spider middleware hooks all speak
//! [`SpiderYield`]: either a new [`Request`] to schedule or an [`Item`] to
//! push into the pipeline. Sequences of yields are `BoxStream`s so the
//! engine can consume them with back-pressure instead of materializing them
//! eagerly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spinneret::prelude::*;
//!
//! let spider = Spider::builder("quotes")
//!     .start_urls(["https://quotes.example.com/page/1"])
//!     .default_callback("parse_page")
//!     .set("DOWNLOAD_DELAY", 2)
//!     .build();
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde_json::Value;

use crate::request::Request;
use crate::settings::Settings;

/// A scraped item. Pipelines receive and transform these.
pub type Item = Value;

/// One element of a spider's output: a follow-up request or a scraped item.
#[derive(Clone, Debug)]
pub enum SpiderYield {
    Request(Request),
    Item(Item),
}

/// Lazy sequence of spider yields.
pub type ResultStream = BoxStream<'static, SpiderYield>;

/// Build a result stream from already-known yields. Handy in callbacks that
/// produce a small, fixed batch.
pub fn results(yields: Vec<SpiderYield>) -> ResultStream {
    Box::pin(stream::iter(yields))
}

/// An empty result stream.
pub fn no_results() -> ResultStream {
    Box::pin(stream::empty())
}

/// A result stream riding inside a signal.
///
/// Signals are cloned once per subscriber, streams cannot be. The stream
/// lives in a take-once cell: the consuming handler takes it, every other
/// subscriber sees an already-consumed cell.
#[derive(Clone)]
pub struct SharedResults {
    inner: Arc<Mutex<Option<ResultStream>>>,
}

impl SharedResults {
    pub fn new(stream: ResultStream) -> Self {
        SharedResults {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    pub fn take(&self) -> Option<ResultStream> {
        self.inner.lock().take()
    }
}

impl fmt::Debug for SharedResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.lock().is_some() {
            f.write_str("SharedResults(pending)")
        } else {
            f.write_str("SharedResults(taken)")
        }
    }
}

enum StartSource {
    Urls(Vec<String>),
    Stream(ResultStream),
}

/// A crawl definition: name, settings, starter sequence and default
/// callback.
pub struct Spider {
    pub name: String,
    pub settings: Arc<Settings>,
    /// Callback used when a request names none.
    pub default_callback: String,
    starts: Mutex<Option<StartSource>>,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Spider {
    pub fn builder(name: &str) -> SpiderBuilder {
        SpiderBuilder {
            name: name.to_string(),
            settings: None,
            starts: None,
            default_callback: String::new(),
            on_close: None,
        }
    }

    /// Take the starter sequence. Yields each start URL as a GET request;
    /// a custom stream is passed through untouched. Returns `None` the
    /// second time around.
    pub(crate) fn take_starts(&self) -> Option<ResultStream> {
        match self.starts.lock().take()? {
            StartSource::Stream(stream) => Some(stream),
            StartSource::Urls(urls) => {
                let requests: Vec<SpiderYield> = urls
                    .into_iter()
                    .filter_map(|url| match Request::parse(&url) {
                        Ok(request) => Some(SpiderYield::Request(request)),
                        Err(err) => {
                            tracing::warn!(url = %url, error = %err, "skipping invalid start url");
                            None
                        }
                    })
                    .collect();
                Some(results(requests))
            }
        }
    }

    pub(crate) fn run_close_hook(&self) {
        if let Some(hook) = &self.on_close {
            hook();
        }
    }
}

impl fmt::Debug for Spider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spider")
            .field("name", &self.name)
            .field("default_callback", &self.default_callback)
            .finish_non_exhaustive()
    }
}

pub struct SpiderBuilder {
    name: String,
    settings: Option<Settings>,
    starts: Option<StartSource>,
    default_callback: String,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl SpiderBuilder {
    /// Seed the crawl from plain URLs, fetched with GET.
    pub fn start_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.starts = Some(StartSource::Urls(
            urls.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Seed the crawl from a custom stream of requests and items.
    pub fn starts(mut self, stream: ResultStream) -> Self {
        self.starts = Some(StartSource::Stream(stream));
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set a single settings key, creating the default table first if
    /// needed.
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        let settings = self.settings.get_or_insert_with(Settings::with_defaults);
        settings.set(key, value);
        self
    }

    pub fn default_callback(mut self, name: &str) -> Self {
        self.default_callback = name.to_string();
        self
    }

    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Spider {
        Spider {
            name: self.name,
            settings: Arc::new(self.settings.unwrap_or_else(Settings::with_defaults)),
            default_callback: self.default_callback,
            starts: Mutex::new(self.starts),
            on_close: self.on_close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn start_urls_become_get_requests() {
        let spider = Spider::builder("test")
            .start_urls(["https://example.com/a", "https://example.com/b"])
            .build();

        let mut starts = spider.take_starts().expect("starts available");
        let mut urls = Vec::new();
        while let Some(SpiderYield::Request(req)) = starts.next().await {
            urls.push(req.url.to_string());
        }
        assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
        assert!(spider.take_starts().is_none(), "starts are take-once");
    }

    #[test]
    fn shared_results_is_take_once() {
        let shared = SharedResults::new(no_results());
        let clone = shared.clone();
        assert!(clone.take().is_some());
        assert!(shared.take().is_none());
    }
}
