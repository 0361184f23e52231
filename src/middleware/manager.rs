//! Middleware managers.
//!
//! Each manager owns an ordered list of plug-ins built from a merged
//! `{name: order}` map: the `_BASE` table from the settings defaults plus
//! user overrides, sorted ascending. Lower order runs earlier in the
//! forward direction; reverse hooks walk the same list backwards. Names are
//! resolved through the [`Registry`](crate::registry::Registry); an unknown
//! name is a configuration error at construction time.

use std::sync::Arc;

use tracing::debug;

use crate::error::CrawlError;
use crate::middleware::{
    DownloadOutcome, DownloaderMiddleware, ItemPipeline, SpiderMiddleware,
};
use crate::registry::Registry;
use crate::request::Request;
use crate::response::Response;
use crate::settings::Settings;
use crate::spider::{Item, ResultStream};
use crate::stats::Stats;

/// An error surfaced by a middleware, tagged with the plug-in's name so the
/// engine can report the offending module.
#[derive(Debug, Clone)]
pub struct MiddlewareError {
    pub middleware: &'static str,
    pub error: CrawlError,
}

pub struct DownloaderMiddlewareManager {
    middlewares: Vec<Arc<dyn DownloaderMiddleware>>,
}

impl DownloaderMiddlewareManager {
    pub fn from_settings(
        settings: &Settings,
        stats: &Arc<Stats>,
        registry: &Registry,
    ) -> Result<Self, CrawlError> {
        let mut middlewares = Vec::new();
        for (name, _) in settings.get_merged_order_map("DOWNLOADER_MIDDLEWARES") {
            let ctor = registry.downloader_middleware(&name).ok_or_else(|| {
                CrawlError::Config(format!("unknown downloader middleware {name:?}"))
            })?;
            middlewares.push(ctor(settings, Arc::clone(stats)));
        }
        debug!(count = middlewares.len(), "downloader middleware stack built");
        Ok(DownloaderMiddlewareManager { middlewares })
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Forward pass; the first non-pass-through result short-circuits.
    pub async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, MiddlewareError> {
        for mw in &self.middlewares {
            match mw.process_request(request).await {
                Ok(None) => continue,
                Ok(Some(outcome)) => return Ok(Some(outcome)),
                Err(error) => {
                    return Err(MiddlewareError {
                        middleware: mw.name(),
                        error,
                    })
                }
            }
        }
        Ok(None)
    }

    /// Reverse pass; a substitute response keeps flowing down the chain, a
    /// request short-circuits back to scheduling.
    pub async fn process_response(
        &self,
        request: &Request,
        mut response: Response,
    ) -> Result<DownloadOutcome, MiddlewareError> {
        for mw in self.middlewares.iter().rev() {
            match mw.process_response(request, response).await {
                Ok(DownloadOutcome::Response(next)) => response = next,
                Ok(DownloadOutcome::Request(req)) => return Ok(DownloadOutcome::Request(req)),
                Err(error) => {
                    return Err(MiddlewareError {
                        middleware: mw.name(),
                        error,
                    })
                }
            }
        }
        Ok(DownloadOutcome::Response(response))
    }

    /// Reverse pass; the first middleware producing a value recovers the
    /// failed request.
    pub async fn process_error(
        &self,
        request: &Request,
        error: &CrawlError,
    ) -> Option<DownloadOutcome> {
        for mw in self.middlewares.iter().rev() {
            if let Some(outcome) = mw.process_error(request, error).await {
                return Some(outcome);
            }
        }
        None
    }

    pub fn close(&self) {
        for mw in &self.middlewares {
            mw.close();
        }
    }
}

pub struct SpiderMiddlewareManager {
    middlewares: Vec<Arc<dyn SpiderMiddleware>>,
}

impl SpiderMiddlewareManager {
    pub fn from_settings(
        settings: &Settings,
        stats: &Arc<Stats>,
        registry: &Registry,
    ) -> Result<Self, CrawlError> {
        let mut middlewares = Vec::new();
        for (name, _) in settings.get_merged_order_map("SPIDER_MIDDLEWARES") {
            let ctor = registry
                .spider_middleware(&name)
                .ok_or_else(|| CrawlError::Config(format!("unknown spider middleware {name:?}")))?;
            middlewares.push(ctor(settings, Arc::clone(stats)));
        }
        debug!(count = middlewares.len(), "spider middleware stack built");
        Ok(SpiderMiddlewareManager { middlewares })
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Reverse pass transforming the starter sequence.
    pub fn process_start_requests(&self, mut starts: ResultStream) -> ResultStream {
        for mw in self.middlewares.iter().rev() {
            starts = Arc::clone(mw).process_start_requests(starts);
        }
        starts
    }

    /// Forward pass; the first error routes the response to the errback
    /// path.
    pub fn process_spider_input(&self, response: &Response) -> Result<(), MiddlewareError> {
        for mw in &self.middlewares {
            if let Err(error) = mw.process_spider_input(response) {
                return Err(MiddlewareError {
                    middleware: mw.name(),
                    error,
                });
            }
        }
        Ok(())
    }

    /// Reverse pass over the callback output, starting at `from_index` and
    /// walking down to 0. A negative index applies nothing. A middleware
    /// returning no stream is a fatal misconfiguration, reported as an
    /// error naming it.
    pub fn process_spider_output(
        &self,
        response: Option<&Response>,
        mut results: ResultStream,
        from_index: isize,
    ) -> Result<ResultStream, MiddlewareError> {
        if self.middlewares.is_empty() || from_index < 0 {
            return Ok(results);
        }
        let start = (from_index as usize).min(self.middlewares.len() - 1);
        for i in (0..=start).rev() {
            let mw = &self.middlewares[i];
            match Arc::clone(mw).process_spider_output(response.cloned(), results) {
                Some(next) => results = next,
                None => {
                    return Err(MiddlewareError {
                        middleware: mw.name(),
                        error: CrawlError::Config(
                            "process_spider_output returned no stream".to_string(),
                        ),
                    })
                }
            }
        }
        Ok(results)
    }

    /// Reverse pass over a spider failure. The first middleware producing a
    /// stream wins; its index becomes the re-entry point for output
    /// processing.
    pub fn process_spider_error(
        &self,
        response: &Response,
        error: &CrawlError,
    ) -> Option<(ResultStream, isize)> {
        for (i, mw) in self.middlewares.iter().enumerate().rev() {
            if let Some(results) = mw.process_spider_error(response, error) {
                return Some((results, i as isize));
            }
        }
        None
    }

    pub fn close(&self) {
        for mw in &self.middlewares {
            mw.close();
        }
    }
}

pub struct ItemPipelineManager {
    pipelines: Vec<Arc<dyn ItemPipeline>>,
}

impl ItemPipelineManager {
    pub fn from_settings(
        settings: &Settings,
        stats: &Arc<Stats>,
        registry: &Registry,
    ) -> Result<Self, CrawlError> {
        let mut pipelines = Vec::new();
        for (name, _) in settings.get_merged_order_map("ITEM_PIPELINES") {
            let ctor = registry
                .item_pipeline(&name)
                .ok_or_else(|| CrawlError::Config(format!("unknown item pipeline {name:?}")))?;
            pipelines.push(ctor(settings, Arc::clone(stats)));
        }
        debug!(count = pipelines.len(), "item pipeline stack built");
        Ok(ItemPipelineManager { pipelines })
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub async fn open_all(&self) -> Result<(), CrawlError> {
        for pipeline in &self.pipelines {
            pipeline.open().await?;
        }
        Ok(())
    }

    /// Forward pass over the item; a drop stops the remaining stages.
    pub async fn process_item(
        &self,
        mut item: Item,
        response: Option<&Response>,
    ) -> Result<Item, MiddlewareError> {
        for pipeline in &self.pipelines {
            match pipeline.process_item(item, response).await {
                Ok(next) => item = next,
                Err(error) => {
                    return Err(MiddlewareError {
                        middleware: pipeline.name(),
                        error,
                    })
                }
            }
        }
        Ok(item)
    }

    pub async fn close_all(&self) {
        for pipeline in &self.pipelines {
            if let Err(error) = pipeline.close().await {
                tracing::error!(pipeline = pipeline.name(), error = %error, "pipeline close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::{no_results, results, SpiderYield};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl DownloaderMiddleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn process_request(
            &self,
            _request: &mut Request,
        ) -> Result<Option<DownloadOutcome>, CrawlError> {
            self.log.lock().push(self.name);
            Ok(None)
        }

        async fn process_response(
            &self,
            _request: &Request,
            response: Response,
        ) -> Result<DownloadOutcome, CrawlError> {
            self.log.lock().push(self.name);
            Ok(DownloadOutcome::Response(response))
        }
    }

    fn manager_of(middlewares: Vec<Arc<dyn DownloaderMiddleware>>) -> DownloaderMiddlewareManager {
        DownloaderMiddlewareManager { middlewares }
    }

    #[tokio::test]
    async fn request_forward_response_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_of(vec![
            Arc::new(Recorder {
                name: "first",
                log: Arc::clone(&log),
            }),
            Arc::new(Recorder {
                name: "second",
                log: Arc::clone(&log),
            }),
        ]);

        let mut request = Request::parse("https://example.com").unwrap();
        manager.process_request(&mut request).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);

        log.lock().clear();
        let response = Response::new(
            http::StatusCode::OK,
            http::HeaderMap::new(),
            bytes::Bytes::new(),
            request.clone(),
        );
        manager.process_response(&request, response).await.unwrap();
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    struct ShortCircuit;

    #[async_trait]
    impl DownloaderMiddleware for ShortCircuit {
        fn name(&self) -> &'static str {
            "short_circuit"
        }

        async fn process_request(
            &self,
            request: &mut Request,
        ) -> Result<Option<DownloadOutcome>, CrawlError> {
            Ok(Some(DownloadOutcome::Response(Response::new(
                http::StatusCode::OK,
                http::HeaderMap::new(),
                bytes::Bytes::from("cached"),
                request.clone(),
            ))))
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_later_middlewares() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_of(vec![
            Arc::new(ShortCircuit),
            Arc::new(Recorder {
                name: "late",
                log: Arc::clone(&log),
            }),
        ]);

        let mut request = Request::parse("https://example.com").unwrap();
        let outcome = manager.process_request(&mut request).await.unwrap();
        assert!(matches!(outcome, Some(DownloadOutcome::Response(_))));
        assert!(log.lock().is_empty());
    }

    struct TagOutput(&'static str);

    impl SpiderMiddleware for TagOutput {
        fn name(&self) -> &'static str {
            self.0
        }

        fn process_spider_output(
            self: Arc<Self>,
            _response: Option<Response>,
            results: ResultStream,
        ) -> Option<ResultStream> {
            let tag = self.0;
            Some(Box::pin(results.map(move |y| match y {
                SpiderYield::Item(mut item) => {
                    let chain = item["chain"].as_str().unwrap_or("").to_string();
                    item["chain"] = json!(format!("{chain}{tag}"));
                    SpiderYield::Item(item)
                }
                other => other,
            })))
        }
    }

    #[tokio::test]
    async fn spider_output_runs_in_reverse_from_index() {
        let manager = SpiderMiddlewareManager {
            middlewares: vec![Arc::new(TagOutput("a")), Arc::new(TagOutput("b"))],
        };

        let stream = results(vec![SpiderYield::Item(json!({ "chain": "" }))]);
        let out = manager
            .process_spider_output(None, stream, 1)
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        match &out[0] {
            SpiderYield::Item(item) => assert_eq!(item["chain"], "ba"),
            other => panic!("unexpected yield {other:?}"),
        }

        // Re-entry below the full stack applies only the lower part.
        let stream = results(vec![SpiderYield::Item(json!({ "chain": "" }))]);
        let out = manager
            .process_spider_output(None, stream, 0)
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        match &out[0] {
            SpiderYield::Item(item) => assert_eq!(item["chain"], "a"),
            other => panic!("unexpected yield {other:?}"),
        }

        // A negative index passes the stream through untouched.
        let stream = results(vec![SpiderYield::Item(json!({ "chain": "" }))]);
        let out = manager
            .process_spider_output(None, stream, -1)
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        match &out[0] {
            SpiderYield::Item(item) => assert_eq!(item["chain"], ""),
            other => panic!("unexpected yield {other:?}"),
        }
    }

    struct DropAll;

    #[async_trait]
    impl ItemPipeline for DropAll {
        fn name(&self) -> &'static str {
            "drop_all"
        }

        async fn process_item(
            &self,
            _item: Item,
            _response: Option<&Response>,
        ) -> Result<Item, CrawlError> {
            Err(CrawlError::DropItem("not wanted".to_string()))
        }
    }

    struct CountItems {
        seen: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl ItemPipeline for CountItems {
        fn name(&self) -> &'static str {
            "count_items"
        }

        async fn process_item(
            &self,
            item: Item,
            _response: Option<&Response>,
        ) -> Result<Item, CrawlError> {
            *self.seen.lock() += 1;
            Ok(item)
        }
    }

    #[tokio::test]
    async fn drop_item_stops_the_pipeline() {
        let seen = Arc::new(Mutex::new(0));
        let manager = ItemPipelineManager {
            pipelines: vec![
                Arc::new(DropAll),
                Arc::new(CountItems {
                    seen: Arc::clone(&seen),
                }),
            ],
        };

        let err = manager
            .process_item(json!({ "title": "x" }), None)
            .await
            .unwrap_err();
        assert!(err.error.is_drop_item());
        assert_eq!(err.middleware, "drop_all");
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn empty_stacks_pass_values_through() {
        let spider = SpiderMiddlewareManager {
            middlewares: Vec::new(),
        };
        let out = spider
            .process_spider_output(None, no_results(), -1)
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert!(out.is_empty());

        let items = ItemPipelineManager {
            pipelines: Vec::new(),
        };
        let item = items.process_item(json!(1), None).await.unwrap();
        assert_eq!(item, json!(1));
    }
}
