//! Built-in spider middlewares: starter tagging, depth accounting, URL
//! length and domain gates, and the HTTP error gate in front of callbacks.
//!
//! The output-shaped hooks transform the result stream lazily; a dropped
//! request simply never surfaces from the stream.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::info;

use crate::error::CrawlError;
use crate::middleware::SpiderMiddleware;
use crate::registry::Registry;
use crate::response::Response;
use crate::settings::Settings;
use crate::spider::{ResultStream, SpiderYield};
use crate::stats::Stats;

pub fn register_builtins(registry: &mut Registry) {
    registry
        .register_spider_middleware("start", |_, _| Arc::new(StartMiddleware))
        .expect("builtin registered twice");
    registry
        .register_spider_middleware("depth", |s, stats| Arc::new(DepthMiddleware::new(s, stats)))
        .expect("builtin registered twice");
    registry
        .register_spider_middleware("url_length", |s, stats| {
            Arc::new(UrlLengthMiddleware::new(s, stats))
        })
        .expect("builtin registered twice");
    registry
        .register_spider_middleware("allowed_domains", |s, stats| {
            Arc::new(AllowedDomainsMiddleware::new(s, stats))
        })
        .expect("builtin registered twice");
    registry
        .register_spider_middleware("http_error", |s, stats| {
            Arc::new(HttpErrorMiddleware::new(s, stats))
        })
        .expect("builtin registered twice");
}

/// Tags every starter request so downstream middlewares can tell seeds from
/// discovered links.
pub struct StartMiddleware;

impl SpiderMiddleware for StartMiddleware {
    fn name(&self) -> &'static str {
        "start"
    }

    fn process_start_requests(self: Arc<Self>, starts: ResultStream) -> ResultStream {
        Box::pin(starts.map(|y| {
            if let SpiderYield::Request(request) = &y {
                request.ctx.set("is_start_request", true);
            }
            y
        }))
    }
}

/// Tracks request depth: starters get depth 0, every descendant gets its
/// parent's depth plus one. Requests beyond `DEPTH_LIMIT` are dropped, and
/// `DEPTH_PRIORITY` trades depth against scheduling priority.
pub struct DepthMiddleware {
    max_depth: i64,
    depth_priority: i64,
    verbose_stats: bool,
    stats: Arc<Stats>,
}

impl DepthMiddleware {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        DepthMiddleware {
            max_depth: settings.get_i64("DEPTH_LIMIT", 0),
            depth_priority: settings.get_i64("DEPTH_PRIORITY", 0),
            verbose_stats: settings.get_bool("DEPTH_STATS_VERBOSE", true),
            stats,
        }
    }
}

impl SpiderMiddleware for DepthMiddleware {
    fn name(&self) -> &'static str {
        "depth"
    }

    fn process_start_requests(self: Arc<Self>, starts: ResultStream) -> ResultStream {
        let mw = self;
        Box::pin(starts.map(move |y| {
            if let SpiderYield::Request(request) = &y {
                request.ctx.set("depth", 0);
                mw.stats.inc_value("request_depth_count/0", 1, 0);
                mw.stats.max_value("request_depth_max", 0);
            }
            y
        }))
    }

    fn process_spider_output(
        self: Arc<Self>,
        response: Option<Response>,
        results: ResultStream,
    ) -> Option<ResultStream> {
        let parent_depth = response
            .map(|r| r.ctx.get_i64_or("depth", 0))
            .unwrap_or(0);
        let mw = self;
        Some(Box::pin(results.filter_map(move |y| {
            let out = match y {
                SpiderYield::Request(mut request) => {
                    let depth = parent_depth + 1;
                    request.ctx.set("depth", depth);
                    if mw.depth_priority != 0 {
                        request.priority -= depth * mw.depth_priority;
                    }
                    if mw.max_depth > 0 && depth > mw.max_depth {
                        info!(
                            url = %request.url,
                            depth,
                            max_depth = mw.max_depth,
                            "request dropped, over depth limit"
                        );
                        None
                    } else {
                        if mw.verbose_stats {
                            mw.stats
                                .inc_value(&format!("request_depth_count/{depth}"), 1, 0);
                            mw.stats.max_value("request_depth_max", depth);
                        }
                        Some(SpiderYield::Request(request))
                    }
                }
                item => Some(item),
            };
            future::ready(out)
        })))
    }
}

/// Drops requests whose URL exceeds the configured length.
pub struct UrlLengthMiddleware {
    max_length: i64,
    stats: Arc<Stats>,
}

impl UrlLengthMiddleware {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        UrlLengthMiddleware {
            max_length: settings.get_i64("URL_LENGTH_LIMIT", 2083),
            stats,
        }
    }
}

impl SpiderMiddleware for UrlLengthMiddleware {
    fn name(&self) -> &'static str {
        "url_length"
    }

    fn process_spider_output(
        self: Arc<Self>,
        _response: Option<Response>,
        results: ResultStream,
    ) -> Option<ResultStream> {
        let mw = self;
        Some(Box::pin(results.filter_map(move |y| {
            let out = match &y {
                SpiderYield::Request(request)
                    if mw.max_length > 0 && request.url.as_str().len() as i64 > mw.max_length =>
                {
                    info!(
                        url = %request.url,
                        max_url_length = mw.max_length,
                        "request dropped, url too long"
                    );
                    mw.stats.inc_value("urllength/request_ignored_count", 1, 0);
                    None
                }
                _ => Some(y),
            };
            future::ready(out)
        })))
    }
}

/// Drops requests whose domain is outside `ALLOWED_DOMAINS`. An empty list
/// allows everything; distinct domains are still counted either way.
pub struct AllowedDomainsMiddleware {
    allowed: Vec<String>,
    seen: Mutex<HashSet<String>>,
    stats: Arc<Stats>,
}

impl AllowedDomainsMiddleware {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        AllowedDomainsMiddleware {
            allowed: settings.get_str_list("ALLOWED_DOMAINS"),
            seen: Mutex::new(HashSet::new()),
            stats,
        }
    }
}

impl SpiderMiddleware for AllowedDomainsMiddleware {
    fn name(&self) -> &'static str {
        "allowed_domains"
    }

    fn process_spider_output(
        self: Arc<Self>,
        _response: Option<Response>,
        results: ResultStream,
    ) -> Option<ResultStream> {
        let mw = self;
        Some(Box::pin(results.filter_map(move |y| {
            let out = match &y {
                SpiderYield::Request(request) => {
                    let domain = request.domain();
                    if mw.seen.lock().insert(domain.clone()) {
                        mw.stats.inc_value("allowed_domain/domains", 1, 0);
                    }
                    if !mw.allowed.is_empty() && !mw.allowed.contains(&domain) {
                        info!(url = %request.url, domain = %domain, "request dropped, domain not allowed");
                        mw.stats.inc_value("allowed_domain/filtered", 1, 0);
                        None
                    } else {
                        Some(y)
                    }
                }
                _ => Some(y),
            };
            future::ready(out)
        })))
    }
}

/// Blocks non-2xx responses from reaching their callback unless the status
/// is explicitly allowed, per request (`handle_httpstatus_list` /
/// `handle_httpstatus_all` context keys) or globally.
pub struct HttpErrorMiddleware {
    allow_all: bool,
    allowed_codes: Vec<i64>,
    stats: Arc<Stats>,
}

impl HttpErrorMiddleware {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        HttpErrorMiddleware {
            allow_all: settings.get_bool("HTTPERROR_ALLOW_ALL", false),
            allowed_codes: settings.get_int_list("HTTPERROR_ALLOWED_CODES"),
            stats,
        }
    }
}

impl SpiderMiddleware for HttpErrorMiddleware {
    fn name(&self) -> &'static str {
        "http_error"
    }

    fn process_spider_input(&self, response: &Response) -> Result<(), CrawlError> {
        if response.status.is_success() {
            return Ok(());
        }
        if response.ctx.get_bool_or("handle_httpstatus_all", false) {
            return Ok(());
        }
        let status = response.status.as_u16() as i64;
        let allowed = match response.ctx.get_int_list("handle_httpstatus_list") {
            Some(list) => list,
            None if self.allow_all => return Ok(()),
            None => self.allowed_codes.clone(),
        };
        if allowed.contains(&status) {
            return Ok(());
        }
        Err(CrawlError::HttpCode(response.status.as_u16()))
    }

    fn process_spider_error(
        &self,
        response: &Response,
        error: &CrawlError,
    ) -> Option<ResultStream> {
        if let CrawlError::HttpCode(_) = error {
            self.stats
                .inc_value("httperror/response_dropped_count", 1, 0);
            self.stats.inc_value(
                &format!("httperror/response_dropped_status_count/{}", error.reason()),
                1,
                0,
            );
            info!(
                url = %response.request.url,
                status = response.status.as_u16(),
                "response dropped, http status not handled"
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::spider::results;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn request(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    fn response_with_status(status: u16) -> Response {
        Response::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            request("https://example.com"),
        )
    }

    async fn collect(stream: ResultStream) -> Vec<SpiderYield> {
        stream.collect().await
    }

    #[tokio::test]
    async fn depth_annotates_and_drops() {
        let settings = Settings::with_defaults();
        settings.set("DEPTH_LIMIT", 1);
        settings.set("DEPTH_PRIORITY", 1);
        let stats = Arc::new(Stats::new());
        let mw = Arc::new(DepthMiddleware::new(&settings, Arc::clone(&stats)));

        // Starters get depth 0.
        let starts = Arc::clone(&mw)
            .process_start_requests(results(vec![SpiderYield::Request(request(
                "https://example.com/seed",
            ))]));
        let starters = collect(starts).await;
        match &starters[0] {
            SpiderYield::Request(r) => assert_eq!(r.ctx.get_i64_or("depth", -1), 0),
            other => panic!("unexpected {other:?}"),
        }

        // A child of a depth-0 response is fine; a child of depth 1 is over
        // the limit and dropped.
        let parent = response_with_status(200);
        parent.ctx.set("depth", 0);
        let out = Arc::clone(&mw)
            .process_spider_output(
                Some(parent),
                results(vec![SpiderYield::Request(request("https://example.com/1"))]),
            )
            .unwrap();
        let kept = collect(out).await;
        assert_eq!(kept.len(), 1);
        match &kept[0] {
            SpiderYield::Request(r) => {
                assert_eq!(r.ctx.get_i64_or("depth", 0), 1);
                assert_eq!(r.priority, -1, "priority reduced by depth");
            }
            other => panic!("unexpected {other:?}"),
        }

        let deep_parent = response_with_status(200);
        deep_parent.ctx.set("depth", 1);
        let out = mw
            .process_spider_output(
                Some(deep_parent),
                results(vec![SpiderYield::Request(request("https://example.com/2"))]),
            )
            .unwrap();
        assert!(collect(out).await.is_empty());
        assert_eq!(stats.get_int("request_depth_max", -1), 1);
    }

    #[tokio::test]
    async fn url_length_gate() {
        let settings = Settings::with_defaults();
        settings.set("URL_LENGTH_LIMIT", 30);
        let stats = Arc::new(Stats::new());
        let mw = Arc::new(UrlLengthMiddleware::new(&settings, Arc::clone(&stats)));

        let out = mw
            .process_spider_output(
                None,
                results(vec![
                    SpiderYield::Request(request("https://example.com/ok")),
                    SpiderYield::Request(request(
                        "https://example.com/a-very-long-path-over-the-limit",
                    )),
                ]),
            )
            .unwrap();
        let kept = collect(out).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(stats.get_int("urllength/request_ignored_count", 0), 1);
    }

    #[tokio::test]
    async fn allowed_domains_gate() {
        let settings = Settings::with_defaults();
        settings.set("ALLOWED_DOMAINS", serde_json::json!(["example.com"]));
        let stats = Arc::new(Stats::new());
        let mw = Arc::new(AllowedDomainsMiddleware::new(&settings, Arc::clone(&stats)));

        let out = mw
            .process_spider_output(
                None,
                results(vec![
                    SpiderYield::Request(request("https://sub.example.com/ok")),
                    SpiderYield::Request(request("https://elsewhere.org/no")),
                ]),
            )
            .unwrap();
        let kept = collect(out).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(stats.get_int("allowed_domain/filtered", 0), 1);
        assert_eq!(stats.get_int("allowed_domain/domains", 0), 2);
    }

    #[test]
    fn http_error_gate_respects_allow_lists() {
        let settings = Settings::with_defaults();
        settings.set("HTTPERROR_ALLOWED_CODES", serde_json::json!([404]));
        let stats = Arc::new(Stats::new());
        let mw = HttpErrorMiddleware::new(&settings, Arc::clone(&stats));

        assert!(mw.process_spider_input(&response_with_status(200)).is_ok());
        assert!(mw.process_spider_input(&response_with_status(404)).is_ok());

        let denied = response_with_status(500);
        let err = mw.process_spider_input(&denied).unwrap_err();
        assert!(matches!(err, CrawlError::HttpCode(500)));

        // Per-request allow list wins over the global one.
        let allowed = response_with_status(500);
        allowed.ctx.set("handle_httpstatus_list", serde_json::json!([500]));
        assert!(mw.process_spider_input(&allowed).is_ok());

        let anything = response_with_status(500);
        anything.ctx.set("handle_httpstatus_all", true);
        assert!(mw.process_spider_input(&anything).is_ok());

        // The error hook records the drop but cannot recover it.
        assert!(mw.process_spider_error(&denied, &err).is_none());
        assert_eq!(stats.get_int("httperror/response_dropped_count", 0), 1);
        assert_eq!(
            stats.get_int("httperror/response_dropped_status_count/500", 0),
            1
        );
    }

    #[tokio::test]
    async fn start_middleware_tags_seeds() {
        let mw = Arc::new(StartMiddleware);
        let out = mw.process_start_requests(results(vec![SpiderYield::Request(request(
            "https://example.com",
        ))]));
        match &collect(out).await[0] {
            SpiderYield::Request(r) => assert!(r.ctx.get_bool_or("is_start_request", false)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
