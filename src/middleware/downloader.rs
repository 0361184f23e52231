//! Built-in downloader middlewares: request metadata defaults (headers,
//! user agent, timeout, basic auth), the retry policy, and download stats.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::CrawlError;
use crate::middleware::{DownloadOutcome, DownloaderMiddleware};
use crate::registry::Registry;
use crate::request::Request;
use crate::response::Response;
use crate::settings::Settings;
use crate::stats::Stats;

pub fn register_builtins(registry: &mut Registry) {
    registry
        .register_downloader_middleware("http_auth", |s, _| Arc::new(HttpAuthMiddleware::new(s)))
        .expect("builtin registered twice");
    registry
        .register_downloader_middleware("download_timeout", |s, _| {
            Arc::new(DownloadTimeoutMiddleware::new(s))
        })
        .expect("builtin registered twice");
    registry
        .register_downloader_middleware("default_headers", |s, _| {
            Arc::new(DefaultHeadersMiddleware::new(s))
        })
        .expect("builtin registered twice");
    registry
        .register_downloader_middleware("user_agent", |s, _| Arc::new(UserAgentMiddleware::new(s)))
        .expect("builtin registered twice");
    registry
        .register_downloader_middleware("retry", |s, stats| Arc::new(RetryMiddleware::new(s, stats)))
        .expect("builtin registered twice");
    registry
        .register_downloader_middleware("downloader_stats", |_, stats| {
            Arc::new(DownloaderStatsMiddleware::new(stats))
        })
        .expect("builtin registered twice");
}

/// Adds a basic-auth header for requests to the configured domains.
/// Without `HTTP_AUTH_DOMAINS` the first request's domain is adopted, so
/// credentials never leak to arbitrary hosts.
pub struct HttpAuthMiddleware {
    auth: Option<String>,
    domains: Mutex<Vec<String>>,
    domain_unset: Mutex<bool>,
}

impl HttpAuthMiddleware {
    pub fn new(settings: &Settings) -> Self {
        let user = settings.get_str("HTTP_USER", "");
        let pass = settings.get_str("HTTP_PASS", "");
        let auth = if user.is_empty() && pass.is_empty() {
            None
        } else {
            Some(format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))))
        };
        let configured = settings.get_str_list("HTTP_AUTH_DOMAINS");
        let domain_unset = auth.is_some() && configured.is_empty();
        if domain_unset {
            tracing::warn!(
                "HTTP_AUTH_DOMAINS is not set; credentials will be pinned to the first \
                 requested domain"
            );
        }
        HttpAuthMiddleware {
            auth,
            domains: Mutex::new(configured),
            domain_unset: Mutex::new(domain_unset),
        }
    }
}

#[async_trait]
impl DownloaderMiddleware for HttpAuthMiddleware {
    fn name(&self) -> &'static str {
        "http_auth"
    }

    async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, CrawlError> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let domain = request.domain();
        {
            let mut unset = self.domain_unset.lock();
            if *unset {
                self.domains.lock().push(domain.clone());
                *unset = false;
            }
        }
        let allowed = self
            .domains
            .lock()
            .iter()
            .any(|d| d.to_lowercase() == domain);
        if allowed && !request.headers.contains_key(AUTHORIZATION) {
            if let Ok(value) = HeaderValue::from_str(auth) {
                request.headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(None)
    }
}

/// Stamps the default download timeout into the request context when the
/// request carries none.
pub struct DownloadTimeoutMiddleware {
    timeout_secs: f64,
}

impl DownloadTimeoutMiddleware {
    pub fn new(settings: &Settings) -> Self {
        DownloadTimeoutMiddleware {
            timeout_secs: settings.get_f64("DOWNLOAD_TIMEOUT", 180.0),
        }
    }
}

#[async_trait]
impl DownloaderMiddleware for DownloadTimeoutMiddleware {
    fn name(&self) -> &'static str {
        "download_timeout"
    }

    async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, CrawlError> {
        if !request.ctx.contains("download_timeout") {
            request.ctx.set("download_timeout", self.timeout_secs);
        }
        Ok(None)
    }
}

/// Fills in headers from `DEFAULT_REQUEST_HEADERS` when the request does
/// not set them itself.
pub struct DefaultHeadersMiddleware {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl DefaultHeadersMiddleware {
    pub fn new(settings: &Settings) -> Self {
        let mut headers = Vec::new();
        if let Some(serde_json::Value::Object(map)) = settings.get("DEFAULT_REQUEST_HEADERS") {
            for (name, value) in map {
                if let (Ok(name), Some(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    value.as_str().and_then(|v| HeaderValue::from_str(v).ok()),
                ) {
                    headers.push((name, value));
                }
            }
        }
        DefaultHeadersMiddleware { headers }
    }
}

#[async_trait]
impl DownloaderMiddleware for DefaultHeadersMiddleware {
    fn name(&self) -> &'static str {
        "default_headers"
    }

    async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, CrawlError> {
        for (name, value) in &self.headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        Ok(None)
    }
}

/// Sets the configured user agent on requests that carry none.
pub struct UserAgentMiddleware {
    user_agent: Option<HeaderValue>,
}

impl UserAgentMiddleware {
    pub fn new(settings: &Settings) -> Self {
        let configured = settings.get_str("USER_AGENT", "");
        UserAgentMiddleware {
            user_agent: HeaderValue::from_str(&configured)
                .ok()
                .filter(|_| !configured.is_empty()),
        }
    }
}

#[async_trait]
impl DownloaderMiddleware for UserAgentMiddleware {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, CrawlError> {
        if let Some(agent) = &self.user_agent {
            if !request.headers.contains_key(USER_AGENT) {
                request.headers.insert(USER_AGENT, agent.clone());
            }
        }
        Ok(None)
    }
}

/// Retries requests whose response status is in the retry set, and failed
/// requests whose transport error is classified as retryable.
///
/// A retry is a clone of the request with `retry_times` bumped in the
/// context, `dont_filter` set so the dupe filter lets it through, and the
/// priority adjusted. Per-request overrides come from the context keys
/// `dont_retry`, `max_retry_times` and `priority_adjust`.
pub struct RetryMiddleware {
    enabled: bool,
    max_retry_times: i64,
    priority_adjust: i64,
    retry_http_codes: HashSet<u16>,
    retry_reasons: HashSet<String>,
    stats: Arc<Stats>,
}

impl RetryMiddleware {
    pub fn new(settings: &Settings, stats: Arc<Stats>) -> Self {
        RetryMiddleware {
            enabled: settings.get_bool("RETRY_ENABLED", true),
            max_retry_times: settings.get_i64("RETRY_TIMES", 2),
            priority_adjust: settings.get_i64("RETRY_PRIORITY_ADJUST", -1),
            retry_http_codes: settings
                .get_int_list("RETRY_HTTP_CODES")
                .into_iter()
                .filter_map(|c| u16::try_from(c).ok())
                .collect(),
            retry_reasons: settings.get_str_list("RETRY_REASONS").into_iter().collect(),
            stats,
        }
    }

    fn retry(&self, request: &Request, reason: &str) -> Option<Request> {
        let retry_times = request.ctx.get_i64_or("retry_times", 0) + 1;
        let max_retry_times = request.ctx.get_i64_or("max_retry_times", self.max_retry_times);
        let priority_adjust = request.ctx.get_i64_or("priority_adjust", self.priority_adjust);

        if retry_times <= max_retry_times {
            debug!(
                url = %request.url,
                retry_times,
                reason,
                "retrying request"
            );
            let mut retried = request.clone();
            retried.ctx.set("retry_times", retry_times);
            retried.dont_filter = true;
            retried.priority += priority_adjust;
            self.stats.inc_value("retry/count", 1, 0);
            self.stats
                .inc_value(&format!("retry/count/{reason}"), 1, 0);
            Some(retried)
        } else {
            self.stats.inc_value("retry/max_reached", 1, 0);
            error!(
                url = %request.url,
                retry_times,
                reason,
                "gave up retrying request"
            );
            None
        }
    }
}

#[async_trait]
impl DownloaderMiddleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<DownloadOutcome, CrawlError> {
        if !self.enabled || request.ctx.get_bool_or("dont_retry", false) {
            return Ok(DownloadOutcome::Response(response));
        }
        if self.retry_http_codes.contains(&response.status.as_u16()) {
            let reason = response.status.as_u16().to_string();
            if let Some(retried) = self.retry(request, &reason) {
                return Ok(DownloadOutcome::Request(retried));
            }
        }
        Ok(DownloadOutcome::Response(response))
    }

    async fn process_error(
        &self,
        request: &Request,
        error: &CrawlError,
    ) -> Option<DownloadOutcome> {
        if !self.enabled || request.ctx.get_bool_or("dont_retry", false) {
            return None;
        }
        let reason = error.reason();
        if !self.retry_reasons.contains(&reason) {
            return None;
        }
        self.retry(request, &reason).map(DownloadOutcome::Request)
    }
}

/// Counts requests, responses and errors passing through the downloader.
pub struct DownloaderStatsMiddleware {
    stats: Arc<Stats>,
}

impl DownloaderStatsMiddleware {
    pub fn new(stats: Arc<Stats>) -> Self {
        DownloaderStatsMiddleware { stats }
    }
}

#[async_trait]
impl DownloaderMiddleware for DownloaderStatsMiddleware {
    fn name(&self) -> &'static str {
        "downloader_stats"
    }

    async fn process_request(
        &self,
        request: &mut Request,
    ) -> Result<Option<DownloadOutcome>, CrawlError> {
        self.stats.inc_value("downloader/request_count", 1, 0);
        self.stats.inc_value(
            &format!(
                "downloader/request_method_count/{}",
                request.method.as_str().to_lowercase()
            ),
            1,
            0,
        );
        self.stats
            .inc_value("downloader/request_bytes", request.wire_size() as i64, 0);
        Ok(None)
    }

    async fn process_response(
        &self,
        _request: &Request,
        response: Response,
    ) -> Result<DownloadOutcome, CrawlError> {
        self.stats.inc_value("downloader/response_count", 1, 0);
        self.stats.inc_value(
            &format!(
                "downloader/response_status_count/{}",
                response.status.as_u16()
            ),
            1,
            0,
        );
        self.stats
            .inc_value("downloader/response_bytes", response.wire_size() as i64, 0);
        Ok(DownloadOutcome::Response(response))
    }

    async fn process_error(
        &self,
        _request: &Request,
        error: &CrawlError,
    ) -> Option<DownloadOutcome> {
        self.stats.inc_value("downloader/error_count", 1, 0);
        self.stats.inc_value(
            &format!("downloader/error_type_count/{}", error.reason()),
            1,
            0,
        );
        None
    }
}
