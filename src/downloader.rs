//! HTTP transport.
//!
//! The engine only knows the [`Downloader`] trait; [`HttpDownloader`] is the
//! reqwest-backed implementation. Per-request behavior comes from the
//! request itself: `download_timeout` and `proxy` ride in the context map,
//! cookies and headers on the request. Transport failures are classified
//! into reason categories so the retry middleware and the error stats can
//! branch on them without touching reqwest types.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{CrawlError, TransportErrorKind};
use crate::request::Request;
use crate::response::Response;
use crate::settings::Settings;

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, CrawlError>;

    fn close(&self) {}
}

pub struct HttpDownloader {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpDownloader {
    pub fn from_settings(settings: &Settings) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build http client: {e}")))?;
        Ok(HttpDownloader {
            client,
            default_timeout: settings.get_duration_secs("DOWNLOAD_TIMEOUT", 180.0),
        })
    }

    fn client_for(&self, request: &Request) -> Result<reqwest::Client, CrawlError> {
        // Proxies are a per-client concern in reqwest, so a proxied request
        // gets a transient client.
        match request.ctx.get_str("proxy") {
            Some(proxy) if !proxy.is_empty() => {
                let proxy = reqwest::Proxy::all(&proxy)
                    .map_err(|e| CrawlError::Config(format!("invalid proxy {proxy:?}: {e}")))?;
                reqwest::Client::builder()
                    .cookie_store(true)
                    .proxy(proxy)
                    .build()
                    .map_err(|e| CrawlError::Config(format!("failed to build proxied client: {e}")))
            }
            _ => Ok(self.client.clone()),
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, request: &Request) -> Result<Response, CrawlError> {
        let timeout = if request.ctx.contains("download_timeout") {
            Duration::from_secs_f64(
                request
                    .ctx
                    .get_f64_or("download_timeout", self.default_timeout.as_secs_f64())
                    .max(0.0),
            )
        } else {
            self.default_timeout
        };

        let client = self.client_for(request)?;
        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .timeout(timeout)
            .headers(request.headers.clone());

        if !request.cookies.is_empty() {
            let cookie_header = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(http::header::COOKIE, cookie_header);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        trace!(url = %request.url, method = %request.method, "fetching");
        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        Ok(Response::new(status, headers, body, request.clone()))
    }
}

fn classify(error: reqwest::Error) -> CrawlError {
    let message = error.to_string();
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        // reqwest folds resolver failures into connect errors; the source
        // chain is the only place the distinction survives.
        let mut source: Option<&(dyn std::error::Error + 'static)> = error.source();
        let mut dns = false;
        while let Some(err) = source {
            let text = err.to_string().to_lowercase();
            if text.contains("dns") || text.contains("resolve") {
                dns = true;
                break;
            }
            source = err.source();
        }
        if dns {
            TransportErrorKind::Dns
        } else {
            TransportErrorKind::ConnectionRefused
        }
    } else {
        TransportErrorKind::Unknown
    };
    CrawlError::transport(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_settings() {
        let settings = Settings::with_defaults();
        let downloader = HttpDownloader::from_settings(&settings).unwrap();
        assert_eq!(downloader.default_timeout, Duration::from_secs(180));
    }

    #[test]
    fn per_request_timeout_overrides_default() {
        let settings = Settings::with_defaults();
        let downloader = HttpDownloader::from_settings(&settings).unwrap();
        let request = Request::parse("https://example.com").unwrap();
        request.ctx.set("download_timeout", 5);
        // The override is read inside fetch; here we only check the ctx
        // plumbing the middleware uses.
        assert_eq!(request.ctx.get_f64_or("download_timeout", 0.0), 5.0);
        drop(downloader);
    }
}
