//! Error taxonomy for the crawl pipeline.
//!
//! Every error that can travel through the signal bus is `Clone`: transport
//! failures are captured as a reason category plus message at the downloader
//! boundary instead of carrying live source errors around.

use thiserror::Error;

/// Category assigned to a network-level failure by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    Dns,
    Unknown,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionRefused => "connection_refused",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced and consumed by the crawl pipeline.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    /// A middleware deliberately discarded a request. Never retried.
    #[error("request dropped: {0}")]
    DropRequest(String),

    /// An item pipeline rejected an item.
    #[error("item dropped: {0}")]
    DropItem(String),

    /// A response status outside the allowed set. A kind of request drop.
    #[error("http status {0} not allowed")]
    HttpCode(u16),

    /// Network-level failure reported by the transport.
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// A user callback or errback failed.
    #[error("spider callback failed: {0}")]
    Spider(String),

    /// Invalid URL, unparseable dict field, bad settings value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CrawlError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        CrawlError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// True for the drop-request family (including http-code drops).
    pub fn is_drop_request(&self) -> bool {
        matches!(self, CrawlError::DropRequest(_) | CrawlError::HttpCode(_))
    }

    pub fn is_drop_item(&self) -> bool {
        matches!(self, CrawlError::DropItem(_))
    }

    /// Short reason tag used in stats keys such as `retry/count/{reason}`
    /// and `downloader/error_type_count/{reason}`.
    pub fn reason(&self) -> String {
        match self {
            CrawlError::DropRequest(_) => "drop_request".to_string(),
            CrawlError::DropItem(_) => "drop_item".to_string(),
            CrawlError::HttpCode(code) => code.to_string(),
            CrawlError::Transport { kind, .. } => kind.as_str().to_string(),
            CrawlError::Spider(_) => "spider_error".to_string(),
            CrawlError::Config(_) => "config_error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_code_is_a_request_drop() {
        assert!(CrawlError::HttpCode(404).is_drop_request());
        assert!(CrawlError::DropRequest("offsite".into()).is_drop_request());
        assert!(!CrawlError::DropItem("dup".into()).is_drop_request());
    }

    #[test]
    fn reason_tags() {
        assert_eq!(CrawlError::HttpCode(503).reason(), "503");
        let err = CrawlError::transport(TransportErrorKind::Timeout, "deadline exceeded");
        assert_eq!(err.reason(), "timeout");
    }
}
