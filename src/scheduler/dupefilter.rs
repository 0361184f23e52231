//! Fingerprint-based request deduplication.
//!
//! A fingerprint is the lowercase hex SHA-1 of a canonical JSON rendering of
//! the request: lowercased method, URL with the fragment stripped (unless
//! asked to keep it), an optional selection of headers (names lowercased,
//! values sorted), and the body. Two requests with equal fingerprints are
//! the same request for deduplication purposes.
//!
//! The seen-set only ever grows; a crawl that revisits a URL must set
//! `dont_filter` on the request.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::request::Request;
use crate::stats::Stats;

/// Fingerprint with the default rules: no headers, fragment stripped.
pub fn fingerprint(request: &Request) -> String {
    request_fingerprint(request, &[], false)
}

/// Fingerprint with explicit header selection and fragment handling.
pub fn request_fingerprint(
    request: &Request,
    include_headers: &[&str],
    keep_fragments: bool,
) -> String {
    let mut url = request.url.clone();
    if !keep_fragments {
        url.set_fragment(None);
    }

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in include_headers {
        let lowered = name.to_lowercase();
        let mut values: Vec<String> = request
            .headers
            .get_all(lowered.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.to_lowercase())
            .collect();
        values.sort();
        if !values.is_empty() {
            headers.insert(lowered, values);
        }
    }

    let canonical = json!({
        "method": request.method.as_str().to_lowercase(),
        "url": url.as_str(),
        "headers": headers,
        "body": request.body.as_ref().map(|b| BASE64.encode(b)).unwrap_or_default(),
    });

    let mut hasher = Sha1::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct DupeFilter {
    fingerprints: HashSet<String>,
    stats: Arc<Stats>,
}

impl DupeFilter {
    pub fn new(stats: Arc<Stats>) -> Self {
        DupeFilter {
            fingerprints: HashSet::new(),
            stats,
        }
    }

    /// Whether this request's fingerprint has been seen before. Marks it
    /// seen as a side effect, so the first caller wins.
    pub fn request_seen(&mut self, request: &Request) -> bool {
        !self.fingerprints.insert(fingerprint(request))
    }

    pub fn log_filtered(&self, request: &Request) {
        debug!(url = %request.url, method = %request.method, "duplicate request filtered");
        self.stats.inc_value("dupefilter/filtered", 1, 0);
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Request::parse("https://example.com/page?x=1").unwrap();
        let b = Request::parse("https://example.com/page?x=1").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 40);
        assert!(fingerprint(&a).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn method_body_and_url_change_the_digest() {
        let base = Request::parse("https://example.com/page").unwrap();
        let post = Request::parse("https://example.com/page")
            .unwrap()
            .with_method(Method::POST);
        let other_url = Request::parse("https://example.com/other").unwrap();
        let with_body = Request::parse("https://example.com/page")
            .unwrap()
            .with_body("x=1");

        let fp = fingerprint(&base);
        assert_ne!(fp, fingerprint(&post));
        assert_ne!(fp, fingerprint(&other_url));
        assert_ne!(fp, fingerprint(&with_body));
    }

    #[test]
    fn fragments_are_stripped_by_default() {
        let plain = Request::parse("https://example.com/page").unwrap();
        let fragment = Request::parse("https://example.com/page#section").unwrap();
        assert_eq!(fingerprint(&plain), fingerprint(&fragment));
        assert_ne!(
            request_fingerprint(&plain, &[], true),
            request_fingerprint(&fragment, &[], true)
        );
    }

    #[test]
    fn header_selection_is_case_insensitive() {
        let tagged = Request::parse("https://example.com")
            .unwrap()
            .with_header("X-Token", "Secret");
        let untagged = Request::parse("https://example.com").unwrap();

        assert_eq!(fingerprint(&tagged), fingerprint(&untagged));
        assert_ne!(
            request_fingerprint(&tagged, &["x-token"], false),
            request_fingerprint(&untagged, &["x-token"], false)
        );
    }

    #[test]
    fn seen_set_grows_monotonically() {
        let mut filter = DupeFilter::new(Arc::new(Stats::new()));
        let req = Request::parse("https://example.com").unwrap();
        assert!(!filter.request_seen(&req));
        assert!(filter.request_seen(&req));
        assert_eq!(filter.len(), 1);
    }
}
