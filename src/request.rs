//! The crawl request.
//!
//! A `Request` owns everything the downloader needs plus the scheduling
//! metadata the engine cares about: an integer priority (higher pops
//! earlier), a `dont_filter` escape hatch for the dupe filter, and the names
//! of the callback/errback that will handle its response. The context map is
//! shared with the eventual `Response` and mutated only by middlewares.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde_json::{json, Value};
use url::Url;

use crate::context::Ctx;
use crate::error::CrawlError;

#[derive(Clone, Debug)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Name/value cookie pairs sent with the request.
    pub cookies: Vec<(String, String)>,
    pub encoding: String,
    pub priority: i64,
    pub dont_filter: bool,
    pub ctx: Ctx,
    /// Registered callback invoked with the response. Empty means the
    /// spider's default callback.
    pub callback: String,
    /// Registered errback invoked when the request fails. Empty means none.
    pub errback: String,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Request {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            cookies: Vec::new(),
            encoding: "utf-8".to_string(),
            priority: 0,
            dont_filter: false,
            ctx: Ctx::new(),
            callback: String::new(),
            errback: String::new(),
        }
    }

    pub fn parse(url: &str) -> Result<Self, CrawlError> {
        let url = Url::parse(url).map_err(|e| CrawlError::Config(format!("invalid url {url:?}: {e}")))?;
        Ok(Request::new(url))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.encoding = encoding.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dont_filter(mut self, dont_filter: bool) -> Self {
        self.dont_filter = dont_filter;
        self
    }

    pub fn with_callback(mut self, name: &str) -> Self {
        self.callback = name.to_string();
        self
    }

    pub fn with_errback(mut self, name: &str) -> Self {
        self.errback = name.to_string();
        self
    }

    pub fn with_ctx(mut self, ctx: Ctx) -> Self {
        self.ctx = ctx;
        self
    }

    /// Registrable domain of the request URL (last two host labels), cached
    /// in the context so per-domain slot lookups stay cheap.
    pub fn domain(&self) -> String {
        if let Some(d) = self.ctx.get_str("domain") {
            return d;
        }
        let d = registrable_domain(&self.url);
        self.ctx.set("domain", d.clone());
        d
    }

    /// Approximate wire size of the request line, headers, cookies and body.
    pub fn wire_size(&self) -> usize {
        let mut size = self.method.as_str().len() + 1 + self.url.as_str().len() + " HTTP/1.1\r\n".len();
        size += "Host: ".len() + self.domain().len() + 2;
        for (name, value) in self.headers.iter() {
            size += name.as_str().len() + 2 + value.len() + 2;
        }
        if !self.cookies.is_empty() {
            size += "Cookie: ".len();
            for (name, value) in &self.cookies {
                size += name.len() + 1 + value.len() + 1;
            }
        }
        if let Some(body) = &self.body {
            size += body.len();
        }
        size
    }

    /// Serialize every field into a JSON dict. The body is base64-encoded;
    /// the context map is embedded as an object.
    pub fn to_dict(&self) -> Value {
        let mut headers = serde_json::Map::new();
        for name in self.headers.keys() {
            let values: Vec<Value> = self
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(|v| Value::String(v.to_string()))
                .collect();
            headers.insert(name.as_str().to_string(), Value::Array(values));
        }
        let cookies: Vec<Value> = self
            .cookies
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect();
        json!({
            "url": self.url.as_str(),
            "method": self.method.as_str(),
            "headers": Value::Object(headers),
            "body": self.body.as_ref().map(|b| BASE64.encode(b)).unwrap_or_default(),
            "cookies": cookies,
            "encoding": self.encoding,
            "priority": self.priority,
            "dont_filter": self.dont_filter,
            "ctx": self.ctx.to_value(),
            "callback": self.callback,
            "errback": self.errback,
        })
    }

    /// Rebuild a request from its dict form. Missing or malformed required
    /// fields are configuration errors.
    pub fn from_dict(dict: &Value) -> Result<Self, CrawlError> {
        let field = |key: &str| {
            dict.get(key)
                .ok_or_else(|| CrawlError::Config(format!("request dict missing {key:?}")))
        };
        let str_field = |key: &str| -> Result<String, CrawlError> {
            Ok(field(key)?
                .as_str()
                .ok_or_else(|| CrawlError::Config(format!("request dict field {key:?} is not a string")))?
                .to_string())
        };

        let url = Url::parse(&str_field("url")?)
            .map_err(|e| CrawlError::Config(format!("request dict has invalid url: {e}")))?;
        let method = str_field("method")?
            .parse::<Method>()
            .map_err(|e| CrawlError::Config(format!("request dict has invalid method: {e}")))?;

        let mut headers = HeaderMap::new();
        if let Value::Object(map) = field("headers")? {
            for (name, values) in map {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| CrawlError::Config(format!("invalid header name {name:?}: {e}")))?;
                if let Value::Array(values) = values {
                    for value in values {
                        if let Some(s) = value.as_str() {
                            let value = HeaderValue::from_str(s).map_err(|e| {
                                CrawlError::Config(format!("invalid header value {s:?}: {e}"))
                            })?;
                            headers.append(name.clone(), value);
                        }
                    }
                }
            }
        }

        let body_b64 = str_field("body")?;
        let body = if body_b64.is_empty() {
            None
        } else {
            Some(Bytes::from(BASE64.decode(body_b64.as_bytes()).map_err(
                |e| CrawlError::Config(format!("request dict has invalid body: {e}")),
            )?))
        };

        let mut cookies = Vec::new();
        if let Value::Array(pairs) = field("cookies")? {
            for pair in pairs {
                if let (Some(k), Some(v)) = (
                    pair.get(0).and_then(Value::as_str),
                    pair.get(1).and_then(Value::as_str),
                ) {
                    cookies.push((k.to_string(), v.to_string()));
                }
            }
        }

        Ok(Request {
            url,
            method,
            headers,
            body,
            cookies,
            encoding: str_field("encoding")?,
            priority: field("priority")?
                .as_i64()
                .ok_or_else(|| CrawlError::Config("request dict priority is not an integer".into()))?,
            dont_filter: field("dont_filter")?
                .as_bool()
                .ok_or_else(|| CrawlError::Config("request dict dont_filter is not a bool".into()))?,
            ctx: Ctx::from_value(field("ctx")?),
            callback: str_field("callback")?,
            errback: str_field("errback")?,
        })
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.method == other.method
            && self.headers == other.headers
            && self.body == other.body
            && self.cookies == other.cookies
            && self.encoding == other.encoding
            && self.priority == other.priority
            && self.dont_filter == other.dont_filter
            && self.callback == other.callback
            && self.errback == other.errback
            && self.ctx.to_value() == other.ctx.to_value()
    }
}

fn registrable_domain(url: &Url) -> String {
    let host = match url.host_str() {
        Some(h) => h,
        None => return "unknown".to_string(),
    };
    let labels: Vec<&str> = host.split('.').collect();
    match labels.len() {
        0 => "unknown".to_string(),
        1 => labels[0].to_string(),
        n => format!("{}.{}", labels[n - 2], labels[n - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let req = Request::parse("https://example.com").unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.priority, 0);
        assert!(!req.dont_filter);
        assert!(Request::parse("://invalid").is_err());
    }

    #[test]
    fn builder_options() {
        let req = Request::parse("https://example.com")
            .unwrap()
            .with_method(Method::POST)
            .with_body("payload")
            .with_cookie("session", "12345")
            .with_encoding("gbk")
            .with_priority(10)
            .with_dont_filter(true)
            .with_callback("parse_page")
            .with_errback("handle_failure");

        assert_eq!(req.method, Method::POST);
        assert_eq!(req.encoding, "gbk");
        assert_eq!(req.priority, 10);
        assert!(req.dont_filter);
        assert_eq!(req.callback, "parse_page");
        assert_eq!(req.errback, "handle_failure");
    }

    #[test]
    fn domain_strips_subdomains() {
        for (url, expected) in [
            ("https://www.example.com/a", "example.com"),
            ("https://deep.sub.example.org", "example.org"),
            ("https://example.net", "example.net"),
        ] {
            let req = Request::parse(url).unwrap();
            assert_eq!(req.domain(), expected, "for {url}");
        }
    }

    #[test]
    fn dict_round_trip() {
        let req = Request::parse("https://example.com/search?q=1")
            .unwrap()
            .with_method(Method::POST)
            .with_header("accept", "text/html")
            .with_header("accept", "application/json")
            .with_body("a=1&b=2")
            .with_cookie("sid", "abc")
            .with_priority(5)
            .with_dont_filter(true)
            .with_callback("parse_search")
            .with_errback("on_error");
        req.ctx.set("depth", 2);

        let restored = Request::from_dict(&req.to_dict()).unwrap();
        assert_eq!(restored, req);
    }
}
