//! The downloaded response. Carries the originating request and shares its
//! context map; clones are cheap (the body is reference-counted).

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::context::Ctx;
use crate::request::Request;

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub request: Request,
    pub ctx: Ctx,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, request: Request) -> Self {
        let ctx = request.ctx.clone();
        Response {
            status,
            body,
            headers,
            request,
            ctx,
        }
    }

    /// Approximate wire size: status line, headers and body.
    pub fn wire_size(&self) -> usize {
        let status_line = "HTTP/1.1 ".len()
            + 3
            + 1
            + self.status.canonical_reason().map(str::len).unwrap_or(0)
            + 2;
        let mut size = status_line + self.body.len();
        for (name, value) in self.headers.iter() {
            size += name.as_str().len() + 2 + value.len() + 2;
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_ctx_with_request() {
        let request = Request::parse("https://example.com").unwrap();
        request.ctx.set("depth", 1);
        let response = Response::new(StatusCode::OK, HeaderMap::new(), Bytes::from("ok"), request);
        response.ctx.set("table", "pages");
        assert_eq!(response.request.ctx.get_i64_or("depth", 0), 1);
        assert_eq!(response.request.ctx.get_str("table").as_deref(), Some("pages"));
    }

    #[test]
    fn wire_size_counts_headers_and_body() {
        let request = Request::parse("https://example.com").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        let response = Response::new(StatusCode::OK, headers, Bytes::from("hello"), request);
        assert!(response.wire_size() > 5);
    }
}
