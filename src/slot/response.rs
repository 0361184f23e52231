//! Byte budget for responses being parsed. A response is admitted before
//! its callback runs and released when parsing ends; the engine's scheduler
//! loop stops feeding new requests while the budget is exhausted.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::debug;

use crate::response::Response;
use crate::settings::Settings;

/// Minimum charge per response, so empty bodies still count.
const MIN_RESPONSE_SIZE: i64 = 1024;

pub struct ResponseSlot {
    active_bytes: AtomicI64,
    max_active_bytes: i64,
}

impl ResponseSlot {
    pub fn new(settings: &Settings) -> Self {
        ResponseSlot {
            active_bytes: AtomicI64::new(0),
            max_active_bytes: settings.get_i64("DOWNLOAD_MAXSIZE", 1_073_741_824),
        }
    }

    fn charge(response: &Response) -> i64 {
        (response.body.len() as i64).max(MIN_RESPONSE_SIZE)
    }

    pub fn add(&self, response: &Response) {
        self.active_bytes
            .fetch_add(Self::charge(response), Ordering::SeqCst);
    }

    pub fn done(&self, response: &Response) {
        self.active_bytes
            .fetch_sub(Self::charge(response), Ordering::SeqCst);
    }

    pub fn is_free(&self) -> bool {
        self.active_bytes.load(Ordering::SeqCst) < self.max_active_bytes
    }

    pub fn active_bytes(&self) -> i64 {
        self.active_bytes.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        debug!(active_bytes = self.active_bytes(), "response slot closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn response_with_body(len: usize) -> Response {
        Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(vec![b'x'; len]),
            Request::parse("https://example.com").unwrap(),
        )
    }

    #[test]
    fn small_bodies_are_charged_the_floor() {
        let settings = Settings::with_defaults();
        let slot = ResponseSlot::new(&settings);
        let response = response_with_body(10);
        slot.add(&response);
        assert_eq!(slot.active_bytes(), 1024);
        slot.done(&response);
        assert_eq!(slot.active_bytes(), 0);
    }

    #[test]
    fn budget_returns_to_zero_after_all_responses_complete() {
        let settings = Settings::with_defaults();
        let slot = ResponseSlot::new(&settings);
        let responses: Vec<Response> = vec![
            response_with_body(10),
            response_with_body(4096),
            response_with_body(2000),
        ];
        for r in &responses {
            slot.add(r);
        }
        assert_eq!(slot.active_bytes(), 1024 + 4096 + 2000);
        for r in &responses {
            slot.done(r);
        }
        assert_eq!(slot.active_bytes(), 0);
        assert!(slot.is_free());
    }

    #[test]
    fn exhausted_budget_is_not_free() {
        let settings = Settings::with_defaults();
        settings.set("DOWNLOAD_MAXSIZE", 2048);
        let slot = ResponseSlot::new(&settings);
        let big = response_with_body(4096);
        assert!(slot.is_free());
        slot.add(&big);
        assert!(!slot.is_free());
        slot.done(&big);
        assert!(slot.is_free());
    }
}
