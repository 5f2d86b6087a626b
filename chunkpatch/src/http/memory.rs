//! In-memory [`HttpTransport`] with scripted results.
//!
//! Serves bodies registered with [`MemoryTransport::insert`], replays queued
//! results per URL, and can hold completions back to simulate a stalled
//! network. Completions are delivered synchronously from `process`.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;

use super::transport::{
    CompletionCallback, HttpRequest, HttpResponse, HttpTransport, TransportResult,
};

#[derive(Default)]
struct MemoryInner {
    bodies: HashMap<String, Bytes>,
    scripted: HashMap<String, VecDeque<TransportResult>>,
    default_result: Option<TransportResult>,
    hold: bool,
    held: Vec<(String, CompletionCallback)>,
    requests: HashMap<String, usize>,
}

#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<MemoryInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 for `url`.
    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.inner.lock().bodies.insert(url.into(), body.into());
    }

    /// Queue a result returned by the next request for `url`, ahead of any
    /// registered body.
    pub fn push_result(&self, url: impl Into<String>, result: TransportResult) {
        self.inner
            .lock()
            .scripted
            .entry(url.into())
            .or_default()
            .push_back(result);
    }

    /// Result for URLs with no body or script. Defaults to a 404 response.
    pub fn set_default_result(&self, result: TransportResult) {
        self.inner.lock().default_result = Some(result);
    }

    /// While holding, requests are recorded but not completed.
    pub fn set_hold(&self, hold: bool) {
        self.inner.lock().hold = hold;
    }

    /// Complete every held request with its normal result.
    pub fn release_held(&self) {
        let held = {
            let mut inner = self.inner.lock();
            inner.hold = false;
            std::mem::take(&mut inner.held)
        };
        for (url, on_complete) in held {
            let result = self.inner.lock().result_for(&url);
            on_complete(result);
        }
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.inner.lock().requests.get(url).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.inner.lock().requests.values().sum()
    }

    pub fn held_count(&self) -> usize {
        self.inner.lock().held.len()
    }
}

impl MemoryInner {
    fn result_for(&mut self, url: &str) -> TransportResult {
        if let Some(result) = self.scripted.get_mut(url).and_then(VecDeque::pop_front) {
            return result;
        }
        if let Some(body) = self.bodies.get(url) {
            return Ok(HttpResponse::new(200, body.clone()));
        }
        self.default_result
            .clone()
            .unwrap_or_else(|| Ok(HttpResponse::new(404, Bytes::new())))
    }
}

impl HttpTransport for MemoryTransport {
    fn process(&self, request: HttpRequest, on_complete: CompletionCallback) {
        let result = {
            let mut inner = self.inner.lock();
            *inner.requests.entry(request.url.clone()).or_default() += 1;
            if inner.hold {
                inner.held.push((request.url, on_complete));
                return;
            }
            inner.result_for(&request.url)
        };
        on_complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::TransportError;
    use std::sync::mpsc;

    fn run(transport: &MemoryTransport, url: &str) -> Option<TransportResult> {
        let (tx, rx) = mpsc::channel();
        transport.process(
            HttpRequest::get(url),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        rx.try_recv().ok()
    }

    #[test]
    fn test_scripted_results_come_first() {
        let transport = MemoryTransport::new();
        transport.insert("u", b"body".to_vec());
        transport.push_result("u", Err(TransportError::Connection("x".to_string())));

        assert!(run(&transport, "u").unwrap().is_err());
        assert_eq!(run(&transport, "u").unwrap().unwrap().status, 200);
        assert_eq!(run(&transport, "other").unwrap().unwrap().status, 404);
        assert_eq!(transport.request_count("u"), 2);
        assert_eq!(transport.total_requests(), 3);
    }

    #[test]
    fn test_hold_and_release() {
        let transport = MemoryTransport::new();
        transport.insert("u", b"body".to_vec());
        transport.set_hold(true);

        let (tx, rx) = mpsc::channel();
        transport.process(
            HttpRequest::get("u"),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.held_count(), 1);

        transport.release_held();
        assert_eq!(rx.try_recv().unwrap().unwrap().status, 200);
    }
}
