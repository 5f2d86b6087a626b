//! [`HttpTransport`] over `reqwest::blocking` with a bounded worker pool.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::Method;

use super::transport::{
    CompletionCallback, HttpRequest, HttpResponse, HttpTransport, HttpVerb, TransportError,
    TransportResult,
};
use super::HttpError;

/// Default per-attempt timeout for chunk requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type Job = (HttpRequest, CompletionCallback);

/// Runs requests on a fixed pool of worker threads.
///
/// The pool size is the simultaneous-connection limit; further requests queue
/// until a worker is free.
pub struct ReqwestTransport {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl ReqwestTransport {
    /// Create a transport with `max_connections` workers (minimum 1).
    pub fn new(max_connections: usize, timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::ClientBuild(e.to_string()))?;

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::new();
        for index in 0..max_connections.max(1) {
            let client = client.clone();
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("chunkpatch-http-{index}"))
                .spawn(move || worker_loop(&client, &receiver))
                .map_err(|e| HttpError::ClientBuild(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers,
        })
    }
}

fn worker_loop(client: &Client, receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = receiver.lock().recv();
        let Ok((request, on_complete)) = job else {
            break;
        };
        on_complete(execute(client, &request));
    }
}

fn execute(client: &Client, request: &HttpRequest) -> TransportResult {
    let method = match request.verb {
        HttpVerb::Get => Method::GET,
        HttpVerb::Head => Method::HEAD,
        HttpVerb::Post => Method::POST,
        HttpVerb::Put => Method::PUT,
        HttpVerb::Delete => Method::DELETE,
    };

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.to_vec());
    }

    let response = builder.send().map_err(map_error)?;
    let status = response.status().as_u16();
    let body = response.bytes().map_err(map_error)?;
    tracing::trace!(url = %request.url, status, bytes = body.len(), "HTTP request complete");
    Ok(HttpResponse::new(status, body))
}

fn map_error(error: reqwest::Error) -> TransportError {
    if error.is_connect() || error.is_timeout() {
        TransportError::Connection(error.to_string())
    } else {
        TransportError::Failed(error.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    fn process(&self, request: HttpRequest, on_complete: CompletionCallback) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            on_complete(Err(TransportError::Failed("transport shut down".to_string())));
            return;
        };
        if let Err(mpsc::SendError((_, on_complete))) = sender.send((request, on_complete)) {
            on_complete(Err(TransportError::Failed("transport shut down".to_string())));
        }
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        // Closing the channel stops the workers once the queue drains
        self.sender.lock().take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
