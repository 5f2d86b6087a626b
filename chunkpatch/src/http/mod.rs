//! HTTP retry system and chunk download service.
//!
//! # Architecture
//!
//! ```text
//!   CloudChunkSource
//!         │ request(url) / poll()
//!         ▼
//!   DownloadService ── local paths read through FileSystem
//!         │ submit / update_at(now)
//!         ▼
//!   HttpRetryManager ── retry, lockout and timeout state per request
//!         │ process(request, completion)
//!         ▼
//!   HttpTransport (ReqwestTransport worker pool)
//! ```
//!
//! Completions cross back from transport threads over a channel; all request
//! state is owned and advanced by the single thread that calls `update`.

mod download;
mod memory;
mod reqwest_transport;
mod retry;
mod transport;

pub use download::{Download, DownloadError, DownloadId, DownloadService, DEFAULT_RETRY_CODES};
pub use memory::MemoryTransport;
pub use reqwest_transport::{ReqwestTransport, DEFAULT_REQUEST_TIMEOUT};
pub use retry::{
    lockout_duration, HttpRetryManager, RequestEntry, RequestId, RequestStatus, RetryOutcome,
    RetryRequest,
};
pub use transport::{
    CompletionCallback, HttpRequest, HttpResponse, HttpTransport, HttpVerb, TransportError,
    TransportResult,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to create HTTP client: {0}")]
    ClientBuild(String),
}
