//! Chunk download front-end.
//!
//! HTTP(S) URLs go through the retry manager; anything else is treated as a
//! local path and read through the [`FileSystem`] immediately, so a cloud
//! directory may also be a plain folder.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use super::retry::{HttpRetryManager, RequestId, RequestStatus, RetryRequest};
use super::transport::{HttpRequest, HttpTransport, TransportError};
use crate::fs::FileSystem;

/// Response codes retried by the retry manager for chunk downloads.
pub const DEFAULT_RETRY_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadId(u64);

#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("{url} timed out")]
    Timeout { url: String },

    #[error("download of {url} was cancelled")]
    Cancelled { url: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

/// A finished download.
#[derive(Debug, Clone)]
pub struct Download {
    pub id: DownloadId,
    pub url: String,
    pub started: Instant,
    pub finished: Instant,
    pub result: Result<Bytes, DownloadError>,
}

#[derive(Debug)]
struct PendingDownload {
    id: DownloadId,
    url: String,
    started: Instant,
}

/// Downloads URLs through the retry manager or the file system.
pub struct DownloadService {
    fs: Arc<dyn FileSystem>,
    retry: HttpRetryManager,
    pending: HashMap<RequestId, PendingDownload>,
    local: VecDeque<Download>,
    next_id: u64,
}

fn is_http(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

impl DownloadService {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        fs: Arc<dyn FileSystem>,
        retry_limit: Option<u32>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            fs,
            retry: HttpRetryManager::new(transport, retry_limit, timeout),
            pending: HashMap::new(),
            local: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Start downloading `url`.
    pub fn request(&mut self, url: &str) -> DownloadId {
        self.request_at(url, Instant::now())
    }

    pub fn request_at(&mut self, url: &str, now: Instant) -> DownloadId {
        let id = DownloadId(self.next_id);
        self.next_id += 1;

        if is_http(url) {
            let request = RetryRequest::new(HttpRequest::get(url))
                .with_retry_codes(DEFAULT_RETRY_CODES);
            let request_id = self.retry.submit(request);
            self.pending.insert(
                request_id,
                PendingDownload {
                    id,
                    url: url.to_string(),
                    started: now,
                },
            );
        } else {
            let path = Path::new(url);
            let result = self
                .fs
                .read(path)
                .map(Bytes::from)
                .map_err(|e| DownloadError::Io {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            self.local.push_back(Download {
                id,
                url: url.to_string(),
                started: now,
                finished: now,
                result,
            });
        }
        id
    }

    /// Cancel an in-flight download; it is reported by the next poll.
    pub fn cancel(&mut self, id: DownloadId) -> bool {
        let request_id = self
            .pending
            .iter()
            .find(|(_, p)| p.id == id)
            .map(|(request_id, _)| *request_id);
        match request_id {
            Some(request_id) => self.retry.cancel(request_id),
            None => false,
        }
    }

    /// Downloads not yet returned by [`poll`](Self::poll).
    pub fn in_flight(&self) -> usize {
        self.pending.len() + self.local.len()
    }

    pub fn poll(&mut self) -> Vec<Download> {
        self.poll_at(Instant::now())
    }

    /// Advance the retry manager and collect finished downloads.
    pub fn poll_at(&mut self, now: Instant) -> Vec<Download> {
        let mut finished: Vec<Download> = self.local.drain(..).collect();

        for outcome in self.retry.update_at(now) {
            let Some(pending) = self.pending.remove(&outcome.id) else {
                continue;
            };
            let url = pending.url;
            let result = match outcome.status {
                RequestStatus::Succeeded => match outcome.response {
                    Some(response) if response.is_success() => Ok(response.body),
                    Some(response) => Err(DownloadError::Status {
                        url: url.clone(),
                        status: response.status,
                    }),
                    None => Err(DownloadError::Transport {
                        url: url.clone(),
                        source: TransportError::Failed("no response".to_string()),
                    }),
                },
                RequestStatus::FailedTimeout => Err(DownloadError::Timeout { url: url.clone() }),
                RequestStatus::Cancelled => Err(DownloadError::Cancelled { url: url.clone() }),
                _ => match (outcome.response, outcome.error) {
                    (Some(response), _) => Err(DownloadError::Status {
                        url: url.clone(),
                        status: response.status,
                    }),
                    (None, Some(error)) => Err(DownloadError::Transport {
                        url: url.clone(),
                        source: error,
                    }),
                    (None, None) => Err(DownloadError::Transport {
                        url: url.clone(),
                        source: TransportError::Failed("retries exhausted".to_string()),
                    }),
                },
            };
            finished.push(Download {
                id: pending.id,
                url,
                started: pending.started,
                finished: now,
                result,
            });
        }

        finished.sort_by_key(|d| d.id);
        finished
    }
}
