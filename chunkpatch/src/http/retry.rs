//! Poll-driven HTTP retry manager.
//!
//! Each submitted request moves through:
//!
//! ```text
//! NotStarted ─► Processing ─┬─► Succeeded
//!                   ▲       ├─► FailedRetry
//!                   │       ├─► FailedTimeout
//!                   │       ├─► Cancelled
//!                   │       ▼
//!                   └── ProcessingLockout
//! ```
//!
//! Nothing happens between calls to [`HttpRetryManager::update_at`]: it issues
//! new requests, consumes transport completions, applies retry lockouts and
//! timeouts, and returns the requests that finished.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError, TransportResult};

/// Lockout before the first and second retries.
const LOCKOUT_BASE: Duration = Duration::from_secs(5);
/// Lockout growth per pair of retries.
const LOCKOUT_STEP: Duration = Duration::from_secs(5);
const LOCKOUT_MAX: Duration = Duration::from_secs(30);

/// Wait before retry number `retry` (1-based).
///
/// 5s, 5s, 10s, 10s, 15s, ... capped at 30s.
pub fn lockout_duration(retry: u32) -> Duration {
    let steps = retry.saturating_sub(1) / 2;
    (LOCKOUT_BASE + LOCKOUT_STEP.saturating_mul(steps)).min(LOCKOUT_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    NotStarted,
    Processing,
    ProcessingLockout,
    Cancelled,
    FailedRetry,
    FailedTimeout,
    Succeeded,
}

impl RequestStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::FailedRetry | Self::FailedTimeout | Self::Succeeded
        )
    }
}

/// A request plus its retry policy.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub request: HttpRequest,
    /// Maximum retries; falls back to the manager default.
    pub retry_limit: Option<u32>,
    /// Overall deadline from the first attempt; falls back to the manager
    /// default.
    pub timeout: Option<Duration>,
    /// Response codes that trigger a retry.
    pub retry_codes: HashSet<u16>,
}

impl RetryRequest {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            retry_limit: None,
            timeout: None,
            retry_codes: HashSet::new(),
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_codes = codes.into_iter().collect();
        self
    }
}

/// Tracked state of one request.
#[derive(Debug)]
pub struct RequestEntry {
    status: RequestStatus,
    retry_count: u32,
    started_at: Option<Instant>,
    lockout_end: Option<Instant>,
    request: RetryRequest,
    /// Bumped on every issue so stale completions can be ignored.
    attempt: u64,
    last_response: Option<HttpResponse>,
    last_error: Option<TransportError>,
}

impl RequestEntry {
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn lockout_end(&self) -> Option<Instant> {
        self.lockout_end
    }

    pub fn request(&self) -> &RetryRequest {
        &self.request
    }
}

/// A request that reached a final state.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub id: RequestId,
    pub status: RequestStatus,
    pub retry_count: u32,
    /// Last response received, if any.
    pub response: Option<HttpResponse>,
    /// Last transport error, if the final attempt produced no response.
    pub error: Option<TransportError>,
}

type Completion = (RequestId, u64, TransportResult);

/// Issues requests through a transport and retries them on failure.
///
/// Not re-entrant: drive it from one thread.
pub struct HttpRetryManager {
    transport: Arc<dyn HttpTransport>,
    default_retry_limit: Option<u32>,
    default_timeout: Option<Duration>,
    entries: HashMap<RequestId, RequestEntry>,
    next_id: u64,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
}

impl HttpRetryManager {
    /// Create a manager. `None` defaults mean unlimited retries and no
    /// timeout.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        default_retry_limit: Option<u32>,
        default_timeout: Option<Duration>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            default_retry_limit,
            default_timeout,
            entries: HashMap::new(),
            next_id: 0,
            completions_tx,
            completions_rx,
        }
    }

    /// Queue a request. It is issued on the next update.
    pub fn submit(&mut self, request: RetryRequest) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            RequestEntry {
                status: RequestStatus::NotStarted,
                retry_count: 0,
                started_at: None,
                lockout_end: None,
                request,
                attempt: 0,
                last_response: None,
                last_error: None,
            },
        );
        id
    }

    /// Cancel an unfinished request. It is reported on the next update.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if !entry.status.is_finished() => {
                entry.status = RequestStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.entries.get(&id).map(|e| e.status)
    }

    pub fn entry(&self, id: RequestId) -> Option<&RequestEntry> {
        self.entries.get(&id)
    }

    /// Requests not yet reported as finished.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn update(&mut self) -> Vec<RetryOutcome> {
        self.update_at(Instant::now())
    }

    /// Advance every request to `now` and return those that finished.
    pub fn update_at(&mut self, now: Instant) -> Vec<RetryOutcome> {
        let default_timeout = self.default_timeout;
        let default_retry_limit = self.default_retry_limit;

        for entry in self.entries.values_mut() {
            let active = matches!(
                entry.status,
                RequestStatus::Processing | RequestStatus::ProcessingLockout
            );
            if active && has_timed_out(entry, default_timeout, now) {
                tracing::debug!(url = %entry.request.request.url, "HTTP request timed out");
                entry.status = RequestStatus::FailedTimeout;
            }
        }

        while let Ok((id, attempt, result)) = self.completions_rx.try_recv() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.status == RequestStatus::Processing && entry.attempt == attempt {
                handle_completion(entry, result, default_retry_limit, now);
            }
        }

        let ready: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, e)| match e.status {
                RequestStatus::NotStarted => true,
                RequestStatus::ProcessingLockout => e.lockout_end.map_or(true, |end| now >= end),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            self.issue(id, now);
        }

        let mut finished: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.status.is_finished())
            .map(|(id, _)| *id)
            .collect();
        finished.sort();

        finished
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .map(|(id, entry)| RetryOutcome {
                id,
                status: entry.status,
                retry_count: entry.retry_count,
                response: entry.last_response,
                error: entry.last_error,
            })
            .collect()
    }

    fn issue(&mut self, id: RequestId, now: Instant) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.status == RequestStatus::NotStarted {
            entry.started_at = Some(now);
        } else {
            entry.retry_count += 1;
            entry.lockout_end = None;
            tracing::debug!(
                url = %entry.request.request.url,
                retry = entry.retry_count,
                "Retrying HTTP request"
            );
        }
        entry.status = RequestStatus::Processing;
        entry.attempt += 1;

        let attempt = entry.attempt;
        let request = entry.request.request.clone();
        let tx = self.completions_tx.clone();
        self.transport.process(
            request,
            Box::new(move |result| {
                let _ = tx.send((id, attempt, result));
            }),
        );
    }
}

fn has_timed_out(entry: &RequestEntry, default_timeout: Option<Duration>, now: Instant) -> bool {
    match (entry.request.timeout.or(default_timeout), entry.started_at) {
        (Some(timeout), Some(started)) => now.saturating_duration_since(started) >= timeout,
        _ => false,
    }
}

fn can_retry(entry: &RequestEntry, default_retry_limit: Option<u32>) -> bool {
    entry
        .request
        .retry_limit
        .or(default_retry_limit)
        .map_or(true, |limit| entry.retry_count < limit)
}

fn handle_completion(
    entry: &mut RequestEntry,
    result: TransportResult,
    default_retry_limit: Option<u32>,
    now: Instant,
) {
    let retryable = match &result {
        Ok(response) => entry.request.retry_codes.contains(&response.status),
        Err(TransportError::Connection(_)) => true,
        Err(TransportError::Failed(_)) => entry.request.request.verb.is_safe_to_retry(),
    };

    let got_response = result.is_ok();
    match result {
        Ok(response) => {
            entry.last_response = Some(response);
            entry.last_error = None;
        }
        Err(error) => {
            entry.last_response = None;
            entry.last_error = Some(error);
        }
    }

    if !retryable {
        entry.status = if got_response {
            RequestStatus::Succeeded
        } else {
            RequestStatus::FailedRetry
        };
    } else if can_retry(entry, default_retry_limit) {
        let lockout = lockout_duration(entry.retry_count + 1);
        entry.lockout_end = Some(now + lockout);
        entry.status = RequestStatus::ProcessingLockout;
    } else {
        entry.status = RequestStatus::FailedRetry;
    }
}
