//! Chunk source that downloads chunks from cloud directories.
//!
//! # Architecture
//!
//! ```text
//!   get(id) ──► store hit? ──yes──► chunk
//!                  │ no
//!                  ▼
//!   ┌──────────── poll loop (caller's thread) ─────────────┐
//!   │ 1. collect finished downloads                        │
//!   │      ok + hash match  → store.put                    │
//!   │      corrupt / failed → retry after RetryTimes[n]    │
//!   │ 2. top up requests: id first, then the tracker's     │
//!   │    upcoming chunks, up to ChunkDownloads in flight   │
//!   │ 3. reclassify download health                        │
//!   └──────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing is downloaded until the first `get`. Each retry of a chunk moves to
//! the next cloud directory in the list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::health::DownloadHealthTracker;
use super::{ChunkSource, ChunkSourceError};
use crate::chunks::{ChunkData, ChunkReferenceTracker, MemoryChunkStore};
use crate::config::{retry_delay, HealthThresholds, PatchTuning};
use crate::control::{ControlFlags, Controllable};
use crate::fs::FileSystem;
use crate::http::{DownloadError, DownloadId, DownloadService, HttpTransport};
use crate::manifest::{chunk_relative_path, BuildManifest, ChunkId};
use crate::message::{ChunkSourceEvent, ChunkSourceKind, MessageSender};
use crate::stats::InstallerStatistics;

/// How often a blocked `get` advances the downloads.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// URL (or path) of a chunk within a cloud directory.
pub fn cloud_chunk_url(cloud_dir: &str, id: &ChunkId) -> String {
    format!(
        "{}/{}",
        cloud_dir.trim_end_matches(['/', '\\']),
        chunk_relative_path(id)
    )
}

#[derive(Debug, Clone)]
pub struct CloudSourceConfig {
    pub cloud_dirs: Vec<String>,
    pub max_simultaneous_downloads: usize,
    /// `None` retries forever.
    pub max_retry_count: Option<u32>,
    pub prefetch_min: usize,
    pub prefetch_max: usize,
    pub retry_delay_times: Vec<Duration>,
    pub health_thresholds: HealthThresholds,
    pub disconnected_delay: Duration,
    /// Chunks no other source can provide; only these are prefetched.
    pub initial_download_set: HashSet<ChunkId>,
}

impl CloudSourceConfig {
    pub fn from_tuning(
        tuning: &PatchTuning,
        cloud_dirs: Vec<String>,
        initial_download_set: HashSet<ChunkId>,
    ) -> Self {
        Self {
            cloud_dirs,
            max_simultaneous_downloads: tuning.chunk_downloads.max(1),
            max_retry_count: tuning.max_chunk_retries(),
            prefetch_min: tuning.cloud_prefetch_min,
            prefetch_max: tuning.cloud_prefetch_max,
            retry_delay_times: tuning.retry_times.clone(),
            health_thresholds: tuning.health,
            disconnected_delay: tuning.disconnected_delay,
            initial_download_set,
        }
    }
}

struct CloudState {
    downloads: DownloadService,
    started: bool,
    in_flight: HashMap<DownloadId, ChunkId>,
    pending: HashSet<ChunkId>,
    retries: HashMap<ChunkId, u32>,
    retry_at: HashMap<ChunkId, Instant>,
    failed: HashMap<ChunkId, String>,
    health: DownloadHealthTracker,
}

pub struct CloudChunkSource {
    config: CloudSourceConfig,
    store: Arc<MemoryChunkStore>,
    tracker: Arc<ChunkReferenceTracker>,
    stats: Arc<InstallerStatistics>,
    messages: MessageSender,
    expected: HashMap<ChunkId, String>,
    flags: ControlFlags,
    state: Mutex<CloudState>,
}

impl CloudChunkSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CloudSourceConfig,
        transport: Arc<dyn HttpTransport>,
        fs: Arc<dyn FileSystem>,
        store: Arc<MemoryChunkStore>,
        tracker: Arc<ChunkReferenceTracker>,
        manifest: &BuildManifest,
        stats: Arc<InstallerStatistics>,
        messages: MessageSender,
    ) -> Self {
        let required: u64 = config
            .initial_download_set
            .iter()
            .filter_map(|id| manifest.chunk_info(id))
            .map(|info| info.size)
            .sum();
        stats.set_required_download_bytes(required);

        let health = DownloadHealthTracker::new(config.health_thresholds, config.disconnected_delay);
        Self {
            store,
            tracker,
            stats,
            messages,
            expected: manifest
                .chunks
                .iter()
                .map(|(id, info)| (*id, info.hash.clone()))
                .collect(),
            flags: ControlFlags::new(),
            state: Mutex::new(CloudState {
                // Chunk-level retries are scheduled here, not by the HTTP layer
                downloads: DownloadService::new(transport, fs, Some(0), None),
                started: false,
                in_flight: HashMap::new(),
                pending: HashSet::new(),
                retries: HashMap::new(),
                retry_at: HashMap::new(),
                failed: HashMap::new(),
                health,
            }),
            config,
        }
    }

    /// Number of chunk downloads currently in flight.
    pub fn downloads_in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn poll(&self, state: &mut CloudState, id: &ChunkId, now: Instant) -> Result<(), ChunkSourceError> {
        if !state.started {
            state.started = true;
            tracing::info!(
                chunks = self.config.initial_download_set.len(),
                cloud_dirs = self.config.cloud_dirs.len(),
                "Cloud chunk source started"
            );
        }

        for download in state.downloads.poll_at(now) {
            let Some(chunk_id) = state.in_flight.remove(&download.id) else {
                continue;
            };
            state.pending.remove(&chunk_id);
            self.complete(state, chunk_id, download.result, download.started, now)?;
        }

        self.request_more(state, id, now);

        let downloading = !state.in_flight.is_empty();
        let health = state.health.update(now, downloading);
        let times = state.health.times();
        self.stats.set_download_health(health, times);
        Ok(())
    }

    fn complete(
        &self,
        state: &mut CloudState,
        id: ChunkId,
        result: Result<bytes::Bytes, DownloadError>,
        started: Instant,
        now: Instant,
    ) -> Result<(), ChunkSourceError> {
        let reason = match result {
            Ok(data) => {
                state.health.record_activity(now);
                let chunk = ChunkData::new(id, data);
                let expected = self.expected.get(&id).map(String::as_str).unwrap_or_default();
                if chunk.verify(expected) {
                    self.stats.record_download(chunk.len() as u64, started, now);
                    self.stats.record_request_outcome(true);
                    state.health.record_outcome(true);
                    state.retry_at.remove(&id);
                    self.store.put(Arc::new(chunk))?;
                    return Ok(());
                }
                self.stats.record_download_corrupt();
                self.messages
                    .chunk_source(ChunkSourceKind::Cloud, ChunkSourceEvent::CorruptChunk, Some(id));
                "downloaded data failed hash verification".to_string()
            }
            Err(DownloadError::Cancelled { .. }) => {
                self.stats.record_download_aborted();
                return Ok(());
            }
            Err(e) => {
                self.stats.record_download_failed();
                e.to_string()
            }
        };

        self.stats.record_request_outcome(false);
        state.health.record_outcome(false);

        let retry = state.retries.get(&id).copied().unwrap_or(0) + 1;
        if self.config.max_retry_count.is_some_and(|max| retry > max) {
            tracing::error!(chunk = %id, retries = retry - 1, reason = %reason, "Chunk download failed");
            self.messages
                .chunk_source(ChunkSourceKind::Cloud, ChunkSourceEvent::DownloadFailed, Some(id));
            state.failed.insert(id, reason);
            return Ok(());
        }

        let delay = retry_delay(&self.config.retry_delay_times, retry);
        tracing::debug!(chunk = %id, retry, delay_ms = delay.as_millis() as u64, reason = %reason, "Retrying chunk download");
        self.messages
            .chunk_source(ChunkSourceKind::Cloud, ChunkSourceEvent::DownloadRetry, Some(id));
        state.retries.insert(id, retry);
        state.retry_at.insert(id, now + delay);
        Ok(())
    }

    /// Issue requests for `id` and the upcoming chunks, within the limits.
    fn request_more(&self, state: &mut CloudState, id: &ChunkId, now: Instant) {
        let upcoming = self.tracker.next_references(self.config.prefetch_max, |c| {
            c != id
                && self.config.initial_download_set.contains(c)
                && self.expected.contains_key(c)
                && !state.failed.contains_key(c)
        });

        let needs_id = !state.pending.contains(id)
            && !state.failed.contains_key(id)
            && !self.store.contains(id);
        let ready = upcoming
            .iter()
            .filter(|c| state.pending.contains(c) || self.store.contains(c))
            .count();
        let top_up = needs_id || ready < self.config.prefetch_min;

        let mut wanted = Vec::with_capacity(upcoming.len() + 1);
        if needs_id {
            wanted.push(*id);
        }
        if top_up {
            wanted.extend(upcoming);
        }

        for chunk in wanted {
            if state.in_flight.len() >= self.config.max_simultaneous_downloads {
                break;
            }
            if state.pending.contains(&chunk) || self.store.contains(&chunk) {
                continue;
            }
            if state.retry_at.get(&chunk).is_some_and(|at| *at > now) {
                continue;
            }

            if state.in_flight.is_empty() {
                state.health.record_activity(now);
            }
            let Some(url) = self.chunk_url(state, &chunk) else {
                return;
            };
            let download = state.downloads.request_at(&url, now);
            state.in_flight.insert(download, chunk);
            state.pending.insert(chunk);
        }
    }

    fn chunk_url(&self, state: &CloudState, id: &ChunkId) -> Option<String> {
        if self.config.cloud_dirs.is_empty() {
            return None;
        }
        let retry = state.retries.get(id).copied().unwrap_or(0) as usize;
        let dir = &self.config.cloud_dirs[retry % self.config.cloud_dirs.len()];
        Some(cloud_chunk_url(dir, id))
    }

    fn cancel_all(&self, state: &mut CloudState) {
        let ids: Vec<DownloadId> = state.in_flight.keys().copied().collect();
        for download in ids {
            state.downloads.cancel(download);
        }
        for download in state.downloads.poll() {
            if state.in_flight.remove(&download.id).is_some() {
                self.stats.record_download_aborted();
            }
        }
        state.in_flight.clear();
        state.pending.clear();
    }
}

impl ChunkSource for CloudChunkSource {
    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.tracker
            .get_referenced_chunks()
            .into_iter()
            .filter(|id| self.store.contains(id))
            .collect()
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkSourceError> {
        if !self.expected.contains_key(id) {
            return Ok(None);
        }

        loop {
            if !self.flags.wait_while_paused() {
                self.cancel_all(&mut self.state.lock());
                return Err(ChunkSourceError::Aborted);
            }
            if let Some(chunk) = self.store.get(id)? {
                return Ok(Some(chunk));
            }

            {
                let mut state = self.state.lock();
                if let Some(reason) = state.failed.get(id) {
                    return Err(ChunkSourceError::DownloadFailed {
                        id: *id,
                        reason: reason.clone(),
                    });
                }
                if self.config.cloud_dirs.is_empty() {
                    return Ok(None);
                }
                self.poll(&mut state, id, Instant::now())?;
            }

            if !self.store.contains(id) {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

impl Controllable for CloudChunkSource {
    fn abort(&self) {
        self.flags.abort();
    }

    fn set_paused(&self, paused: bool) {
        self.flags.set_paused(paused);
    }
}
