//! Live installer statistics.
//!
//! Chunk stores, chunk sources and the download service share one
//! [`InstallerStatistics`] and bump its atomic counters as they work. The
//! installer snapshots the counters into its build statistics at the end of
//! each stage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::source::DownloadHealth;

/// Download records older than this are discarded.
const SPEED_HISTORY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct DownloadRecord {
    start: Instant,
    end: Instant,
    bytes: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatisticsSnapshot {
    pub chunks_downloaded: u64,
    pub downloads_failed: u64,
    pub downloads_corrupt: u64,
    pub downloads_aborted: u64,
    pub bytes_downloaded: u64,
    pub required_download_bytes: u64,
    pub chunks_recycled: u64,
    pub recycle_failures: u64,
    pub chunkdb_chunks_read: u64,
    pub chunkdb_failures: u64,
    pub chunks_booted: u64,
    pub chunks_released: u64,
    pub disk_cache_loads: u64,
    pub disk_cache_load_failures: u64,
    pub files_constructed: u64,
    pub bytes_constructed: u64,
    pub request_successes: u64,
    pub request_failures: u64,
    pub download_health: DownloadHealth,
    /// Seconds spent in each health state, indexed by [`DownloadHealth::index`].
    pub health_times: [f64; DownloadHealth::COUNT],
}

impl StatisticsSnapshot {
    /// Fraction of chunk requests that succeeded, 1.0 when none were made.
    pub fn request_success_rate(&self) -> f64 {
        let total = self.request_successes + self.request_failures;
        if total == 0 {
            1.0
        } else {
            self.request_successes as f64 / total as f64
        }
    }
}

/// Shared statistics counters.
#[derive(Debug, Default)]
pub struct InstallerStatistics {
    chunks_downloaded: AtomicU64,
    downloads_failed: AtomicU64,
    downloads_corrupt: AtomicU64,
    downloads_aborted: AtomicU64,
    bytes_downloaded: AtomicU64,
    required_download_bytes: AtomicU64,
    chunks_recycled: AtomicU64,
    recycle_failures: AtomicU64,
    chunkdb_chunks_read: AtomicU64,
    chunkdb_failures: AtomicU64,
    chunks_booted: AtomicU64,
    chunks_released: AtomicU64,
    disk_cache_loads: AtomicU64,
    disk_cache_load_failures: AtomicU64,
    files_constructed: AtomicU64,
    bytes_constructed: AtomicU64,
    request_successes: AtomicU64,
    request_failures: AtomicU64,
    health: Mutex<(DownloadHealth, [f64; DownloadHealth::COUNT])>,
    records: Mutex<VecDeque<DownloadRecord>>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl InstallerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64, start: Instant, end: Instant) {
        bump(&self.chunks_downloaded);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);

        let mut records = self.records.lock();
        records.push_back(DownloadRecord { start, end, bytes });
        while records
            .front()
            .is_some_and(|r| end.saturating_duration_since(r.end) > SPEED_HISTORY)
        {
            records.pop_front();
        }
    }

    pub fn record_download_failed(&self) {
        bump(&self.downloads_failed);
    }

    pub fn record_download_corrupt(&self) {
        bump(&self.downloads_corrupt);
    }

    pub fn record_download_aborted(&self) {
        bump(&self.downloads_aborted);
    }

    pub fn record_request_outcome(&self, success: bool) {
        if success {
            bump(&self.request_successes);
        } else {
            bump(&self.request_failures);
        }
    }

    pub fn set_required_download_bytes(&self, bytes: u64) {
        self.required_download_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn record_recycled(&self) {
        bump(&self.chunks_recycled);
    }

    pub fn record_recycle_failure(&self) {
        bump(&self.recycle_failures);
    }

    pub fn record_chunkdb_read(&self) {
        bump(&self.chunkdb_chunks_read);
    }

    pub fn record_chunkdb_failure(&self) {
        bump(&self.chunkdb_failures);
    }

    pub fn record_booted(&self) {
        bump(&self.chunks_booted);
    }

    pub fn record_released(&self) {
        bump(&self.chunks_released);
    }

    pub fn record_disk_load(&self, success: bool) {
        if success {
            bump(&self.disk_cache_loads);
        } else {
            bump(&self.disk_cache_load_failures);
        }
    }

    pub fn record_file_constructed(&self) {
        bump(&self.files_constructed);
    }

    pub fn add_bytes_constructed(&self, bytes: u64) {
        self.bytes_constructed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn set_download_health(&self, health: DownloadHealth, times: [Duration; DownloadHealth::COUNT]) {
        *self.health.lock() = (health, times.map(|t| t.as_secs_f64()));
    }

    pub fn download_health(&self) -> DownloadHealth {
        self.health.lock().0
    }

    /// Average download speed in bytes per second over the last `window`.
    pub fn download_speed(&self, window: Duration) -> f64 {
        self.download_speed_at(window, Instant::now())
    }

    pub fn download_speed_at(&self, window: Duration, now: Instant) -> f64 {
        let records = self.records.lock();
        let recent: Vec<&DownloadRecord> = records
            .iter()
            .filter(|r| now.saturating_duration_since(r.end) <= window)
            .collect();

        let (Some(first_start), Some(last_end)) = (
            recent.iter().map(|r| r.start).min(),
            recent.iter().map(|r| r.end).max(),
        ) else {
            return 0.0;
        };

        let elapsed = last_end.saturating_duration_since(first_start).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        recent.iter().map(|r| r.bytes).sum::<u64>() as f64 / elapsed
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (download_health, health_times) = *self.health.lock();
        StatisticsSnapshot {
            chunks_downloaded: load(&self.chunks_downloaded),
            downloads_failed: load(&self.downloads_failed),
            downloads_corrupt: load(&self.downloads_corrupt),
            downloads_aborted: load(&self.downloads_aborted),
            bytes_downloaded: load(&self.bytes_downloaded),
            required_download_bytes: load(&self.required_download_bytes),
            chunks_recycled: load(&self.chunks_recycled),
            recycle_failures: load(&self.recycle_failures),
            chunkdb_chunks_read: load(&self.chunkdb_chunks_read),
            chunkdb_failures: load(&self.chunkdb_failures),
            chunks_booted: load(&self.chunks_booted),
            chunks_released: load(&self.chunks_released),
            disk_cache_loads: load(&self.disk_cache_loads),
            disk_cache_load_failures: load(&self.disk_cache_load_failures),
            files_constructed: load(&self.files_constructed),
            bytes_constructed: load(&self.bytes_constructed),
            request_successes: load(&self.request_successes),
            request_failures: load(&self.request_failures),
            download_health,
            health_times,
        }
    }
}
