//! Engine tunables loaded from an ini file.
//!
//! All keys live in the `[Portal.BuildPatch]` section. Missing or unparsable
//! keys keep their defaults; present values are clamped to their valid range.
//!
//! ```ini
//! [Portal.BuildPatch]
//! ChunkDownloads=16
//! ChunkRetries=6
//! RetryTimes=0.5,1,1,3,3,10,10,20,20,30
//! ```

use std::path::Path;
use std::time::Duration;

use ini::{Ini, Properties};

use super::ConfigError;

/// Ini section holding the tunables.
pub const TUNING_SECTION: &str = "Portal.BuildPatch";

/// Memory chunk store size limits, in chunks.
const MIN_STORE_SIZE: usize = 32;
const MAX_STORE_SIZE: usize = 2048;

/// Success-rate thresholds for download health classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub ok: f32,
    pub good: f32,
    pub excellent: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            ok: 0.75,
            good: 0.95,
            excellent: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchTuning {
    pub num_file_move_retries: u32,
    /// Total installation attempts, the first one included.
    pub num_installer_retries: u32,
    /// Window over which the download speed is averaged.
    pub download_speed_average_time: Duration,

    pub chunkdb_prefetch_min: usize,
    pub chunkdb_prefetch_max: usize,
    pub chunkdb_open_retry_time: Duration,

    pub install_batch_min: usize,
    pub install_batch_max: usize,

    /// Simultaneous chunk downloads.
    pub chunk_downloads: usize,
    /// Retries per chunk. Negative means unlimited.
    pub chunk_retries: i32,
    pub cloud_prefetch_min: usize,
    pub cloud_prefetch_max: usize,
    /// Delay before the n-th retry of a chunk; the last entry repeats.
    pub retry_times: Vec<Duration>,
    pub health: HealthThresholds,
    pub disconnected_delay: Duration,
}

impl Default for PatchTuning {
    fn default() -> Self {
        Self {
            num_file_move_retries: 5,
            num_installer_retries: 5,
            download_speed_average_time: Duration::from_secs(10),
            chunkdb_prefetch_min: 10,
            chunkdb_prefetch_max: 20,
            chunkdb_open_retry_time: Duration::from_secs(2),
            install_batch_min: 10,
            install_batch_max: 40,
            chunk_downloads: 16,
            chunk_retries: 6,
            cloud_prefetch_min: 10,
            cloud_prefetch_max: 40,
            retry_times: [0.5, 1.0, 1.0, 3.0, 3.0, 10.0, 10.0, 20.0, 20.0, 30.0]
                .into_iter()
                .map(Duration::from_secs_f64)
                .collect(),
            health: HealthThresholds::default(),
            disconnected_delay: Duration::from_secs(5),
        }
    }
}

impl PatchTuning {
    /// Load tunables from an ini file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_ini(&ini))
    }

    /// Parse tunables from ini text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        Ok(Self::from_ini(&Ini::load_from_str(text)?))
    }

    pub fn from_ini(ini: &Ini) -> Self {
        let mut tuning = Self::default();
        let Some(props) = ini.section(Some(TUNING_SECTION)) else {
            return tuning;
        };

        if let Some(v) = parse::<u32>(props, "NumFileMoveRetries") {
            tuning.num_file_move_retries = v.clamp(1, 50);
        }
        if let Some(v) = parse::<u32>(props, "NumInstallerRetries") {
            tuning.num_installer_retries = v.clamp(1, 50);
        }
        if let Some(v) = parse::<f64>(props, "DownloadSpeedAverageTime") {
            tuning.download_speed_average_time = Duration::from_secs_f64(v.clamp(1.0, 30.0));
        }

        if let Some(v) = parse::<usize>(props, "ChunkDbSourcePreFetchMinimum") {
            tuning.chunkdb_prefetch_min = v.clamp(1, 1000);
        }
        if let Some(v) = parse::<usize>(props, "ChunkDbSourcePreFetchMaximum") {
            tuning.chunkdb_prefetch_max = v;
        }
        tuning.chunkdb_prefetch_max = tuning
            .chunkdb_prefetch_max
            .clamp(tuning.chunkdb_prefetch_min, 1000);
        if let Some(v) = parse::<f64>(props, "ChunkDbSourceChunkDbOpenRetryTime") {
            tuning.chunkdb_open_retry_time = Duration::from_secs_f64(v.clamp(0.5, 60.0));
        }

        if let Some(v) = parse::<usize>(props, "InstallSourceBatchFetchMinimum") {
            tuning.install_batch_min = v.clamp(1, 1000);
        }
        if let Some(v) = parse::<usize>(props, "InstallSourceBatchFetchMaximum") {
            tuning.install_batch_max = v;
        }
        tuning.install_batch_max = tuning
            .install_batch_max
            .clamp(tuning.install_batch_min, 1000);

        if let Some(v) = parse::<usize>(props, "ChunkDownloads") {
            tuning.chunk_downloads = v.clamp(1, 100);
        }
        if let Some(v) = parse::<i32>(props, "ChunkRetries") {
            tuning.chunk_retries = v.clamp(-1, 1000);
        }
        if let Some(v) = parse::<usize>(props, "CloudSourcePreFetchMinimum") {
            tuning.cloud_prefetch_min = v.clamp(1, 1000);
        }
        if let Some(v) = parse::<usize>(props, "CloudSourcePreFetchMaximum") {
            tuning.cloud_prefetch_max = v;
        }
        tuning.cloud_prefetch_max = tuning
            .cloud_prefetch_max
            .clamp(tuning.cloud_prefetch_min, 1000);

        let retry_times: Vec<Duration> = ["RetryTimes", "+RetryTimes"]
            .into_iter()
            .flat_map(|key| props.get_all(key))
            .flat_map(|value| value.split(','))
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Duration::from_secs_f64)
            .collect();
        if !retry_times.is_empty() {
            tuning.retry_times = retry_times;
        }

        let ok = parse::<f32>(props, "OKHealth");
        let good = parse::<f32>(props, "GoodHealth");
        let excellent = parse::<f32>(props, "ExcellentHealth");
        if let (Some(ok), Some(good), Some(excellent)) = (ok, good, excellent) {
            tuning.health = HealthThresholds {
                ok: ok.clamp(0.0, 1.0),
                good: good.clamp(0.0, 1.0),
                excellent: excellent.clamp(0.0, 1.0),
            };
        }

        if let Some(v) = parse::<f64>(props, "DisconnectedDelay") {
            tuning.disconnected_delay = Duration::from_secs_f64(v.clamp(1.0, 30.0));
        }

        tuning
    }

    /// Maximum retries per chunk download, `None` when unlimited.
    pub fn max_chunk_retries(&self) -> Option<u32> {
        u32::try_from(self.chunk_retries).ok()
    }

    /// Memory store size shared by the chunk database and cloud sources.
    pub fn cloud_store_size(&self) -> usize {
        (self.cloud_prefetch_max + self.chunkdb_prefetch_max).clamp(MIN_STORE_SIZE, MAX_STORE_SIZE)
    }

    /// Memory store size of the install source.
    pub fn install_store_size(&self) -> usize {
        self.install_batch_max.clamp(MIN_STORE_SIZE, MAX_STORE_SIZE)
    }

    /// Delay before retry number `retry` (1-based) of a chunk download.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        retry_delay(&self.retry_times, retry)
    }
}

/// Delay before retry number `retry` (1-based); the last entry repeats.
pub(crate) fn retry_delay(times: &[Duration], retry: u32) -> Duration {
    match (retry, times.last()) {
        (0, _) | (_, None) => Duration::ZERO,
        (n, Some(last)) => times.get(n as usize - 1).copied().unwrap_or(*last),
    }
}

fn parse<T: std::str::FromStr>(props: &Properties, key: &str) -> Option<T> {
    props.get(key).and_then(|v| v.trim().parse().ok())
}
