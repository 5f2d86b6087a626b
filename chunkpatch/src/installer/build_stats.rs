//! Statistics reported for a finished installation.

use serde::Serialize;

use super::error::InstallErrorKind;
use crate::source::DownloadHealth;
use crate::stats::StatisticsSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildStats {
    pub app_name: String,
    pub app_installed_version: String,
    pub app_patch_version: String,
    pub cloud_directories: Vec<String>,

    pub num_files_in_build: u64,
    pub num_files_outdated: u64,
    pub num_files_to_remove: u64,
    pub num_files_constructed: u64,
    pub num_files_resumed: u64,

    pub num_chunks_required: u64,
    pub chunks_queued_for_download: u64,
    pub chunks_locally_available: u64,
    pub chunks_in_chunk_dbs: u64,
    pub num_chunks_downloaded: u64,
    pub num_chunks_recycled: u64,
    pub num_chunks_read_from_chunk_dbs: u64,
    pub num_failed_downloads: u64,
    pub num_bad_downloads: u64,
    pub num_aborted_downloads: u64,
    pub num_recycle_failures: u64,
    pub num_chunk_db_failures: u64,
    pub num_chunks_store_booted: u64,
    pub num_chunks_store_released: u64,
    pub num_disk_cache_loads: u64,

    pub total_downloaded_data: u64,
    pub total_required_download_data: u64,
    pub total_bytes_constructed: u64,
    /// Bytes per second over the download stage.
    pub average_download_speed: f64,
    pub overall_request_success_rate: f64,
    pub final_download_health: DownloadHealth,
    /// Seconds spent in each health state, indexed by [`DownloadHealth::index`].
    pub download_health_times: [f64; DownloadHealth::COUNT],

    pub initialize_time: f64,
    pub construct_time: f64,
    pub move_from_stage_time: f64,
    pub file_attributes_time: f64,
    pub verify_time: f64,
    pub clean_up_time: f64,
    pub prereq_time: f64,
    pub process_paused_time: f64,
    pub process_active_time: f64,
    pub process_execute_time: f64,

    pub process_success: bool,
    pub num_installer_retries: u32,
    pub failure_type: InstallErrorKind,
    pub error_code: String,
    pub failure_reason_text: String,
    pub retry_failure_types: Vec<InstallErrorKind>,
    pub retry_error_codes: Vec<String>,
}

impl BuildStats {
    /// Copy the live counters in.
    pub fn apply_statistics(&mut self, snapshot: &StatisticsSnapshot) {
        self.num_chunks_downloaded = snapshot.chunks_downloaded;
        self.num_chunks_recycled = snapshot.chunks_recycled;
        self.num_chunks_read_from_chunk_dbs = snapshot.chunkdb_chunks_read;
        self.num_failed_downloads = snapshot.downloads_failed;
        self.num_bad_downloads = snapshot.downloads_corrupt;
        self.num_aborted_downloads = snapshot.downloads_aborted;
        self.num_recycle_failures = snapshot.recycle_failures;
        self.num_chunk_db_failures = snapshot.chunkdb_failures;
        self.num_chunks_store_booted = snapshot.chunks_booted;
        self.num_chunks_store_released = snapshot.chunks_released;
        self.num_disk_cache_loads = snapshot.disk_cache_loads;
        self.total_downloaded_data = snapshot.bytes_downloaded;
        self.total_required_download_data = snapshot.required_download_bytes;
        self.total_bytes_constructed = snapshot.bytes_constructed;
        self.overall_request_success_rate = snapshot.request_success_rate();
        self.final_download_health = snapshot.download_health;
        self.download_health_times = snapshot.health_times;
    }

    /// Log every statistic as one `Build Stat:` line.
    pub fn log(&self) {
        let value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Could not serialize build statistics");
                return;
            }
        };
        let Some(fields) = value.as_object() else {
            return;
        };
        for (name, value) in fields {
            tracing::info!("Build Stat: {}: {}", name, value);
        }
    }
}
