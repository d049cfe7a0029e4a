//! StorageReaper (spec.md §4.7): a daily retention sweep over each route's
//! `completed/`, `failed/`, `history/`, and `logs/` directories, plus an
//! on-demand trigger. Grounded in `MetricsAggregator::spawn`'s supervised
//! `tokio::time::interval` loop (`src/metrics/mod.rs`) — ticks never kill the
//! task, failures are logged and swallowed.

use crate::config::GatewayConfig;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub studies_deleted: u64,
    pub history_files_deleted: u64,
    pub log_files_deleted: u64,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.studies_deleted += other.studies_deleted;
        self.history_files_deleted += other.history_files_deleted;
        self.log_files_deleted += other.log_files_deleted;
    }
}

/// Deletes `completed/`, `failed/`, `history/`, and `logs/` entries older
/// than `config.retention`, across every route directory (`scripts/`
/// excluded). Runs on a 24h cadence via [`spawn`], plus on demand via
/// [`Handle::trigger`].
pub struct StorageReaper {
    config: GatewayConfig,
}

/// Handle for requesting an out-of-band sweep outside the daily cadence.
#[derive(Clone)]
pub struct Handle {
    trigger: mpsc::Sender<()>,
}

impl Handle {
    /// Requests an immediate sweep. A pending request already queued is
    /// enough (the channel is capacity-1); this never blocks.
    pub fn trigger_cleanup(&self) {
        let _ = self.trigger.try_send(());
    }
}

impl StorageReaper {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Spawns the supervised daily sweep loop. Returns a [`Handle`] for
    /// triggering an immediate out-of-band run.
    pub fn spawn(self: std::sync::Arc<Self>) -> (tokio::task::JoinHandle<()>, Handle) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    Some(()) = rx.recv() => {}
                    else => break,
                }
                match self.sweep().await {
                    Ok(report) => info!(
                        studies_deleted = report.studies_deleted,
                        history_files_deleted = report.history_files_deleted,
                        log_files_deleted = report.log_files_deleted,
                        "storage reaper sweep completed"
                    ),
                    Err(e) => error!("storage reaper sweep failed: {e}"),
                }
            }
        });
        (handle, Handle { trigger: tx })
    }

    pub async fn sweep(&self) -> std::io::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if !self.config.data_root.exists() {
            return Ok(report);
        }

        let cutoff = SystemTime::now()
            .checked_sub(self.config.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut routes = fs::read_dir(&self.config.data_root).await?;
        while let Some(entry) = routes.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == "scripts" {
                continue;
            }
            report.merge(self.sweep_route(&entry.path(), cutoff).await?);
        }
        Ok(report)
    }

    /// Runs [`sweep`] immediately, bypassing the daily cadence (spec.md §4.7).
    pub async fn trigger_cleanup(&self) -> std::io::Result<CleanupReport> {
        self.sweep().await
    }

    async fn sweep_route(&self, route_dir: &std::path::Path, cutoff: SystemTime) -> std::io::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        report.studies_deleted += delete_older_studies(&route_dir.join("completed"), cutoff).await?;
        report.studies_deleted += delete_older_studies(&route_dir.join("failed"), cutoff).await?;
        report.history_files_deleted +=
            delete_older_files(&route_dir.join("history"), &["json", "csv"], cutoff).await?;
        report.log_files_deleted += delete_older_files(&route_dir.join("logs"), &["json", "csv"], cutoff).await?;
        Ok(report)
    }
}

async fn modified_before(path: &std::path::Path, cutoff: SystemTime) -> std::io::Result<bool> {
    let metadata = fs::metadata(path).await?;
    Ok(metadata.modified()? < cutoff)
}

/// Deletes `study_*` subdirectories of `dir` whose mtime predates `cutoff`.
async fn delete_older_studies(dir: &std::path::Path, cutoff: SystemTime) -> std::io::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut deleted = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let is_study = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with("study_"))
            .unwrap_or(false);
        if !is_study {
            continue;
        }
        let path = entry.path();
        if modified_before(&path, cutoff).await? {
            if let Err(e) = fs::remove_dir_all(&path).await {
                warn!("failed to remove expired study directory {}: {e}", path.display());
                continue;
            }
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Deletes files directly under `dir` with one of `extensions` whose mtime
/// predates `cutoff`.
async fn delete_older_files(dir: &std::path::Path, extensions: &[&str], cutoff: SystemTime) -> std::io::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut deleted = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.contains(&e))
            .unwrap_or(false);
        if !matches_ext {
            continue;
        }
        if modified_before(&path, cutoff).await? {
            if let Err(e) = fs::remove_file(&path).await {
                warn!("failed to remove expired file {}: {e}", path.display());
                continue;
            }
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A few-millisecond retention window: files written before the sleep in
    /// each test are already expired by the time `sweep` runs, without
    /// needing to fake file mtimes.
    fn test_config() -> GatewayConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        let mut config = GatewayConfig::new(path.join("data"), path.join("db.sqlite"));
        config.retention = Duration::from_millis(1);
        config
    }

    async fn write_file(path: &std::path::Path) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn sweep_skips_scripts_directory() {
        let config = test_config();
        let reaper = StorageReaper::new(config.clone());
        let scripts_file = config.scripts_dir().join("deid.lua");
        write_file(&scripts_file).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        reaper.sweep().await.unwrap();
        assert!(scripts_file.exists());
    }

    #[tokio::test]
    async fn sweep_deletes_expired_study_directories_only() {
        let config = test_config();
        let reaper = StorageReaper::new(config.clone());

        let old_study = config.route_dir("RTE_A").join("completed").join("study_1.2.3");
        write_file(&old_study.join("marker.dcm")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh_study = config.route_dir("RTE_A").join("completed").join("study_9.9.9");
        write_file(&fresh_study.join("marker.dcm")).await;

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.studies_deleted, 1);
        assert!(!old_study.exists());
        assert!(fresh_study.exists());
    }

    #[tokio::test]
    async fn sweep_deletes_expired_history_and_log_files() {
        let config = test_config();
        let reaper = StorageReaper::new(config.clone());

        let history = config.route_dir("RTE_A").join("history").join("2024-01-01.json");
        write_file(&history).await;
        let log = config.route_dir("RTE_A").join("logs").join("transfer.csv");
        write_file(&log).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.history_files_deleted, 1);
        assert_eq!(report.log_files_deleted, 1);
        assert!(!history.exists());
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn trigger_cleanup_runs_a_sweep_immediately() {
        let config = test_config();
        let reaper = StorageReaper::new(config.clone());
        let old_study = config.route_dir("RTE_A").join("failed").join("study_1.2.3");
        write_file(&old_study.join("marker.dcm")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = reaper.trigger_cleanup().await.unwrap();
        assert_eq!(report.studies_deleted, 1);
    }
}
