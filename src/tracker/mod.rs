//! TransferTracker (spec.md §4.2): in-memory active-transfer registry + per-
//! route daily history files + per-route CSV event log. Advances
//! `TransferRecord`s through the fixed state machine
//! `RECEIVED -> PROCESSING -> FORWARDING -> {COMPLETED|PARTIAL|FAILED}`.
//!
//! Mirrors the teacher's preference for `tokio::sync` primitives over a
//! third-party concurrent map (`Arc<RwLock<HashMap<..>>>` the same way
//! `DicomReceiver` guards its connection count with `Arc<Semaphore>`).

use crate::config::GatewayConfig;
use crate::metrics::MetricsAggregator;
use crate::model::{
    DestinationResult, DestinationStatus, TransferRecord, TransferStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("transfer not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Default)]
struct RouteCounters {
    received: AtomicU64,
    success: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
}

impl RouteCounters {
    fn success_rate(&self) -> f64 {
        let success = self.success.load(Ordering::Relaxed) as f64;
        let partial = self.partial.load(Ordering::Relaxed) as f64;
        let failed = self.failed.load(Ordering::Relaxed) as f64;
        let denom = success + partial + failed;
        if denom == 0.0 {
            0.0
        } else {
            success / denom
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HistoryFile {
    date: String,
    ae_title: String,
    transfers: Vec<TransferRecord>,
}

pub struct TransferTracker {
    config: GatewayConfig,
    active: RwLock<HashMap<String, TransferRecord>>,
    route_counters: RwLock<HashMap<String, Arc<RouteCounters>>>,
    history_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    metrics: Option<Arc<MetricsAggregator>>,
}

impl TransferTracker {
    pub fn new(config: GatewayConfig, metrics: Option<Arc<MetricsAggregator>>) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            route_counters: RwLock::new(HashMap::new()),
            history_locks: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    fn make_transfer_id(ae_title: &str, study_uid: &str) -> String {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let tail: String = if study_uid.len() > 8 {
            study_uid[study_uid.len() - 8..].to_string()
        } else {
            study_uid.to_string()
        };
        format!("{ae_title}_{ts}_{tail}")
    }

    async fn counters_for(&self, ae_title: &str) -> Arc<RouteCounters> {
        if let Some(c) = self.route_counters.read().await.get(ae_title) {
            return c.clone();
        }
        let mut write = self.route_counters.write().await;
        write
            .entry(ae_title.to_string())
            .or_insert_with(|| Arc::new(RouteCounters::default()))
            .clone()
    }

    async fn history_lock_for(&self, ae_title: &str, date: &str) -> Arc<Mutex<()>> {
        let key = format!("{ae_title}:{date}");
        if let Some(l) = self.history_locks.read().await.get(&key) {
            return l.clone();
        }
        let mut write = self.history_locks.write().await;
        write
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn logs_dir(&self, ae_title: &str) -> PathBuf {
        self.config.route_dir(ae_title).join("logs")
    }

    fn history_dir(&self, ae_title: &str) -> PathBuf {
        self.config.route_dir(ae_title).join("history")
    }

    async fn append_event(
        &self,
        ae_title: &str,
        transfer_id: &str,
        event: &str,
        study_uid: &str,
        message: &str,
    ) -> TrackerResult<()> {
        let dir = self.logs_dir(ae_title);
        fs::create_dir_all(&dir).await?;
        let date = Utc::now().format("%Y-%m-%d");
        let path = dir.join(format!("transfers_{date}.csv"));

        let lock = self.history_lock_for(ae_title, &format!("csv-{date}")).await;
        let _guard = lock.lock().await;

        let needs_header = !path.exists();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        use tokio::io::AsyncWriteExt;
        if needs_header {
            file.write_all(b"timestamp,transfer_id,event,study_uid,message\n")
                .await?;
        }
        let line = format!(
            "{},{},{},{},{}\n",
            Utc::now().to_rfc3339(),
            transfer_id,
            event,
            study_uid,
            message.replace(',', ";")
        );
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn write_history(&self, record: &TransferRecord) -> TrackerResult<()> {
        let dir = self.history_dir(&record.ae_title);
        fs::create_dir_all(&dir).await?;
        let date = record.received_at.format("%Y-%m-%d").to_string();
        let path = dir.join(format!("transfers_{date}.json"));

        let lock = self.history_lock_for(&record.ae_title, &date).await;
        let _guard = lock.lock().await;

        let mut doc = if path.exists() {
            let raw = fs::read_to_string(&path).await?;
            serde_json::from_str::<HistoryFile>(&raw).unwrap_or(HistoryFile {
                date: date.clone(),
                ae_title: record.ae_title.clone(),
                transfers: Vec::new(),
            })
        } else {
            HistoryFile {
                date: date.clone(),
                ae_title: record.ae_title.clone(),
                transfers: Vec::new(),
            }
        };
        doc.transfers.push(record.clone());

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&doc)?).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn create_transfer(
        &self,
        ae_title: &str,
        study_uid: &str,
        calling_ae_title: &str,
        file_count: u64,
        total_size: u64,
    ) -> TrackerResult<TransferRecord> {
        let transfer_id = Self::make_transfer_id(ae_title, study_uid);
        let record = TransferRecord {
            transfer_id: transfer_id.clone(),
            ae_title: ae_title.to_string(),
            study_uid: study_uid.to_string(),
            calling_ae_title: calling_ae_title.to_string(),
            file_count,
            total_size,
            status: TransferStatus::Received,
            error_message: None,
            received_at: Utc::now(),
            processing_started_at: None,
            forwarding_started_at: None,
            completed_at: None,
            destination_results: Vec::new(),
        };

        self.active
            .write()
            .await
            .insert(transfer_id.clone(), record.clone());

        self.counters_for(ae_title)
            .await
            .received
            .fetch_add(1, Ordering::Relaxed);

        if let Some(metrics) = &self.metrics {
            metrics.record_transfer_received(ae_title).await;
        }

        self.append_event(ae_title, &transfer_id, "RECEIVED", study_uid, "transfer received")
            .await?;

        info!(transfer_id = %transfer_id, %ae_title, %study_uid, "transfer received");
        Ok(record)
    }

    pub async fn start_processing(&self, transfer_id: &str) -> TrackerResult<()> {
        let mut active = self.active.write().await;
        let record = active
            .get_mut(transfer_id)
            .ok_or_else(|| TrackerError::NotFound(transfer_id.to_string()))?;
        record.status = TransferStatus::Processing;
        record.processing_started_at = Some(Utc::now());
        let ae_title = record.ae_title.clone();
        let study_uid = record.study_uid.clone();
        drop(active);
        self.append_event(&ae_title, transfer_id, "PROCESSING", &study_uid, "").await?;
        Ok(())
    }

    pub async fn start_forwarding(
        &self,
        transfer_id: &str,
        destinations: &[String],
    ) -> TrackerResult<()> {
        let mut active = self.active.write().await;
        let record = active
            .get_mut(transfer_id)
            .ok_or_else(|| TrackerError::NotFound(transfer_id.to_string()))?;
        record.status = TransferStatus::Forwarding;
        record.forwarding_started_at = Some(Utc::now());
        record.destination_results = destinations
            .iter()
            .map(|d| DestinationResult::pending(d.clone()))
            .collect();
        let ae_title = record.ae_title.clone();
        let study_uid = record.study_uid.clone();
        drop(active);
        self.append_event(&ae_title, transfer_id, "FORWARDING", &study_uid, "").await?;
        Ok(())
    }

    /// Mutates the matching destination result and, if this call is the one
    /// that observes every destination reach SUCCESS|FAILED, performs the
    /// terminal transition exactly once (spec.md §4.2 concurrency note).
    pub async fn update_destination_result(
        &self,
        transfer_id: &str,
        destination: &str,
        status: DestinationStatus,
        message: Option<&str>,
        duration_ms: Option<u64>,
        files_transferred: Option<u64>,
    ) -> TrackerResult<()> {
        let mut active = self.active.write().await;
        let record = match active.get_mut(transfer_id) {
            Some(r) => r,
            None => return Err(TrackerError::NotFound(transfer_id.to_string())),
        };

        if let Some(dest) = record
            .destination_results
            .iter_mut()
            .find(|d| d.destination == destination)
        {
            dest.status = status;
            dest.message = message.map(|m| m.to_string());
            dest.duration_ms = duration_ms;
            dest.files_transferred = files_transferred;
            if matches!(status, DestinationStatus::Success | DestinationStatus::Failed) {
                dest.completed_at = Some(Utc::now());
            }
        }

        self.append_event(
            &record.ae_title,
            transfer_id,
            &format!("DESTINATION_{}", status.as_str()),
            &record.study_uid,
            message.unwrap_or(""),
        )
        .await?;

        if let Some(terminal_status) = record.implied_terminal_status() {
            // Still holding the write lock: only this call can observe and
            // act on the transition, guaranteeing a single terminal write.
            record.status = terminal_status;
            record.completed_at = Some(Utc::now());
            let finished = active.remove(transfer_id).expect("record present");
            drop(active);
            self.finish(finished).await?;
        }

        Ok(())
    }

    pub async fn fail_transfer(&self, transfer_id: &str, reason: &str) -> TrackerResult<()> {
        let mut active = self.active.write().await;
        let record = match active.remove(transfer_id) {
            Some(r) => r,
            None => return Err(TrackerError::NotFound(transfer_id.to_string())),
        };
        drop(active);

        let mut record = record;
        record.status = TransferStatus::Failed;
        record.error_message = Some(reason.to_string());
        record.completed_at = Some(Utc::now());
        self.finish(record).await
    }

    async fn finish(&self, record: TransferRecord) -> TrackerResult<()> {
        let counters = self.counters_for(&record.ae_title).await;
        match record.status {
            TransferStatus::Completed => {
                counters.success.fetch_add(1, Ordering::Relaxed);
            }
            TransferStatus::Partial => {
                counters.partial.fetch_add(1, Ordering::Relaxed);
            }
            TransferStatus::Failed => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => warn!(transfer_id = %record.transfer_id, "finish called on non-terminal status"),
        }

        if let Some(metrics) = &self.metrics {
            let files = record
                .destination_results
                .iter()
                .filter_map(|d| d.files_transferred)
                .sum::<u64>()
                .max(record.file_count);
            match record.status {
                TransferStatus::Failed => metrics.record_transfer_failed(&record.ae_title).await,
                _ => {
                    metrics
                        .record_transfer_success(&record.ae_title, record.total_size, files)
                        .await
                }
            }
        }

        self.append_event(
            &record.ae_title,
            &record.transfer_id,
            record.status.as_str(),
            &record.study_uid,
            record.error_message.as_deref().unwrap_or(""),
        )
        .await?;

        self.write_history(&record).await?;

        info!(
            transfer_id = %record.transfer_id,
            status = record.status.as_str(),
            "transfer reached terminal state"
        );
        Ok(())
    }

    // ---- queries ---------------------------------------------------------

    pub async fn get_active_transfers(&self, ae_title: Option<&str>) -> Vec<TransferRecord> {
        self.active
            .read()
            .await
            .values()
            .filter(|r| ae_title.map(|a| a == r.ae_title).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get_transfer(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.active.read().await.get(transfer_id).cloned()
    }

    pub async fn get_transfers_by_study_uid(&self, study_uid: &str) -> Vec<TransferRecord> {
        self.active
            .read()
            .await
            .values()
            .filter(|r| r.study_uid == study_uid)
            .cloned()
            .collect()
    }

    pub async fn get_history(&self, ae_title: &str, date: &str) -> TrackerResult<Vec<TransferRecord>> {
        let path = self.history_dir(ae_title).join(format!("transfers_{date}.json"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        let doc: HistoryFile = serde_json::from_str(&raw)?;
        Ok(doc.transfers)
    }

    /// Walks back up to 30 days of history files for `ae_title`.
    pub async fn get_transfer_history(&self, ae_title: &str, limit: usize) -> TrackerResult<Vec<TransferRecord>> {
        let mut out = Vec::new();
        let today = Utc::now().date_naive();
        for days_ago in 0..30 {
            if out.len() >= limit {
                break;
            }
            let date = today - chrono::Duration::days(days_ago);
            let records = self.get_history(ae_title, &date.format("%Y-%m-%d").to_string()).await?;
            out.extend(records);
        }
        out.truncate(limit);
        Ok(out)
    }

    pub async fn get_failed_transfers(
        &self,
        ae_title: Option<&str>,
        limit: usize,
    ) -> TrackerResult<Vec<TransferRecord>> {
        let mut out = Vec::new();
        let today = Utc::now().date_naive();
        for days_ago in 0..30 {
            if out.len() >= limit {
                break;
            }
            let date = today - chrono::Duration::days(days_ago);
            if let Some(ae) = ae_title {
                let records = self.get_history(ae, &date.format("%Y-%m-%d").to_string()).await?;
                out.extend(records.into_iter().filter(|r| r.status == TransferStatus::Failed));
            } else {
                // No route given: scan every route directory under the data root.
                let mut entries = match fs::read_dir(&self.config.data_root).await {
                    Ok(e) => e,
                    Err(_) => break,
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Some(name) = entry.file_name().to_str() {
                        if name == "scripts" {
                            continue;
                        }
                        let records = self
                            .get_history(name, &date.format("%Y-%m-%d").to_string())
                            .await
                            .unwrap_or_default();
                        out.extend(records.into_iter().filter(|r| r.status == TransferStatus::Failed));
                    }
                }
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    pub async fn success_rate(&self, ae_title: &str) -> f64 {
        self.counters_for(ae_title).await.success_rate()
    }

    /// Durable folder-count statistics, surviving process restart (spec.md
    /// §4.2). Counts `study_*` directories under each lifecycle stage.
    pub async fn global_folder_stats(&self, ae_title: &str) -> TrackerResult<GlobalFolderStats> {
        let route_dir = self.config.route_dir(ae_title);
        let mut stats = GlobalFolderStats::default();
        for (stage, field) in [
            ("incoming", &mut stats.incoming),
            ("processing", &mut stats.processing),
            ("completed", &mut stats.completed),
            ("failed", &mut stats.failed),
        ] {
            let dir = route_dir.join(stage);
            *field = count_study_folders(&dir).await;
        }
        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct GlobalFolderStats {
    pub incoming: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

async fn count_study_folders(dir: &std::path::Path) -> u64 {
    let mut count = 0u64;
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return 0,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(file_type) = entry.file_type().await {
            if file_type.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with("study_") {
                        count += 1;
                    }
                }
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DestinationStatus;

    fn test_config() -> GatewayConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        GatewayConfig::new(path.join("data"), path.join("db.sqlite"))
    }

    #[tokio::test]
    async fn single_study_forward_all_success() {
        let tracker = TransferTracker::new(test_config(), None);
        let record = tracker
            .create_transfer("RTE_A", "1.2.3", "MODALITY", 10, 1_048_576)
            .await
            .unwrap();
        tracker
            .start_forwarding(&record.transfer_id, &["dest1".into(), "dest2".into()])
            .await
            .unwrap();
        tracker
            .update_destination_result(
                &record.transfer_id,
                "dest1",
                DestinationStatus::Success,
                Some("ok"),
                Some(500),
                Some(10),
            )
            .await
            .unwrap();
        assert!(tracker.get_transfer(&record.transfer_id).await.is_some());
        tracker
            .update_destination_result(
                &record.transfer_id,
                "dest2",
                DestinationStatus::Success,
                Some("ok"),
                Some(700),
                Some(10),
            )
            .await
            .unwrap();

        assert!(tracker.get_transfer(&record.transfer_id).await.is_none());
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let history = tracker.get_history("RTE_A", &today).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransferStatus::Completed);
        assert_eq!(tracker.success_rate("RTE_A").await, 1.0);
    }

    #[tokio::test]
    async fn partial_when_one_destination_fails() {
        let tracker = TransferTracker::new(test_config(), None);
        let record = tracker
            .create_transfer("RTE_A", "1.2.3", "MODALITY", 10, 1_048_576)
            .await
            .unwrap();
        tracker
            .start_forwarding(&record.transfer_id, &["dest1".into(), "dest2".into()])
            .await
            .unwrap();
        tracker
            .update_destination_result(
                &record.transfer_id,
                "dest1",
                DestinationStatus::Success,
                None,
                None,
                None,
            )
            .await
            .unwrap();
        tracker
            .update_destination_result(
                &record.transfer_id,
                "dest2",
                DestinationStatus::Failed,
                Some("boom"),
                None,
                None,
            )
            .await
            .unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let history = tracker.get_history("RTE_A", &today).await.unwrap();
        assert_eq!(history[0].status, TransferStatus::Partial);
    }

    #[tokio::test]
    async fn fail_transfer_is_terminal_and_removed() {
        let tracker = TransferTracker::new(test_config(), None);
        let record = tracker
            .create_transfer("RTE_B", "1.2.4", "MOD", 1, 10)
            .await
            .unwrap();
        tracker.fail_transfer(&record.transfer_id, "explicit failure").await.unwrap();
        assert!(tracker.get_transfer(&record.transfer_id).await.is_none());
    }
}
