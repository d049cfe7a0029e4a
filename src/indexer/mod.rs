//! Indexer (spec.md §4.4): filesystem scan, subtree-as-destination scan, and
//! remote C-FIND scan, sharing a worker pool, a single-job-at-a-time
//! invariant, cooperative cancellation and batch barrier synchronization.
//!
//! The single "current job" slot is modeled as a compare-and-swap on a job
//! handle (spec.md §9 design note) rather than scattered volatile flags.

pub mod cfind;
pub mod chunk;
pub mod tags;

use crate::config::GatewayConfig;
use crate::model::{CustomField, CustomFieldLevel, IndexedInstance, IndexedSeries, IndexedStudy, ReindexJobStatus};
use crate::store::{Store, StoreError};
use chunk::{build_dicom_date_range, generate_date_chunks, ChunkSize};
use dicom_core::Tag;
use dicom_dictionary_std::tags as dict_tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("c-find error: {0}")]
    CFind(#[from] cfind::CFindError),
}

pub type IndexerResult<T> = Result<T, IndexerError>;

struct JobHandle {
    id: String,
    cancel: Arc<AtomicBool>,
}

pub struct Indexer {
    config: GatewayConfig,
    store: Arc<Store>,
    current_job: Arc<Mutex<Option<JobHandle>>>,
}

impl Indexer {
    pub fn new(config: GatewayConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            current_job: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a new job if none is running, returning `(job_id,
    /// is_new, cancel_flag)`. If a job is already running its id is
    /// returned with `is_new = false` and no new work should be started.
    async fn claim_job(&self) -> (String, bool, Arc<AtomicBool>) {
        let mut slot = self.current_job.lock().await;
        if let Some(existing) = slot.as_ref() {
            return (existing.id.clone(), false, existing.cancel.clone());
        }
        let id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        *slot = Some(JobHandle {
            id: id.clone(),
            cancel: cancel.clone(),
        });
        (id, true, cancel)
    }

    async fn release_job(&self, id: &str) {
        let mut slot = self.current_job.lock().await;
        if slot.as_ref().map(|h| h.id.as_str()) == Some(id) {
            *slot = None;
        }
    }

    /// Returns `true` if `job_id` is the currently running job and it was
    /// signalled to cancel.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let slot = self.current_job.lock().await;
        match slot.as_ref() {
            Some(handle) if handle.id == job_id => {
                handle.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub async fn start_filesystem_scan(&self, root: PathBuf, source_route: String) -> IndexerResult<String> {
        let (id, is_new, cancel) = self.claim_job().await;
        if !is_new {
            return Ok(id);
        }
        self.store.create_reindex_job(&id).await?;
        let store = self.store.clone();
        let batch_size = self.config.indexer_batch_size;
        let job_id = id.clone();
        let current_job = self.current_job.clone();
        tokio::spawn(async move {
            let outcome = run_filesystem_scan(&store, &root, &source_route, batch_size, &job_id, &cancel).await;
            finish_job(&store, &job_id, outcome).await;
            release_slot(&current_job, &job_id).await;
        });
        Ok(id)
    }

    pub async fn start_subtree_scan(
        &self,
        root: PathBuf,
        destination_name: String,
        clear_index_first: bool,
    ) -> IndexerResult<String> {
        let (id, is_new, cancel) = self.claim_job().await;
        if !is_new {
            return Ok(id);
        }
        self.store.create_reindex_job(&id).await?;
        if clear_index_first {
            self.store.clear_index().await?;
        }
        let store = self.store.clone();
        let batch_size = self.config.indexer_batch_size;
        let job_id = id.clone();
        let current_job = self.current_job.clone();
        tokio::spawn(async move {
            let outcome =
                run_filesystem_scan(&store, &root, &destination_name, batch_size, &job_id, &cancel).await;
            finish_job(&store, &job_id, outcome).await;
            release_slot(&current_job, &job_id).await;
        });
        Ok(id)
    }

    pub async fn start_remote_scan(
        &self,
        target: cfind::RemoteScanTarget,
        source_route: String,
        study_date_from: Option<String>,
        study_date_to: Option<String>,
        chunk_size: ChunkSize,
    ) -> IndexerResult<String> {
        let (id, is_new, cancel) = self.claim_job().await;
        if !is_new {
            return Ok(id);
        }
        self.store.create_reindex_job(&id).await?;
        let store = self.store.clone();
        let timeout = self.config.cfind_timeout;
        let job_id = id.clone();
        let current_job = self.current_job.clone();
        tokio::spawn(async move {
            let outcome = run_remote_scan(
                &store,
                &target,
                &source_route,
                study_date_from.as_deref(),
                study_date_to.as_deref(),
                chunk_size,
                timeout,
                &job_id,
                &cancel,
            )
            .await;
            finish_job(&store, &job_id, outcome).await;
            release_slot(&current_job, &job_id).await;
        });
        Ok(id)
    }
}

async fn release_slot(current_job: &Arc<Mutex<Option<JobHandle>>>, id: &str) {
    let mut slot = current_job.lock().await;
    if slot.as_ref().map(|h| h.id.as_str()) == Some(id) {
        *slot = None;
    }
}

struct JobOutcome {
    status: ReindexJobStatus,
    total_files: u64,
    processed: u64,
    errors: u64,
    message: Option<String>,
}

async fn finish_job(store: &Store, job_id: &str, outcome: IndexerResult<JobOutcome>) {
    let outcome = outcome.unwrap_or_else(|e| {
        error!("reindex job {job_id} failed: {e}");
        JobOutcome {
            status: ReindexJobStatus::Failed,
            total_files: 0,
            processed: 0,
            errors: 1,
            message: Some(e.to_string()),
        }
    });
    if let Err(e) = store
        .update_reindex_job(
            job_id,
            outcome.status,
            outcome.total_files,
            outcome.processed,
            outcome.errors,
            outcome.message.as_deref(),
        )
        .await
    {
        error!("failed to persist final state for reindex job {job_id}: {e}");
    }
}

/// `path/-relative` DICOM candidate test: filename suffix or the `DICM`
/// magic at byte offset 128 (spec.md §4.4).
async fn is_dicom_candidate(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if ext == "dcm" || ext == "dicom" {
            return true;
        }
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => bytes.len() >= 132 && &bytes[128..132] == b"DICM",
        Err(_) => false,
    }
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

async fn run_filesystem_scan(
    store: &Store,
    root: &Path,
    source_route: &str,
    batch_size: usize,
    job_id: &str,
    cancel: &Arc<AtomicBool>,
) -> IndexerResult<JobOutcome> {
    let candidates: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();

    if candidates.is_empty() {
        return Ok(JobOutcome {
            status: ReindexJobStatus::Completed,
            total_files: 0,
            processed: 0,
            errors: 0,
            message: Some("No DICOM files found".to_string()),
        });
    }

    let custom_fields = store.get_enabled_custom_fields().await?;

    let mut processed = 0u64;
    let mut errors = 0u64;
    let total = candidates.len() as u64;

    for batch in candidates.chunks(batch_size) {
        if cancel.load(Ordering::SeqCst) {
            store
                .update_reindex_job(
                    job_id,
                    ReindexJobStatus::Cancelled,
                    total,
                    processed,
                    errors,
                    Some("Cancelled by user"),
                )
                .await?;
            return Ok(JobOutcome {
                status: ReindexJobStatus::Cancelled,
                total_files: total,
                processed,
                errors,
                message: Some("Cancelled by user".to_string()),
            });
        }

        for path in batch {
            if !is_dicom_candidate(path).await {
                processed += 1;
                continue;
            }
            match index_one_file(store, path, source_route, &custom_fields).await {
                Ok(true) => {}
                Ok(false) => {
                    // missing a required UID; skipped without counting as an error
                }
                Err(e) => {
                    warn!("failed to index {}: {e}", path.display());
                    errors += 1;
                }
            }
            processed += 1;
        }

        store
            .update_reindex_job(
                job_id,
                ReindexJobStatus::Running,
                total,
                processed,
                errors,
                Some(&format!("Indexed {processed}/{total} files")),
            )
            .await?;
    }

    store.aggregate_study_counts().await?;

    Ok(JobOutcome {
        status: ReindexJobStatus::Completed,
        total_files: total,
        processed,
        errors,
        message: None,
    })
}

/// Parses one candidate file (stopping before pixel data), upserts its
/// study/series/instance rows and any enabled custom field values derived
/// from it (spec.md §4.4), and returns `false` if a required UID was missing
/// (skip, not an error).
async fn index_one_file(
    store: &Store,
    path: &Path,
    source_route: &str,
    custom_fields: &[CustomField],
) -> IndexerResult<bool> {
    let path = path.to_path_buf();
    let bytes = tokio::fs::read(&path).await?;
    let file_size = bytes.len() as i64;
    let file_hash = md5_hex(&bytes);
    let source_route = source_route.to_string();
    let custom_fields = custom_fields.to_vec();

    let parsed = tokio::task::spawn_blocking(move || {
        parse_dicom_metadata(&path, file_size, &file_hash, &source_route, &custom_fields)
    })
    .await
    .map_err(|e| IndexerError::Io(std::io::Error::other(e.to_string())))?;

    let Some((study, series, instance, field_values)) = parsed else {
        return Ok(false);
    };

    store.upsert_study(&study).await?;
    store.upsert_series(&series).await?;
    store.upsert_instance(&instance).await?;
    for (field_id, entity_uid, value) in field_values {
        store.set_custom_field_value(field_id, &entity_uid, value.as_deref()).await?;
    }
    Ok(true)
}

/// Resolves `field.dicom_tag` to a `Tag`, or `None` if the spec string
/// doesn't name a known tag (`tags::NO_TAG`); the field is skipped entirely
/// in that case rather than stored with an empty value.
fn resolve_custom_field_tag(dicom_tag: &str) -> Option<Tag> {
    let packed = tags::parse_tag(dicom_tag);
    if packed == tags::NO_TAG {
        return None;
    }
    let packed = packed as u32;
    Some(Tag((packed >> 16) as u16, (packed & 0xFFFF) as u16))
}

/// Reads `tag`'s value out of the parsed object as the custom field's stored
/// value, `None` if the element is absent or empty.
fn read_custom_field_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[allow(clippy::type_complexity)]
fn parse_dicom_metadata(
    path: &Path,
    file_size: i64,
    file_hash: &str,
    source_route: &str,
    custom_fields: &[CustomField],
) -> Option<(IndexedStudy, IndexedSeries, IndexedInstance, Vec<(i64, String, Option<String>)>)> {
    let obj = OpenFileOptions::new()
        .read_until(dict_tags::PIXEL_DATA)
        .open_file(path)
        .ok()?;

    let study_uid = obj.element(dict_tags::STUDY_INSTANCE_UID).ok()?.to_str().ok()?.trim().to_string();
    let series_uid = obj.element(dict_tags::SERIES_INSTANCE_UID).ok()?.to_str().ok()?.trim().to_string();
    let sop_instance_uid = obj.element(dict_tags::SOP_INSTANCE_UID).ok()?.to_str().ok()?.trim().to_string();
    if study_uid.is_empty() || series_uid.is_empty() || sop_instance_uid.is_empty() {
        return None;
    }

    let opt_str = |tag| obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let opt_int = |tag| obj.element(tag).ok().and_then(|e| e.to_int::<i64>().ok());

    let modality = opt_str(dict_tags::MODALITY);
    let study = IndexedStudy {
        study_uid: study_uid.clone(),
        patient_id: opt_str(dict_tags::PATIENT_ID),
        patient_name: opt_str(dict_tags::PATIENT_NAME),
        patient_sex: opt_str(dict_tags::PATIENT_SEX),
        study_date: opt_str(dict_tags::STUDY_DATE),
        study_time: opt_str(dict_tags::STUDY_TIME),
        accession_number: opt_str(dict_tags::ACCESSION_NUMBER),
        study_description: opt_str(dict_tags::STUDY_DESCRIPTION),
        modalities: modality.clone().into_iter().collect(),
        institution_name: opt_str(dict_tags::INSTITUTION_NAME),
        referring_physician: opt_str(dict_tags::REFERRING_PHYSICIAN_NAME),
        source_route: source_route.to_string(),
        series_count: 0,
        instance_count: 0,
        total_size: 0,
    };
    let series = IndexedSeries {
        series_uid: series_uid.clone(),
        study_uid,
        modality,
        series_number: opt_str(dict_tags::SERIES_NUMBER),
        series_description: opt_str(dict_tags::SERIES_DESCRIPTION),
        body_part: opt_str(dict_tags::BODY_PART_EXAMINED),
        instance_count: 0,
    };
    let instance = IndexedInstance {
        sop_instance_uid,
        series_uid,
        sop_class_uid: opt_str(dict_tags::SOP_CLASS_UID),
        instance_number: opt_int(dict_tags::INSTANCE_NUMBER),
        file_path: path.display().to_string(),
        file_size,
        file_hash: file_hash.to_string(),
    };
    let field_values = custom_fields
        .iter()
        .filter(|f| f.enabled)
        .filter_map(|f| {
            let tag = resolve_custom_field_tag(&f.dicom_tag)?;
            let entity_uid = match f.level {
                CustomFieldLevel::Study => study.study_uid.clone(),
                CustomFieldLevel::Series => series.series_uid.clone(),
                CustomFieldLevel::Instance => instance.sop_instance_uid.clone(),
            };
            let value = read_custom_field_value(&obj, tag);
            Some((f.id, entity_uid, value))
        })
        .collect();

    Some((study, series, instance, field_values))
}

#[allow(clippy::too_many_arguments)]
async fn run_remote_scan(
    store: &Store,
    target: &cfind::RemoteScanTarget,
    source_route: &str,
    study_date_from: Option<&str>,
    study_date_to: Option<&str>,
    chunk_size: ChunkSize,
    timeout: std::time::Duration,
    job_id: &str,
    cancel: &Arc<AtomicBool>,
) -> IndexerResult<JobOutcome> {
    let chunks = generate_date_chunks(study_date_from, study_date_to, chunk_size);
    let total_chunks = chunks.len() as u64;
    let mut processed = 0u64;
    let mut errors = 0u64;
    let mut total_studies = 0u64;

    for (idx, (from, to)) in chunks.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            return Ok(cancelled_outcome(total_chunks, processed, errors));
        }

        let date_range = build_dicom_date_range(from.as_deref(), to.as_deref());
        let label = match (from, to) {
            (Some(f), Some(t)) => format!("Querying chunk {}/{}: {} - {}", idx + 1, total_chunks, f, t),
            _ => format!("Querying chunk {}/{}", idx + 1, total_chunks),
        };
        store
            .update_reindex_job(job_id, ReindexJobStatus::Running, total_chunks, processed, errors, Some(&label))
            .await?;

        let target = target.clone();
        let date_range_owned = date_range.clone();
        let identifiers = tokio::task::spawn_blocking(move || cfind::find_studies(&target, &date_range_owned, timeout))
            .await
            .map_err(|e| IndexerError::Io(std::io::Error::other(e.to_string())))??;

        let studies = cfind::studies_from_identifiers(&identifiers, source_route);
        for study in &studies {
            if cancel.load(Ordering::SeqCst) {
                return Ok(cancelled_outcome(total_chunks, processed, errors));
            }
            if let Err(e) = store.upsert_study(study).await {
                warn!("failed to upsert study {}: {e}", study.study_uid);
                errors += 1;
                continue;
            }
            total_studies += 1;

            if cancel.load(Ordering::SeqCst) {
                return Ok(cancelled_outcome(total_chunks, processed, errors));
            }
            let target = target.clone();
            let study_uid = study.study_uid.clone();
            let series_identifiers =
                tokio::task::spawn_blocking(move || cfind::find_series(&target, &study_uid, timeout))
                    .await
                    .map_err(|e| IndexerError::Io(std::io::Error::other(e.to_string())))?;
            match series_identifiers {
                Ok(identifiers) => {
                    for series in cfind::series_from_identifiers(&identifiers, &study.study_uid) {
                        if let Err(e) = store.upsert_series(&series).await {
                            warn!("failed to upsert series {}: {e}", series.series_uid);
                            errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("series-level C-FIND failed for study {}: {e}", study.study_uid);
                    errors += 1;
                }
            }
        }

        processed += 1;
    }

    info!("remote scan job {job_id} indexed {total_studies} studies across {total_chunks} chunks");
    store.aggregate_study_counts().await?;

    Ok(JobOutcome {
        status: ReindexJobStatus::Completed,
        total_files: total_chunks,
        processed,
        errors,
        message: None,
    })
}

fn cancelled_outcome(total: u64, processed: u64, errors: u64) -> JobOutcome {
    JobOutcome {
        status: ReindexJobStatus::Cancelled,
        total_files: total,
        processed,
        errors,
        message: Some("Cancelled by user".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GatewayConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        GatewayConfig::new(path.join("data"), path.join("db.sqlite"))
    }

    #[tokio::test]
    async fn empty_scan_root_completes_with_no_files_message() {
        let config = test_config();
        let store = Arc::new(Store::open(&config.database_path).await.unwrap());
        let indexer = Indexer::new(config.clone(), store.clone());
        let empty_root = tempfile::tempdir().unwrap();

        let job_id = indexer
            .start_filesystem_scan(empty_root.path().to_path_buf(), "RTE_A".to_string())
            .await
            .unwrap();

        // Scan runs on a spawned task; poll briefly for completion.
        for _ in 0..50 {
            if let Some(job) = store.get_reindex_job(&job_id).await.unwrap() {
                if job.status != crate::model::ReindexJobStatus::Running {
                    assert_eq!(job.total_files, 0);
                    assert_eq!(job.message.as_deref(), Some("No DICOM files found"));
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("scan did not complete in time");
    }

    #[tokio::test]
    async fn concurrent_start_returns_existing_job_id() {
        let config = test_config();
        let store = Arc::new(Store::open(&config.database_path).await.unwrap());
        let indexer = Indexer::new(config.clone(), store.clone());
        let root = tempfile::tempdir().unwrap();

        let first = indexer
            .start_filesystem_scan(root.path().to_path_buf(), "RTE_A".to_string())
            .await
            .unwrap();
        let second = indexer
            .start_filesystem_scan(root.path().to_path_buf(), "RTE_B".to_string())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dicom_candidate_accepts_extension_case_insensitively() {
        // exercised indirectly through is_dicom_candidate in async tests;
        // this checks the pure extension matching logic.
        let path = Path::new("/tmp/study/IMG001.DCM");
        assert_eq!(path.extension().unwrap().to_str().unwrap().to_ascii_lowercase(), "dcm");
    }
}
