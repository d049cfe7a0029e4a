//! Archive (spec.md §4 overview row): on-disk staging of `originals/`,
//! `anonymized/` and an audit report, addressed by `(route, studyUid)`.
//! Consumed by ReviewCoordinator and ComparisonEngine.
//!
//! Staged under `{data_root}/{ae_title}/processing/study_{sanitizedUid}/`,
//! keeping it inside the lifecycle directories already named in spec.md §6
//! rather than inventing a new top-level directory.

use crate::config::{sanitize_uid, GatewayConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("archive not found for {0}/{1}")]
    NotFound(String, String),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Audit metadata recorded by the anonymization service (an external
/// collaborator per spec.md §1) when it hands a study off for review.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditReport {
    pub script_used: Option<String>,
    pub phi_fields_modified: Vec<String>,
    pub warnings: Vec<String>,
    /// Whether SOP/series/study UIDs were rewritten and recorded in a
    /// crosswalk, consumed by `ComparisonEngine`'s first pairing strategy.
    pub hash_uids: bool,
    pub broker_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArchivedStudy {
    pub ae_title: String,
    pub study_uid: String,
    pub root: PathBuf,
}

impl ArchivedStudy {
    pub fn originals_dir(&self) -> PathBuf {
        self.root.join("originals")
    }

    pub fn anonymized_dir(&self) -> PathBuf {
        self.root.join("anonymized")
    }

    pub fn audit_report_path(&self) -> PathBuf {
        self.root.join("audit_report.json")
    }
}

pub struct Archive {
    config: GatewayConfig,
}

impl Archive {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn root_for(&self, ae_title: &str, study_uid: &str) -> PathBuf {
        self.config
            .route_dir(ae_title)
            .join("processing")
            .join(format!("study_{}", sanitize_uid(study_uid)))
    }

    /// Creates `originals/` and `anonymized/` under the study's staging
    /// directory. Idempotent: re-staging an already-staged study is a no-op
    /// beyond ensuring the directories exist.
    pub async fn stage(&self, ae_title: &str, study_uid: &str) -> ArchiveResult<ArchivedStudy> {
        let root = self.root_for(ae_title, study_uid);
        let archived = ArchivedStudy {
            ae_title: ae_title.to_string(),
            study_uid: study_uid.to_string(),
            root,
        };
        fs::create_dir_all(archived.originals_dir()).await?;
        fs::create_dir_all(archived.anonymized_dir()).await?;
        Ok(archived)
    }

    pub fn locate(&self, ae_title: &str, study_uid: &str) -> ArchivedStudy {
        ArchivedStudy {
            ae_title: ae_title.to_string(),
            study_uid: study_uid.to_string(),
            root: self.root_for(ae_title, study_uid),
        }
    }

    pub async fn write_original_file(
        &self,
        archived: &ArchivedStudy,
        filename: &str,
        bytes: &[u8],
    ) -> ArchiveResult<PathBuf> {
        let path = archived.originals_dir().join(filename);
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_anonymized_file(
        &self,
        archived: &ArchivedStudy,
        filename: &str,
        bytes: &[u8],
    ) -> ArchiveResult<PathBuf> {
        let path = archived.anonymized_dir().join(filename);
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_audit_report(
        &self,
        archived: &ArchivedStudy,
        report: &AuditReport,
    ) -> ArchiveResult<()> {
        let bytes = serde_json::to_vec_pretty(report)?;
        fs::write(archived.audit_report_path(), bytes).await?;
        Ok(())
    }

    pub async fn read_audit_report(&self, archived: &ArchivedStudy) -> ArchiveResult<AuditReport> {
        if !archived.audit_report_path().exists() {
            return Ok(AuditReport::default());
        }
        let raw = fs::read(archived.audit_report_path()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn list_original_files(&self, archived: &ArchivedStudy) -> ArchiveResult<Vec<PathBuf>> {
        list_dicom_files(&archived.originals_dir()).await
    }

    pub async fn list_anonymized_files(&self, archived: &ArchivedStudy) -> ArchiveResult<Vec<PathBuf>> {
        list_dicom_files(&archived.anonymized_dir()).await
    }

    /// Moves the whole staged study directory to `{ae_title}/completed/` or
    /// `{ae_title}/failed/`, matching spec.md §6's lifecycle layout once
    /// forwarding reaches a terminal state.
    pub async fn finalize(&self, archived: &ArchivedStudy, success: bool) -> ArchiveResult<PathBuf> {
        let stage = if success { "completed" } else { "failed" };
        let dest_root = self.config.route_dir(&archived.ae_title).join(stage);
        fs::create_dir_all(&dest_root).await?;
        let dest = dest_root.join(format!("study_{}", sanitize_uid(&archived.study_uid)));
        if archived.root.exists() {
            fs::rename(&archived.root, &dest).await?;
        }
        Ok(dest)
    }
}

async fn list_dicom_files(dir: &Path) -> ArchiveResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
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
    async fn stage_creates_both_subdirectories() {
        let archive = Archive::new(test_config());
        let archived = archive.stage("RTE_A", "1.2.3").await.unwrap();
        assert!(archived.originals_dir().is_dir());
        assert!(archived.anonymized_dir().is_dir());
    }

    #[tokio::test]
    async fn audit_report_round_trips() {
        let archive = Archive::new(test_config());
        let archived = archive.stage("RTE_A", "1.2.3").await.unwrap();
        let report = AuditReport {
            script_used: Some("deid_v2".into()),
            phi_fields_modified: vec!["PatientName".into(), "PatientID".into()],
            warnings: vec![],
            hash_uids: true,
            broker_name: Some("broker1".into()),
        };
        archive.write_audit_report(&archived, &report).await.unwrap();
        let read_back = archive.read_audit_report(&archived).await.unwrap();
        assert_eq!(read_back.phi_fields_modified.len(), 2);
        assert!(read_back.hash_uids);
    }

    #[tokio::test]
    async fn finalize_moves_study_directory() {
        let archive = Archive::new(test_config());
        let archived = archive.stage("RTE_A", "1.2.3").await.unwrap();
        archive
            .write_original_file(&archived, "a.dcm", b"data")
            .await
            .unwrap();
        let dest = archive.finalize(&archived, true).await.unwrap();
        assert!(dest.join("originals").join("a.dcm").exists());
        assert!(!archived.root.exists());
    }
}
