//! ReviewCoordinator (spec.md §4.3): directory-addressable pending/approved/
//! rejected workflow with an approval callback wired to downstream
//! forwarding. A reviewId appears in at most one of
//! `{pending_review, rejected}` at any time.

use crate::archive::ArchivedStudy;
use crate::config::{sanitize_uid, GatewayConfig};
use crate::model::ReviewMetadata;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type ReviewResult<T> = Result<T, ReviewError>;

/// Single-method interface so the forward manager can be swapped in tests
/// (spec.md §9 design note). Runs synchronously within `approve_review`; if
/// throughput matters the implementation, not the coordinator, should hand
/// off to a queue.
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn on_approved(&self, review: &ReviewMetadata, archived: &ArchivedStudy);
}

pub struct ReviewCoordinator {
    config: GatewayConfig,
    callback: Option<Box<dyn ApprovalCallback>>,
}

impl ReviewCoordinator {
    pub fn new(config: GatewayConfig, callback: Option<Box<dyn ApprovalCallback>>) -> Self {
        Self { config, callback }
    }

    fn pending_dir(&self, ae_title: &str, study_uid: &str) -> PathBuf {
        self.config
            .route_dir(ae_title)
            .join("pending_review")
            .join(format!("study_{}", sanitize_uid(study_uid)))
    }

    fn rejected_dir(&self, ae_title: &str, study_uid: &str) -> PathBuf {
        self.config
            .route_dir(ae_title)
            .join("rejected")
            .join(format!("study_{}", sanitize_uid(study_uid)))
    }

    pub async fn submit_for_review(
        &self,
        ae_title: &str,
        study_uid: &str,
        archive_path: &str,
        script_used: Option<String>,
        phi_fields_modified: Vec<String>,
        warnings: Vec<String>,
    ) -> ReviewResult<String> {
        let review_id = Uuid::new_v4().to_string();
        let dir = self.pending_dir(ae_title, study_uid);
        fs::create_dir_all(&dir).await?;

        let metadata = ReviewMetadata {
            review_id: review_id.clone(),
            study_uid: study_uid.to_string(),
            ae_title: ae_title.to_string(),
            archive_path: archive_path.to_string(),
            submitted_at: Utc::now(),
            status: crate::model::ReviewStatus::PendingReview,
            script_used,
            phi_fields_modified,
            warnings,
            reviewed_at: None,
            reviewed_by: None,
            review_notes: None,
            rejection_reason: None,
        };
        self.write_metadata(&dir.join("review_metadata.json"), &metadata).await?;
        Ok(review_id)
    }

    async fn write_metadata(&self, path: &PathBuf, metadata: &ReviewMetadata) -> ReviewResult<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(metadata)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_metadata(&self, path: &PathBuf) -> ReviewResult<Option<ReviewMetadata>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Scans pending reviews across all routes for `review_id`, returning
    /// `(ae_title, study_uid)`. Restricted to pending reviews since approve
    /// and reject both require status=PENDING_REVIEW.
    async fn resolve_pending(&self, review_id: &str) -> ReviewResult<Option<(String, String)>> {
        let mut routes = self.all_route_names().await?;
        routes.sort();
        for ae_title in routes {
            for candidate in self.get_pending_reviews(&ae_title).await? {
                if candidate.review_id == review_id {
                    return Ok(Some((candidate.ae_title, candidate.study_uid)));
                }
            }
        }
        Ok(None)
    }

    /// Requires status=PENDING_REVIEW; returns `false` without side effects
    /// if `review_id` doesn't resolve to a pending review. Invokes the
    /// callback synchronously before removing the pending directory so a
    /// crash mid-approval never leaves the directory gone with the callback
    /// never invoked.
    pub async fn approve_review(&self, review_id: &str, user_id: &str, notes: Option<String>) -> ReviewResult<bool> {
        let Some((ae_title, study_uid)) = self.resolve_pending(review_id).await? else {
            return Ok(false);
        };
        let ae_title = ae_title.as_str();
        let study_uid = study_uid.as_str();
        let dir = self.pending_dir(ae_title, study_uid);
        let path = dir.join("review_metadata.json");
        let mut metadata = match self.read_metadata(&path).await? {
            Some(m) => m,
            None => return Ok(false),
        };
        if metadata.status != crate::model::ReviewStatus::PendingReview {
            return Ok(false);
        }

        metadata.status = crate::model::ReviewStatus::Approved;
        metadata.reviewed_at = Some(Utc::now());
        metadata.reviewed_by = Some(user_id.to_string());
        metadata.review_notes = notes;

        if let Some(callback) = &self.callback {
            let archived = ArchivedStudy {
                ae_title: ae_title.to_string(),
                study_uid: study_uid.to_string(),
                root: self
                    .config
                    .route_dir(ae_title)
                    .join("processing")
                    .join(format!("study_{}", sanitize_uid(study_uid))),
            };
            // Callback exceptions are logged; the directory is removed
            // regardless (spec.md §4.3).
            callback.on_approved(&metadata, &archived).await;
        }

        if let Err(e) = fs::remove_dir_all(&dir).await {
            error!("failed to remove pending review directory {}: {e}", dir.display());
        }
        Ok(true)
    }

    /// Writes `rejection_metadata.json` under `rejected/` and removes the
    /// pending directory. Returns `false` if `review_id` doesn't resolve to
    /// a pending review.
    pub async fn reject_review(&self, review_id: &str, user_id: &str, reason: &str) -> ReviewResult<bool> {
        let Some((ae_title, study_uid)) = self.resolve_pending(review_id).await? else {
            return Ok(false);
        };
        let ae_title = ae_title.as_str();
        let study_uid = study_uid.as_str();
        let pending = self.pending_dir(ae_title, study_uid);
        let path = pending.join("review_metadata.json");
        let mut metadata = match self.read_metadata(&path).await? {
            Some(m) => m,
            None => return Ok(false),
        };
        if metadata.status != crate::model::ReviewStatus::PendingReview {
            return Ok(false);
        }

        metadata.status = crate::model::ReviewStatus::Rejected;
        metadata.reviewed_at = Some(Utc::now());
        metadata.reviewed_by = Some(user_id.to_string());
        metadata.rejection_reason = Some(reason.to_string());

        let rejected = self.rejected_dir(ae_title, study_uid);
        fs::create_dir_all(&rejected).await?;
        self.write_metadata(&rejected.join("rejection_metadata.json"), &metadata)
            .await?;
        fs::remove_dir_all(&pending).await?;
        Ok(true)
    }

    pub async fn get_review(&self, review_id: &str) -> ReviewResult<Option<ReviewMetadata>> {
        let mut routes = self.all_route_names().await?;
        routes.sort();
        for ae_title in routes {
            for candidate in self.get_pending_reviews(&ae_title).await? {
                if candidate.review_id == review_id {
                    return Ok(Some(candidate));
                }
            }
            for candidate in self.get_rejected_studies(&ae_title, usize::MAX).await? {
                if candidate.review_id == review_id {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    pub async fn get_review_by_study_uid(
        &self,
        ae_title: &str,
        study_uid: &str,
    ) -> ReviewResult<Option<ReviewMetadata>> {
        let path = self.pending_dir(ae_title, study_uid).join("review_metadata.json");
        self.read_metadata(&path).await
    }

    pub async fn get_pending_reviews(&self, ae_title: &str) -> ReviewResult<Vec<ReviewMetadata>> {
        let dir = self.config.route_dir(ae_title).join("pending_review");
        self.read_all_metadata(&dir, "review_metadata.json").await
    }

    pub async fn get_all_pending_reviews(&self) -> ReviewResult<Vec<ReviewMetadata>> {
        let mut out = Vec::new();
        for ae_title in self.all_route_names().await? {
            out.extend(self.get_pending_reviews(&ae_title).await?);
        }
        Ok(out)
    }

    pub async fn get_rejected_studies(&self, ae_title: &str, limit: usize) -> ReviewResult<Vec<ReviewMetadata>> {
        let dir = self.config.route_dir(ae_title).join("rejected");
        let mut all = self.read_all_metadata(&dir, "rejection_metadata.json").await?;
        all.sort_by_key(|m| std::cmp::Reverse(m.reviewed_at));
        all.truncate(limit);
        Ok(all)
    }

    pub async fn get_pending_review_count(&self, ae_title: &str) -> ReviewResult<usize> {
        Ok(self.get_pending_reviews(ae_title).await?.len())
    }

    async fn read_all_metadata(&self, dir: &PathBuf, filename: &str) -> ReviewResult<Vec<ReviewMetadata>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let path = entry.path().join(filename);
                if let Some(metadata) = self.read_metadata(&path).await? {
                    out.push(metadata);
                } else {
                    warn!("study directory {} missing {filename}", entry.path().display());
                }
            }
        }
        Ok(out)
    }

    async fn all_route_names(&self) -> ReviewResult<Vec<String>> {
        let mut out = Vec::new();
        if !self.config.data_root.exists() {
            return Ok(out);
        }
        let mut entries = fs::read_dir(&self.config.data_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if name != "scripts" {
                        out.push(name.to_string());
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct RecordingCallback {
        invoked: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ApprovalCallback for RecordingCallback {
        async fn on_approved(&self, _review: &ReviewMetadata, _archived: &ArchivedStudy) {
            self.invoked.store(true, Ordering::SeqCst);
        }
    }

    fn test_config() -> GatewayConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        GatewayConfig::new(path.join("data"), path.join("db.sqlite"))
    }

    #[tokio::test]
    async fn approve_invokes_callback_and_removes_directory() {
        let invoked = Arc::new(AtomicBool::new(false));
        let coordinator = ReviewCoordinator::new(
            test_config(),
            Some(Box::new(RecordingCallback {
                invoked: invoked.clone(),
            })),
        );
        let review_id = coordinator
            .submit_for_review("RTE_A", "1.2.3", "processing/study_1.2.3", None, vec![], vec![])
            .await
            .unwrap();
        let approved = coordinator.approve_review(&review_id, "alice", None).await.unwrap();
        assert!(approved);
        assert!(invoked.load(Ordering::SeqCst));
        assert!(!coordinator.pending_dir("RTE_A", "1.2.3").exists());
    }

    #[tokio::test]
    async fn approve_twice_is_a_no_op() {
        let coordinator = ReviewCoordinator::new(test_config(), None);
        let review_id = coordinator
            .submit_for_review("RTE_A", "1.2.3", "path", None, vec![], vec![])
            .await
            .unwrap();
        assert!(coordinator.approve_review(&review_id, "alice", None).await.unwrap());
        assert!(!coordinator.approve_review(&review_id, "alice", None).await.unwrap());
    }

    #[tokio::test]
    async fn reject_writes_rejection_metadata_once() {
        let coordinator = ReviewCoordinator::new(test_config(), None);
        let review_id = coordinator
            .submit_for_review("RTE_A", "1.2.3", "path", None, vec![], vec![])
            .await
            .unwrap();
        assert!(coordinator
            .reject_review(&review_id, "bob", "bad deid")
            .await
            .unwrap());
        assert!(!coordinator
            .reject_review(&review_id, "bob", "bad deid")
            .await
            .unwrap());
        let rejected_path = coordinator
            .rejected_dir("RTE_A", "1.2.3")
            .join("rejection_metadata.json");
        assert!(rejected_path.exists());
    }
}
