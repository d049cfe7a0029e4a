//! Shared data model types used across Store, TransferTracker, ReviewCoordinator,
//! MetricsAggregator and ComparisonEngine. Mirrors the plain-record style of
//! `common::types::DicomFile`/`TransferResult`: required fields up front,
//! optionals explicit, no reflective row mirroring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedStudy {
    pub study_uid: String,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_sex: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub accession_number: Option<String>,
    pub study_description: Option<String>,
    pub modalities: Vec<String>,
    pub institution_name: Option<String>,
    pub referring_physician: Option<String>,
    pub source_route: String,
    pub series_count: i64,
    pub instance_count: i64,
    pub total_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedSeries {
    pub series_uid: String,
    pub study_uid: String,
    pub modality: Option<String>,
    pub series_number: Option<String>,
    pub series_description: Option<String>,
    pub body_part: Option<String>,
    pub instance_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedInstance {
    pub sop_instance_uid: String,
    pub series_uid: String,
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<i64>,
    pub file_path: String,
    pub file_size: i64,
    pub file_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomFieldType {
    String,
    Number,
    Date,
}

impl CustomFieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomFieldType::String => "string",
            CustomFieldType::Number => "number",
            CustomFieldType::Date => "date",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(CustomFieldType::String),
            "number" => Some(CustomFieldType::Number),
            "date" => Some(CustomFieldType::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomFieldLevel {
    Study,
    Series,
    Instance,
}

impl CustomFieldLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomFieldLevel::Study => "study",
            CustomFieldLevel::Series => "series",
            CustomFieldLevel::Instance => "instance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "study" => Some(CustomFieldLevel::Study),
            "series" => Some(CustomFieldLevel::Series),
            "instance" => Some(CustomFieldLevel::Instance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: i64,
    pub dicom_tag: String,
    pub field_type: CustomFieldType,
    pub level: CustomFieldLevel,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Received,
    Processing,
    Forwarding,
    Completed,
    Partial,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Received => "RECEIVED",
            TransferStatus::Processing => "PROCESSING",
            TransferStatus::Forwarding => "FORWARDING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Partial => "PARTIAL",
            TransferStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Partial | TransferStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationStatus::Pending => "PENDING",
            DestinationStatus::InProgress => "IN_PROGRESS",
            DestinationStatus::Success => "SUCCESS",
            DestinationStatus::Failed => "FAILED",
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, DestinationStatus::Success | DestinationStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationResult {
    pub destination: String,
    pub status: DestinationStatus,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
    pub files_transferred: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DestinationResult {
    pub fn pending(destination: String) -> Self {
        Self {
            destination,
            status: DestinationStatus::Pending,
            message: None,
            duration_ms: None,
            files_transferred: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub ae_title: String,
    pub study_uid: String,
    pub calling_ae_title: String,
    pub file_count: u64,
    pub total_size: u64,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub forwarding_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub destination_results: Vec<DestinationResult>,
}

impl TransferRecord {
    /// Overall status implied purely by the current destination results, per
    /// the COMPLETED/PARTIAL/FAILED invariant in spec.md §3. Returns `None`
    /// while any destination is still PENDING/IN_PROGRESS.
    pub fn implied_terminal_status(&self) -> Option<TransferStatus> {
        if self.destination_results.is_empty() {
            return None;
        }
        if !self
            .destination_results
            .iter()
            .all(|d| d.status.is_settled())
        {
            return None;
        }
        let success = self
            .destination_results
            .iter()
            .filter(|d| d.status == DestinationStatus::Success)
            .count();
        let failed = self
            .destination_results
            .iter()
            .filter(|d| d.status == DestinationStatus::Failed)
            .count();
        if failed == 0 {
            Some(TransferStatus::Completed)
        } else if success == 0 {
            Some(TransferStatus::Failed)
        } else {
            Some(TransferStatus::Partial)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    PendingReview,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::PendingReview => "PENDING_REVIEW",
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub review_id: String,
    pub study_uid: String,
    pub ae_title: String,
    pub archive_path: String,
    pub submitted_at: DateTime<Utc>,
    pub status: ReviewStatus,
    pub script_used: Option<String>,
    pub phi_fields_modified: Vec<String>,
    pub warnings: Vec<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp_millis: i64,
    pub transfers: u64,
    pub successful: u64,
    pub failed: u64,
    pub bytes: u64,
    pub files: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    pub ae_title: String,
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub total_bytes: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReindexJobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ReindexJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexJobStatus::Running => "running",
            ReindexJobStatus::Completed => "completed",
            ReindexJobStatus::Failed => "failed",
            ReindexJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ReindexJobStatus::Running),
            "completed" => Some(ReindexJobStatus::Completed),
            "failed" => Some(ReindexJobStatus::Failed),
            "cancelled" => Some(ReindexJobStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexJob {
    pub id: String,
    pub status: ReindexJobStatus,
    pub total_files: u64,
    pub processed: u64,
    pub errors: u64,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
