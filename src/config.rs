//! Gateway-wide configuration. Loading from a file is out of scope (spec.md
//! §1); callers construct this directly, mirroring `DicomClientConfig` in
//! `src/sender/dicom_client.rs`.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Root directory holding `{ae_title}/{incoming,processing,completed,failed,
    /// pending_review,rejected,history,logs}` and the reserved `scripts/` dir.
    pub data_root: PathBuf,
    /// Path to the SQLite database file backing the Store.
    pub database_path: PathBuf,
    /// Number of worker threads in the Indexer's scan pool.
    pub indexer_workers: usize,
    /// Number of files processed per batch before the cancellation/progress
    /// barrier is checked (spec.md §4.4).
    pub indexer_batch_size: usize,
    /// How long a study folder / history file / log file may sit before
    /// StorageReaper deletes it.
    pub retention: Duration,
    /// Association timeout budget for C-FIND queries; enforced by the
    /// underlying DICOM library's own timeouts (spec.md §5), this value is
    /// passed through for callers that want to bound it at a higher layer.
    pub cfind_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(data_root: impl Into<PathBuf>, database_path: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            database_path: database_path.into(),
            indexer_workers: 4,
            indexer_batch_size: 100,
            retention: Duration::from_secs(30 * 24 * 3600),
            cfind_timeout: Duration::from_secs(60),
        }
    }

    pub fn route_dir(&self, ae_title: &str) -> PathBuf {
        self.data_root.join(ae_title)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_root.join("scripts")
    }
}

/// `gggg,eeee` -> `{A-Za-z0-9.-}` sanitization used for every filesystem path
/// keyed by a DICOM UID (spec.md §4.3).
pub fn sanitize_uid(uid: &str) -> String {
    uid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize_uid("1.2.840/10008\\5"), "1.2.840_10008_5");
        assert_eq!(sanitize_uid("1.2.3-4.5"), "1.2.3-4.5");
    }
}
