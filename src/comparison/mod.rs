//! ComparisonEngine (spec.md §4.6): builds a study/scan/header diff between
//! archived originals and their anonymized counterparts. Built on
//! `dicom-object`/`dicom-core` the way the teacher's `dicom_client.rs`
//! already manipulates `InMemDicomObject` and `DataElement`, generalized
//! from transmission to tag-by-tag comparison.

use crate::archive::{Archive, ArchiveError, ArchivedStudy};
use crate::config::GatewayConfig;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ComparisonError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("no original files found for study {0}")]
    NoOriginals(String),
}

pub type ComparisonResult<T> = Result<T, ComparisonError>;

pub const ID_TYPE_SOP_UID: &str = "SOP_UID";

/// External crosswalk collaborator (spec.md §6): given a broker name and an
/// original identifier, returns its de-identified substitute.
pub trait Crosswalk: Send + Sync {
    fn lookup(&self, broker_name: &str, original_id: &str, id_type: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCategory {
    Patient,
    Study,
    Series,
    Equipment,
    Image,
    Other,
}

impl TagCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagCategory::Patient => "Patient",
            TagCategory::Study => "Study",
            TagCategory::Series => "Series",
            TagCategory::Equipment => "Equipment",
            TagCategory::Image => "Image",
            TagCategory::Other => "Other",
        }
    }
}

/// PHI tag set as listed in spec.md §4.6. `PersonName` is omitted: it names a
/// VR, not a tag keyword, so there is no single tag it could resolve to.
const PHI_TAGS: &[Tag] = &[
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::PATIENT_AGE,
    tags::PATIENT_WEIGHT,
    tags::PATIENT_ADDRESS,
    tags::PATIENT_TELEPHONE_NUMBERS,
    tags::OTHER_PATIENT_I_DS,
    tags::OTHER_PATIENT_NAMES,
    tags::ETHNIC_GROUP,
    tags::PATIENT_COMMENTS,
    tags::MEDICAL_RECORD_LOCATOR,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::PERFORMING_PHYSICIAN_NAME,
    tags::OPERATORS_NAME,
    tags::INSTITUTION_NAME,
    tags::INSTITUTION_ADDRESS,
    tags::INSTITUTIONAL_DEPARTMENT_NAME,
    tags::STATION_NAME,
    tags::ACCESSION_NUMBER,
    tags::STUDY_ID,
    tags::STUDY_DESCRIPTION,
    tags::SERIES_DESCRIPTION,
    tags::REQUESTING_PHYSICIAN,
    tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME,
    tags::NAME_OF_PHYSICIANS_READING_STUDY,
    tags::CONTENT_CREATOR_NAME,
    tags::VERIFYING_OBSERVER_NAME,
];

fn is_phi(tag: Tag) -> bool {
    PHI_TAGS.contains(&tag)
}

/// Category derivation from group number, per spec.md §4.6.
fn category_for_tag(tag: Tag) -> TagCategory {
    match tag.group() {
        0x0010 => TagCategory::Patient,
        0x0020 => TagCategory::Series,
        0x0028 | 0x7FE0 => TagCategory::Image,
        0x0008 => {
            if (0x0070..=0x0090).contains(&tag.element()) {
                TagCategory::Equipment
            } else if matches!(tag.element(), 0x0060 | 0x103E) {
                TagCategory::Series
            } else {
                TagCategory::Study
            }
        }
        _ => TagCategory::Other,
    }
}

fn keyword_for_tag(tag: Tag) -> Option<String> {
    crate::indexer::tags::keyword_for_tag(((tag.group() as u32) << 16) | tag.element() as u32)
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct TagDiff {
    pub hex: String,
    pub keyword: Option<String>,
    pub category: TagCategory,
    pub original_value: Option<String>,
    pub anonymized_value: Option<String>,
    pub changed: bool,
    pub removed: bool,
    pub added: bool,
    pub is_phi: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderComparison {
    pub tags: Vec<TagDiff>,
}

#[derive(Debug, Clone)]
pub struct FileComparison {
    pub original_path: PathBuf,
    pub anonymized_path: Option<PathBuf>,
    pub header: Option<HeaderComparison>,
}

#[derive(Debug, Clone)]
pub struct ScanComparison {
    pub series_uid: String,
    pub files: Vec<FileComparison>,
}

#[derive(Debug, Clone)]
pub struct StudyComparison {
    pub study_uid: String,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub scan_count: usize,
    pub file_count: usize,
    pub script_used: Option<String>,
    pub phi_fields_modified: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StudyComparisonResult {
    pub study: StudyComparison,
    pub scans: Vec<ScanComparison>,
}

pub struct ComparisonEngine {
    #[allow(dead_code)]
    config: GatewayConfig,
    archive: Archive,
    crosswalk: Option<Arc<dyn Crosswalk>>,
}

impl ComparisonEngine {
    pub fn new(config: GatewayConfig, crosswalk: Option<Arc<dyn Crosswalk>>) -> Self {
        let archive = Archive::new(config.clone());
        Self { config, archive, crosswalk }
    }

    pub async fn compare_study(
        &self,
        ae_title: &str,
        study_uid: &str,
        broker_name: Option<&str>,
    ) -> ComparisonResult<StudyComparisonResult> {
        let archived = self.archive.locate(ae_title, study_uid);
        let original_paths = self.archive.list_original_files(&archived).await?;
        let anonymized_paths = self.archive.list_anonymized_files(&archived).await?;
        let audit = self.archive.read_audit_report(&archived).await?;

        if original_paths.is_empty() {
            return Err(ComparisonError::NoOriginals(study_uid.to_string()));
        }

        let (originals, anonymized) = {
            let original_paths = original_paths.clone();
            let anonymized_paths = anonymized_paths.clone();
            tokio::task::spawn_blocking(move || (load_objects(&original_paths), load_objects(&anonymized_paths)))
                .await
                .expect("blocking dicom load task panicked")
        };

        let first = &originals[0].1;
        let study = StudyComparison {
            study_uid: study_uid.to_string(),
            patient_id: element_str(first, tags::PATIENT_ID),
            patient_name: element_str(first, tags::PATIENT_NAME),
            study_date: element_str(first, tags::STUDY_DATE),
            scan_count: unique_series_count(&originals),
            file_count: original_paths.len().max(anonymized_paths.len()),
            script_used: audit.script_used.clone(),
            phi_fields_modified: audit.phi_fields_modified.clone(),
        };

        let scans = self.build_scans(&archived, &originals, &anonymized, &audit, broker_name);
        Ok(StudyComparisonResult { study, scans })
    }

    fn build_scans(
        &self,
        _archived: &ArchivedStudy,
        originals: &[(PathBuf, InMemDicomObject)],
        anonymized: &[(PathBuf, InMemDicomObject)],
        audit: &crate::archive::AuditReport,
        broker_name: Option<&str>,
    ) -> Vec<ScanComparison> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, (_, obj)) in originals.iter().enumerate() {
            let series_uid = element_str(obj, tags::SERIES_INSTANCE_UID).unwrap_or_default();
            if !groups.contains_key(&series_uid) {
                order.push(series_uid.clone());
            }
            groups.entry(series_uid).or_default().push(idx);
        }

        order
            .into_iter()
            .map(|series_uid| {
                let mut indices = groups.remove(&series_uid).unwrap_or_default();
                indices.sort_by_key(|&i| element_int(&originals[i].1, tags::INSTANCE_NUMBER).unwrap_or(0));

                let files = indices
                    .into_iter()
                    .map(|i| {
                        let (path, obj) = &originals[i];
                        let anon = self.pair_file(path, obj, anonymized, audit, broker_name);
                        let header = anon.as_ref().map(|(_, anon_obj)| diff_headers(obj, anon_obj));
                        FileComparison {
                            original_path: path.clone(),
                            anonymized_path: anon.map(|(p, _)| p),
                            header,
                        }
                    })
                    .collect();

                ScanComparison { series_uid, files }
            })
            .collect()
    }

    /// Pairs an original file to an anonymized one using the first
    /// strategy that yields a match (spec.md §4.6).
    fn pair_file(
        &self,
        original_path: &Path,
        original: &InMemDicomObject,
        anonymized: &[(PathBuf, InMemDicomObject)],
        audit: &crate::archive::AuditReport,
        broker_name: Option<&str>,
    ) -> Option<(PathBuf, InMemDicomObject)> {
        let original_sop_uid = element_str(original, tags::SOP_INSTANCE_UID)?;

        // 1. Crosswalk lookup by (brokerName, originalSopUid, ID_TYPE_SOP_UID).
        if audit.hash_uids {
            if let (Some(crosswalk), Some(broker)) = (&self.crosswalk, broker_name) {
                if let Some(mapped_uid) = crosswalk.lookup(broker, &original_sop_uid, ID_TYPE_SOP_UID) {
                    if let Some(found) = anonymized
                        .iter()
                        .find(|(_, obj)| element_str(obj, tags::SOP_INSTANCE_UID).as_deref() == Some(mapped_uid.as_str()))
                    {
                        return Some(found.clone());
                    }
                }
            }
        }

        // 2. Same basename under the anonymized directory.
        if let Some(found) = anonymized
            .iter()
            .find(|(path, _)| file_name_matches(path, original_path))
        {
            return Some(found.clone());
        }

        // 3. Identical internal SOPInstanceUID in an anonymized file.
        if let Some(found) = anonymized
            .iter()
            .find(|(_, obj)| element_str(obj, tags::SOP_INSTANCE_UID).as_deref() == Some(original_sop_uid.as_str()))
        {
            return Some(found.clone());
        }

        // 4. Same instanceNumber within the same seriesUid group.
        let series_uid = element_str(original, tags::SERIES_INSTANCE_UID)?;
        let instance_number = element_int(original, tags::INSTANCE_NUMBER)?;
        anonymized
            .iter()
            .find(|(_, obj)| {
                element_str(obj, tags::SERIES_INSTANCE_UID).as_deref() == Some(series_uid.as_str())
                    && element_int(obj, tags::INSTANCE_NUMBER) == Some(instance_number)
            })
            .cloned()
    }
}

fn file_name_matches(anon_path: &Path, original_path: &Path) -> bool {
    match (anon_path.file_name(), original_path.file_name()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn load_objects(paths: &[PathBuf]) -> Vec<(PathBuf, InMemDicomObject)> {
    paths
        .iter()
        .filter_map(|path| {
            OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(path)
                .ok()
                .map(|obj| (path.clone(), obj))
        })
        .collect()
}

fn unique_series_count(originals: &[(PathBuf, InMemDicomObject)]) -> usize {
    let mut seen = std::collections::HashSet::new();
    for (_, obj) in originals {
        if let Some(uid) = element_str(obj, tags::SERIES_INSTANCE_UID) {
            seen.insert(uid);
        }
    }
    seen.len()
}

fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn element_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.element(tag).ok().and_then(|e| e.to_int::<i64>().ok())
}

const MAX_VALUE_LEN: usize = 200;

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_VALUE_LEN {
        s.to_string()
    } else {
        s.chars().take(MAX_VALUE_LEN).collect()
    }
}

/// VR-aware value rendering (spec.md §4.6): string, then printable-UTF-8
/// decode for byte data, else a binary placeholder. `InMemObject::element`
/// already joins multi-valued strings with a backslash via `to_str`.
fn render_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let element = obj.element(tag).ok()?;
    if let Ok(s) = element.to_str() {
        return Some(truncate(&s));
    }
    if let Ok(bytes) = element.to_bytes() {
        if let Ok(s) = std::str::from_utf8(&bytes) {
            if s.chars().all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t')) {
                return Some(truncate(s));
            }
        }
        return Some(format!("[binary: {} bytes]", bytes.len()));
    }
    None
}

/// HeaderComparison for a single (original, anonymized) file pair.
fn diff_headers(original: &InMemDicomObject, anonymized: &InMemDicomObject) -> HeaderComparison {
    let mut tag_set: Vec<Tag> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for element in original.iter().chain(anonymized.iter()) {
        if element.tag() == tags::PIXEL_DATA {
            continue;
        }
        if seen.insert(element.tag()) {
            tag_set.push(element.tag());
        }
    }

    let diffs = tag_set
        .into_iter()
        .map(|tag| {
            let original_value = render_value(original, tag);
            let anonymized_value = render_value(anonymized, tag);
            let removed = original_value.is_some() && anonymized_value.is_none();
            let added = original_value.is_none() && anonymized_value.is_some();
            let changed = original_value.is_some()
                && anonymized_value.is_some()
                && original_value != anonymized_value;
            TagDiff {
                hex: crate::indexer::tags::format_tag(((tag.group() as u32) << 16) | tag.element() as u32),
                keyword: keyword_for_tag(tag),
                category: category_for_tag(tag),
                original_value,
                anonymized_value,
                changed,
                removed,
                added,
                is_phi: is_phi(tag),
            }
        })
        .collect();

    HeaderComparison { tags: diffs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_derivation_matches_spec_examples() {
        assert_eq!(category_for_tag(tags::PATIENT_NAME), TagCategory::Patient);
        assert_eq!(category_for_tag(tags::SERIES_INSTANCE_UID), TagCategory::Series);
        assert_eq!(category_for_tag(tags::ROWS), TagCategory::Image);
        assert_eq!(category_for_tag(tags::INSTITUTION_NAME), TagCategory::Equipment);
        assert_eq!(category_for_tag(tags::STUDY_DESCRIPTION), TagCategory::Study);
        assert_eq!(category_for_tag(Tag(0x0009, 0x0001)), TagCategory::Other);
    }

    #[test]
    fn phi_set_matches_spec_list() {
        assert!(is_phi(tags::PATIENT_NAME));
        assert!(is_phi(tags::ACCESSION_NUMBER));
        assert!(is_phi(tags::MEDICAL_RECORD_LOCATOR));
        assert!(!is_phi(tags::ROWS));
    }

    #[test]
    fn value_truncation_caps_at_200_chars() {
        let long = "x".repeat(250);
        assert_eq!(truncate(&long).chars().count(), 200);
    }
}
