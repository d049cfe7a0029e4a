//! DICOM tag resolution (spec.md §4.4): accepts either `gggg,eeee` hex
//! (optionally parenthesized) or a case-insensitive keyword (dashes and
//! underscores stripped) against a built-in keyword map. Used by custom
//! fields and by any caller needing to turn a user-supplied tag spec into a
//! `Tag`.

use dicom_dictionary_std::tags;
use dicom_core::Tag;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Sentinel returned for an unrecognized tag spec.
pub const NO_TAG: i64 = -1;

fn tag_to_u32(tag: Tag) -> u32 {
    ((tag.group() as u32) << 16) | tag.element() as u32
}

/// Reverse of [`keyword_map`]: packed tag value back to its canonical
/// keyword, used by ComparisonEngine's header diff rendering.
fn reverse_keyword_map() -> &'static HashMap<u32, &'static str> {
    static MAP: OnceLock<HashMap<u32, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| KEYWORD_ENTRIES.iter().map(|(name, tag)| (tag_to_u32(*tag), *name)).collect())
}

/// Looks up the canonical keyword for a packed tag value, if known.
pub fn keyword_for_tag(tag: u32) -> Option<&'static str> {
    reverse_keyword_map().get(&tag).copied()
}

/// Built-in keyword map (spec.md §4.4), shared by [`keyword_map`] (name ->
/// tag, for `parse_tag`) and [`reverse_keyword_map`] (tag -> canonical name,
/// for ComparisonEngine's header diff rendering).
const KEYWORD_ENTRIES: &[(&str, Tag)] = &[
    ("PatientName", tags::PATIENT_NAME),
    ("PatientID", tags::PATIENT_ID),
    ("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
    ("PatientSex", tags::PATIENT_SEX),
    ("PatientAge", tags::PATIENT_AGE),
    ("PatientWeight", tags::PATIENT_WEIGHT),
    ("PatientAddress", tags::PATIENT_ADDRESS),
    ("PatientTelephoneNumbers", tags::PATIENT_TELEPHONE_NUMBERS),
    ("OtherPatientIDs", tags::OTHER_PATIENT_I_DS),
    ("OtherPatientNames", tags::OTHER_PATIENT_NAMES),
    ("EthnicGroup", tags::ETHNIC_GROUP),
    ("PatientComments", tags::PATIENT_COMMENTS),
    ("ReferringPhysicianName", tags::REFERRING_PHYSICIAN_NAME),
    ("PerformingPhysicianName", tags::PERFORMING_PHYSICIAN_NAME),
    ("OperatorsName", tags::OPERATORS_NAME),
    ("InstitutionName", tags::INSTITUTION_NAME),
    ("InstitutionAddress", tags::INSTITUTION_ADDRESS),
    ("InstitutionalDepartmentName", tags::INSTITUTIONAL_DEPARTMENT_NAME),
    ("StationName", tags::STATION_NAME),
    ("AccessionNumber", tags::ACCESSION_NUMBER),
    ("StudyID", tags::STUDY_ID),
    ("StudyDescription", tags::STUDY_DESCRIPTION),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("RequestingPhysician", tags::REQUESTING_PHYSICIAN),
    (
        "ScheduledPerformingPhysicianName",
        tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME,
    ),
    (
        "NameOfPhysiciansReadingStudy",
        tags::NAME_OF_PHYSICIANS_READING_STUDY,
    ),
    ("ContentCreatorName", tags::CONTENT_CREATOR_NAME),
    ("VerifyingObserverName", tags::VERIFYING_OBSERVER_NAME),
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
    ("SOPClassUID", tags::SOP_CLASS_UID),
    ("StudyDate", tags::STUDY_DATE),
    ("StudyTime", tags::STUDY_TIME),
    ("Modality", tags::MODALITY),
    ("ModalitiesInStudy", tags::MODALITIES_IN_STUDY),
    ("SeriesNumber", tags::SERIES_NUMBER),
    ("InstanceNumber", tags::INSTANCE_NUMBER),
    ("BodyPartExamined", tags::BODY_PART_EXAMINED),
    ("NumberOfStudyRelatedSeries", tags::NUMBER_OF_STUDY_RELATED_SERIES),
    (
        "NumberOfStudyRelatedInstances",
        tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
    ),
    ("QueryRetrieveLevel", tags::QUERY_RETRIEVE_LEVEL),
    ("Rows", tags::ROWS),
    ("Columns", tags::COLUMNS),
    ("PixelData", tags::PIXEL_DATA),
];

fn keyword_map() -> &'static HashMap<String, u32> {
    static MAP: OnceLock<HashMap<String, u32>> = OnceLock::new();
    MAP.get_or_init(|| {
        KEYWORD_ENTRIES
            .iter()
            .map(|(name, tag)| (normalize(name), tag_to_u32(*tag)))
            .collect()
    })
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Parses `"(gggg,eeee)"`, `"gggg,eeee"`, or a keyword into its packed
/// `u32` tag value (`(group << 16) | element`), returning [`NO_TAG`] if
/// unrecognized.
pub fn parse_tag(spec: &str) -> i64 {
    let trimmed = spec.trim().trim_start_matches('(').trim_end_matches(')');
    if let Some((group, element)) = trimmed.split_once(',') {
        if let (Ok(g), Ok(e)) = (
            u32::from_str_radix(group.trim(), 16),
            u32::from_str_radix(element.trim(), 16),
        ) {
            if g <= 0xFFFF && e <= 0xFFFF {
                return ((g << 16) | e) as i64;
            }
        }
        return NO_TAG;
    }

    keyword_map()
        .get(&normalize(trimmed))
        .map(|t| *t as i64)
        .unwrap_or(NO_TAG)
}

/// Formats a packed tag value as `"gggg,eeee"` (lowercase hex, zero-padded).
pub fn format_tag(tag: u32) -> String {
    format!("{:04x},{:04x}", (tag >> 16) & 0xFFFF, tag & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parenthesized_hex_parses() {
        assert_eq!(parse_tag("(0008,0060)"), 0x0008_0060);
    }

    #[test]
    fn keyword_parses_case_insensitively() {
        assert_eq!(parse_tag("Modality"), 0x0008_0060);
        assert_eq!(parse_tag("modality"), 0x0008_0060);
        assert_eq!(parse_tag("MODALITY"), 0x0008_0060);
    }

    #[test]
    fn unknown_spec_returns_sentinel() {
        assert_eq!(parse_tag("nope"), NO_TAG);
    }

    #[test]
    fn round_trips_through_format_tag() {
        for spec in ["PatientName", "StudyInstanceUID", "(0020,000d)"] {
            let tag = parse_tag(spec);
            assert_ne!(tag, NO_TAG);
            assert_eq!(parse_tag(&format_tag(tag as u32)), tag);
        }
    }
}
