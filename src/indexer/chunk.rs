//! Date-range chunking for remote C-FIND scans (spec.md §4.4).

use chrono::{Datelike, NaiveDate};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    None,
}

/// Last day of the calendar month/year a chunk starting on `cursor` covers,
/// so a 31-day month or a leap year collapses to one chunk instead of
/// over-stepping by a fixed day count (spec.md §4.4, §8 invariant 7: chunk
/// count minimized, range covered exactly).
fn natural_chunk_end(cursor: NaiveDate, chunk_size: ChunkSize) -> NaiveDate {
    match chunk_size {
        // DICOM `StudyDate` has day resolution, so Hourly and Daily collapse
        // to single-day chunks.
        ChunkSize::Hourly | ChunkSize::Daily => cursor,
        ChunkSize::Weekly => cursor + chrono::Duration::days(6),
        ChunkSize::Monthly => end_of_month(cursor),
        ChunkSize::Yearly => NaiveDate::from_ymd_opt(cursor.year(), 12, 31).expect("valid date"),
        ChunkSize::None => cursor,
    }
}

fn end_of_month(cursor: NaiveDate) -> NaiveDate {
    let (next_year, next_month) = if cursor.month() == 12 {
        (cursor.year() + 1, 1)
    } else {
        (cursor.year(), cursor.month() + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid date") - chrono::Duration::days(1)
}

fn parse_yyyymmdd(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d").ok()
}

fn format_yyyymmdd(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

/// Generates inclusive `(from, to)` chunk pairs covering `[from, to]`,
/// stepping by the chunk width, with the last chunk clipped to the range end.
/// `ChunkSize::None` or missing dates yield a single unchunked pair.
/// Reversed endpoints are swapped (with a warning) before chunking.
pub fn generate_date_chunks(
    study_date_from: Option<&str>,
    study_date_to: Option<&str>,
    chunk_size: ChunkSize,
) -> Vec<(Option<String>, Option<String>)> {
    let (from, to) = match (study_date_from, study_date_to) {
        (None, None) => return vec![(None, None)],
        (from, to) => (from, to),
    };

    if chunk_size == ChunkSize::None {
        return vec![(from.map(str::to_string), to.map(str::to_string))];
    }

    let (from_date, to_date) = match (from.and_then(parse_yyyymmdd), to.and_then(parse_yyyymmdd)) {
        (Some(f), Some(t)) => (f, t),
        // One bound missing: DICOM date-range chunking needs both endpoints
        // to step across; fall back to a single unchunked query.
        _ => return vec![(from.map(str::to_string), to.map(str::to_string))],
    };

    let (from_date, to_date) = if from_date > to_date {
        warn!(
            "study date range reversed ({} > {}), swapping",
            format_yyyymmdd(from_date),
            format_yyyymmdd(to_date)
        );
        (to_date, from_date)
    } else {
        (from_date, to_date)
    };

    let mut chunks = Vec::new();
    let mut cursor = from_date;
    while cursor <= to_date {
        let chunk_end = std::cmp::min(natural_chunk_end(cursor, chunk_size), to_date);
        chunks.push((Some(format_yyyymmdd(cursor)), Some(format_yyyymmdd(chunk_end))));
        cursor = chunk_end + chrono::Duration::days(1);
    }
    chunks
}

/// Builds the DICOM date-range value `YYYYMMDD-YYYYMMDD` | `YYYYMMDD-` |
/// `-YYYYMMDD`, or an empty string when both bounds are absent.
pub fn build_dicom_date_range(from: Option<&str>, to: Option<&str>) -> String {
    match (from, to) {
        (Some(a), Some(b)) => format!("{a}-{b}"),
        (Some(a), None) => format!("{a}-"),
        (None, Some(b)) => format!("-{b}"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_chunk_size_passes_through() {
        let chunks = generate_date_chunks(Some("20240101"), Some("20240131"), ChunkSize::None);
        assert_eq!(chunks, vec![(Some("20240101".into()), Some("20240131".into()))]);
    }

    #[test]
    fn monthly_clips_to_single_chunk() {
        let chunks = generate_date_chunks(Some("20240101"), Some("20240131"), ChunkSize::Monthly);
        assert_eq!(chunks, vec![(Some("20240101".into()), Some("20240131".into()))]);
    }

    #[test]
    fn weekly_produces_five_contiguous_chunks() {
        let chunks = generate_date_chunks(Some("20240101"), Some("20240131"), ChunkSize::Weekly);
        assert_eq!(
            chunks,
            vec![
                (Some("20240101".into()), Some("20240107".into())),
                (Some("20240108".into()), Some("20240114".into())),
                (Some("20240115".into()), Some("20240121".into())),
                (Some("20240122".into()), Some("20240128".into())),
                (Some("20240129".into()), Some("20240131".into())),
            ]
        );
    }

    #[test]
    fn reversed_dates_are_swapped() {
        let chunks = generate_date_chunks(Some("20240131"), Some("20240101"), ChunkSize::Monthly);
        assert_eq!(chunks, vec![(Some("20240101".into()), Some("20240131".into()))]);
    }

    #[test]
    fn chunks_are_contiguous_non_overlapping_and_cover_the_range() {
        for chunk_size in [ChunkSize::Weekly, ChunkSize::Monthly, ChunkSize::Yearly] {
            let chunks = generate_date_chunks(Some("20230101"), Some("20241231"), chunk_size);
            assert_eq!(chunks.first().unwrap().0.as_deref(), Some("20230101"));
            assert_eq!(chunks.last().unwrap().1.as_deref(), Some("20241231"));
            for window in chunks.windows(2) {
                let prev_end = parse_yyyymmdd(window[0].1.as_deref().unwrap()).unwrap();
                let next_start = parse_yyyymmdd(window[1].0.as_deref().unwrap()).unwrap();
                assert_eq!(next_start, prev_end + chrono::Duration::days(1));
            }
        }
    }

    #[test]
    fn date_range_builder_covers_all_boundary_shapes() {
        assert_eq!(build_dicom_date_range(Some("20240101"), Some("20240131")), "20240101-20240131");
        assert_eq!(build_dicom_date_range(Some("20240101"), None), "20240101-");
        assert_eq!(build_dicom_date_range(None, Some("20240131")), "-20240131");
        assert_eq!(build_dicom_date_range(None, None), "");
    }
}
