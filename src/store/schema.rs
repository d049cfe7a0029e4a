//! Embedded schema, applied once at `Store::open`. Kept as a plain statement
//! list (rather than an external migrations directory) since this crate has
//! exactly one schema version; `sqlx::raw_sql` isn't relied on so each
//! statement is executed individually against the pool.

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS studies (
        study_uid           TEXT PRIMARY KEY,
        patient_id          TEXT,
        patient_name        TEXT,
        patient_sex         TEXT,
        study_date          TEXT,
        study_time          TEXT,
        accession_number    TEXT,
        study_description   TEXT,
        modalities          TEXT NOT NULL DEFAULT '',
        institution_name    TEXT,
        referring_physician TEXT,
        source_route        TEXT NOT NULL,
        series_count        INTEGER NOT NULL DEFAULT 0,
        instance_count      INTEGER NOT NULL DEFAULT 0,
        total_size          INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS series (
        series_uid          TEXT PRIMARY KEY,
        study_uid           TEXT NOT NULL,
        modality            TEXT,
        series_number       TEXT,
        series_description  TEXT,
        body_part           TEXT,
        instance_count      INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_series_study_uid ON series(study_uid)",
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        sop_instance_uid    TEXT PRIMARY KEY,
        series_uid          TEXT NOT NULL,
        sop_class_uid       TEXT,
        instance_number     INTEGER,
        file_path           TEXT NOT NULL,
        file_size           INTEGER NOT NULL DEFAULT 0,
        file_hash           TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_instances_series_uid ON instances(series_uid)",
    r#"
    CREATE TABLE IF NOT EXISTS custom_fields (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        dicom_tag   TEXT NOT NULL,
        field_type  TEXT NOT NULL,
        level       TEXT NOT NULL,
        enabled     INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS custom_field_values (
        field_id    INTEGER NOT NULL,
        entity_uid  TEXT NOT NULL,
        value       TEXT,
        PRIMARY KEY (field_id, entity_uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS minute_metrics (
        timestamp_millis INTEGER NOT NULL,
        ae_title         TEXT NOT NULL DEFAULT '',
        transfers        INTEGER NOT NULL,
        successful       INTEGER NOT NULL,
        failed           INTEGER NOT NULL,
        bytes            INTEGER NOT NULL,
        files            INTEGER NOT NULL,
        PRIMARY KEY (timestamp_millis, ae_title)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hour_metrics (
        timestamp_millis INTEGER NOT NULL,
        ae_title         TEXT NOT NULL DEFAULT '',
        transfers        INTEGER NOT NULL,
        successful       INTEGER NOT NULL,
        failed           INTEGER NOT NULL,
        bytes            INTEGER NOT NULL,
        files            INTEGER NOT NULL,
        PRIMARY KEY (timestamp_millis, ae_title)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS day_metrics (
        timestamp_millis INTEGER NOT NULL,
        ae_title         TEXT NOT NULL DEFAULT '',
        transfers        INTEGER NOT NULL,
        successful       INTEGER NOT NULL,
        failed           INTEGER NOT NULL,
        bytes            INTEGER NOT NULL,
        files            INTEGER NOT NULL,
        PRIMARY KEY (timestamp_millis, ae_title)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS route_stats (
        ae_title            TEXT PRIMARY KEY,
        total_transfers     INTEGER NOT NULL DEFAULT 0,
        successful_transfers INTEGER NOT NULL DEFAULT 0,
        failed_transfers    INTEGER NOT NULL DEFAULT 0,
        total_bytes         INTEGER NOT NULL DEFAULT 0,
        total_files         INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reindex_jobs (
        id              TEXT PRIMARY KEY,
        status          TEXT NOT NULL,
        total_files     INTEGER NOT NULL DEFAULT 0,
        processed       INTEGER NOT NULL DEFAULT 0,
        errors          INTEGER NOT NULL DEFAULT 0,
        message         TEXT,
        started_at      TEXT NOT NULL,
        completed_at    TEXT
    )
    "#,
];

/// Sentinel `ae_title` value used for global (cross-route) metric rows.
pub const GLOBAL_ROUTE: &str = "";
