//! Relational persistence (spec.md §4.1). SQLite via `sqlx`, grounded in the
//! `sqlx::AnyPool` / upsert-by-primary-key pattern used by
//! `yangszwei-rustcoon`'s studies store and `tombelieber-claude-view`'s
//! `Database` queries module. Concurrent upserts of the same UID rely on
//! SQLite's single-writer serialization plus `INSERT ... ON CONFLICT DO
//! UPDATE` for last-writer-wins field values (no torn rows).

mod schema;

use crate::model::{
    CustomField, CustomFieldLevel, CustomFieldType, IndexedInstance, IndexedSeries, IndexedStudy,
    MetricPoint, ReindexJob, ReindexJobStatus, RouteStats,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(database_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(sqlx::Error::Io(e))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            database_path.display()
        ))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // Single writer connection keeps upserts race-free without an
        // additional in-process lock; SQLite's WAL mode still allows
        // concurrent readers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for stmt in schema::STATEMENTS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// One local retry on a transient backend error, per spec.md §7. `NotFound`
    /// is never retried.
    async fn with_retry<T, Fut, F>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        match op().await {
            Err(StoreError::Backend(_)) => op().await,
            other => other,
        }
    }

    // ---- studies / series / instances ----------------------------------

    pub async fn upsert_study(&self, study: &IndexedStudy) -> StoreResult<()> {
        let modalities = study.modalities.join(",");
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO studies (
                    study_uid, patient_id, patient_name, patient_sex, study_date,
                    study_time, accession_number, study_description, modalities,
                    institution_name, referring_physician, source_route,
                    series_count, instance_count, total_size
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                ON CONFLICT(study_uid) DO UPDATE SET
                    patient_id = excluded.patient_id,
                    patient_name = excluded.patient_name,
                    patient_sex = excluded.patient_sex,
                    study_date = excluded.study_date,
                    study_time = excluded.study_time,
                    accession_number = excluded.accession_number,
                    study_description = excluded.study_description,
                    modalities = excluded.modalities,
                    institution_name = excluded.institution_name,
                    referring_physician = excluded.referring_physician,
                    source_route = excluded.source_route
                "#,
            )
            .bind(&study.study_uid)
            .bind(&study.patient_id)
            .bind(&study.patient_name)
            .bind(&study.patient_sex)
            .bind(&study.study_date)
            .bind(&study.study_time)
            .bind(&study.accession_number)
            .bind(&study.study_description)
            .bind(&modalities)
            .bind(&study.institution_name)
            .bind(&study.referring_physician)
            .bind(&study.source_route)
            .bind(study.series_count)
            .bind(study.instance_count)
            .bind(study.total_size)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_series(&self, series: &IndexedSeries) -> StoreResult<()> {
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO series (
                    series_uid, study_uid, modality, series_number,
                    series_description, body_part, instance_count
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)
                ON CONFLICT(series_uid) DO UPDATE SET
                    study_uid = excluded.study_uid,
                    modality = excluded.modality,
                    series_number = excluded.series_number,
                    series_description = excluded.series_description,
                    body_part = excluded.body_part
                "#,
            )
            .bind(&series.series_uid)
            .bind(&series.study_uid)
            .bind(&series.modality)
            .bind(&series.series_number)
            .bind(&series.series_description)
            .bind(&series.body_part)
            .bind(series.instance_count)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_instance(&self, instance: &IndexedInstance) -> StoreResult<()> {
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO instances (
                    sop_instance_uid, series_uid, sop_class_uid, instance_number,
                    file_path, file_size, file_hash
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)
                ON CONFLICT(sop_instance_uid) DO UPDATE SET
                    series_uid = excluded.series_uid,
                    sop_class_uid = excluded.sop_class_uid,
                    instance_number = excluded.instance_number,
                    file_path = excluded.file_path,
                    file_size = excluded.file_size,
                    file_hash = excluded.file_hash
                "#,
            )
            .bind(&instance.sop_instance_uid)
            .bind(&instance.series_uid)
            .bind(&instance.sop_class_uid)
            .bind(instance.instance_number)
            .bind(&instance.file_path)
            .bind(instance.file_size)
            .bind(&instance.file_hash)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_study(&self, study_uid: &str) -> StoreResult<Option<IndexedStudy>> {
        let row = sqlx::query("SELECT * FROM studies WHERE study_uid = ?1")
            .bind(study_uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| study_from_row(&r)))
    }

    pub async fn clear_index(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM custom_field_values")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM instances").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM series").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM studies").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recomputes seriesCount/instanceCount/totalSize/modalities for every
    /// study from its children in a single bulk pass (spec.md §4.1, §8
    /// invariant 4).
    pub async fn aggregate_study_counts(&self) -> StoreResult<()> {
        let study_uids: Vec<String> =
            sqlx::query_scalar("SELECT study_uid FROM studies")
                .fetch_all(&self.pool)
                .await?;

        for study_uid in study_uids {
            let series_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM series WHERE study_uid = ?1")
                    .bind(&study_uid)
                    .fetch_one(&self.pool)
                    .await?;

            let (instance_count, total_size): (i64, Option<i64>) = sqlx::query_as(
                r#"
                SELECT COUNT(*), SUM(i.file_size)
                FROM instances i
                JOIN series s ON s.series_uid = i.series_uid
                WHERE s.study_uid = ?1
                "#,
            )
            .bind(&study_uid)
            .fetch_one(&self.pool)
            .await?;

            let mut modalities: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT modality FROM series WHERE study_uid = ?1 AND modality IS NOT NULL",
            )
            .bind(&study_uid)
            .fetch_all(&self.pool)
            .await?;
            modalities.sort();
            modalities.dedup();

            sqlx::query(
                r#"
                UPDATE studies SET series_count = ?2, instance_count = ?3,
                    total_size = ?4, modalities = ?5
                WHERE study_uid = ?1
                "#,
            )
            .bind(&study_uid)
            .bind(series_count)
            .bind(instance_count)
            .bind(total_size.unwrap_or(0))
            .bind(modalities.join(","))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ---- custom fields ---------------------------------------------------

    pub async fn set_custom_field_value(
        &self,
        field_id: i64,
        entity_uid: &str,
        value: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO custom_field_values (field_id, entity_uid, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(field_id, entity_uid) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(field_id)
        .bind(entity_uid)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_enabled_custom_fields(&self) -> StoreResult<Vec<CustomField>> {
        let rows = sqlx::query("SELECT * FROM custom_fields WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| custom_field_from_row(r))
            .collect())
    }

    // ---- metrics -----------------------------------------------------------

    pub async fn record_minute_metric(&self, ae_title: &str, point: &MetricPoint) -> StoreResult<()> {
        self.record_metric("minute_metrics", ae_title, point).await
    }

    pub async fn record_hour_metric(&self, ae_title: &str, point: &MetricPoint) -> StoreResult<()> {
        self.record_metric("hour_metrics", ae_title, point).await
    }

    pub async fn record_day_metric(&self, ae_title: &str, point: &MetricPoint) -> StoreResult<()> {
        self.record_metric("day_metrics", ae_title, point).await
    }

    async fn record_metric(
        &self,
        table: &str,
        ae_title: &str,
        point: &MetricPoint,
    ) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (timestamp_millis, ae_title, transfers, successful, failed, bytes, files)
            VALUES (?1,?2,?3,?4,?5,?6,?7)
            ON CONFLICT(timestamp_millis, ae_title) DO UPDATE SET
                transfers = excluded.transfers,
                successful = excluded.successful,
                failed = excluded.failed,
                bytes = excluded.bytes,
                files = excluded.files
            "#
        );
        sqlx::query(&sql)
            .bind(point.timestamp_millis)
            .bind(ae_title)
            .bind(point.transfers as i64)
            .bind(point.successful as i64)
            .bind(point.failed as i64)
            .bind(point.bytes as i64)
            .bind(point.files as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_minute_metrics(&self, ae_title: &str, limit: i64) -> StoreResult<Vec<MetricPoint>> {
        self.get_metrics("minute_metrics", ae_title, limit).await
    }

    pub async fn get_hour_metrics(&self, ae_title: &str, limit: i64) -> StoreResult<Vec<MetricPoint>> {
        self.get_metrics("hour_metrics", ae_title, limit).await
    }

    pub async fn get_day_metrics(&self, ae_title: &str, limit: i64) -> StoreResult<Vec<MetricPoint>> {
        self.get_metrics("day_metrics", ae_title, limit).await
    }

    async fn get_metrics(
        &self,
        table: &str,
        ae_title: &str,
        limit: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE ae_title = ?1 ORDER BY timestamp_millis DESC LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(ae_title)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut points: Vec<MetricPoint> = rows.iter().map(metric_point_from_row).collect();
        points.reverse();
        Ok(points)
    }

    pub async fn cleanup_old_metrics(
        &self,
        minute_cutoff_millis: i64,
        hour_cutoff_millis: i64,
        day_cutoff_millis: i64,
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM minute_metrics WHERE timestamp_millis < ?1")
            .bind(minute_cutoff_millis)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM hour_metrics WHERE timestamp_millis < ?1")
            .bind(hour_cutoff_millis)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM day_metrics WHERE timestamp_millis < ?1")
            .bind(day_cutoff_millis)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- route stats ---------------------------------------------------

    pub async fn update_route_stats(
        &self,
        ae_title: &str,
        success: bool,
        bytes: u64,
        files: u64,
    ) -> StoreResult<()> {
        let (success_inc, failed_inc) = if success { (1, 0) } else { (0, 1) };
        sqlx::query(
            r#"
            INSERT INTO route_stats (
                ae_title, total_transfers, successful_transfers, failed_transfers,
                total_bytes, total_files
            ) VALUES (?1, 1, ?2, ?3, ?4, ?5)
            ON CONFLICT(ae_title) DO UPDATE SET
                total_transfers = total_transfers + 1,
                successful_transfers = successful_transfers + ?2,
                failed_transfers = failed_transfers + ?3,
                total_bytes = total_bytes + ?4,
                total_files = total_files + ?5
            "#,
        )
        .bind(ae_title)
        .bind(success_inc)
        .bind(failed_inc)
        .bind(bytes as i64)
        .bind(files as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_route_stats(&self, ae_title: &str) -> StoreResult<Option<RouteStats>> {
        let row = sqlx::query("SELECT * FROM route_stats WHERE ae_title = ?1")
            .bind(ae_title)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| route_stats_from_row(&r)))
    }

    pub async fn get_all_route_stats(&self) -> StoreResult<Vec<RouteStats>> {
        let rows = sqlx::query("SELECT * FROM route_stats")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(route_stats_from_row).collect())
    }

    // ---- reindex jobs ---------------------------------------------------

    pub async fn create_reindex_job(&self, id: &str) -> StoreResult<ReindexJob> {
        let started_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO reindex_jobs (id, status, total_files, processed, errors, message, started_at)
            VALUES (?1, 'running', 0, 0, 0, NULL, ?2)
            "#,
        )
        .bind(id)
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(ReindexJob {
            id: id.to_string(),
            status: ReindexJobStatus::Running,
            total_files: 0,
            processed: 0,
            errors: 0,
            message: None,
            started_at,
            completed_at: None,
        })
    }

    pub async fn update_reindex_job(
        &self,
        id: &str,
        status: ReindexJobStatus,
        total_files: u64,
        processed: u64,
        errors: u64,
        message: Option<&str>,
    ) -> StoreResult<()> {
        let completed_at = if status.as_str() != "running" {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        sqlx::query(
            r#"
            UPDATE reindex_jobs SET status = ?2, total_files = ?3, processed = ?4,
                errors = ?5, message = ?6, completed_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(total_files as i64)
        .bind(processed as i64)
        .bind(errors as i64)
        .bind(message)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_reindex_job(&self, id: &str) -> StoreResult<Option<ReindexJob>> {
        let row = sqlx::query("SELECT * FROM reindex_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| reindex_job_from_row(&r)))
    }

    pub async fn get_latest_reindex_job(&self) -> StoreResult<Option<ReindexJob>> {
        let row = sqlx::query("SELECT * FROM reindex_jobs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| reindex_job_from_row(&r)))
    }
}

fn study_from_row(row: &sqlx::sqlite::SqliteRow) -> IndexedStudy {
    let modalities_raw: String = row.get("modalities");
    IndexedStudy {
        study_uid: row.get("study_uid"),
        patient_id: row.get("patient_id"),
        patient_name: row.get("patient_name"),
        patient_sex: row.get("patient_sex"),
        study_date: row.get("study_date"),
        study_time: row.get("study_time"),
        accession_number: row.get("accession_number"),
        study_description: row.get("study_description"),
        modalities: if modalities_raw.is_empty() {
            Vec::new()
        } else {
            modalities_raw.split(',').map(|s| s.to_string()).collect()
        },
        institution_name: row.get("institution_name"),
        referring_physician: row.get("referring_physician"),
        source_route: row.get("source_route"),
        series_count: row.get("series_count"),
        instance_count: row.get("instance_count"),
        total_size: row.get("total_size"),
    }
}

fn custom_field_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<CustomField> {
    let field_type: String = row.get("field_type");
    let level: String = row.get("level");
    Some(CustomField {
        id: row.get("id"),
        dicom_tag: row.get("dicom_tag"),
        field_type: CustomFieldType::parse(&field_type)?,
        level: CustomFieldLevel::parse(&level)?,
        enabled: row.get::<i64, _>("enabled") != 0,
    })
}

fn metric_point_from_row(row: &sqlx::sqlite::SqliteRow) -> MetricPoint {
    MetricPoint {
        timestamp_millis: row.get("timestamp_millis"),
        transfers: row.get::<i64, _>("transfers") as u64,
        successful: row.get::<i64, _>("successful") as u64,
        failed: row.get::<i64, _>("failed") as u64,
        bytes: row.get::<i64, _>("bytes") as u64,
        files: row.get::<i64, _>("files") as u64,
    }
}

fn route_stats_from_row(row: &sqlx::sqlite::SqliteRow) -> RouteStats {
    RouteStats {
        ae_title: row.get("ae_title"),
        total_transfers: row.get::<i64, _>("total_transfers") as u64,
        successful_transfers: row.get::<i64, _>("successful_transfers") as u64,
        failed_transfers: row.get::<i64, _>("failed_transfers") as u64,
        total_bytes: row.get::<i64, _>("total_bytes") as u64,
        total_files: row.get::<i64, _>("total_files") as u64,
    }
}

fn reindex_job_from_row(row: &sqlx::sqlite::SqliteRow) -> ReindexJob {
    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");
    ReindexJob {
        id: row.get("id"),
        status: ReindexJobStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(ReindexJobStatus::Failed),
        total_files: row.get::<i64, _>("total_files") as u64,
        processed: row.get::<i64, _>("processed") as u64,
        errors: row.get::<i64, _>("errors") as u64,
        message: row.get("message"),
        started_at: chrono::DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
    }
}

pub use schema::GLOBAL_ROUTE;
