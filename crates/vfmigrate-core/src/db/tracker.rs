use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;
use vfmigrate_parser::VersionLabel;

use super::{is_transient, DbPool};
use crate::failure::{Failure, FailureCategory};
use crate::source::RawArchiveRecord;
use crate::tracker::{
    EntityIds, MetadataFields, MigrationRecord, MigrationRecordStore, MigrationStatus,
    TrackerError, UpsertOutcome,
};

const SELECT_RECORD: &str = r#"
    SELECT id, archive_id, archive_name, create_time, duration_secs, file_name, file_size,
           status, failure_category, error_message, court_reference, urn, exhibit_reference,
           defendant_last_name, witness_first_name, version_label, version_number,
           file_extension, recording_group_key, is_most_recent, recording_id, booking_id,
           capture_session_id, resolved_at, created_at
    FROM vf_migration_records
"#;

/// Tracker rows in `vf_migration_records`. Status transitions are guarded in
/// SQL so that concurrent writers cannot move a terminal row.
#[derive(Clone)]
pub struct PgMigrationRecordStore {
    pool: DbPool,
}

impl PgMigrationRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, filter: &str, bind: Option<String>) -> Result<Vec<MigrationRecord>, TrackerError> {
        let sql = format!("{SELECT_RECORD} {filter} ORDER BY created_at, archive_id");
        let mut query = sqlx::query(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn finish(
        &self,
        archive_id: &str,
        to: MigrationStatus,
        failure: Option<&Failure>,
        ids: EntityIds,
    ) -> Result<(), TrackerError> {
        let result = sqlx::query(
            r#"
                UPDATE vf_migration_records
                SET status = $2,
                    failure_category = $3,
                    error_message = $4,
                    recording_id = $5,
                    booking_id = $6,
                    capture_session_id = $7,
                    resolved_at = now()
                WHERE archive_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(archive_id)
        .bind(to.as_str())
        .bind(failure.map(|f| f.category.as_str()))
        .bind(failure.map(|f| f.message.as_str()))
        .bind(ids.recording_id)
        .bind(ids.booking_id)
        .bind(ids.capture_session_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.find_by_archive_id(archive_id).await? {
            Some(record) => Err(TrackerError::InvalidTransition {
                archive_id: archive_id.to_string(),
                from: record.status,
                to,
            }),
            None => Err(TrackerError::NotFound(archive_id.to_string())),
        }
    }
}

fn storage(err: sqlx::Error) -> TrackerError {
    if is_transient(&err) {
        TrackerError::Unavailable(err.to_string())
    } else {
        TrackerError::Storage(err.to_string())
    }
}

fn record_from_row(row: &PgRow) -> Result<MigrationRecord, TrackerError> {
    let status: String = row.try_get("status").map_err(storage)?;
    let status = MigrationStatus::from_tag(&status)
        .ok_or_else(|| TrackerError::Storage(format!("unknown status '{status}'")))?;
    let failure_category: Option<String> = row.try_get("failure_category").map_err(storage)?;
    let version_label: Option<String> = row.try_get("version_label").map_err(storage)?;

    Ok(MigrationRecord {
        id: row.try_get("id").map_err(storage)?,
        archive_id: row.try_get("archive_id").map_err(storage)?,
        archive_name: row.try_get("archive_name").map_err(storage)?,
        create_time: row.try_get("create_time").map_err(storage)?,
        duration_secs: row.try_get("duration_secs").map_err(storage)?,
        file_name: row.try_get("file_name").map_err(storage)?,
        file_size: row.try_get("file_size").map_err(storage)?,
        status,
        failure_category: failure_category.as_deref().and_then(FailureCategory::from_tag),
        error_message: row.try_get("error_message").map_err(storage)?,
        court_reference: row.try_get("court_reference").map_err(storage)?,
        urn: row.try_get("urn").map_err(storage)?,
        exhibit_reference: row.try_get("exhibit_reference").map_err(storage)?,
        defendant_last_name: row.try_get("defendant_last_name").map_err(storage)?,
        witness_first_name: row.try_get("witness_first_name").map_err(storage)?,
        version_label: version_label.as_deref().and_then(VersionLabel::from_token),
        version_number: row.try_get("version_number").map_err(storage)?,
        file_extension: row.try_get("file_extension").map_err(storage)?,
        recording_group_key: row.try_get("recording_group_key").map_err(storage)?,
        is_most_recent: row.try_get("is_most_recent").map_err(storage)?,
        recording_id: row.try_get("recording_id").map_err(storage)?,
        booking_id: row.try_get("booking_id").map_err(storage)?,
        capture_session_id: row.try_get("capture_session_id").map_err(storage)?,
        resolved_at: row.try_get("resolved_at").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn require_id(raw: &RawArchiveRecord) -> Result<(), TrackerError> {
    if raw.archive_id.trim().is_empty() {
        return Err(TrackerError::MissingArchiveId);
    }
    Ok(())
}

#[async_trait]
impl MigrationRecordStore for PgMigrationRecordStore {
    async fn upsert(&self, raw: &RawArchiveRecord) -> Result<UpsertOutcome, TrackerError> {
        require_id(raw)?;
        let row = sqlx::query(
            r#"
                INSERT INTO vf_migration_records
                    (id, archive_id, archive_name, create_time, duration_secs, file_name, file_size)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (archive_id) DO UPDATE
                SET archive_name = EXCLUDED.archive_name,
                    create_time = EXCLUDED.create_time,
                    duration_secs = EXCLUDED.duration_secs,
                    file_name = EXCLUDED.file_name,
                    file_size = EXCLUDED.file_size
                RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&raw.archive_id)
        .bind(&raw.archive_name)
        .bind(raw.create_time)
        .bind(raw.duration_secs)
        .bind(&raw.file_name)
        .bind(&raw.file_size)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        let inserted: bool = row.try_get("inserted").map_err(storage)?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn insert_pending(&self, raw: &RawArchiveRecord) -> Result<bool, TrackerError> {
        require_id(raw)?;
        let result = sqlx::query(
            r#"
                INSERT INTO vf_migration_records
                    (id, archive_id, archive_name, create_time, duration_secs, file_name, file_size)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (archive_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&raw.archive_id)
        .bind(&raw.archive_name)
        .bind(raw.create_time)
        .bind(raw.duration_secs)
        .bind(&raw.file_name)
        .bind(&raw.file_size)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_metadata_fields(
        &self,
        archive_id: &str,
        fields: &MetadataFields,
    ) -> Result<String, TrackerError> {
        let key = fields.group_key();
        let result = sqlx::query(
            r#"
                UPDATE vf_migration_records
                SET court_reference = $2,
                    urn = $3,
                    exhibit_reference = $4,
                    defendant_last_name = $5,
                    witness_first_name = $6,
                    version_label = $7,
                    version_number = $8,
                    file_extension = $9,
                    recording_group_key = NULLIF($10, '')
                WHERE archive_id = $1
            "#,
        )
        .bind(archive_id)
        .bind(&fields.court_reference)
        .bind(&fields.urn)
        .bind(&fields.exhibit_reference)
        .bind(&fields.defendant_last_name)
        .bind(&fields.witness_first_name)
        .bind(fields.version_label.map(|l| l.as_str()))
        .bind(&fields.version_number)
        .bind(&fields.file_extension)
        .bind(&key)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::NotFound(archive_id.to_string()));
        }
        Ok(key)
    }

    async fn set_most_recent(
        &self,
        archive_id: &str,
        is_most_recent: bool,
    ) -> Result<(), TrackerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let row = sqlx::query(
            r#"
                UPDATE vf_migration_records
                SET is_most_recent = $2
                WHERE archive_id = $1
                RETURNING recording_group_key, version_label
            "#,
        )
        .bind(archive_id)
        .bind(is_most_recent)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or_else(|| TrackerError::NotFound(archive_id.to_string()))?;

        let group: Option<String> = row.try_get("recording_group_key").map_err(storage)?;
        let label: Option<String> = row.try_get("version_label").map_err(storage)?;
        if is_most_recent {
            if let Some(group) = group {
                sqlx::query(
                    r#"
                        UPDATE vf_migration_records
                        SET is_most_recent = FALSE
                        WHERE recording_group_key = $1
                          AND version_label IS NOT DISTINCT FROM $2
                          AND archive_id <> $3
                    "#,
                )
                .bind(group)
                .bind(label)
                .bind(archive_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            }
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn mark_success(&self, archive_id: &str, ids: EntityIds) -> Result<(), TrackerError> {
        self.finish(archive_id, MigrationStatus::Success, None, ids).await
    }

    async fn mark_failed(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError> {
        self.finish(archive_id, MigrationStatus::Failed, Some(failure), EntityIds::default())
            .await
    }

    async fn mark_skipped(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError> {
        self.finish(archive_id, MigrationStatus::Skipped, Some(failure), EntityIds::default())
            .await
    }

    async fn reset_to_pending(&self, archive_id: &str) -> Result<(), TrackerError> {
        let result = sqlx::query(
            r#"
                UPDATE vf_migration_records
                SET status = 'PENDING',
                    failure_category = NULL,
                    error_message = NULL,
                    resolved_at = NULL,
                    is_most_recent = FALSE,
                    recording_id = NULL,
                    booking_id = NULL,
                    capture_session_id = NULL
                WHERE archive_id = $1
            "#,
        )
        .bind(archive_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(TrackerError::NotFound(archive_id.to_string()));
        }
        Ok(())
    }

    async fn find_by_archive_id(
        &self,
        archive_id: &str,
    ) -> Result<Option<MigrationRecord>, TrackerError> {
        Ok(self
            .fetch("WHERE archive_id = $1", Some(archive_id.to_string()))
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_archive_name(
        &self,
        archive_name: &str,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.fetch("WHERE archive_name = $1", Some(archive_name.to_string()))
            .await
    }

    async fn find_by_status(
        &self,
        status: MigrationStatus,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.fetch("WHERE status = $1", Some(status.as_str().to_string()))
            .await
    }

    async fn find_by_group_key_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        let escaped = prefix
            .to_lowercase()
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        self.fetch("WHERE recording_group_key LIKE $1", Some(format!("{escaped}%")))
            .await
    }

    async fn all(&self) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.fetch("", None).await
    }
}
