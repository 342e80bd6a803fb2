//! Durable per-archive migration status.
//!
//! One [`MigrationRecord`] exists per archive id. Records start `PENDING`
//! and move to exactly one terminal status; going back to `PENDING` needs an
//! explicit [`MigrationRecordStore::reset_to_pending`].

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use vfmigrate_parser::{group_key, ExtractedMetadata, VersionLabel};

use crate::failure::{Failure, FailureCategory};
use crate::source::RawArchiveRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "PENDING",
            MigrationStatus::Success => "SUCCESS",
            MigrationStatus::Failed => "FAILED",
            MigrationStatus::Skipped => "SKIPPED",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(MigrationStatus::Pending),
            "SUCCESS" => Some(MigrationStatus::Success),
            "FAILED" => Some(MigrationStatus::Failed),
            "SKIPPED" => Some(MigrationStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MigrationStatus::Pending)
    }

    /// Only `PENDING` may move to a terminal status.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        matches!(self, MigrationStatus::Pending) && next.is_terminal()
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("migration record has no archive id")]
    MissingArchiveId,

    #[error("no migration record for archive '{0}'")]
    NotFound(String),

    #[error("archive '{archive_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        archive_id: String,
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("tracker store unavailable: {0}")]
    Unavailable(String),

    #[error("tracker store rejected the operation: {0}")]
    Storage(String),
}

impl TrackerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Ids of the entities written for an archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIds {
    pub recording_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub capture_session_id: Option<Uuid>,
}

/// Parsed fields copied onto the tracker row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFields {
    pub court_reference: Option<String>,
    pub urn: Option<String>,
    pub exhibit_reference: Option<String>,
    pub defendant_last_name: Option<String>,
    pub witness_first_name: Option<String>,
    pub version_label: Option<VersionLabel>,
    pub version_number: Option<String>,
    pub file_extension: Option<String>,
}

impl MetadataFields {
    pub fn group_key(&self) -> String {
        group_key(
            self.urn.as_deref(),
            self.exhibit_reference.as_deref(),
            self.witness_first_name.as_deref(),
            self.defendant_last_name.as_deref(),
        )
    }
}

impl From<&ExtractedMetadata> for MetadataFields {
    fn from(metadata: &ExtractedMetadata) -> Self {
        Self {
            court_reference: Some(metadata.court_reference.clone()),
            urn: metadata.urn.clone(),
            exhibit_reference: metadata.exhibit_reference.clone(),
            defendant_last_name: Some(metadata.defendant_last_name.clone()),
            witness_first_name: Some(metadata.witness_first_name.clone()),
            version_label: Some(metadata.version_label),
            version_number: Some(metadata.version_number.clone()),
            file_extension: metadata.file_extension.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub archive_id: String,
    pub archive_name: String,
    pub create_time: Option<NaiveDateTime>,
    pub duration_secs: Option<i64>,
    pub file_name: Option<String>,
    pub file_size: Option<String>,
    pub status: MigrationStatus,
    pub failure_category: Option<FailureCategory>,
    pub error_message: Option<String>,
    pub court_reference: Option<String>,
    pub urn: Option<String>,
    pub exhibit_reference: Option<String>,
    pub defendant_last_name: Option<String>,
    pub witness_first_name: Option<String>,
    pub version_label: Option<VersionLabel>,
    pub version_number: Option<String>,
    pub file_extension: Option<String>,
    pub recording_group_key: Option<String>,
    pub is_most_recent: bool,
    pub recording_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub capture_session_id: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn pending(raw: &RawArchiveRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            archive_id: raw.archive_id.clone(),
            archive_name: raw.archive_name.clone(),
            create_time: raw.create_time,
            duration_secs: raw.duration_secs,
            file_name: raw.file_name.clone(),
            file_size: raw.file_size.clone(),
            status: MigrationStatus::Pending,
            failure_category: None,
            error_message: None,
            court_reference: None,
            urn: None,
            exhibit_reference: None,
            defendant_last_name: None,
            witness_first_name: None,
            version_label: None,
            version_number: None,
            file_extension: None,
            recording_group_key: None,
            is_most_recent: false,
            recording_id: None,
            booking_id: None,
            capture_session_id: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn to_raw(&self) -> RawArchiveRecord {
        RawArchiveRecord {
            archive_id: self.archive_id.clone(),
            archive_name: self.archive_name.clone(),
            create_time: self.create_time,
            duration_secs: self.duration_secs,
            file_name: self.file_name.clone(),
            file_size: self.file_size.clone(),
            hints: None,
        }
    }

    fn refresh_raw(&mut self, raw: &RawArchiveRecord) {
        self.archive_name = raw.archive_name.clone();
        self.create_time = raw.create_time;
        self.duration_secs = raw.duration_secs;
        self.file_name = raw.file_name.clone();
        self.file_size = raw.file_size.clone();
    }

    fn apply_metadata(&mut self, fields: &MetadataFields) -> String {
        self.court_reference = fields.court_reference.clone();
        self.urn = fields.urn.clone();
        self.exhibit_reference = fields.exhibit_reference.clone();
        self.defendant_last_name = fields.defendant_last_name.clone();
        self.witness_first_name = fields.witness_first_name.clone();
        self.version_label = fields.version_label;
        self.version_number = fields.version_number.clone();
        self.file_extension = fields.file_extension.clone();
        let key = fields.group_key();
        self.recording_group_key = Some(key.clone()).filter(|k| !k.is_empty());
        key
    }

    fn transition(&mut self, to: MigrationStatus) -> Result<(), TrackerError> {
        if !self.status.can_transition_to(to) {
            return Err(TrackerError::InvalidTransition {
                archive_id: self.archive_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    fn record_failure(&mut self, to: MigrationStatus, failure: &Failure) -> Result<(), TrackerError> {
        self.transition(to)?;
        self.failure_category = Some(failure.category);
        self.error_message = Some(failure.message.clone());
        Ok(())
    }
}

#[async_trait]
pub trait MigrationRecordStore: Send + Sync {
    /// Inserts a `PENDING` record, or refreshes the raw fields of an existing
    /// one without touching its status.
    async fn upsert(&self, raw: &RawArchiveRecord) -> Result<UpsertOutcome, TrackerError>;

    /// Inserts a `PENDING` record unless the archive id is already known.
    /// Returns `false` for a known id.
    async fn insert_pending(&self, raw: &RawArchiveRecord) -> Result<bool, TrackerError>;

    /// Stores parsed fields and returns the recomputed recording-group key.
    async fn update_metadata_fields(
        &self,
        archive_id: &str,
        fields: &MetadataFields,
    ) -> Result<String, TrackerError>;

    /// Sets the flag. Setting it clears it on every other record of the
    /// same group and version class.
    async fn set_most_recent(&self, archive_id: &str, is_most_recent: bool)
        -> Result<(), TrackerError>;

    async fn mark_success(&self, archive_id: &str, ids: EntityIds) -> Result<(), TrackerError>;

    async fn mark_failed(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError>;

    async fn mark_skipped(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError>;

    /// Explicit re-migration: returns a terminal record to `PENDING` and
    /// clears its outcome.
    async fn reset_to_pending(&self, archive_id: &str) -> Result<(), TrackerError>;

    async fn find_by_archive_id(&self, archive_id: &str)
        -> Result<Option<MigrationRecord>, TrackerError>;

    async fn find_by_archive_name(&self, archive_name: &str)
        -> Result<Vec<MigrationRecord>, TrackerError>;

    async fn find_by_status(&self, status: MigrationStatus)
        -> Result<Vec<MigrationRecord>, TrackerError>;

    async fn find_by_group_key_prefix(&self, prefix: &str)
        -> Result<Vec<MigrationRecord>, TrackerError>;

    async fn all(&self) -> Result<Vec<MigrationRecord>, TrackerError>;
}

#[derive(Debug, Default)]
struct TrackerState {
    records: Vec<MigrationRecord>,
    by_archive_id: HashMap<String, usize>,
}

impl TrackerState {
    fn get_mut(&mut self, archive_id: &str) -> Result<&mut MigrationRecord, TrackerError> {
        let idx = *self
            .by_archive_id
            .get(archive_id)
            .ok_or_else(|| TrackerError::NotFound(archive_id.to_string()))?;
        Ok(&mut self.records[idx])
    }

    fn insert(&mut self, record: MigrationRecord) {
        self.by_archive_id
            .insert(record.archive_id.clone(), self.records.len());
        self.records.push(record);
    }

    fn filtered(&self, keep: impl Fn(&MigrationRecord) -> bool) -> Vec<MigrationRecord> {
        self.records.iter().filter(|r| keep(r)).cloned().collect()
    }
}

/// In-process tracker. Records keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryMigrationRecordStore {
    state: RwLock<TrackerState>,
}

impl MemoryMigrationRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }
}

fn require_id(raw: &RawArchiveRecord) -> Result<(), TrackerError> {
    if raw.archive_id.trim().is_empty() {
        return Err(TrackerError::MissingArchiveId);
    }
    Ok(())
}

#[async_trait]
impl MigrationRecordStore for MemoryMigrationRecordStore {
    async fn upsert(&self, raw: &RawArchiveRecord) -> Result<UpsertOutcome, TrackerError> {
        require_id(raw)?;
        let mut state = self.state.write().await;
        match state.get_mut(&raw.archive_id) {
            Ok(existing) => {
                existing.refresh_raw(raw);
                Ok(UpsertOutcome::Updated)
            }
            Err(_) => {
                state.insert(MigrationRecord::pending(raw));
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn insert_pending(&self, raw: &RawArchiveRecord) -> Result<bool, TrackerError> {
        require_id(raw)?;
        let mut state = self.state.write().await;
        if state.by_archive_id.contains_key(&raw.archive_id) {
            return Ok(false);
        }
        state.insert(MigrationRecord::pending(raw));
        Ok(true)
    }

    async fn update_metadata_fields(
        &self,
        archive_id: &str,
        fields: &MetadataFields,
    ) -> Result<String, TrackerError> {
        let mut state = self.state.write().await;
        Ok(state.get_mut(archive_id)?.apply_metadata(fields))
    }

    async fn set_most_recent(
        &self,
        archive_id: &str,
        is_most_recent: bool,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        let target = state.get_mut(archive_id)?;
        target.is_most_recent = is_most_recent;
        if !is_most_recent {
            return Ok(());
        }

        let group = target.recording_group_key.clone();
        let label = target.version_label;
        if group.is_none() {
            return Ok(());
        }
        for sibling in state.records.iter_mut() {
            if sibling.archive_id != archive_id
                && sibling.recording_group_key == group
                && sibling.version_label == label
            {
                sibling.is_most_recent = false;
            }
        }
        Ok(())
    }

    async fn mark_success(&self, archive_id: &str, ids: EntityIds) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        let record = state.get_mut(archive_id)?;
        record.transition(MigrationStatus::Success)?;
        record.failure_category = None;
        record.error_message = None;
        record.recording_id = ids.recording_id;
        record.booking_id = ids.booking_id;
        record.capture_session_id = ids.capture_session_id;
        Ok(())
    }

    async fn mark_failed(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        state
            .get_mut(archive_id)?
            .record_failure(MigrationStatus::Failed, failure)
    }

    async fn mark_skipped(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        state
            .get_mut(archive_id)?
            .record_failure(MigrationStatus::Skipped, failure)
    }

    async fn reset_to_pending(&self, archive_id: &str) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        let record = state.get_mut(archive_id)?;
        record.status = MigrationStatus::Pending;
        record.failure_category = None;
        record.error_message = None;
        record.resolved_at = None;
        record.is_most_recent = false;
        record.recording_id = None;
        record.booking_id = None;
        record.capture_session_id = None;
        Ok(())
    }

    async fn find_by_archive_id(
        &self,
        archive_id: &str,
    ) -> Result<Option<MigrationRecord>, TrackerError> {
        let state = self.state.read().await;
        Ok(state
            .by_archive_id
            .get(archive_id)
            .map(|idx| state.records[*idx].clone()))
    }

    async fn find_by_archive_name(
        &self,
        archive_name: &str,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        let state = self.state.read().await;
        Ok(state.filtered(|r| r.archive_name == archive_name))
    }

    async fn find_by_status(
        &self,
        status: MigrationStatus,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        let state = self.state.read().await;
        Ok(state.filtered(|r| r.status == status))
    }

    async fn find_by_group_key_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        let prefix = prefix.to_lowercase();
        let state = self.state.read().await;
        Ok(state.filtered(|r| {
            r.recording_group_key
                .as_deref()
                .is_some_and(|key| key.starts_with(&prefix))
        }))
    }

    async fn all(&self) -> Result<Vec<MigrationRecord>, TrackerError> {
        Ok(self.state.read().await.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str) -> RawArchiveRecord {
        RawArchiveRecord::new(format!("{id}.mp4")).with_archive_id(id)
    }

    fn fields(urn: &str, label: VersionLabel, version: &str) -> MetadataFields {
        MetadataFields {
            court_reference: Some("Leeds".into()),
            urn: Some(urn.into()),
            exhibit_reference: Some("T12345".into()),
            defendant_last_name: Some("Smith".into()),
            witness_first_name: Some("John".into()),
            version_label: Some(label),
            version_number: Some(version.into()),
            file_extension: Some("mp4".into()),
        }
    }

    #[tokio::test]
    async fn insert_pending_is_the_dedup_gate() {
        let store = MemoryMigrationRecordStore::new();
        assert!(store.insert_pending(&raw("a")).await.unwrap());
        assert!(!store.insert_pending(&raw("a")).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_archive_id_is_rejected() {
        let store = MemoryMigrationRecordStore::new();
        let err = store.insert_pending(&raw(" ")).await.unwrap_err();
        assert!(matches!(err, TrackerError::MissingArchiveId));
    }

    #[tokio::test]
    async fn upsert_preserves_status() {
        let store = MemoryMigrationRecordStore::new();
        assert_eq!(store.upsert(&raw("a")).await.unwrap(), UpsertOutcome::Created);
        store
            .mark_failed("a", &Failure::new(FailureCategory::TestData, "demo"))
            .await
            .unwrap();

        let refreshed = raw("a").with_duration(42);
        assert_eq!(store.upsert(&refreshed).await.unwrap(), UpsertOutcome::Updated);
        let record = store.find_by_archive_id("a").await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.duration_secs, Some(42));
    }

    #[tokio::test]
    async fn terminal_records_need_an_explicit_reset() {
        let store = MemoryMigrationRecordStore::new();
        store.insert_pending(&raw("a")).await.unwrap();
        store.mark_success("a", EntityIds::default()).await.unwrap();

        let err = store
            .mark_failed("a", &Failure::new(FailureCategory::WriteError, "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));

        store.reset_to_pending("a").await.unwrap();
        store
            .mark_failed("a", &Failure::new(FailureCategory::WriteError, "retry"))
            .await
            .unwrap();
        let record = store.find_by_archive_id("a").await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.failure_category, Some(FailureCategory::WriteError));
        assert!(record.resolved_at.is_some());
    }

    #[tokio::test]
    async fn group_key_is_recomputed_from_metadata() {
        let store = MemoryMigrationRecordStore::new();
        store.insert_pending(&raw("a")).await.unwrap();
        let key = store
            .update_metadata_fields("a", &fields("12AB345678", VersionLabel::Orig, "1"))
            .await
            .unwrap();
        assert_eq!(key, "12ab345678|t12345|john|smith");

        let found = store.find_by_group_key_prefix("12AB").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.find_by_group_key_prefix("99").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn most_recent_flag_is_exclusive_per_group_and_class() {
        let store = MemoryMigrationRecordStore::new();
        for (id, label, version) in [
            ("orig", VersionLabel::Orig, "1"),
            ("copy1", VersionLabel::Copy, "1"),
            ("copy2", VersionLabel::Copy, "2"),
        ] {
            store.insert_pending(&raw(id)).await.unwrap();
            store
                .update_metadata_fields(id, &fields("12AB345678", label, version))
                .await
                .unwrap();
            store.set_most_recent(id, true).await.unwrap();
        }

        let flagged: Vec<_> = store
            .all()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.is_most_recent)
            .map(|r| r.archive_id)
            .collect();
        assert_eq!(flagged, vec!["orig".to_string(), "copy2".to_string()]);
    }

    #[tokio::test]
    async fn queries_by_name_and_status() {
        let store = MemoryMigrationRecordStore::new();
        store.insert_pending(&raw("a")).await.unwrap();
        store.insert_pending(&raw("b")).await.unwrap();
        store
            .mark_skipped("b", &Failure::new(FailureCategory::Excluded, "listed"))
            .await
            .unwrap();

        assert_eq!(store.find_by_archive_name("a.mp4").await.unwrap().len(), 1);
        let pending = store.find_by_status(MigrationStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].archive_id, "a");
        assert_eq!(
            store.find_by_status(MigrationStatus::Skipped).await.unwrap()[0].failure_category,
            Some(FailureCategory::Excluded)
        );
    }
}
