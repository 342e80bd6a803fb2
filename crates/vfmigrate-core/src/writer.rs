use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entities::{
    Booking, CaptureSession, Case, EntityGraph, EntityIndex, EntityKind, GroupEntities,
    Participant, Planned, Recording, ShareBooking, User,
};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("entity store unavailable: {0}")]
    Unavailable(String),

    #[error("chunk commit exceeded {0:?}")]
    Timeout(Duration),

    #[error("{entity} rejected: {message}")]
    Constraint { entity: EntityKind, message: String },

    #[error("entity store error: {0}")]
    Storage(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Timeout(_))
    }

    /// The entity kind an item-level rejection happened at.
    pub fn rejected_at(&self) -> Option<EntityKind> {
        match self {
            SinkError::Constraint { entity, .. } => Some(*entity),
            _ => None,
        }
    }
}

/// Persistence target for entity graphs. Writes happen inside a chunk
/// transaction that becomes visible only on commit.
#[async_trait]
pub trait EntitySink: Send + Sync {
    /// Natural-key index over what the store already holds.
    async fn load_index(&self) -> Result<EntityIndex, SinkError>;

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTransaction>, SinkError>;
}

#[async_trait]
pub trait ChunkTransaction: Send {
    /// Writes one archive's graph. A [`SinkError::Constraint`] leaves the
    /// entities written before the rejected one in place and the
    /// transaction usable.
    async fn persist(&mut self, graph: &EntityGraph) -> Result<(), SinkError>;

    async fn commit(self: Box<Self>) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Default)]
pub struct StoredEntities {
    pub users: HashMap<Uuid, User>,
    pub cases: HashMap<Uuid, Case>,
    pub participants: HashMap<Uuid, Participant>,
    pub bookings: HashMap<Uuid, Booking>,
    pub capture_sessions: HashMap<Uuid, CaptureSession>,
    pub recordings: HashMap<Uuid, Recording>,
    pub share_bookings: HashMap<Uuid, ShareBooking>,
    group_of_booking: HashMap<Uuid, String>,
}

impl StoredEntities {
    fn case_reference_taken(&self, reference: &str) -> bool {
        self.cases
            .values()
            .any(|case| case.reference.eq_ignore_ascii_case(reference))
    }

    fn email_taken(&self, email: &str) -> bool {
        self.users.values().any(|user| user.email == email)
    }

    fn index(&self) -> EntityIndex {
        let mut groups: HashMap<String, GroupEntities> = HashMap::new();
        for (booking_id, key) in &self.group_of_booking {
            groups.entry(key.clone()).or_default().booking_id = Some(*booking_id);
        }
        let group_of_session: HashMap<Uuid, &String> = self
            .capture_sessions
            .values()
            .filter_map(|session| {
                self.group_of_booking
                    .get(&session.booking_id)
                    .map(|key| (session.id, key))
            })
            .collect();
        for (session_id, key) in &group_of_session {
            groups.entry((*key).clone()).or_default().capture_session_id = Some(*session_id);
        }
        for recording in self.recordings.values() {
            if recording.parent_recording_id.is_some() || recording.version != 1 {
                continue;
            }
            if let Some(key) = group_of_session.get(&recording.capture_session_id) {
                groups.entry((*key).clone()).or_default().orig_recording_id = Some(recording.id);
            }
        }

        EntityIndex::seed(
            self.cases
                .values()
                .map(|case| (case.reference.clone(), case.id)),
            groups,
            self.users.values().map(|user| (user.email.clone(), user.id)),
        )
    }
}

/// In-process entity store. Knobs let tests reject recordings for chosen
/// archives or fail a number of commits as if the store were unreachable.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    committed: Arc<Mutex<StoredEntities>>,
    rejected_archives: HashSet<String>,
    transient_commit_failures: Arc<AtomicU32>,
    commit_delay: Option<Duration>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_recording_for(mut self, archive_id: impl Into<String>) -> Self {
        self.rejected_archives.insert(archive_id.into());
        self
    }

    pub fn fail_next_commits(self, count: u32) -> Self {
        self.transient_commit_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    pub async fn snapshot(&self) -> StoredEntities {
        self.committed.lock().await.clone()
    }
}

#[async_trait]
impl EntitySink for MemoryEntityStore {
    async fn load_index(&self) -> Result<EntityIndex, SinkError> {
        Ok(self.committed.lock().await.index())
    }

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTransaction>, SinkError> {
        Ok(Box::new(MemoryChunk {
            committed: Arc::clone(&self.committed),
            pending: StoredEntities::default(),
            rejected_archives: self.rejected_archives.clone(),
            transient_commit_failures: Arc::clone(&self.transient_commit_failures),
            commit_delay: self.commit_delay,
        }))
    }
}

struct MemoryChunk {
    committed: Arc<Mutex<StoredEntities>>,
    pending: StoredEntities,
    rejected_archives: HashSet<String>,
    transient_commit_failures: Arc<AtomicU32>,
    commit_delay: Option<Duration>,
}

impl MemoryChunk {
    fn constraint(entity: EntityKind, message: impl Into<String>) -> SinkError {
        SinkError::Constraint {
            entity,
            message: message.into(),
        }
    }
}

#[async_trait]
impl ChunkTransaction for MemoryChunk {
    async fn persist(&mut self, graph: &EntityGraph) -> Result<(), SinkError> {
        let committed = self.committed.lock().await;

        for user in &graph.users {
            if committed.email_taken(&user.email) || self.pending.email_taken(&user.email) {
                return Err(Self::constraint(
                    EntityKind::User,
                    format!("email '{}' already registered", user.email),
                ));
            }
            self.pending.users.insert(user.id, user.clone());
        }

        if let Planned::New(case) = &graph.case {
            if committed.case_reference_taken(&case.reference)
                || self.pending.case_reference_taken(&case.reference)
            {
                return Err(Self::constraint(
                    EntityKind::Case,
                    format!("case reference '{}' already exists", case.reference),
                ));
            }
            self.pending.cases.insert(case.id, case.clone());
        }
        for participant in &graph.participants {
            self.pending
                .participants
                .insert(participant.id, participant.clone());
        }
        if let Planned::New(booking) = &graph.booking {
            self.pending.bookings.insert(booking.id, booking.clone());
            self.pending
                .group_of_booking
                .insert(booking.id, graph.group_key.clone());
        }
        if let Planned::New(session) = &graph.capture_session {
            self.pending.capture_sessions.insert(session.id, session.clone());
        }

        if self.rejected_archives.contains(&graph.archive_id) {
            return Err(Self::constraint(
                EntityKind::Recording,
                format!("recording for archive '{}' violates a constraint", graph.archive_id),
            ));
        }
        self.pending
            .recordings
            .insert(graph.recording.id, graph.recording.clone());

        for share in &graph.share_bookings {
            self.pending.share_bookings.insert(share.id, share.clone());
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.transient_commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_commit_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Unavailable("simulated connection reset".into()));
        }

        let MemoryChunk {
            committed, pending, ..
        } = *self;
        let mut committed = committed.lock().await;
        committed.users.extend(pending.users);
        committed.cases.extend(pending.cases);
        committed.participants.extend(pending.participants);
        committed.bookings.extend(pending.bookings);
        committed.capture_sessions.extend(pending.capture_sessions);
        committed.recordings.extend(pending.recordings);
        committed.share_bookings.extend(pending.share_bookings);
        committed.group_of_booking.extend(pending.group_of_booking);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::transform::CaseState;
    use vfmigrate_parser::VersionLabel;

    fn graph(archive_id: &str, reference: &str) -> EntityGraph {
        let at = NaiveDate::from_ymd_opt(2020, 6, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        let case = Case {
            id: Uuid::new_v4(),
            court_id: Uuid::new_v4(),
            reference: reference.into(),
            state: CaseState::Closed,
            test: false,
        };
        let booking = Booking {
            id: Uuid::new_v4(),
            case_id: case.id,
            scheduled_for: at,
            participant_ids: Vec::new(),
        };
        let session = CaptureSession {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            started_at: at,
            finished_at: None,
            started_by_user_id: Uuid::new_v4(),
        };
        EntityGraph {
            archive_id: archive_id.into(),
            group_key: format!("{archive_id}|g"),
            version_label: VersionLabel::Orig,
            users: Vec::new(),
            recording: Recording {
                id: Uuid::new_v4(),
                capture_session_id: session.id,
                parent_recording_id: None,
                version: 1,
                filename: None,
                duration_secs: Some(120),
                archive_id: archive_id.into(),
            },
            case: Planned::New(case),
            participants: Vec::new(),
            booking: Planned::New(booking),
            capture_session: Planned::New(session),
            share_bookings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn nothing_is_visible_before_commit() {
        let store = MemoryEntityStore::new();
        let mut tx = store.begin_chunk().await.unwrap();
        tx.persist(&graph("a", "CASE000001")).await.unwrap();
        assert!(store.snapshot().await.cases.is_empty());

        drop(tx);
        assert!(store.snapshot().await.recordings.is_empty());
    }

    #[tokio::test]
    async fn rejected_recording_keeps_earlier_entities() {
        let store = MemoryEntityStore::new().reject_recording_for("bad");
        let mut tx = store.begin_chunk().await.unwrap();
        let err = tx.persist(&graph("bad", "CASE000001")).await.unwrap_err();
        assert_eq!(err.rejected_at(), Some(EntityKind::Recording));
        assert!(!err.is_transient());
        tx.persist(&graph("good", "CASE000002")).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.snapshot().await;
        assert_eq!(stored.cases.len(), 2);
        assert_eq!(stored.recordings.len(), 1);
        assert_eq!(stored.capture_sessions.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_case_reference_is_a_constraint_violation() {
        let store = MemoryEntityStore::new();
        let mut tx = store.begin_chunk().await.unwrap();
        tx.persist(&graph("a", "CASE000001")).await.unwrap();
        let err = tx.persist(&graph("b", "case000001")).await.unwrap_err();
        assert_eq!(err.rejected_at(), Some(EntityKind::Case));
    }

    #[tokio::test]
    async fn injected_commit_failures_are_transient() {
        let store = MemoryEntityStore::new().fail_next_commits(1);
        let mut tx = store.begin_chunk().await.unwrap();
        tx.persist(&graph("a", "CASE000001")).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_transient());

        let mut tx = store.begin_chunk().await.unwrap();
        tx.persist(&graph("a", "CASE000001")).await.unwrap();
        tx.commit().await.unwrap();
        let index = store.load_index().await.unwrap();
        assert!(index.case_id("CASE000001").is_some());
        assert!(index.group("a|g").and_then(|g| g.orig_recording_id).is_some());
    }
}
