//! Domain entity graph built from validated recordings.
//!
//! Each archive yields one [`EntityGraph`]. Entities that already exist for
//! the same case reference or recording group are referenced by id instead
//! of being rebuilt, so ORIG and COPY siblings share a case, booking and
//! capture session.

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vfmigrate_parser::VersionLabel;

use crate::reference::Contact;
use crate::tracker::EntityIds;
use crate::transform::CaseState;
use crate::validation::ValidatedRecording;

/// Placeholder for a participant name the archive does not carry.
pub const DEFAULT_NAME: &str = "Unknown";

pub const MIGRATION_USER_EMAIL: &str = "legacy.migration@vfmigrate.local";

/// Entity kinds in the order a sink writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Case,
    Participant,
    Booking,
    CaptureSession,
    Recording,
    ShareBooking,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Case => "case",
            EntityKind::Participant => "participant",
            EntityKind::Booking => "booking",
            EntityKind::CaptureSession => "capture_session",
            EntityKind::Recording => "recording",
            EntityKind::ShareBooking => "share_booking",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantType {
    Witness,
    Defendant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub case_id: Uuid,
    pub participant_type: ParticipantType,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub id: Uuid,
    pub court_id: Uuid,
    pub reference: String,
    pub state: CaseState,
    pub test: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub case_id: Uuid,
    pub scheduled_for: NaiveDateTime,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub started_by_user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,
    pub capture_session_id: Uuid,
    pub parent_recording_id: Option<Uuid>,
    pub version: i32,
    pub filename: Option<String>,
    pub duration_secs: Option<i64>,
    pub archive_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl User {
    pub fn new(first_name: &str, last_name: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_name: capitalize(first_name),
            last_name: capitalize(last_name),
            email: email.trim().to_lowercase(),
        }
    }

    pub fn migration_user() -> Self {
        Self::new("Legacy", "Migration", MIGRATION_USER_EMAIL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareBooking {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub shared_by_user_id: Uuid,
    pub shared_with_user_id: Uuid,
}

/// Either a freshly built entity or a reference to one already stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Planned<T> {
    New(T),
    Existing(Uuid),
}

impl<T> Planned<T> {
    pub fn new_value(&self) -> Option<&T> {
        match self {
            Planned::New(value) => Some(value),
            Planned::Existing(_) => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Planned::New(_))
    }
}

macro_rules! planned_id {
    ($($ty:ty),*) => {
        $(impl Planned<$ty> {
            pub fn id(&self) -> Uuid {
                match self {
                    Planned::New(value) => value.id,
                    Planned::Existing(id) => *id,
                }
            }
        })*
    };
}

planned_id!(Case, Booking, CaptureSession);

#[derive(Debug, Clone, Serialize)]
pub struct EntityGraph {
    pub archive_id: String,
    pub group_key: String,
    pub version_label: VersionLabel,
    pub users: Vec<User>,
    pub case: Planned<Case>,
    pub participants: Vec<Participant>,
    pub booking: Planned<Booking>,
    pub capture_session: Planned<CaptureSession>,
    pub recording: Recording,
    pub share_bookings: Vec<ShareBooking>,
}

impl EntityGraph {
    pub fn ids(&self) -> EntityIds {
        EntityIds {
            recording_id: Some(self.recording.id),
            booking_id: Some(self.booking.id()),
            capture_session_id: Some(self.capture_session.id()),
        }
    }
}

/// Ids already written for one recording group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntities {
    pub booking_id: Option<Uuid>,
    pub capture_session_id: Option<Uuid>,
    pub orig_recording_id: Option<Uuid>,
}

/// Natural-key lookups over persisted entities.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    cases: HashMap<String, Uuid>,
    groups: HashMap<String, GroupEntities>,
    users: HashMap<String, Uuid>,
}

impl EntityIndex {
    pub fn seed(
        cases: impl IntoIterator<Item = (String, Uuid)>,
        groups: impl IntoIterator<Item = (String, GroupEntities)>,
        users: impl IntoIterator<Item = (String, Uuid)>,
    ) -> Self {
        Self {
            cases: cases
                .into_iter()
                .map(|(reference, id)| (reference.to_uppercase(), id))
                .collect(),
            groups: groups.into_iter().collect(),
            users: users
                .into_iter()
                .map(|(email, id)| (email.to_lowercase(), id))
                .collect(),
        }
    }

    pub fn case_id(&self, reference: &str) -> Option<Uuid> {
        self.cases.get(&reference.to_uppercase()).copied()
    }

    pub fn group(&self, group_key: &str) -> Option<&GroupEntities> {
        self.groups.get(group_key)
    }

    pub fn user_id(&self, email: &str) -> Option<Uuid> {
        self.users.get(&email.trim().to_lowercase()).copied()
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Records the entities of `graph` that reached the store. `failed_at`
    /// names the first entity the sink rejected; nothing from that kind on
    /// is recorded.
    pub fn record(&mut self, graph: &EntityGraph, failed_at: Option<EntityKind>) {
        let written = |kind: EntityKind| failed_at.map_or(true, |failed| kind < failed);

        if written(EntityKind::User) {
            for user in &graph.users {
                self.users.insert(user.email.clone(), user.id);
            }
        }
        if written(EntityKind::Case) {
            if let Planned::New(case) = &graph.case {
                self.cases.insert(case.reference.to_uppercase(), case.id);
            }
        }
        let group = self.groups.entry(graph.group_key.clone()).or_default();
        if written(EntityKind::Booking) {
            group.booking_id = Some(graph.booking.id());
        }
        if written(EntityKind::CaptureSession) {
            group.capture_session_id = Some(graph.capture_session.id());
        }
        if written(EntityKind::Recording) && graph.version_label == VersionLabel::Orig {
            group.orig_recording_id = Some(graph.recording.id);
        }
    }

    /// Folds a chunk overlay into the committed index.
    pub fn merge(&mut self, overlay: EntityIndex) {
        self.cases.extend(overlay.cases);
        self.users.extend(overlay.users);
        for (key, entities) in overlay.groups {
            let group = self.groups.entry(key).or_default();
            group.booking_id = entities.booking_id.or(group.booking_id);
            group.capture_session_id = entities.capture_session_id.or(group.capture_session_id);
            group.orig_recording_id = entities.orig_recording_id.or(group.orig_recording_id);
        }
    }
}

/// Looks a key up in the chunk overlay first, then in the committed index.
struct Layers<'a> {
    committed: &'a EntityIndex,
    overlay: &'a EntityIndex,
}

impl Layers<'_> {
    fn case_id(&self, reference: &str) -> Option<Uuid> {
        self.overlay
            .case_id(reference)
            .or_else(|| self.committed.case_id(reference))
    }

    fn group(&self, group_key: &str) -> GroupEntities {
        let overlay = self.overlay.group(group_key).cloned().unwrap_or_default();
        let committed = self.committed.group(group_key).cloned().unwrap_or_default();
        GroupEntities {
            booking_id: overlay.booking_id.or(committed.booking_id),
            capture_session_id: overlay.capture_session_id.or(committed.capture_session_id),
            orig_recording_id: overlay.orig_recording_id.or(committed.orig_recording_id),
        }
    }

    fn user_id(&self, email: &str) -> Option<Uuid> {
        self.overlay
            .user_id(email)
            .or_else(|| self.committed.user_id(email))
    }
}

pub struct EntityBuilder {
    migration_user: User,
}

impl Default for EntityBuilder {
    fn default() -> Self {
        Self::new(User::migration_user())
    }
}

impl EntityBuilder {
    pub fn new(migration_user: User) -> Self {
        Self { migration_user }
    }

    pub fn migration_user(&self) -> &User {
        &self.migration_user
    }

    pub fn build(
        &self,
        validated: &ValidatedRecording,
        committed: &EntityIndex,
        overlay: &EntityIndex,
    ) -> EntityGraph {
        let layers = Layers { committed, overlay };
        let recording = validated.recording();
        let recorded_at = validated.recorded_at();
        let mut users = Vec::new();

        let migration_user_id = match layers.user_id(&self.migration_user.email) {
            Some(id) => id,
            None => {
                users.push(self.migration_user.clone());
                self.migration_user.id
            }
        };

        let case = match layers.case_id(validated.case_reference()) {
            Some(id) => Planned::Existing(id),
            None => Planned::New(Case {
                id: Uuid::new_v4(),
                court_id: validated.court().id,
                reference: validated.case_reference().to_string(),
                state: recording.case_state,
                test: false,
            }),
        };

        let group = layers.group(&recording.group_key);
        let participants = match group.booking_id {
            Some(_) => Vec::new(),
            None => vec![
                participant(
                    case.id(),
                    ParticipantType::Witness,
                    &recording.metadata.witness_first_name,
                    "",
                ),
                participant(
                    case.id(),
                    ParticipantType::Defendant,
                    "",
                    &recording.metadata.defendant_last_name,
                ),
            ],
        };
        let booking = match group.booking_id {
            Some(id) => Planned::Existing(id),
            None => Planned::New(Booking {
                id: Uuid::new_v4(),
                case_id: case.id(),
                scheduled_for: recorded_at,
                participant_ids: participants.iter().map(|p| p.id).collect(),
            }),
        };
        let capture_session = match group.capture_session_id {
            Some(id) => Planned::Existing(id),
            None => Planned::New(CaptureSession {
                id: Uuid::new_v4(),
                booking_id: booking.id(),
                started_at: recorded_at,
                finished_at: recording
                    .duration_secs
                    .map(|secs| recorded_at + Duration::seconds(secs)),
                started_by_user_id: migration_user_id,
            }),
        };

        let parent_recording_id = match recording.version_label() {
            VersionLabel::Orig => None,
            VersionLabel::Copy => group.orig_recording_id,
        };
        let new_recording = Recording {
            id: Uuid::new_v4(),
            capture_session_id: capture_session.id(),
            parent_recording_id,
            version: recording.version.standardized_version_number,
            filename: recording.file_name.clone(),
            duration_secs: recording.duration_secs,
            archive_id: recording.archive_id.clone(),
        };

        let mut share_bookings = Vec::new();
        if booking.is_new() {
            for contact in &recording.contacts {
                let shared_with = self.contact_user(contact, &layers, &mut users);
                share_bookings.push(ShareBooking {
                    id: Uuid::new_v4(),
                    booking_id: booking.id(),
                    shared_by_user_id: migration_user_id,
                    shared_with_user_id: shared_with,
                });
            }
        }

        EntityGraph {
            archive_id: recording.archive_id.clone(),
            group_key: recording.group_key.clone(),
            version_label: recording.version_label(),
            users,
            case,
            participants,
            booking,
            capture_session,
            recording: new_recording,
            share_bookings,
        }
    }

    fn contact_user(&self, contact: &Contact, layers: &Layers<'_>, users: &mut Vec<User>) -> Uuid {
        let email = contact.email.trim().to_lowercase();
        if let Some(id) = layers.user_id(&email) {
            return id;
        }
        if let Some(user) = users.iter().find(|user| user.email == email) {
            return user.id;
        }
        let first = non_blank(&contact.first_name).unwrap_or(DEFAULT_NAME);
        let last = non_blank(&contact.last_name).unwrap_or(DEFAULT_NAME);
        let user = User::new(first, last, &email);
        let id = user.id;
        users.push(user);
        id
    }
}

fn participant(
    case_id: Uuid,
    participant_type: ParticipantType,
    first_name: &str,
    last_name: &str,
) -> Participant {
    Participant {
        id: Uuid::new_v4(),
        case_id,
        participant_type,
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
    }
}

fn non_blank(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

fn capitalize(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let mut chars = lowered.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::MigrationConfig;
    use crate::reference::ReferenceData;
    use crate::source::RawArchiveRecord;
    use crate::transform::Transformer;
    use crate::validation::{ValidationRules, Validator};
    use crate::versioning::{MemoryRecencyCache, VersionResolver};

    async fn validated(names: &[&str], reference: ReferenceData) -> Vec<ValidatedRecording> {
        let resolver = VersionResolver::new(Arc::new(MemoryRecencyCache::new("t:")));
        let transformer = Transformer::new(Arc::new(reference), resolver.clone());
        let validator = Validator::new(
            ValidationRules::from(&MigrationConfig::default()),
            resolver,
        );
        let mut out = Vec::new();
        for name in names {
            let raw = RawArchiveRecord::new(*name).with_duration(120);
            let processed = transformer.transform_raw(&raw).await.unwrap().unwrap();
            out.push(validator.validate(processed, &raw).await.unwrap().unwrap());
        }
        out
    }

    fn leeds() -> ReferenceData {
        ReferenceData::default().with_site("LEEDS", "Leeds Youth Court")
    }

    #[tokio::test]
    async fn first_archive_builds_a_full_graph() {
        let items = validated(&["Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4"], leeds()).await;
        let graph = EntityBuilder::default().build(&items[0], &EntityIndex::default(), &EntityIndex::default());

        let case = graph.case.new_value().expect("new case");
        assert_eq!(case.reference, "12AB345678");
        assert_eq!(graph.participants.len(), 2);
        assert!(graph.booking.is_new());
        assert!(graph.capture_session.is_new());
        assert_eq!(graph.recording.version, 1);
        assert_eq!(graph.recording.parent_recording_id, None);
        assert_eq!(graph.users.len(), 1, "migration user is created once");
        let session = graph.capture_session.new_value().unwrap();
        assert_eq!(
            session.finished_at.unwrap() - session.started_at,
            Duration::seconds(120)
        );
    }

    #[tokio::test]
    async fn copy_reuses_group_entities_and_links_parent() {
        let items = validated(
            &[
                "Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4",
                "Leeds-010620-12AB345678-T12345-Smith-John-COPY-2.mp4",
            ],
            leeds(),
        )
        .await;
        let builder = EntityBuilder::default();
        let committed = EntityIndex::default();
        let mut overlay = EntityIndex::default();

        let orig = builder.build(&items[0], &committed, &overlay);
        overlay.record(&orig, None);
        let copy = builder.build(&items[1], &committed, &overlay);

        assert_eq!(copy.case, Planned::Existing(orig.case.id()));
        assert_eq!(copy.booking.id(), orig.booking.id());
        assert_eq!(copy.capture_session.id(), orig.capture_session.id());
        assert_eq!(copy.recording.parent_recording_id, Some(orig.recording.id));
        assert_eq!(copy.recording.version, 2);
        assert!(copy.users.is_empty());
    }

    #[tokio::test]
    async fn rejected_recording_is_not_a_parent() {
        let items = validated(&["Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4"], leeds()).await;
        let graph = EntityBuilder::default().build(&items[0], &EntityIndex::default(), &EntityIndex::default());

        let mut index = EntityIndex::default();
        index.record(&graph, Some(EntityKind::Recording));
        let group = index.group(&graph.group_key).unwrap();
        assert_eq!(group.capture_session_id, Some(graph.capture_session.id()));
        assert_eq!(group.orig_recording_id, None);
        assert_eq!(index.case_id("12ab345678"), Some(graph.case.id()));
    }

    #[tokio::test]
    async fn contacts_become_share_bookings() {
        let reference = leeds().with_contact(
            "Leeds-010620-12AB345678-T12345-Smith-John-ORIG",
            Contact {
                first_name: "JANE".into(),
                last_name: "doe".into(),
                email: "Jane.Doe@example.com".into(),
            },
        );
        let items = validated(&["Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4"], reference).await;
        let graph = EntityBuilder::default().build(&items[0], &EntityIndex::default(), &EntityIndex::default());

        assert_eq!(graph.share_bookings.len(), 1);
        let invited = graph
            .users
            .iter()
            .find(|u| u.email == "jane.doe@example.com")
            .expect("contact user");
        assert_eq!(invited.first_name, "Jane");
        assert_eq!(invited.last_name, "Doe");
        assert_eq!(graph.share_bookings[0].shared_with_user_id, invited.id);
    }

    #[test]
    fn merge_keeps_committed_ids_the_overlay_lacks() {
        let group = GroupEntities {
            booking_id: Some(Uuid::new_v4()),
            capture_session_id: Some(Uuid::new_v4()),
            orig_recording_id: Some(Uuid::new_v4()),
        };
        let mut committed = EntityIndex::seed(
            [("CASE1".to_string(), Uuid::new_v4())],
            [("g".to_string(), group.clone())],
            Vec::<(String, Uuid)>::new(),
        );
        let overlay = EntityIndex::seed(
            [("CASE2".to_string(), Uuid::new_v4())],
            [("g".to_string(), GroupEntities::default())],
            Vec::<(String, Uuid)>::new(),
        );
        committed.merge(overlay);
        assert_eq!(committed.case_count(), 2);
        assert_eq!(committed.group("g"), Some(&group));
    }
}
