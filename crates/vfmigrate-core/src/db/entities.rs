use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgQueryResult;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{is_transient, DbPool};
use crate::entities::{EntityGraph, EntityIndex, EntityKind, GroupEntities, ParticipantType, Planned};
use crate::writer::{ChunkTransaction, EntitySink, SinkError};

/// Writes entity graphs into the target tables. Each chunk is one database
/// transaction; each entity gets a savepoint so a rejected insert leaves
/// earlier writes in the chunk intact.
#[derive(Clone)]
pub struct PgEntitySink {
    pool: DbPool,
}

impl PgEntitySink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn sink_error(entity: Option<EntityKind>, err: sqlx::Error) -> SinkError {
    if is_transient(&err) {
        return SinkError::Unavailable(err.to_string());
    }
    match (entity, &err) {
        (Some(entity), sqlx::Error::Database(db)) => SinkError::Constraint {
            entity,
            message: db.message().to_string(),
        },
        _ => SinkError::Storage(err.to_string()),
    }
}

#[async_trait]
impl EntitySink for PgEntitySink {
    async fn load_index(&self) -> Result<EntityIndex, SinkError> {
        let cases = sqlx::query(r#"SELECT reference, id FROM cases"#)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| sink_error(None, err))?
            .iter()
            .map(|row| -> Result<(String, Uuid), sqlx::Error> {
                Ok((row.try_get("reference")?, row.try_get("id")?))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| sink_error(None, err))?;

        let users = sqlx::query(r#"SELECT email, id FROM users"#)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| sink_error(None, err))?
            .iter()
            .map(|row| -> Result<(String, Uuid), sqlx::Error> {
                Ok((row.try_get("email")?, row.try_get("id")?))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| sink_error(None, err))?;

        let group_rows = sqlx::query(
            r#"
                SELECT
                    b.recording_group_key,
                    b.id AS booking_id,
                    (SELECT cs.id FROM capture_sessions cs
                     WHERE cs.booking_id = b.id
                     ORDER BY cs.started_at LIMIT 1) AS capture_session_id,
                    (SELECT r.id FROM recordings r
                     JOIN capture_sessions cs ON r.capture_session_id = cs.id
                     WHERE cs.booking_id = b.id
                       AND r.parent_recording_id IS NULL
                       AND r.version = 1
                     LIMIT 1) AS orig_recording_id
                FROM bookings b
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| sink_error(None, err))?;

        let mut groups = HashMap::with_capacity(group_rows.len());
        for row in group_rows {
            let key: String = row
                .try_get("recording_group_key")
                .map_err(|err| sink_error(None, err))?;
            let entities = GroupEntities {
                booking_id: row.try_get("booking_id").map_err(|err| sink_error(None, err))?,
                capture_session_id: row
                    .try_get("capture_session_id")
                    .map_err(|err| sink_error(None, err))?,
                orig_recording_id: row
                    .try_get("orig_recording_id")
                    .map_err(|err| sink_error(None, err))?,
            };
            groups.insert(key, entities);
        }

        debug!(
            cases = cases.len(),
            users = users.len(),
            groups = groups.len(),
            "Loaded entity index"
        );
        Ok(EntityIndex::seed(cases, groups, users))
    }

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTransaction>, SinkError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| sink_error(None, err))?;
        Ok(Box::new(PgChunk { tx }))
    }
}

struct PgChunk {
    tx: Transaction<'static, Postgres>,
}

impl PgChunk {
    async fn savepoint(&mut self) -> Result<(), SinkError> {
        sqlx::query("SAVEPOINT vf_entity")
            .execute(&mut *self.tx)
            .await
            .map_err(|err| sink_error(None, err))?;
        Ok(())
    }

    /// Releases the savepoint on success, rolls back to it on a rejected
    /// insert.
    async fn settle(
        &mut self,
        entity: EntityKind,
        result: Result<PgQueryResult, sqlx::Error>,
    ) -> Result<(), SinkError> {
        match result {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT vf_entity")
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|err| sink_error(None, err))?;
                Ok(())
            }
            Err(err) => {
                let mapped = sink_error(Some(entity), err);
                if !mapped.is_transient() {
                    sqlx::query("ROLLBACK TO SAVEPOINT vf_entity")
                        .execute(&mut *self.tx)
                        .await
                        .map_err(|err| sink_error(None, err))?;
                }
                Err(mapped)
            }
        }
    }
}

#[async_trait]
impl ChunkTransaction for PgChunk {
    async fn persist(&mut self, graph: &EntityGraph) -> Result<(), SinkError> {
        for user in &graph.users {
            self.savepoint().await?;
            let result = sqlx::query(
                r#"
                    INSERT INTO users (id, first_name, last_name, email)
                    VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(user.id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.email)
            .execute(&mut *self.tx)
            .await;
            self.settle(EntityKind::User, result).await?;
        }

        if let Planned::New(case) = &graph.case {
            self.savepoint().await?;
            let result = sqlx::query(
                r#"
                    INSERT INTO cases (id, court_id, reference, state, test)
                    VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(case.id)
            .bind(case.court_id)
            .bind(&case.reference)
            .bind(case.state.as_str())
            .bind(case.test)
            .execute(&mut *self.tx)
            .await;
            self.settle(EntityKind::Case, result).await?;
        }

        for participant in &graph.participants {
            let participant_type = match participant.participant_type {
                ParticipantType::Witness => "WITNESS",
                ParticipantType::Defendant => "DEFENDANT",
            };
            self.savepoint().await?;
            let result = sqlx::query(
                r#"
                    INSERT INTO participants (id, case_id, participant_type, first_name, last_name)
                    VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(participant.id)
            .bind(participant.case_id)
            .bind(participant_type)
            .bind(&participant.first_name)
            .bind(&participant.last_name)
            .execute(&mut *self.tx)
            .await;
            self.settle(EntityKind::Participant, result).await?;
        }

        if let Planned::New(booking) = &graph.booking {
            self.savepoint().await?;
            let mut result = sqlx::query(
                r#"
                    INSERT INTO bookings (id, case_id, scheduled_for, recording_group_key)
                    VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(booking.id)
            .bind(booking.case_id)
            .bind(booking.scheduled_for)
            .bind(&graph.group_key)
            .execute(&mut *self.tx)
            .await;
            for participant_id in &booking.participant_ids {
                if result.is_err() {
                    break;
                }
                result = sqlx::query(
                    r#"
                        INSERT INTO booking_participants (booking_id, participant_id)
                        VALUES ($1, $2)
                    "#,
                )
                .bind(booking.id)
                .bind(participant_id)
                .execute(&mut *self.tx)
                .await;
            }
            self.settle(EntityKind::Booking, result).await?;
        }

        if let Planned::New(session) = &graph.capture_session {
            self.savepoint().await?;
            let result = sqlx::query(
                r#"
                    INSERT INTO capture_sessions (id, booking_id, started_at, finished_at, started_by_user_id)
                    VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(session.id)
            .bind(session.booking_id)
            .bind(session.started_at)
            .bind(session.finished_at)
            .bind(session.started_by_user_id)
            .execute(&mut *self.tx)
            .await;
            self.settle(EntityKind::CaptureSession, result).await?;
        }

        let recording = &graph.recording;
        self.savepoint().await?;
        let result = sqlx::query(
            r#"
                INSERT INTO recordings
                    (id, capture_session_id, parent_recording_id, version, filename, duration_secs, archive_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(recording.id)
        .bind(recording.capture_session_id)
        .bind(recording.parent_recording_id)
        .bind(recording.version)
        .bind(&recording.filename)
        .bind(recording.duration_secs)
        .bind(&recording.archive_id)
        .execute(&mut *self.tx)
        .await;
        self.settle(EntityKind::Recording, result).await?;

        for share in &graph.share_bookings {
            self.savepoint().await?;
            let result = sqlx::query(
                r#"
                    INSERT INTO share_bookings (id, booking_id, shared_by_user_id, shared_with_user_id)
                    VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(share.id)
            .bind(share.booking_id)
            .bind(share.shared_by_user_id)
            .bind(share.shared_with_user_id)
            .execute(&mut *self.tx)
            .await;
            self.settle(EntityKind::ShareBooking, result).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        self.tx
            .commit()
            .await
            .map_err(|err| sink_error(None, err))
    }
}
