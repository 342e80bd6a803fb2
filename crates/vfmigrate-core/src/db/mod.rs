use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tokio::task;

pub mod entities;
pub mod reference;
pub mod tracker;

pub use entities::PgEntitySink;
pub use reference::{load_courts, sync_courts};
pub use tracker::PgMigrationRecordStore;

pub type DbPool = Pool<Postgres>;

/// Advisory lock key held for the duration of a migration run.
pub const MIGRATION_LOCK_KEY: i64 = 0x5646_4D49_4752; // "VFMIGR"

/// Establish a new Postgres connection pool sized for the migration workers.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(2))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .with_context(|| "failed to connect to Postgres")
}

/// Run database migrations embedded at compile-time.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .with_context(|| "failed to run database migrations")
}

/// Session-level `pg_advisory_lock` that keeps two runs from working the same
/// tracker at once.
pub struct AdvisoryLock {
    conn: Option<sqlx::pool::PoolConnection<Postgres>>,
    key: i64,
}

impl AdvisoryLock {
    pub async fn acquire(pool: &DbPool, key: i64) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query::<Postgres>("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(conn.as_mut())
            .await
            .with_context(|| format!("failed to take advisory lock {key}"))?;
        Ok(Self {
            conn: Some(conn),
            key,
        })
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query::<Postgres>("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(conn.as_mut())
                .await?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            task::spawn(async move {
                if let Err(err) = sqlx::query::<Postgres>("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(conn.as_mut())
                    .await
                {
                    tracing::warn!("failed to release advisory lock in drop: {err}");
                }
            });
        }
    }
}

/// Sorts sqlx errors into "try again" and "give up".
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)
    )
}
