use anyhow::{Context, Result};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::DbPool;
use crate::reference::{CourtRef, ReferenceData};

pub async fn load_courts(pool: &DbPool) -> Result<Vec<CourtRef>> {
    let rows = sqlx::query(r#"SELECT id, name FROM courts ORDER BY name"#)
        .fetch_all(pool)
        .await
        .with_context(|| "failed to load courts")?;

    let mut courts = Vec::with_capacity(rows.len());
    for row in rows {
        let id: Uuid = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        courts.push(CourtRef { id, name });
    }
    Ok(courts)
}

/// Makes sure every court named by the site mapping exists in the court
/// directory, then swaps the in-memory directory for the stored one so case
/// rows reference real court ids.
pub async fn sync_courts(pool: &DbPool, reference: ReferenceData) -> Result<ReferenceData> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0u64;
    for court in reference.courts() {
        inserted += sqlx::query(
            r#"
                INSERT INTO courts (id, name)
                VALUES ($1, $2)
                ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(court.id)
        .bind(&court.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;

    let courts = load_courts(pool).await?;
    info!(inserted, total = courts.len(), "Synchronised court directory");
    Ok(reference.with_courts(courts))
}
