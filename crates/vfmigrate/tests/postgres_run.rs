use std::env;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tokio::runtime::Runtime;
use vfmigrate_core::db::{self, PgEntitySink, PgMigrationRecordStore};
use vfmigrate_core::{
    BatchRunner, EntitySink, MemoryRecencyCache, MigrationConfig, MigrationRecordStore,
    MigrationStatus, RawArchiveRecord, ReferenceData, SourceRow,
};

const ORIG: &str = "Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4";
const COPY: &str = "Leeds-010620-12AB345678-T12345-Smith-John-COPY-2.mp4";

fn rows() -> Vec<SourceRow> {
    let at = NaiveDate::from_ymd_opt(2020, 6, 1)
        .and_then(|d| d.and_hms_opt(10, 30, 0))
        .unwrap();
    [ORIG, COPY, "random_junk_file"]
        .iter()
        .map(|name| {
            Ok(RawArchiveRecord::new(*name)
                .with_duration(120)
                .with_create_time(at))
        })
        .collect()
}

#[test]
fn postgres_run_is_idempotent() -> Result<()> {
    let database_url = match env::var("VFMIGRATE_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping postgres integration test because VFMIGRATE_TEST_DATABASE_URL is not set"
            );
            return Ok(());
        }
    };

    let rt = Runtime::new()?;
    let result: Result<()> = rt.block_on(async move {
        let pool = db::connect(&database_url, 4).await?;
        db::run_migrations(&pool).await?;

        sqlx::query(
            "TRUNCATE TABLE share_bookings, recordings, capture_sessions, booking_participants, bookings, participants, cases, users, courts, vf_migration_records CASCADE",
        )
        .execute(&pool)
        .await?;

        let reference = ReferenceData::default().with_site("LEEDS", "Leeds Youth Court");
        let reference = Arc::new(db::sync_courts(&pool, reference).await?);
        let tracker = Arc::new(PgMigrationRecordStore::new(pool.clone()));
        let sink: Arc<dyn EntitySink> = Arc::new(PgEntitySink::new(pool.clone()));

        let runner = |cache: Arc<MemoryRecencyCache>| {
            BatchRunner::new(
                MigrationConfig::default(),
                tracker.clone(),
                sink.clone(),
                cache,
                reference.clone(),
            )
        };

        let first = runner(Arc::new(MemoryRecencyCache::new("pg:")))
            .run(rows())
            .await?;
        assert_eq!(first.summary.migrated, 2);
        assert_eq!(first.summary.failed, 1);

        let record = tracker.find_by_archive_id(COPY).await?.expect("tracked");
        assert_eq!(record.status, MigrationStatus::Success);
        assert!(record.is_most_recent);

        let second = runner(Arc::new(MemoryRecencyCache::new("pg:")))
            .run(rows())
            .await?;
        assert_eq!(second.summary.duplicates, 3);
        assert_eq!(second.summary.migrated, 0);

        let recordings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recordings")
            .fetch_one(&pool)
            .await?;
        assert_eq!(recordings, 2);
        let linked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recordings WHERE parent_recording_id IS NOT NULL",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(linked, 1);

        Ok(())
    });
    result
}
