use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use vfmigrate_core::source::MalformedRow;
use vfmigrate_core::tracker::{
    EntityIds, MetadataFields, MigrationRecord, TrackerError, UpsertOutcome,
};
use vfmigrate_core::{
    write_report_csv, BatchRunner, Failure, FailureCategory, MemoryEntityStore,
    MemoryMigrationRecordStore, MemoryRecencyCache, MigrationConfig, MigrationRecordStore,
    MigrationStatus, PipelineError, RawArchiveRecord, ReferenceData, SourceRow,
};

const ORIG: &str = "Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4";
const COPY_2: &str = "Leeds-010620-12AB345678-T12345-Smith-John-COPY-2.mp4";
const COPY_3: &str = "Leeds-010620-12AB345678-T12345-Smith-John-COPY-3.mp4";

fn recorded_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 6, 1)
        .and_then(|d| d.and_hms_opt(10, 30, 0))
        .unwrap()
}

fn raw(name: &str) -> RawArchiveRecord {
    RawArchiveRecord::new(name)
        .with_duration(120)
        .with_create_time(recorded_at())
}

fn rows(names: &[&str]) -> Vec<SourceRow> {
    names.iter().map(|name| Ok(raw(name))).collect()
}

/// Distinct cases, one ORIG each.
fn distinct_origs(count: usize) -> Vec<String> {
    (0..count)
        .map(|idx| format!("Leeds-010620-12AB34567{idx}-T12345-Smith-John-ORIG.mp4"))
        .collect()
}

fn reference() -> Arc<ReferenceData> {
    Arc::new(
        ReferenceData::default()
            .with_site("LEEDS", "Leeds Youth Court")
            .with_site("BIRMINGHAM", "Birmingham Crown Court"),
    )
}

struct Harness {
    tracker: Arc<MemoryMigrationRecordStore>,
    sink: Arc<MemoryEntityStore>,
    cache: Arc<MemoryRecencyCache>,
}

impl Harness {
    fn new() -> Self {
        Self::with_sink(MemoryEntityStore::new())
    }

    fn with_sink(sink: MemoryEntityStore) -> Self {
        Self {
            tracker: Arc::new(MemoryMigrationRecordStore::new()),
            sink: Arc::new(sink),
            cache: Arc::new(MemoryRecencyCache::new("test:")),
        }
    }

    fn runner(&self, config: MigrationConfig) -> BatchRunner {
        BatchRunner::new(
            config,
            self.tracker.clone(),
            self.sink.clone(),
            self.cache.clone(),
            reference(),
        )
    }

    async fn status(&self, archive_id: &str) -> MigrationStatus {
        self.tracker
            .find_by_archive_id(archive_id)
            .await
            .unwrap()
            .expect("record exists")
            .status
    }
}

#[tokio::test]
async fn single_archive_migrates_end_to_end() {
    let harness = Harness::new();
    let report = harness
        .runner(MigrationConfig::default())
        .run(rows(&[ORIG]))
        .await
        .unwrap();

    assert_eq!(report.summary.total, 1);
    assert_eq!(report.summary.migrated, 1);
    assert_eq!(report.summary.unaccounted, 0);

    let record = harness.tracker.find_by_archive_id(ORIG).await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::Success);
    assert!(record.is_most_recent);
    assert!(record.recording_id.is_some());

    let stored = harness.sink.snapshot().await;
    assert_eq!(stored.cases.len(), 1);
    assert_eq!(stored.recordings.len(), 1);
    assert_eq!(stored.bookings.len(), 1);
    let case = stored.cases.values().next().unwrap();
    assert_eq!(case.reference, "12AB345678");
    assert_eq!(report.migrated_items[0].court, "Leeds Youth Court");
}

#[tokio::test]
async fn orig_and_copy_share_group_entities() {
    let harness = Harness::new();
    let report = harness
        .runner(MigrationConfig::default())
        .run(rows(&[ORIG, COPY_2]))
        .await
        .unwrap();
    assert_eq!(report.summary.migrated, 2);

    let stored = harness.sink.snapshot().await;
    assert_eq!(stored.cases.len(), 1);
    assert_eq!(stored.bookings.len(), 1);
    assert_eq!(stored.capture_sessions.len(), 1);
    assert_eq!(stored.recordings.len(), 2);

    let orig = stored.recordings.values().find(|r| r.archive_id == ORIG).unwrap();
    let copy = stored.recordings.values().find(|r| r.archive_id == COPY_2).unwrap();
    assert_eq!(orig.version, 1);
    assert_eq!(copy.version, 2);
    assert_eq!(copy.parent_recording_id, Some(orig.id));
}

#[tokio::test]
async fn superseded_copy_is_not_most_recent() {
    let harness = Harness::new();
    let report = harness
        .runner(MigrationConfig::default())
        .run(rows(&[ORIG, COPY_2, COPY_3]))
        .await
        .unwrap();

    assert_eq!(report.summary.migrated, 2);
    assert_eq!(report.failures.count(FailureCategory::NotMostRecent), 1);
    assert_eq!(harness.status(COPY_2).await, MigrationStatus::Failed);
    assert_eq!(harness.status(COPY_3).await, MigrationStatus::Success);

    let flagged: Vec<_> = harness
        .tracker
        .all()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.is_most_recent)
        .map(|r| r.archive_id)
        .collect();
    assert_eq!(flagged.len(), 2);
    assert!(flagged.contains(&COPY_3.to_string()));
}

fn permutations(names: &[&'static str]) -> Vec<Vec<&'static str>> {
    if names.len() <= 1 {
        return vec![names.to_vec()];
    }
    let mut out = Vec::new();
    for idx in 0..names.len() {
        let mut rest = names.to_vec();
        let head = rest.remove(idx);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}

#[tokio::test]
async fn recency_ignores_input_order_and_chunk_size() {
    for order in permutations(&[ORIG, COPY_2, COPY_3]) {
        for chunk_size in [1, 2, 100] {
            let harness = Harness::new();
            let config = MigrationConfig {
                chunk_size,
                ..MigrationConfig::default()
            };
            let report = harness.runner(config).run(rows(&order)).await.unwrap();
            let context = format!("order {order:?}, chunk_size {chunk_size}");

            assert_eq!(report.summary.migrated, 2, "{context}");
            assert_eq!(
                report.failures.count(FailureCategory::NotMostRecent),
                1,
                "{context}"
            );
            assert_eq!(harness.status(ORIG).await, MigrationStatus::Success, "{context}");
            assert_eq!(harness.status(COPY_2).await, MigrationStatus::Failed, "{context}");
            assert_eq!(harness.status(COPY_3).await, MigrationStatus::Success, "{context}");

            let stored = harness.sink.snapshot().await;
            assert_eq!(stored.recordings.len(), 2, "{context}");
            let orig = stored.recordings.values().find(|r| r.archive_id == ORIG).unwrap();
            let copy = stored.recordings.values().find(|r| r.archive_id == COPY_3).unwrap();
            assert_eq!(copy.parent_recording_id, Some(orig.id), "{context}");
        }
    }
}

#[tokio::test]
async fn copy_listed_before_its_orig_finds_the_parent() {
    for chunk_size in [1, 100] {
        let harness = Harness::new();
        let config = MigrationConfig {
            chunk_size,
            ..MigrationConfig::default()
        };
        let report = harness
            .runner(config)
            .run(rows(&[COPY_2, ORIG]))
            .await
            .unwrap();

        assert_eq!(report.summary.migrated, 2, "chunk_size {chunk_size}");
        assert_eq!(report.failures.count(FailureCategory::NoParentFound), 0);
        assert_eq!(harness.status(COPY_2).await, MigrationStatus::Success);

        let stored = harness.sink.snapshot().await;
        let orig = stored.recordings.values().find(|r| r.archive_id == ORIG).unwrap();
        let copy = stored.recordings.values().find(|r| r.archive_id == COPY_2).unwrap();
        assert_eq!(copy.parent_recording_id, Some(orig.id));
    }
}

#[tokio::test]
async fn junk_names_fail_without_stopping_the_run() {
    let harness = Harness::new();
    let report = harness
        .runner(MigrationConfig::default())
        .run(rows(&["random_junk_file", ORIG]))
        .await
        .unwrap();

    assert_eq!(report.summary.migrated, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.failures.count(FailureCategory::ParseError), 1);
    assert_eq!(harness.status("random_junk_file").await, MigrationStatus::Failed);
    assert_eq!(report.summary.unaccounted, 0);
}

#[tokio::test]
async fn rerunning_the_same_input_changes_nothing() {
    let harness = Harness::new();
    let names = [ORIG, COPY_2, "random_junk_file"];
    harness
        .runner(MigrationConfig::default())
        .run(rows(&names))
        .await
        .unwrap();
    let before = harness.sink.snapshot().await;

    let second = harness
        .runner(MigrationConfig::default())
        .run(rows(&names))
        .await
        .unwrap();
    assert_eq!(second.summary.total, 3);
    assert_eq!(second.summary.duplicates, 3);
    assert_eq!(second.summary.migrated, 0);
    assert_eq!(second.summary.unaccounted, 0);

    let after = harness.sink.snapshot().await;
    assert_eq!(after.recordings.len(), before.recordings.len());
    assert_eq!(after.cases.len(), before.cases.len());
    assert_eq!(harness.tracker.len().await, 3);
}

#[tokio::test]
async fn skip_limit_allows_exactly_the_configured_failures() {
    let names = distinct_origs(4);
    let config = MigrationConfig {
        skip_limit: 2,
        ..MigrationConfig::default()
    };

    let sink = MemoryEntityStore::new()
        .reject_recording_for(names[0].clone())
        .reject_recording_for(names[1].clone());
    let harness = Harness::with_sink(sink);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let report = harness.runner(config.clone()).run(rows(&refs)).await.unwrap();
    assert_eq!(report.summary.migrated, 2);
    assert_eq!(report.failures.count(FailureCategory::WriteError), 2);
    assert_eq!(harness.status(&names[0]).await, MigrationStatus::Failed);

    let sink = MemoryEntityStore::new()
        .reject_recording_for(names[0].clone())
        .reject_recording_for(names[1].clone())
        .reject_recording_for(names[2].clone());
    let harness = Harness::with_sink(sink);
    let err = harness.runner(config).run(rows(&refs)).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::SkipLimitExceeded { limit: 2, skipped: 3 }
    ));
    assert!(harness.sink.snapshot().await.recordings.is_empty());
}

#[tokio::test]
async fn business_failures_do_not_count_toward_the_skip_limit() {
    let harness = Harness::new();
    let config = MigrationConfig {
        skip_limit: 0,
        ..MigrationConfig::default()
    };
    let report = harness
        .runner(config)
        .run(rows(&["random_junk_file", "more_junk", ORIG]))
        .await
        .unwrap();
    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.summary.migrated, 1);
}

#[tokio::test]
async fn malformed_rows_are_reported_and_counted() {
    let harness = Harness::new();
    let config = MigrationConfig {
        skip_limit: 1,
        ..MigrationConfig::default()
    };
    let mut input = rows(&[ORIG]);
    input.push(Err(MalformedRow {
        line: 3,
        archive_name: Some("Leeds-bad-row.mp4".into()),
        message: "duration 'abc' is not a number".into(),
    }));

    let report = harness.runner(config.clone()).run(input).await.unwrap();
    assert_eq!(report.failures.count(FailureCategory::MalformedRow), 1);
    assert_eq!(report.summary.unaccounted, 0);
    assert_eq!(harness.status("Leeds-bad-row.mp4").await, MigrationStatus::Failed);

    let harness = Harness::new();
    let input: Vec<SourceRow> = (0..2)
        .map(|line| {
            Err(MalformedRow {
                line,
                archive_name: None,
                message: "missing archive name".into(),
            })
        })
        .collect();
    let err = harness.runner(config).run(input).await.unwrap_err();
    assert!(matches!(err, PipelineError::SkipLimitExceeded { .. }));
}

#[tokio::test]
async fn transient_commit_failures_are_retried() {
    let harness = Harness::with_sink(MemoryEntityStore::new().fail_next_commits(2));
    let config = MigrationConfig {
        chunk_retry_attempts: 3,
        ..MigrationConfig::default()
    };
    let report = harness.runner(config).run(rows(&[ORIG, COPY_2])).await.unwrap();
    assert_eq!(report.summary.migrated, 2);
    assert_eq!(harness.sink.snapshot().await.recordings.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_abort_and_leave_records_pending() {
    let harness = Harness::with_sink(MemoryEntityStore::new().fail_next_commits(3));
    let config = MigrationConfig {
        chunk_retry_attempts: 3,
        ..MigrationConfig::default()
    };
    let err = harness
        .runner(config)
        .run(rows(&[ORIG, COPY_2]))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Infrastructure { attempts: 3, .. }));
    assert!(harness.sink.snapshot().await.recordings.is_empty());
    assert_eq!(harness.status(ORIG).await, MigrationStatus::Pending);
    assert_eq!(harness.status(COPY_2).await, MigrationStatus::Pending);
}

#[tokio::test]
async fn slow_commits_time_out() {
    let harness = Harness::with_sink(
        MemoryEntityStore::new().with_commit_delay(Duration::from_millis(1500)),
    );
    let config = MigrationConfig {
        commit_timeout_secs: 1,
        chunk_retry_attempts: 1,
        ..MigrationConfig::default()
    };
    let err = harness.runner(config).run(rows(&[ORIG])).await.unwrap_err();
    assert!(matches!(err, PipelineError::Infrastructure { attempts: 1, .. }));
    assert!(harness.sink.snapshot().await.recordings.is_empty());
}

/// Delegates to the memory store, failing the first calls of two
/// operations with `Unavailable`.
struct FlakyTracker {
    inner: MemoryMigrationRecordStore,
    metadata_failures: AtomicUsize,
    success_failures: AtomicUsize,
}

impl FlakyTracker {
    fn new(metadata_failures: usize, success_failures: usize) -> Self {
        Self {
            inner: MemoryMigrationRecordStore::new(),
            metadata_failures: AtomicUsize::new(metadata_failures),
            success_failures: AtomicUsize::new(success_failures),
        }
    }

    fn blip(counter: &AtomicUsize) -> Result<(), TrackerError> {
        let left = counter.load(Ordering::SeqCst);
        if left > 0 {
            counter.store(left - 1, Ordering::SeqCst);
            return Err(TrackerError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationRecordStore for FlakyTracker {
    async fn upsert(&self, raw: &RawArchiveRecord) -> Result<UpsertOutcome, TrackerError> {
        self.inner.upsert(raw).await
    }

    async fn insert_pending(&self, raw: &RawArchiveRecord) -> Result<bool, TrackerError> {
        self.inner.insert_pending(raw).await
    }

    async fn update_metadata_fields(
        &self,
        archive_id: &str,
        fields: &MetadataFields,
    ) -> Result<String, TrackerError> {
        Self::blip(&self.metadata_failures)?;
        self.inner.update_metadata_fields(archive_id, fields).await
    }

    async fn set_most_recent(
        &self,
        archive_id: &str,
        is_most_recent: bool,
    ) -> Result<(), TrackerError> {
        self.inner.set_most_recent(archive_id, is_most_recent).await
    }

    async fn mark_success(&self, archive_id: &str, ids: EntityIds) -> Result<(), TrackerError> {
        Self::blip(&self.success_failures)?;
        self.inner.mark_success(archive_id, ids).await
    }

    async fn mark_failed(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError> {
        self.inner.mark_failed(archive_id, failure).await
    }

    async fn mark_skipped(&self, archive_id: &str, failure: &Failure) -> Result<(), TrackerError> {
        self.inner.mark_skipped(archive_id, failure).await
    }

    async fn reset_to_pending(&self, archive_id: &str) -> Result<(), TrackerError> {
        self.inner.reset_to_pending(archive_id).await
    }

    async fn find_by_archive_id(
        &self,
        archive_id: &str,
    ) -> Result<Option<MigrationRecord>, TrackerError> {
        self.inner.find_by_archive_id(archive_id).await
    }

    async fn find_by_archive_name(
        &self,
        archive_name: &str,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.inner.find_by_archive_name(archive_name).await
    }

    async fn find_by_status(
        &self,
        status: MigrationStatus,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.inner.find_by_status(status).await
    }

    async fn find_by_group_key_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.inner.find_by_group_key_prefix(prefix).await
    }

    async fn all(&self) -> Result<Vec<MigrationRecord>, TrackerError> {
        self.inner.all().await
    }
}

fn flaky_runner(
    tracker: Arc<FlakyTracker>,
    sink: Arc<MemoryEntityStore>,
    attempts: u32,
) -> BatchRunner {
    let config = MigrationConfig {
        chunk_retry_attempts: attempts,
        ..MigrationConfig::default()
    };
    BatchRunner::new(
        config,
        tracker,
        sink,
        Arc::new(MemoryRecencyCache::new("flaky:")),
        reference(),
    )
}

#[tokio::test]
async fn transient_tracker_failures_are_retried() {
    let tracker = Arc::new(FlakyTracker::new(1, 1));
    let sink = Arc::new(MemoryEntityStore::new());
    let report = flaky_runner(tracker.clone(), sink.clone(), 3)
        .run(rows(&[ORIG, COPY_2]))
        .await
        .unwrap();

    assert_eq!(report.summary.migrated, 2);
    assert_eq!(sink.snapshot().await.recordings.len(), 2);
    for archive_id in [ORIG, COPY_2] {
        let record = tracker.find_by_archive_id(archive_id).await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Success);
    }
}

#[tokio::test]
async fn a_tracker_outage_aborts_as_infrastructure_failure() {
    let tracker = Arc::new(FlakyTracker::new(usize::MAX, 0));
    let sink = Arc::new(MemoryEntityStore::new());
    let err = flaky_runner(tracker.clone(), sink.clone(), 2)
        .run(rows(&[ORIG]))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Infrastructure { attempts: 2, .. }));
    assert!(sink.snapshot().await.recordings.is_empty());
    let record = tracker.find_by_archive_id(ORIG).await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::Pending);
}

#[tokio::test]
async fn an_interrupted_run_resumes_pending_records() {
    let harness = Harness::with_sink(MemoryEntityStore::new().fail_next_commits(1));
    let config = MigrationConfig {
        chunk_retry_attempts: 1,
        ..MigrationConfig::default()
    };
    assert!(harness
        .runner(config.clone())
        .run(rows(&[ORIG]))
        .await
        .is_err());
    assert_eq!(harness.status(ORIG).await, MigrationStatus::Pending);

    let report = harness.runner(config).run(Vec::new()).await.unwrap();
    assert_eq!(report.summary.total, 1);
    assert_eq!(report.summary.migrated, 1);
    assert_eq!(harness.status(ORIG).await, MigrationStatus::Success);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_chunk() {
    let harness = Harness::new();
    let config = MigrationConfig {
        chunk_size: 1,
        ..MigrationConfig::default()
    };
    let runner = harness.runner(config);
    runner.cancel_handle().cancel();

    let report = runner.run(rows(&[ORIG, COPY_2])).await.unwrap();
    assert!(report.summary.cancelled);
    assert_eq!(report.summary.migrated, 0);
    assert_eq!(report.summary.unaccounted, 2);
    assert_eq!(harness.status(ORIG).await, MigrationStatus::Pending);
}

#[tokio::test]
async fn dry_run_builds_without_writing() {
    let harness = Harness::new();
    let config = MigrationConfig {
        dry_run: true,
        ..MigrationConfig::default()
    };
    let report = harness
        .runner(config)
        .run(rows(&[ORIG, COPY_2, "random_junk_file"]))
        .await
        .unwrap();

    assert!(report.summary.dry_run);
    assert_eq!(report.summary.migrated, 2);
    assert_eq!(report.summary.failed, 1);
    assert!(harness.sink.snapshot().await.recordings.is_empty());
    for archive_id in [ORIG, COPY_2, "random_junk_file"] {
        assert_eq!(harness.status(archive_id).await, MigrationStatus::Pending);
    }
}

#[tokio::test]
async fn exclusions_and_pre_existing_names_are_skipped() {
    let harness = Harness::new();
    let pre = "Leeds-010620-12AB345678-PRE-Smith-John-ORIG.mp4";
    let runner = harness
        .runner(MigrationConfig::default())
        .with_exclusions([COPY_2.to_string()].into_iter().collect());

    let report = runner.run(rows(&[ORIG, COPY_2, pre])).await.unwrap();
    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.failures.count(FailureCategory::Excluded), 1);
    assert_eq!(report.failures.count(FailureCategory::PreExisting), 1);
    assert_eq!(harness.status(COPY_2).await, MigrationStatus::Skipped);
    assert_eq!(harness.status(pre).await, MigrationStatus::Skipped);
    assert_eq!(report.summary.unaccounted, 0);
}

#[tokio::test]
async fn missing_archive_id_aborts_the_run() {
    let harness = Harness::new();
    let input = vec![Ok(raw(ORIG).with_archive_id("  "))];
    let err = harness
        .runner(MigrationConfig::default())
        .run(input)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Contract(_)));
}

#[tokio::test]
async fn run_report_is_written_as_csv() {
    let harness = Harness::new();
    let report = harness
        .runner(MigrationConfig::default())
        .run(rows(&[ORIG, "random_junk_file"]))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let paths = write_report_csv(&report, dir.path()).unwrap();
    let failures = std::fs::read_to_string(&paths[0]).unwrap();
    assert!(failures.contains("PARSE_ERROR,FAILED,1,random_junk_file"));
    let migrated = std::fs::read_to_string(&paths[1]).unwrap();
    assert!(migrated.contains(ORIG));
    assert!(migrated.contains("Leeds Youth Court"));
}
