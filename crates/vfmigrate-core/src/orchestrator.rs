//! Batch driver: ingest rows, then move PENDING archives through
//! transform, validate and write one chunk at a time.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};
use vfmigrate_parser::{is_pre_existing, ArchiveGrammar, VersionLabel};

use crate::config::MigrationConfig;
use crate::entities::{EntityBuilder, EntityGraph, EntityIndex, EntityKind};
use crate::error::{PipelineError, Result};
use crate::failure::{Failure, FailureCategory};
use crate::reference::ReferenceData;
use crate::report::{MigratedItem, RunReport};
use crate::source::{MalformedRow, RawArchiveRecord, SourceRow};
use crate::tracker::{MetadataFields, MigrationRecord, MigrationRecordStore, MigrationStatus};
use crate::transform::{ProcessedRecording, ServiceResult, Transformer};
use crate::validation::{ValidatedRecording, ValidationRules, Validator};
use crate::versioning::{replay_from_records, RecencyCache, VersionResolver};
use crate::writer::{EntitySink, SinkError};

/// Stops a run before its next chunk. The chunk in flight finishes or rolls
/// back.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RunState {
    report: RunReport,
    item_errors: usize,
    processed: usize,
    committed: EntityIndex,
    inserted: HashSet<String>,
    inputs: HashMap<String, RawArchiveRecord>,
    dry_run_skipped: HashSet<String>,
}

enum ChunkError {
    Transient(SinkError),
    Fatal(PipelineError),
}

struct ChunkWrite {
    overlay: EntityIndex,
    written: Vec<(usize, EntityGraph)>,
    rejected: Vec<(usize, SinkError)>,
}

pub struct BatchRunner {
    config: MigrationConfig,
    tracker: Arc<dyn MigrationRecordStore>,
    sink: Arc<dyn EntitySink>,
    cache: Arc<dyn RecencyCache>,
    transformer: Transformer,
    validator: Validator,
    builder: EntityBuilder,
    exclusions: HashSet<String>,
    clear_cache: bool,
    cancel: CancelHandle,
}

impl BatchRunner {
    pub fn new(
        config: MigrationConfig,
        tracker: Arc<dyn MigrationRecordStore>,
        sink: Arc<dyn EntitySink>,
        cache: Arc<dyn RecencyCache>,
        reference: Arc<ReferenceData>,
    ) -> Self {
        let resolver = VersionResolver::new(Arc::clone(&cache));
        let transformer = Transformer::new(reference, resolver.clone());
        let validator = Validator::new(ValidationRules::from(&config), resolver);
        Self {
            config,
            tracker,
            sink,
            cache,
            transformer,
            validator,
            builder: EntityBuilder::default(),
            exclusions: HashSet::new(),
            clear_cache: false,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_exclusions(mut self, exclusions: HashSet<String>) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_grammars(mut self, grammars: Vec<&'static dyn ArchiveGrammar>) -> Self {
        self.transformer = self.transformer.with_grammars(grammars);
        self
    }

    pub fn with_builder(mut self, builder: EntityBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Empty the recency cache namespace before replaying tracker records.
    pub fn clear_cache_on_start(mut self, clear: bool) -> Self {
        self.clear_cache = clear;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub async fn run(&self, rows: Vec<SourceRow>) -> Result<RunReport> {
        let started = Instant::now();
        match self.run_inner(rows, started).await {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Migration run aborted"
                );
                Err(err)
            }
        }
    }

    async fn run_inner(&self, rows: Vec<SourceRow>, started: Instant) -> Result<RunReport> {
        self.config.validate()?;
        info!(
            rows = rows.len(),
            chunk_size = self.config.chunk_size,
            workers = self.config.workers,
            dry_run = self.config.dry_run,
            "Starting migration run"
        );

        if self.clear_cache {
            let cleared = self.cache.clear().await?;
            info!(cleared, "Cleared recency cache");
        }
        let existing = self.tracker.all().await?;
        replay_from_records(self.cache.as_ref(), &existing).await?;

        let mut state = RunState {
            committed: self.sink.load_index().await?,
            ..RunState::default()
        };

        self.ingest(rows, &mut state).await?;

        let mut pending: Vec<MigrationRecord> = self
            .tracker
            .find_by_status(MigrationStatus::Pending)
            .await?
            .into_iter()
            .filter(|record| !state.dry_run_skipped.contains(&record.archive_id))
            .collect();
        let resumed = pending
            .iter()
            .filter(|record| !state.inserted.contains(&record.archive_id))
            .count();
        state.report.summary.total += resumed;
        if resumed > 0 {
            info!(resumed, "Resuming archives left PENDING by an earlier run");
        }
        self.observe_pending(&mut pending, &state).await?;

        for (chunk_index, chunk) in pending.chunks(self.config.chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                warn!(chunk = chunk_index, "Migration run cancelled before chunk");
                state.report.summary.cancelled = true;
                break;
            }
            self.process_chunk(chunk_index, chunk, &mut state).await?;
        }

        let mut report = state.report;
        report.summary.failed = report.failures.failed();
        report.summary.skipped = report.failures.skipped();
        report.summary.dry_run = self.config.dry_run;
        report.summary.elapsed_ms = started.elapsed().as_millis();
        report.summary.recompute_unaccounted();

        info!(
            total = report.summary.total,
            migrated = report.summary.migrated,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            duplicates = report.summary.duplicates,
            unaccounted = report.summary.unaccounted,
            elapsed_ms = report.summary.elapsed_ms as u64,
            cancelled = report.summary.cancelled,
            "Migration run finished"
        );
        Ok(report)
    }

    async fn ingest(&self, rows: Vec<SourceRow>, state: &mut RunState) -> Result<()> {
        state.report.summary.total += rows.len();
        for row in rows {
            let raw = match row {
                Ok(raw) => raw,
                Err(malformed) => {
                    self.record_malformed(malformed, state).await?;
                    continue;
                }
            };
            if raw.archive_id.trim().is_empty() {
                return Err(PipelineError::Contract(format!(
                    "source row '{}' has no archive id",
                    raw.archive_name
                )));
            }

            if !self.tracker.insert_pending(&raw).await? {
                // A row still PENDING from an interrupted run is migrated with
                // this one rather than counted as a duplicate.
                let resumable = !state.inserted.contains(&raw.archive_id)
                    && self
                        .tracker
                        .find_by_archive_id(&raw.archive_id)
                        .await?
                        .is_some_and(|record| record.status == MigrationStatus::Pending);
                if !resumable {
                    debug!(archive_id = %raw.archive_id, "Archive already tracked");
                    state.report.summary.duplicates += 1;
                    continue;
                }
            }
            state.inserted.insert(raw.archive_id.clone());

            let skip = if is_pre_existing(&raw.archive_name) {
                Some(Failure::new(
                    FailureCategory::PreExisting,
                    "recording was migrated before this run",
                ))
            } else if self.exclusions.contains(&raw.archive_id) {
                Some(Failure::new(FailureCategory::Excluded, "archive is on the exclusion list"))
            } else {
                None
            };
            match skip {
                Some(failure) => {
                    if self.config.dry_run {
                        state.dry_run_skipped.insert(raw.archive_id.clone());
                    }
                    self.fail_item(&raw, failure, state).await?;
                }
                None => {
                    state.inputs.insert(raw.archive_id.clone(), raw);
                }
            }
        }
        Ok(())
    }

    /// Records the version of every pending archive in the recency cache
    /// before any chunk runs, so recency and parent checks see the whole
    /// dataset whatever the chunking or input order. ORIG archives are then
    /// moved ahead of COPY archives so parents are written first.
    async fn observe_pending(
        &self,
        pending: &mut Vec<MigrationRecord>,
        state: &RunState,
    ) -> Result<()> {
        let resolver = self.transformer.resolver();
        let mut labels = HashMap::new();
        for record in pending.iter() {
            let raw = state
                .inputs
                .get(&record.archive_id)
                .cloned()
                .unwrap_or_else(|| record.to_raw());
            // Unparseable names fail inside their chunk.
            let Ok(metadata) = self.transformer.parse(&raw) else {
                continue;
            };
            let fields = MetadataFields::from(&metadata);
            let group_key = metadata.group_key();
            let (archive_id, fields, group_key, metadata) =
                (raw.archive_id.as_str(), &fields, group_key.as_str(), &metadata);
            self.retrying("observe", move || async move {
                self.tracker.update_metadata_fields(archive_id, fields).await?;
                resolver
                    .resolve(metadata.version_label, &metadata.version_number, group_key)
                    .await?;
                Ok::<_, PipelineError>(())
            })
            .await?;
            labels.insert(record.archive_id.clone(), metadata.version_label);
        }
        pending.sort_by_key(|record| labels.get(&record.archive_id) != Some(&VersionLabel::Orig));
        debug!(observed = labels.len(), pending = pending.len(), "Observed pending versions");
        Ok(())
    }

    /// Runs `op` until it succeeds, fails permanently, or has failed
    /// transiently `chunk_retry_attempts` times. Every retried step must be
    /// safe to repeat.
    async fn retrying<T, F, Fut>(&self, step: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.chunk_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(step, attempt, error = %err, "Transient failure; retrying");
                }
                Err(err) if err.is_transient() => {
                    return Err(PipelineError::Infrastructure {
                        attempts: attempt,
                        message: err.to_string(),
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_malformed(&self, row: MalformedRow, state: &mut RunState) -> Result<()> {
        warn!(line = row.line, message = %row.message, "Malformed source row");
        let label = row
            .archive_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("line {}", row.line));
        state
            .report
            .failures
            .record(FailureCategory::MalformedRow, &label);

        if let Some(name) = row.archive_name.filter(|name| !name.trim().is_empty()) {
            let raw = RawArchiveRecord::new(name);
            if self.tracker.insert_pending(&raw).await? {
                state.inserted.insert(raw.archive_id.clone());
                if self.config.dry_run {
                    state.dry_run_skipped.insert(raw.archive_id.clone());
                } else {
                    let failure = Failure::new(FailureCategory::MalformedRow, row.message);
                    self.tracker.mark_failed(&raw.archive_id, &failure).await?;
                }
            }
        }
        self.count_item_error(state)
    }

    fn count_item_error(&self, state: &mut RunState) -> Result<()> {
        state.item_errors += 1;
        if state.item_errors > self.config.skip_limit {
            return Err(PipelineError::SkipLimitExceeded {
                limit: self.config.skip_limit,
                skipped: state.item_errors,
            });
        }
        Ok(())
    }

    async fn fail_item(
        &self,
        raw: &RawArchiveRecord,
        failure: Failure,
        state: &mut RunState,
    ) -> Result<()> {
        warn!(
            archive_id = %raw.archive_id,
            category = %failure.category,
            message = %failure.message,
            "Archive not migrated"
        );
        state
            .report
            .failures
            .record(failure.category, &raw.archive_name);
        if !self.config.dry_run {
            let (archive_id, failure) = (raw.archive_id.as_str(), &failure);
            self.retrying("mark", move || async move {
                if failure.category.is_skip() {
                    self.tracker.mark_skipped(archive_id, failure).await?;
                } else {
                    self.tracker.mark_failed(archive_id, failure).await?;
                }
                Ok::<_, PipelineError>(())
            })
            .await?;
        }
        self.tick(state);
        Ok(())
    }

    fn tick(&self, state: &mut RunState) {
        state.processed += 1;
        if self.config.progress_every > 0 && state.processed % self.config.progress_every == 0 {
            info!(
                processed = state.processed,
                total = state.report.summary.total,
                migrated = state.report.summary.migrated,
                "Migration progress"
            );
        }
    }

    async fn transform_item(
        &self,
        raw: &RawArchiveRecord,
    ) -> Result<ServiceResult<ProcessedRecording>> {
        let metadata = match self.transformer.parse(raw) {
            Ok(metadata) => metadata,
            Err(failure) => return Ok(Err(failure)),
        };
        self.tracker
            .update_metadata_fields(&raw.archive_id, &MetadataFields::from(&metadata))
            .await?;
        self.transformer
            .transform_extracted(raw, metadata)
            .await
            .map(Ok)
    }

    async fn process_chunk(
        &self,
        chunk_index: usize,
        chunk: &[MigrationRecord],
        state: &mut RunState,
    ) -> Result<()> {
        let raws: Vec<RawArchiveRecord> = chunk
            .iter()
            .map(|record| {
                state
                    .inputs
                    .get(&record.archive_id)
                    .cloned()
                    .unwrap_or_else(|| record.to_raw())
            })
            .collect();

        let raws = &raws;
        let outcomes = self
            .retrying("prepare", move || self.prepare_chunk(raws))
            .await?;

        let mut validated = Vec::new();
        for (raw, outcome) in raws.iter().zip(outcomes) {
            match outcome {
                Ok(valid) => validated.push((raw, valid)),
                Err(failure) => self.fail_item(raw, failure, state).await?,
            }
        }

        self.write_chunk(chunk_index, validated, state).await
    }

    /// Transforms and validates one chunk without touching run state, so a
    /// transient failure can rerun it from the start.
    async fn prepare_chunk(
        &self,
        raws: &[RawArchiveRecord],
    ) -> Result<Vec<ServiceResult<ValidatedRecording>>> {
        let transformed: Vec<Result<ServiceResult<ProcessedRecording>>> = stream::iter(raws.iter())
            .map(|raw| self.transform_item(raw))
            .buffered(self.config.workers)
            .collect()
            .await;

        let resolver = self.transformer.resolver();
        let mut outcomes = Vec::with_capacity(raws.len());
        for (raw, outcome) in raws.iter().zip(transformed) {
            let mut processed = match outcome? {
                Ok(processed) => processed,
                Err(failure) => {
                    outcomes.push(Err(failure));
                    continue;
                }
            };
            let current = resolver
                .is_current(
                    processed.version_label(),
                    &processed.metadata.version_number,
                    &processed.group_key,
                )
                .await?;
            processed.version.is_most_recent = current;
            self.tracker.set_most_recent(&raw.archive_id, current).await?;
            outcomes.push(self.validator.validate(processed, raw).await?);
        }
        Ok(outcomes)
    }

    async fn write_chunk(
        &self,
        chunk_index: usize,
        validated: Vec<(&RawArchiveRecord, ValidatedRecording)>,
        state: &mut RunState,
    ) -> Result<()> {
        if validated.is_empty() {
            return Ok(());
        }

        if self.config.dry_run {
            let mut overlay = EntityIndex::default();
            for (_, valid) in &validated {
                let graph = self.builder.build(valid, &state.committed, &overlay);
                overlay.record(&graph, None);
                self.record_migrated(valid, &graph, state);
            }
            state.committed.merge(overlay);
            debug!(chunk = chunk_index, items = validated.len(), "Dry run chunk built");
            return Ok(());
        }

        let attempts = self.config.chunk_retry_attempts.max(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.try_write_chunk(&validated, state).await {
                Ok(outcome) => break outcome,
                Err(ChunkError::Transient(err)) if attempt < attempts => {
                    warn!(
                        chunk = chunk_index,
                        attempt,
                        error = %err,
                        "Transient failure writing chunk; retrying"
                    );
                }
                Err(ChunkError::Transient(err)) => {
                    return Err(PipelineError::Infrastructure {
                        attempts: attempt,
                        message: err.to_string(),
                    })
                }
                Err(ChunkError::Fatal(err)) => return Err(err),
            }
        };

        state.committed.merge(outcome.overlay);
        for (idx, graph) in &outcome.written {
            let (_, valid) = &validated[*idx];
            self.retrying("mark", move || async move {
                self.tracker
                    .mark_success(valid.archive_id(), graph.ids())
                    .await
                    .map_err(PipelineError::from)
            })
            .await?;
            self.record_migrated(valid, graph, state);
        }
        for (idx, err) in outcome.rejected {
            let raw = validated[idx].0;
            state.item_errors += 1;
            self.fail_item(raw, Failure::new(FailureCategory::WriteError, err.to_string()), state)
                .await?;
        }

        info!(
            chunk = chunk_index,
            attempt,
            written = outcome.written.len(),
            item_errors = state.item_errors,
            "Committed chunk"
        );
        Ok(())
    }

    async fn try_write_chunk(
        &self,
        validated: &[(&RawArchiveRecord, ValidatedRecording)],
        state: &RunState,
    ) -> std::result::Result<ChunkWrite, ChunkError> {
        let mut tx = self.sink.begin_chunk().await.map_err(classify)?;
        let mut write = ChunkWrite {
            overlay: EntityIndex::default(),
            written: Vec::new(),
            rejected: Vec::new(),
        };

        for (idx, (raw, valid)) in validated.iter().enumerate() {
            let graph = self.builder.build(valid, &state.committed, &write.overlay);
            match tx.persist(&graph).await {
                Ok(()) => {
                    write.overlay.record(&graph, None);
                    write.written.push((idx, graph));
                }
                Err(err) if err.is_transient() => return Err(ChunkError::Transient(err)),
                Err(err) => {
                    warn!(
                        archive_id = %raw.archive_id,
                        error = %err,
                        "Entity write rejected"
                    );
                    let failed_at = err.rejected_at().unwrap_or(EntityKind::User);
                    write.overlay.record(&graph, Some(failed_at));
                    write.rejected.push((idx, err));

                    let skipped = state.item_errors + write.rejected.len();
                    if skipped > self.config.skip_limit {
                        return Err(ChunkError::Fatal(PipelineError::SkipLimitExceeded {
                            limit: self.config.skip_limit,
                            skipped,
                        }));
                    }
                }
            }
        }

        let timeout = self.config.commit_timeout();
        match tokio::time::timeout(timeout, tx.commit()).await {
            Ok(Ok(())) => Ok(write),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(ChunkError::Transient(SinkError::Timeout(timeout))),
        }
    }

    fn record_migrated(&self, valid: &ValidatedRecording, graph: &EntityGraph, state: &mut RunState) {
        let recording = valid.recording();
        state.report.summary.migrated += 1;
        state.report.migrated_items.push(MigratedItem {
            archive_id: recording.archive_id.clone(),
            archive_name: recording.archive_name().to_string(),
            case_reference: valid.case_reference().to_string(),
            court: valid.court().name.clone(),
            version_label: recording.version_label().to_string(),
            version_number: recording.metadata.version_number.clone(),
            recording_id: graph.recording.id,
        });
        self.tick(state);
    }
}

fn classify(err: SinkError) -> ChunkError {
    if err.is_transient() {
        ChunkError::Transient(err)
    } else {
        ChunkError::Fatal(PipelineError::Sink(err))
    }
}
