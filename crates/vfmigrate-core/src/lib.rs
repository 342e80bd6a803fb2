pub mod config;
pub mod entities;
pub mod error;
pub mod failure;
pub mod orchestrator;
pub mod reference;
pub mod report;
pub mod source;
pub mod tracker;
pub mod transform;
pub mod validation;
pub mod versioning;
pub mod writer;

#[cfg(feature = "runtime")]
pub mod db;

pub use config::MigrationConfig;
pub use error::{PipelineError, Result};
pub use failure::{Failure, FailureCategory};
pub use orchestrator::{BatchRunner, CancelHandle};
pub use reference::ReferenceData;
pub use report::{write_report_csv, RunReport, RunSummary};
pub use source::{RawArchiveRecord, SourceRow};
pub use tracker::{MemoryMigrationRecordStore, MigrationRecordStore, MigrationStatus};
pub use versioning::{MemoryRecencyCache, RecencyCache};
pub use writer::{EntitySink, MemoryEntityStore};
