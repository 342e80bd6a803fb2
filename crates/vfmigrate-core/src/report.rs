use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::failure::FailureCategory;
use crate::tracker::{MigrationRecord, MigrationStatus};
use crate::transform::derive_case_reference;

const SAMPLES_PER_CATEGORY: usize = 5;

pub const FAILURE_REPORT_FILE: &str = "Failure_Report.csv";
pub const MIGRATED_ITEMS_FILE: &str = "Migrated_Items.csv";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryCount {
    pub count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<String>,
}

/// FAILED and SKIPPED archives grouped by category, with a few sample names
/// per category for operator review.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureReport {
    pub categories: BTreeMap<FailureCategory, CategoryCount>,
}

impl FailureReport {
    pub fn record(&mut self, category: FailureCategory, archive_name: &str) {
        let entry = self.categories.entry(category).or_default();
        entry.count += 1;
        if entry.samples.len() < SAMPLES_PER_CATEGORY {
            entry.samples.push(archive_name.to_string());
        }
    }

    pub fn count(&self, category: FailureCategory) -> usize {
        self.categories.get(&category).map_or(0, |c| c.count)
    }

    pub fn failed(&self) -> usize {
        self.categories
            .iter()
            .filter(|(category, _)| !category.is_skip())
            .map(|(_, c)| c.count)
            .sum()
    }

    pub fn skipped(&self) -> usize {
        self.categories
            .iter()
            .filter(|(category, _)| category.is_skip())
            .map(|(_, c)| c.count)
            .sum()
    }

    /// Categories ordered by descending count, ties by tag.
    pub fn ranked(&self) -> Vec<(FailureCategory, &CategoryCount)> {
        let mut entries: Vec<_> = self.categories.iter().map(|(k, v)| (*k, v)).collect();
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    pub fn from_records(records: &[MigrationRecord]) -> Self {
        let mut report = FailureReport::default();
        for record in records {
            if !matches!(record.status, MigrationStatus::Failed | MigrationStatus::Skipped) {
                continue;
            }
            if let Some(category) = record.failure_category {
                report.record(category, &record.archive_name);
            }
        }
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigratedItem {
    pub archive_id: String,
    pub archive_name: String,
    pub case_reference: String,
    pub court: String,
    pub version_label: String,
    pub version_number: String,
    pub recording_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub migrated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    /// `total - migrated - failed - skipped - duplicates`; zero for a clean
    /// run.
    pub unaccounted: i64,
    pub elapsed_ms: u128,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl RunSummary {
    pub fn recompute_unaccounted(&mut self) {
        let accounted = self.migrated + self.failed + self.skipped + self.duplicates;
        self.unaccounted = self.total as i64 - accounted as i64;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub failures: FailureReport,
    #[serde(skip)]
    pub migrated_items: Vec<MigratedItem>,
}

impl RunReport {
    /// Status totals straight from the tracker, for reporting outside a run.
    pub fn from_records(records: &[MigrationRecord]) -> Self {
        let mut summary = RunSummary {
            total: records.len(),
            ..RunSummary::default()
        };
        let mut migrated_items = Vec::new();
        for record in records {
            match record.status {
                MigrationStatus::Success => {
                    summary.migrated += 1;
                    if let Some(recording_id) = record.recording_id {
                        migrated_items.push(MigratedItem {
                            archive_id: record.archive_id.clone(),
                            archive_name: record.archive_name.clone(),
                            case_reference: derive_case_reference(
                                record.urn.as_deref(),
                                record.exhibit_reference.as_deref(),
                            ),
                            court: record.court_reference.clone().unwrap_or_default(),
                            version_label: record
                                .version_label
                                .map(|l| l.to_string())
                                .unwrap_or_default(),
                            version_number: record.version_number.clone().unwrap_or_default(),
                            recording_id,
                        });
                    }
                }
                MigrationStatus::Failed => summary.failed += 1,
                MigrationStatus::Skipped => summary.skipped += 1,
                MigrationStatus::Pending => {}
            }
        }
        summary.recompute_unaccounted();
        Self {
            summary,
            failures: FailureReport::from_records(records),
            migrated_items,
        }
    }
}

#[derive(Debug, Serialize)]
struct FailureReportRow<'a> {
    category: &'a str,
    outcome: &'a str,
    count: usize,
    sample_archive_names: String,
}

/// Writes `Failure_Report.csv` and `Migrated_Items.csv` into `dir`,
/// creating it if needed.
pub fn write_report_csv(report: &RunReport, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let failure_path = dir.join(FAILURE_REPORT_FILE);
    let mut writer = csv::Writer::from_path(&failure_path)?;
    for (category, counts) in report.failures.ranked() {
        writer.serialize(FailureReportRow {
            category: category.as_str(),
            outcome: if category.is_skip() { "SKIPPED" } else { "FAILED" },
            count: counts.count,
            sample_archive_names: counts.samples.join("; "),
        })?;
    }
    writer.flush()?;

    let migrated_path = dir.join(MIGRATED_ITEMS_FILE);
    let mut writer = csv::Writer::from_path(&migrated_path)?;
    for item in &report.migrated_items {
        writer.serialize(item)?;
    }
    writer.flush()?;

    Ok(vec![failure_path, migrated_path])
}
