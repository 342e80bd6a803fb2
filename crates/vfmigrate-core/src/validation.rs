use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use vfmigrate_parser::{matched_test_keyword, VersionLabel};

use crate::config::MigrationConfig;
use crate::failure::{Failure, FailureCategory};
use crate::reference::CourtRef;
use crate::source::RawArchiveRecord;
use crate::transform::{ProcessedRecording, ServiceResult};
use crate::versioning::{CacheError, VersionResolver};

/// A processed recording that passed every check. Court and timestamp are
/// guaranteed present; the case reference is non-empty and within bounds.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedRecording {
    recording: ProcessedRecording,
    court: CourtRef,
    recorded_at: NaiveDateTime,
}

impl ValidatedRecording {
    pub fn recording(&self) -> &ProcessedRecording {
        &self.recording
    }

    pub fn court(&self) -> &CourtRef {
        &self.court
    }

    pub fn recorded_at(&self) -> NaiveDateTime {
        self.recorded_at
    }

    pub fn case_reference(&self) -> &str {
        &self.recording.case_reference
    }

    pub fn archive_id(&self) -> &str {
        &self.recording.archive_id
    }

    pub fn into_recording(self) -> ProcessedRecording {
        self.recording
    }
}

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub go_live_date: NaiveDate,
    pub min_duration_secs: i64,
    pub test_keywords: Vec<String>,
    pub accepted_extensions: Vec<String>,
    pub case_reference_max_len: usize,
    pub case_reference_min_len: usize,
    pub strict_case_reference: bool,
    pub allow_unknown_court: bool,
}

impl From<&MigrationConfig> for ValidationRules {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            go_live_date: config.go_live_date,
            min_duration_secs: config.min_duration_secs,
            test_keywords: config.test_keywords.clone(),
            accepted_extensions: config.accepted_extensions.clone(),
            case_reference_max_len: config.case_reference_max_len,
            case_reference_min_len: config.case_reference_min_len,
            strict_case_reference: config.strict_case_reference,
            allow_unknown_court: config.allow_unknown_court,
        }
    }
}

/// Applies the business checks in a fixed order and stops at the first
/// failure.
pub struct Validator {
    rules: ValidationRules,
    resolver: VersionResolver,
}

impl Validator {
    pub fn new(rules: ValidationRules, resolver: VersionResolver) -> Self {
        Self { rules, resolver }
    }

    pub async fn validate(
        &self,
        recording: ProcessedRecording,
        raw: &RawArchiveRecord,
    ) -> Result<ServiceResult<ValidatedRecording>, CacheError> {
        let (recorded_at, court) = match self.check_record(&recording, raw) {
            Ok(found) => found,
            Err(failure) => return Ok(Err(failure)),
        };
        if let Err(failure) = self.check_parent(&recording).await? {
            return Ok(Err(failure));
        }

        Ok(Ok(ValidatedRecording {
            recording,
            court,
            recorded_at,
        }))
    }

    /// Checks one to seven; the parent check needs the cache and runs last.
    fn check_record(
        &self,
        recording: &ProcessedRecording,
        raw: &RawArchiveRecord,
    ) -> ServiceResult<(NaiveDateTime, CourtRef)> {
        self.check_go_live(recording)?;
        self.check_test_data(recording, raw)?;
        self.check_extension(recording)?;
        let recorded_at = self.check_timestamp(recording)?;
        let court = self.check_court(recording)?;
        self.check_most_recent(recording)?;
        self.check_case_reference(recording)?;
        Ok((recorded_at, court))
    }

    fn check_go_live(&self, recording: &ProcessedRecording) -> ServiceResult<()> {
        match recording.recording_timestamp {
            Some(recorded_at) if recorded_at.date() < self.rules.go_live_date => Err(Failure::new(
                FailureCategory::PredatesGoLive,
                format!(
                    "recorded {} before go-live {}",
                    recorded_at.date(),
                    self.rules.go_live_date
                ),
            )),
            _ => Ok(()),
        }
    }

    fn check_test_data(
        &self,
        recording: &ProcessedRecording,
        raw: &RawArchiveRecord,
    ) -> ServiceResult<()> {
        let keyword = matched_test_keyword(&raw.archive_name, &self.rules.test_keywords).or_else(
            || {
                raw.file_name
                    .as_deref()
                    .and_then(|name| matched_test_keyword(name, &self.rules.test_keywords))
            },
        );
        if let Some(keyword) = keyword {
            return Err(Failure::new(
                FailureCategory::TestData,
                format!("name contains test keyword '{keyword}'"),
            ));
        }
        match recording.duration_secs {
            Some(duration) if duration < self.rules.min_duration_secs => Err(Failure::new(
                FailureCategory::TestData,
                format!(
                    "duration {duration}s is below the {}s minimum",
                    self.rules.min_duration_secs
                ),
            )),
            _ => Ok(()),
        }
    }

    fn check_extension(&self, recording: &ProcessedRecording) -> ServiceResult<()> {
        let extension = recording.metadata.file_extension.as_deref().unwrap_or("");
        let accepted = !extension.is_empty()
            && self
                .rules
                .accepted_extensions
                .iter()
                .any(|ok| ok.trim_start_matches('.').eq_ignore_ascii_case(extension));
        if accepted {
            Ok(())
        } else if extension.is_empty() {
            Err(Failure::new(
                FailureCategory::InvalidExtension,
                "archive has no file extension",
            ))
        } else {
            Err(Failure::new(
                FailureCategory::InvalidExtension,
                format!("extension '.{extension}' is not accepted"),
            ))
        }
    }

    fn check_timestamp(&self, recording: &ProcessedRecording) -> ServiceResult<NaiveDateTime> {
        recording.recording_timestamp.ok_or_else(|| {
            Failure::new(
                FailureCategory::MissingTimestamp,
                "no creation time and no date in the archive name",
            )
        })
    }

    fn check_court(&self, recording: &ProcessedRecording) -> ServiceResult<CourtRef> {
        let court = recording.court.clone().ok_or_else(|| {
            Failure::new(
                FailureCategory::MissingCourt,
                format!(
                    "court '{}' is not in the court directory",
                    recording.metadata.court_reference
                ),
            )
        })?;
        if recording.court_from_sentinel && !self.rules.allow_unknown_court {
            return Err(Failure::new(
                FailureCategory::UnknownCourt,
                format!(
                    "no site mapping for court reference '{}'",
                    recording.metadata.court_reference
                ),
            ));
        }
        Ok(court)
    }

    fn check_most_recent(&self, recording: &ProcessedRecording) -> ServiceResult<()> {
        if recording.is_most_recent() {
            return Ok(());
        }
        Err(Failure::new(
            FailureCategory::NotMostRecent,
            format!(
                "{} version {} is superseded in group '{}'",
                recording.version_label(),
                recording.metadata.version_number,
                recording.group_key
            ),
        ))
    }

    fn check_case_reference(&self, recording: &ProcessedRecording) -> ServiceResult<()> {
        let reference = recording.case_reference.trim();
        let len = reference.chars().count();
        if reference.is_empty() {
            return Err(Failure::new(
                FailureCategory::CaseReferenceInvalid,
                "neither URN nor exhibit reference yields a case reference",
            ));
        }
        if len > self.rules.case_reference_max_len {
            return Err(Failure::new(
                FailureCategory::CaseReferenceTooLong,
                format!(
                    "case reference '{reference}' exceeds {} characters",
                    self.rules.case_reference_max_len
                ),
            ));
        }
        if self.rules.strict_case_reference && len < self.rules.case_reference_min_len {
            return Err(Failure::new(
                FailureCategory::CaseReferenceTooShort,
                format!(
                    "case reference '{reference}' is shorter than {} characters",
                    self.rules.case_reference_min_len
                ),
            ));
        }
        Ok(())
    }

    async fn check_parent(
        &self,
        recording: &ProcessedRecording,
    ) -> Result<ServiceResult<()>, CacheError> {
        if recording.version_label() == VersionLabel::Orig {
            return Ok(Ok(()));
        }
        if self.resolver.has_parent(&recording.group_key).await? {
            return Ok(Ok(()));
        }
        Ok(Err(Failure::new(
            FailureCategory::NoParentFound,
            format!("no ORIG recording known for group '{}'", recording.group_key),
        )))
    }
}
