use std::fmt;

use serde::{Deserialize, Serialize};
use vfmigrate_parser::ParseError;

/// Stable tags for every way an archive can end up FAILED or SKIPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    ParseError,
    IncompleteData,
    PreExisting,
    Excluded,
    PredatesGoLive,
    TestData,
    InvalidExtension,
    MissingTimestamp,
    MissingCourt,
    UnknownCourt,
    NotMostRecent,
    CaseReferenceInvalid,
    CaseReferenceTooLong,
    CaseReferenceTooShort,
    NoParentFound,
    MalformedRow,
    WriteError,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 17] = [
        FailureCategory::ParseError,
        FailureCategory::IncompleteData,
        FailureCategory::PreExisting,
        FailureCategory::Excluded,
        FailureCategory::PredatesGoLive,
        FailureCategory::TestData,
        FailureCategory::InvalidExtension,
        FailureCategory::MissingTimestamp,
        FailureCategory::MissingCourt,
        FailureCategory::UnknownCourt,
        FailureCategory::NotMostRecent,
        FailureCategory::CaseReferenceInvalid,
        FailureCategory::CaseReferenceTooLong,
        FailureCategory::CaseReferenceTooShort,
        FailureCategory::NoParentFound,
        FailureCategory::MalformedRow,
        FailureCategory::WriteError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::ParseError => "PARSE_ERROR",
            FailureCategory::IncompleteData => "INCOMPLETE_DATA",
            FailureCategory::PreExisting => "PRE_EXISTING",
            FailureCategory::Excluded => "EXCLUDED",
            FailureCategory::PredatesGoLive => "PREDATES_GO_LIVE",
            FailureCategory::TestData => "TEST_DATA",
            FailureCategory::InvalidExtension => "INVALID_EXTENSION",
            FailureCategory::MissingTimestamp => "MISSING_TIMESTAMP",
            FailureCategory::MissingCourt => "MISSING_COURT",
            FailureCategory::UnknownCourt => "UNKNOWN_COURT",
            FailureCategory::NotMostRecent => "NOT_MOST_RECENT",
            FailureCategory::CaseReferenceInvalid => "CASE_REFERENCE_INVALID",
            FailureCategory::CaseReferenceTooLong => "CASE_REFERENCE_TOO_LONG",
            FailureCategory::CaseReferenceTooShort => "CASE_REFERENCE_TOO_SHORT",
            FailureCategory::NoParentFound => "NO_PARENT_FOUND",
            FailureCategory::MalformedRow => "MALFORMED_ROW",
            FailureCategory::WriteError => "WRITE_ERROR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(tag.trim()))
    }

    /// Categories that mark an archive SKIPPED rather than FAILED.
    pub fn is_skip(&self) -> bool {
        matches!(self, FailureCategory::PreExisting | FailureCategory::Excluded)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business outcome that stops one archive without stopping the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub category: FailureCategory,
    pub message: String,
}

impl Failure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl From<&ParseError> for Failure {
    fn from(err: &ParseError) -> Self {
        let category = match err {
            ParseError::IncompleteMetadata { .. } => FailureCategory::IncompleteData,
            _ => FailureCategory::ParseError,
        };
        Failure::new(category, err.to_string())
    }
}
