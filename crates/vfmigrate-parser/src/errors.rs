use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct GrammarAttempt {
    pub grammar: &'static str,
    pub message: String,
}

impl GrammarAttempt {
    pub fn new(grammar: &'static str, message: impl Into<String>) -> Self {
        Self {
            grammar,
            message: message.into(),
        }
    }
}

impl fmt::Display for GrammarAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.grammar, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{grammar} grammar mismatch: {reason}")]
    GrammarMismatch {
        grammar: &'static str,
        reason: String,
    },

    #[error("{grammar} matched '{archive_name}' but left required fields empty: {}", .missing.join(", "))]
    IncompleteMetadata {
        grammar: &'static str,
        archive_name: String,
        missing: Vec<&'static str>,
    },

    #[error("archive name must not be empty")]
    EmptyArchiveName,

    #[error("no grammar recognized '{archive_name}' ({} attempts)", .attempts.len())]
    NoMatchingGrammar {
        archive_name: String,
        attempts: Vec<GrammarAttempt>,
    },
}

impl ParseError {
    /// Stable tag used when the failure is reported per category.
    pub fn category(&self) -> &'static str {
        match self {
            ParseError::IncompleteMetadata { .. } => "INCOMPLETE_DATA",
            ParseError::GrammarMismatch { .. }
            | ParseError::EmptyArchiveName
            | ParseError::NoMatchingGrammar { .. } => "PARSE_ERROR",
        }
    }
}
