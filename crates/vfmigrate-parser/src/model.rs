use std::fmt;

use serde::{Deserialize, Serialize};

/// The two recording-variant classes. Each class is versioned independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VersionLabel {
    Orig,
    Copy,
}

impl VersionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionLabel::Orig => "ORIG",
            VersionLabel::Copy => "COPY",
        }
    }

    /// Maps the spellings found in legacy archive names onto a class.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "ORIG" | "ORI" | "ORG" | "OR" => Some(VersionLabel::Orig),
            "COPY" | "CPY" | "COP" | "CO" => Some(VersionLabel::Copy),
            _ => None,
        }
    }

    pub fn standardized_number(&self) -> i32 {
        match self {
            VersionLabel::Orig => 1,
            VersionLabel::Copy => 2,
        }
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for VersionLabel {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        VersionLabel::from_token(value).ok_or_else(|| format!("unknown version label '{value}'"))
    }
}

/// Raw captures of one grammar before normalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrammarMatch {
    pub court: Option<String>,
    pub date: Option<String>,
    pub urn: Option<String>,
    pub urn2: Option<String>,
    pub exhibit: Option<String>,
    pub exhibit2: Option<String>,
    pub defendant: Option<String>,
    pub witness: Option<String>,
    pub version_type: Option<String>,
    pub version_number: Option<String>,
    pub extension: Option<String>,
}

/// Structured fields supplied alongside an archive name, e.g. from a metadata
/// export. They fill captures the grammar left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseHints {
    pub court_reference: Option<String>,
    pub urn: Option<String>,
    pub exhibit_reference: Option<String>,
    pub defendant_last_name: Option<String>,
    pub witness_first_name: Option<String>,
    pub version_label: Option<VersionLabel>,
    pub version_number: Option<String>,
    pub file_extension: Option<String>,
}

impl ParseHints {
    pub fn is_complete(&self) -> bool {
        has_text(&self.court_reference)
            && has_text(&self.defendant_last_name)
            && has_text(&self.witness_first_name)
            && self.version_label.is_some()
            && (has_text(&self.urn) || has_text(&self.exhibit_reference))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedMetadata {
    pub grammar: &'static str,
    pub archive_name: String,
    pub sanitized_archive_name: String,
    pub court_reference: String,
    pub date: Option<String>,
    pub urn: Option<String>,
    /// Second URN found in the name. Kept for triage, never used as a key.
    pub supplementary_urn: Option<String>,
    pub exhibit_reference: Option<String>,
    pub supplementary_exhibit_reference: Option<String>,
    pub defendant_last_name: String,
    pub witness_first_name: String,
    pub version_label: VersionLabel,
    pub version_number: String,
    pub file_extension: Option<String>,
}

impl ExtractedMetadata {
    pub fn is_orig(&self) -> bool {
        self.version_label == VersionLabel::Orig
    }

    pub fn archive_name_without_extension(&self) -> &str {
        strip_extension(&self.archive_name)
    }

    /// Lower-cased composite clustering ORIG and COPY variants of one
    /// recording. Empty components are left out.
    pub fn group_key(&self) -> String {
        group_key(
            self.urn.as_deref(),
            self.exhibit_reference.as_deref(),
            Some(&self.witness_first_name),
            Some(&self.defendant_last_name),
        )
    }
}

pub fn group_key(
    urn: Option<&str>,
    exhibit_reference: Option<&str>,
    witness_first_name: Option<&str>,
    defendant_last_name: Option<&str>,
) -> String {
    [urn, exhibit_reference, witness_first_name, defendant_last_name]
        .into_iter()
        .flatten()
        .map(|part| normalize_name(part).to_lowercase())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("|")
}

/// Trims and collapses internal whitespace while keeping the original case.
pub fn normalize_name(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => &name[..idx],
        _ => name,
    }
}

pub(crate) fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
