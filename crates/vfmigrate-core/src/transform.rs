use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vfmigrate_parser::{parse_with, ArchiveGrammar, ExtractedMetadata, VersionLabel};

use crate::error::{PipelineError, Result};
use crate::failure::Failure;
use crate::reference::{Contact, CourtRef, ReferenceData};
use crate::source::RawArchiveRecord;
use crate::versioning::{Resolution, VersionResolver};

/// Outcome of a step that can stop a single archive for a business reason.
pub type ServiceResult<T> = std::result::Result<T, Failure>;

const URN_CASE_REFERENCE_MIN: usize = 9;
const EXHIBIT_CASE_REFERENCE_MIN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    Open,
    Closed,
}

impl CaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseState::Open => "OPEN",
            CaseState::Closed => "CLOSED",
        }
    }
}

/// An archive after parsing, court lookup and version resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecording {
    pub archive_id: String,
    pub metadata: ExtractedMetadata,
    pub court: Option<CourtRef>,
    pub court_from_sentinel: bool,
    pub case_reference: String,
    pub case_state: CaseState,
    pub recording_timestamp: Option<NaiveDateTime>,
    pub duration_secs: Option<i64>,
    pub file_name: Option<String>,
    pub file_size: Option<String>,
    pub group_key: String,
    pub version: Resolution,
    pub contacts: Vec<Contact>,
}

impl ProcessedRecording {
    pub fn archive_name(&self) -> &str {
        &self.metadata.archive_name
    }

    pub fn version_label(&self) -> VersionLabel {
        self.metadata.version_label
    }

    pub fn is_most_recent(&self) -> bool {
        self.version.is_most_recent
    }
}

/// Case key: the URN when it is long enough, else a long enough exhibit
/// reference, else empty.
pub fn derive_case_reference(urn: Option<&str>, exhibit_reference: Option<&str>) -> String {
    let urn = urn.map(|v| v.trim().to_uppercase()).unwrap_or_default();
    if urn.chars().count() >= URN_CASE_REFERENCE_MIN {
        return urn;
    }
    let exhibit = exhibit_reference
        .map(|v| v.trim().to_uppercase())
        .unwrap_or_default();
    if exhibit.chars().count() >= EXHIBIT_CASE_REFERENCE_MIN {
        return exhibit;
    }
    String::new()
}

/// Reads the date embedded in an archive name (`ddmmyy`, `dmmyy`,
/// `dd-mm-yyyy` or `dd/mm/yyyy`).
pub fn parse_name_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    match value.len() {
        5 if value.chars().all(|c| c.is_ascii_digit()) => {
            NaiveDate::parse_from_str(&format!("0{value}"), "%d%m%y").ok()
        }
        6 => NaiveDate::parse_from_str(value, "%d%m%y").ok(),
        _ => NaiveDate::parse_from_str(value, "%d-%m-%Y")
            .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
            .ok(),
    }
}

pub struct Transformer {
    reference: Arc<ReferenceData>,
    resolver: VersionResolver,
    grammars: Option<Vec<&'static dyn ArchiveGrammar>>,
}

impl Transformer {
    pub fn new(reference: Arc<ReferenceData>, resolver: VersionResolver) -> Self {
        Self {
            reference,
            resolver,
            grammars: None,
        }
    }

    /// Restricts parsing to the given grammars, in order.
    pub fn with_grammars(mut self, grammars: Vec<&'static dyn ArchiveGrammar>) -> Self {
        self.grammars = Some(grammars);
        self
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    pub fn parse(&self, raw: &RawArchiveRecord) -> ServiceResult<ExtractedMetadata> {
        let parsed = match &self.grammars {
            Some(grammars) => parse_with(&raw.archive_name, raw.hints.as_ref(), grammars),
            None => parse_with(
                &raw.archive_name,
                raw.hints.as_ref(),
                vfmigrate_parser::default_grammars(),
            ),
        };
        parsed.map_err(|err| Failure::from(&err))
    }

    pub async fn transform_raw(
        &self,
        raw: &RawArchiveRecord,
    ) -> Result<ServiceResult<ProcessedRecording>> {
        let metadata = match self.parse(raw) {
            Ok(metadata) => metadata,
            Err(failure) => return Ok(Err(failure)),
        };
        self.transform_extracted(raw, metadata).await.map(Ok)
    }

    /// Builds the processed record for an already parsed archive. Resolving
    /// the version records the sighting in the recency cache.
    pub async fn transform_extracted(
        &self,
        raw: &RawArchiveRecord,
        metadata: ExtractedMetadata,
    ) -> Result<ProcessedRecording> {
        if raw.archive_id.trim().is_empty() {
            return Err(PipelineError::Contract(format!(
                "archive '{}' reached the transformer without an archive id",
                raw.archive_name
            )));
        }
        if metadata.court_reference.trim().is_empty() {
            return Err(PipelineError::Contract(format!(
                "archive '{}' has no court reference after parsing",
                raw.archive_id
            )));
        }

        let site = self.reference.resolve_site(&metadata.court_reference);
        let court = self.reference.court_by_name(&site.court_name).cloned();

        let group_key = metadata.group_key();
        let version = self
            .resolver
            .resolve(metadata.version_label, &metadata.version_number, &group_key)
            .await?;

        let case_reference = derive_case_reference(
            metadata.urn.as_deref(),
            metadata.exhibit_reference.as_deref(),
        );
        let recording_timestamp = raw.create_time.or_else(|| {
            metadata
                .date
                .as_deref()
                .and_then(parse_name_date)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        });
        let contacts = self.reference.contacts_for(&metadata.archive_name).to_vec();
        let case_state = if contacts.is_empty() {
            CaseState::Closed
        } else {
            CaseState::Open
        };

        debug!(
            archive_id = %raw.archive_id,
            grammar = metadata.grammar,
            group_key = %group_key,
            is_most_recent = version.is_most_recent,
            "Transformed archive"
        );

        Ok(ProcessedRecording {
            archive_id: raw.archive_id.clone(),
            court,
            court_from_sentinel: site.from_sentinel,
            case_reference,
            case_state,
            recording_timestamp,
            duration_secs: raw.duration_secs,
            file_name: raw.file_name.clone(),
            file_size: raw.file_size.clone(),
            group_key,
            version,
            contacts,
            metadata,
        })
    }
}
