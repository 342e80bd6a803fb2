//! Adapters that turn archive listings into [`RawArchiveRecord`]s.
//!
//! Two listing shapes are supported: the delimited archive list
//! (`archive_name,create_time,duration,file_name,file_size` with an optional
//! `archive_id` column) and the per-archive XML metadata export. Rows that
//! cannot be read become [`MalformedRow`]s so the orchestrator can count them
//! against the skip limit instead of aborting.

use std::collections::HashSet;
use std::io::{BufRead, Read};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use vfmigrate_parser::ParseHints;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArchiveRecord {
    pub archive_id: String,
    pub archive_name: String,
    pub create_time: Option<NaiveDateTime>,
    pub duration_secs: Option<i64>,
    pub file_name: Option<String>,
    pub file_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<ParseHints>,
}

impl RawArchiveRecord {
    pub fn new(archive_name: impl Into<String>) -> Self {
        let archive_name = archive_name.into();
        Self {
            archive_id: archive_name.clone(),
            archive_name,
            create_time: None,
            duration_secs: None,
            file_name: None,
            file_size: None,
            hints: None,
        }
    }

    pub fn with_create_time(mut self, create_time: NaiveDateTime) -> Self {
        self.create_time = Some(create_time);
        self
    }

    pub fn with_duration(mut self, duration_secs: i64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }

    pub fn with_archive_id(mut self, archive_id: impl Into<String>) -> Self {
        self.archive_id = archive_id.into();
        self
    }

    pub fn with_hints(mut self, hints: ParseHints) -> Self {
        self.hints = Some(hints);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedRow {
    pub line: u64,
    pub archive_name: Option<String>,
    pub message: String,
}

pub type SourceRow = std::result::Result<RawArchiveRecord, MalformedRow>;

#[derive(Debug, Default, Deserialize)]
struct ArchiveListRow {
    #[serde(default)]
    archive_id: Option<String>,
    #[serde(default, alias = "ArchiveName", alias = "display_name")]
    archive_name: Option<String>,
    #[serde(default, alias = "CreateTime", alias = "create_time_ms")]
    create_time: Option<String>,
    #[serde(default, alias = "Duration")]
    duration: Option<String>,
    #[serde(default, alias = "FileName")]
    file_name: Option<String>,
    #[serde(default, alias = "FileSize")]
    file_size: Option<String>,
}

impl ArchiveListRow {
    fn is_blank(&self) -> bool {
        [
            &self.archive_id,
            &self.archive_name,
            &self.create_time,
            &self.duration,
            &self.file_name,
            &self.file_size,
        ]
        .iter()
        .all(|field| field.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

/// Reads a delimited archive list. Blank lines are dropped; rows whose
/// fields cannot be decoded are returned as [`MalformedRow`].
pub fn read_csv_listing<R: Read>(reader: R) -> Result<Vec<SourceRow>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    csv_reader.headers()?;

    let mut rows = Vec::new();
    for (index, result) in csv_reader.deserialize::<ArchiveListRow>().enumerate() {
        let line = index as u64 + 2;
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                rows.push(Err(MalformedRow {
                    line: err.position().map_or(line, |pos| pos.line()),
                    archive_name: None,
                    message: err.to_string(),
                }));
                continue;
            }
        };
        if row.is_blank() {
            continue;
        }
        rows.push(row_to_record(row, line));
    }
    Ok(rows)
}

fn row_to_record(row: ArchiveListRow, line: u64) -> SourceRow {
    let archive_name = clean(row.archive_name).unwrap_or_default();
    let duration_secs = match clean(row.duration) {
        Some(value) => match parse_duration(&value) {
            Some(secs) => Some(secs),
            None => {
                return Err(MalformedRow {
                    line,
                    archive_name: Some(archive_name),
                    message: format!("duration '{value}' is not a number of seconds"),
                })
            }
        },
        None => None,
    };

    Ok(RawArchiveRecord {
        archive_id: clean(row.archive_id).unwrap_or_else(|| archive_name.clone()),
        create_time: clean(row.create_time).and_then(|value| parse_create_time(&value)),
        duration_secs,
        file_name: clean(row.file_name),
        file_size: clean(row.file_size),
        hints: None,
        archive_name,
    })
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_duration(value: &str) -> Option<i64> {
    if let Ok(secs) = value.parse::<i64>() {
        return Some(secs);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.round() as i64)
}

const EPOCH_SECONDS_CEILING: i64 = 100_000_000_000;
const EPOCH_SENTINELS: [i64; 2] = [0, 3600];

const DATE_TIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d"];

/// Decodes an archive creation time. Epoch values below
/// 100 000 000 000 are seconds, larger ones milliseconds. The export writes
/// 0 or 3600 when the time is unknown; both decode to `None`.
pub fn parse_create_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(epoch) = value.parse::<i64>() {
        if EPOCH_SENTINELS.contains(&epoch) {
            return None;
        }
        let millis = if epoch.abs() < EPOCH_SECONDS_CEILING {
            epoch.checked_mul(1000)?
        } else {
            epoch
        };
        return DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc());
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }

    DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Archive ids listed one per line, or as the first column of a CSV with an
/// `archive_id`/`archive_name` header.
pub fn read_exclusions<R: Read>(reader: R) -> Result<HashSet<String>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut exclusions = HashSet::new();
    for (index, record) in csv_reader.records().enumerate() {
        let record = record?;
        let Some(first) = record.get(0).map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        if index == 0 && (first.eq_ignore_ascii_case("archive_id") || first.eq_ignore_ascii_case("archive_name")) {
            continue;
        }
        exclusions.insert(first.to_string());
    }
    Ok(exclusions)
}

#[derive(Debug, Default)]
struct XmlArchive {
    display_name: String,
    create_time: String,
    duration: String,
    files: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XmlField {
    DisplayName,
    CreateTime,
    Duration,
    FileName,
    FileSize,
}

/// Reads the structured archive export. Every `ArchiveFiles` element yields
/// one row per eligible MP4 file it lists.
pub fn read_xml_listing<R: BufRead>(reader: R) -> Result<Vec<SourceRow>> {
    let mut xml = quick_xml::Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    let mut rows = Vec::new();
    let mut buf = Vec::new();
    let mut archive: Option<XmlArchive> = None;
    let mut file: Option<(String, String)> = None;
    let mut field: Option<XmlField> = None;
    let mut archives_seen: u64 = 0;

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"ArchiveFiles" => {
                    archives_seen += 1;
                    archive = Some(XmlArchive::default());
                }
                b"MP4File" if archive.is_some() => file = Some((String::new(), String::new())),
                b"DisplayName" if file.is_none() => field = Some(XmlField::DisplayName),
                b"CreatTime" if file.is_none() => field = Some(XmlField::CreateTime),
                b"Duration" if file.is_none() => field = Some(XmlField::Duration),
                b"Name" if file.is_some() => field = Some(XmlField::FileName),
                b"Size" if file.is_some() => field = Some(XmlField::FileSize),
                _ => field = None,
            },
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|err| PipelineError::Xml(err.to_string()))?
                    .trim()
                    .to_string();
                match (field, archive.as_mut(), file.as_mut()) {
                    (Some(XmlField::DisplayName), Some(a), _) => a.display_name = value,
                    (Some(XmlField::CreateTime), Some(a), _) => a.create_time = value,
                    (Some(XmlField::Duration), Some(a), _) => a.duration = value,
                    (Some(XmlField::FileName), _, Some(f)) => f.0 = value,
                    (Some(XmlField::FileSize), _, Some(f)) => f.1 = value,
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"MP4File" => {
                    if let (Some(a), Some(f)) = (archive.as_mut(), file.take()) {
                        a.files.push(f);
                    }
                }
                b"ArchiveFiles" => {
                    if let Some(finished) = archive.take() {
                        rows.extend(xml_archive_rows(finished, archives_seen));
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(PipelineError::Xml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(rows)
}

fn xml_archive_rows(archive: XmlArchive, ordinal: u64) -> Vec<SourceRow> {
    if archive.display_name.is_empty() {
        return vec![Err(MalformedRow {
            line: ordinal,
            archive_name: None,
            message: "ArchiveFiles element without DisplayName".into(),
        })];
    }

    let duration_secs = match archive.duration.as_str() {
        "" => None,
        value => match parse_duration(value) {
            Some(secs) => Some(secs),
            None => {
                return vec![Err(MalformedRow {
                    line: ordinal,
                    archive_name: Some(archive.display_name),
                    message: format!("duration '{value}' is not a number of seconds"),
                })]
            }
        },
    };

    archive
        .files
        .into_iter()
        .filter(|(name, size)| is_eligible_mp4(name) && !size.is_empty())
        .map(|(name, size_kb)| {
            Ok(RawArchiveRecord {
                archive_id: archive.display_name.clone(),
                archive_name: archive.display_name.clone(),
                create_time: parse_create_time(&archive.create_time),
                duration_secs,
                file_name: Some(name),
                file_size: Some(format_file_size(&size_kb)),
                hints: None,
            })
        })
        .collect()
}

fn is_eligible_mp4(file_name: &str) -> bool {
    file_name.starts_with("0x1e") && file_name.to_ascii_lowercase().ends_with(".mp4")
}

/// Renders a size given in kilobytes the way operators read it in reports.
pub fn format_file_size(size_kb: &str) -> String {
    let Ok(kb) = size_kb.trim().parse::<f64>() else {
        return size_kb.trim().to_string();
    };
    if kb >= 1024.0 * 1024.0 {
        format!("{:.2} GB", kb / (1024.0 * 1024.0))
    } else if kb >= 1024.0 {
        format!("{:.2} MB", kb / 1024.0)
    } else {
        format!("{kb:.2} KB")
    }
}
