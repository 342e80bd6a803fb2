use crate::errors::{GrammarAttempt, ParseError};
use crate::grammars::default_grammars;
use crate::model::{
    has_text, non_empty, normalize_name, ExtractedMetadata, GrammarMatch, ParseHints, VersionLabel,
};
use crate::sanitize::sanitize_archive_name;

pub const STRUCTURED_GRAMMAR: &str = "structured";

pub trait ArchiveGrammar: Send + Sync {
    fn name(&self) -> &'static str;
    fn match_name(&self, archive_name: &str) -> Result<GrammarMatch, ParseError>;
}

pub fn parse_archive_name(archive_name: &str) -> Result<ExtractedMetadata, ParseError> {
    parse_with(archive_name, None, default_grammars())
}

pub fn parse_with_hints(
    archive_name: &str,
    hints: Option<&ParseHints>,
) -> Result<ExtractedMetadata, ParseError> {
    parse_with(archive_name, hints, default_grammars())
}

pub fn parse_with_grammars(
    archive_name: &str,
    grammars: &[&dyn ArchiveGrammar],
) -> Result<ExtractedMetadata, ParseError> {
    parse_with(archive_name, None, grammars)
}

pub fn parse_with(
    archive_name: &str,
    hints: Option<&ParseHints>,
    grammars: &[&dyn ArchiveGrammar],
) -> Result<ExtractedMetadata, ParseError> {
    if archive_name.trim().is_empty() {
        return Err(ParseError::EmptyArchiveName);
    }

    let sanitized = sanitize_archive_name(archive_name);
    let mut attempts = Vec::new();

    for grammar in grammars {
        match grammar.match_name(&sanitized) {
            Ok(matched) => {
                return assemble(archive_name, sanitized, grammar.name(), matched, hints);
            }
            Err(ParseError::GrammarMismatch { reason, .. }) => {
                attempts.push(GrammarAttempt::new(grammar.name(), reason));
            }
            Err(err) => return Err(err),
        }
    }

    if let Some(hints) = hints.filter(|hints| hints.is_complete()) {
        let matched = GrammarMatch {
            extension: extension_of(&sanitized),
            ..GrammarMatch::default()
        };
        return assemble(archive_name, sanitized, STRUCTURED_GRAMMAR, matched, Some(hints));
    }

    Err(ParseError::NoMatchingGrammar {
        archive_name: archive_name.to_string(),
        attempts,
    })
}

fn assemble(
    archive_name: &str,
    sanitized: String,
    grammar: &'static str,
    matched: GrammarMatch,
    hints: Option<&ParseHints>,
) -> Result<ExtractedMetadata, ParseError> {
    let hints = hints.cloned().unwrap_or_default();

    let court = non_empty(matched.court).or(non_empty(hints.court_reference));
    let urn = non_empty(matched.urn)
        .or(non_empty(hints.urn))
        .map(|value| value.to_uppercase());
    let exhibit = non_empty(matched.exhibit)
        .or(non_empty(hints.exhibit_reference))
        .map(|value| value.to_uppercase());
    let defendant = non_empty(matched.defendant)
        .or(non_empty(hints.defendant_last_name))
        .map(|value| normalize_name(&value));
    let witness = non_empty(matched.witness)
        .or(non_empty(hints.witness_first_name))
        .map(|value| normalize_name(&value));
    let label = matched
        .version_type
        .as_deref()
        .and_then(VersionLabel::from_token)
        .or(hints.version_label);
    let version_number = non_empty(matched.version_number)
        .or(non_empty(hints.version_number))
        .unwrap_or_else(|| "1".to_string());
    let extension = non_empty(matched.extension)
        .or(non_empty(hints.file_extension))
        .map(|value| value.trim_start_matches('.').to_ascii_lowercase());

    match (court, defendant, witness, label) {
        (Some(court), Some(defendant), Some(witness), Some(label))
            if urn.is_some() || exhibit.is_some() =>
        {
            Ok(ExtractedMetadata {
                grammar,
                archive_name: archive_name.to_string(),
                sanitized_archive_name: sanitized,
                court_reference: court,
                date: non_empty(matched.date),
                urn,
                supplementary_urn: non_empty(matched.urn2).map(|value| value.to_uppercase()),
                exhibit_reference: exhibit,
                supplementary_exhibit_reference: non_empty(matched.exhibit2)
                    .map(|value| value.to_uppercase()),
                defendant_last_name: defendant,
                witness_first_name: witness,
                version_label: label,
                version_number,
                file_extension: extension,
            })
        }
        (court, defendant, witness, label) => {
            let mut missing = Vec::new();
            if court.is_none() {
                missing.push("court");
            }
            if urn.is_none() && exhibit.is_none() {
                missing.push("urn_or_exhibit");
            }
            if defendant.is_none() {
                missing.push("defendant_last_name");
            }
            if witness.is_none() {
                missing.push("witness_first_name");
            }
            if label.is_none() {
                missing.push("version_label");
            }
            Err(ParseError::IncompleteMetadata {
                grammar,
                archive_name: archive_name.to_string(),
                missing,
            })
        }
    }
}

fn extension_of(name: &str) -> Option<String> {
    let (stem, extension) = name.rsplit_once('.')?;
    let extension = Some(extension.to_string());
    if stem.is_empty() || !has_text(&extension) {
        return None;
    }
    extension
}
