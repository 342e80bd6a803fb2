mod fragments;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::errors::ParseError;
use crate::model::GrammarMatch;
use crate::registry::ArchiveGrammar;

use fragments::{expand, has_optional_exhibit, starts_with_ignored_word};

#[derive(Debug, Clone)]
pub struct GrammarDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub template: &'static str,
}

/// Built-in grammars, most specific first. Earlier entries win when several
/// grammars accept the same name.
static GRAMMARS: Lazy<Vec<GrammarDescriptor>> = Lazy::new(|| {
    vec![
        GrammarDescriptor {
            name: "special_case_short_date",
            description: "Five digit legacy date with a required exhibit and optional _QC tail",
            template: r"{court}{sep}(?P<date>\d{5}){sep}{urn}{sep}{exhibit}{sep}{names}{sep}{version}(?:_QC)?{ext}",
        },
        GrammarDescriptor {
            name: "double_urn_dot_witness",
            description: "Two URNs where the witness slot holds a single dot",
            template: r"{court}{sep}(?P<date>\d{6}){sep}{urn}{sep}(?P<urn2>\d+[A-Za-z]{1,2}\d+){sep}(?P<defendant>[A-Za-z']+(?:[-\s][A-Za-z0-9&]+)*){sep}(?P<witness>\.){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "double_date",
            description: "Court and date repeated before the URN, numbered witness",
            template: r"{court}{sep}{date}{sep}(?P<court2>[A-Za-z]+){sep}(?P<date2>\d{6}|\d{2}-\d{2}-\d{4}|\d{2}/\d{2}/\d{4}){sep}{urn}{sep}(?P<defendant>[A-Za-z]+){sep}(?P<witness>Witness\d+){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "no_urn",
            description: "A dot in place of the URN followed by an exhibit",
            template: r"{court}{sep}{date}{sep}\.{sep}{exhibit}{sep}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "prefix_in_exhibit_position",
            description: "S28, NEW or QC marker where the exhibit would sit",
            template: r"{court}{sep}{date}{sep}{urn}{sep}(?:S?28|NEW|QC){sep}(?P<defendant>[A-Za-z'\-\s]+){sep}(?P<witness>[A-Za-z'\-\s]+){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "specific_exhibit",
            description: "Court, date, URN and a required exhibit",
            template: r"{court}{sep}{date}{sep}{urn}{sep}{exhibit}{sep}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "double_urn",
            description: "Second URN of the digits-letters-digits form, no exhibit",
            template: r"{court}{sep}{date}{sep}{urn}{sep}(?P<urn2>\d+[A-Za-z]{1,2}\d+){sep}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "double_exhibit",
            description: "Two exhibits and no URN",
            template: r"{court}{sep}{date}{sep}{exhibit}{sep}(?P<exhibit2>[A-Za-z]*\d+){sep}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "urn_extra_id",
            description: "Numeric identifier of six or more digits after the URN",
            template: r"{court}{sep}{date}{sep}{urn}{sep}(?P<extra_id>\d{6,}){sep}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "standard",
            description: "Court, date, URN, optional exhibit, names and version",
            template: r"{court}{sep}{date}{sep}{urn}{sep}{exhibit?}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "standard_numeric_prefix",
            description: "Standard layout with a short numeric prefix before the URN",
            template: r"{court}{sep}{date}{sep}(?:\d{1,5}[-_\s])?{urn}{sep}{exhibit?}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "prefix",
            description: "Standard layout behind an S28, NEW or QC prefix",
            template: r"(?:(?:S28|NEW|QC)[-_\s]+)?{court}{sep}{date}{sep}{urn}{sep}{exhibit?}{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "post_urn_prefix",
            description: "Optional S28 marker between the URN and the names",
            template: r"{court}{sep}{date}{sep}{urn}{sep}(?:S28[-_\s]+)?{names}{sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "witness_parens",
            description: "Witness followed by a short parenthesised qualifier",
            template: r"{court}{sep}{date}{sep}{urn}{sep}{exhibit?}(?P<defendant>[A-Za-z']+(?:[-\s][A-Za-z0-9&]+)*){sep}(?P<witness>[A-Za-z0-9&']+(?:[-'\s][A-Za-z]+)*(?:\s*\([A-Za-z0-9&+'\-]{1,6}\))?){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "dots_in_name",
            description: "Participant names containing dots",
            template: r"{court}{sep}(?P<date>\d{6}){sep}(?P<urn>[A-Za-z0-9]+){sep}(?P<exhibit>[A-Za-z]\d{6,9}){sep}(?P<defendant>[A-Za-z'.\-\s]+){sep}(?P<witness>[A-Za-z'.\-\s]+){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "plus_in_name",
            description: "Participant names containing plus signs or digits",
            template: r"{court}{sep}{date}{sep}{urn}{sep}{exhibit}{sep}(?P<defendant>[A-Za-z0-9&+'\s-]+){sep}(?P<witness>[A-Za-z0-9&+'\s-]+){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "no_exhibit_dot_separator",
            description: "URN separated from loose names by dots or separators",
            template: r"{court}{sep}{date}{sep}{urn}[-_\s.]+(?P<defendant>[A-Za-z'\-\s]+){sep}(?P<witness>[A-Za-z'\-\s]+){sep}{version}{ext}",
        },
        GrammarDescriptor {
            name: "flexible",
            description: "Run-together URN pair with optional separators throughout",
            template: r"{court}{sep}{date}{sep0}{urn}(?P<urn2>[A-Za-z0-9]{11}){sep0}{exhibit0?}{names}{sep0}{version}{ext}",
        },
    ]
});

static COMPILED: Lazy<Vec<RegexGrammar>> = Lazy::new(|| {
    GRAMMARS
        .iter()
        .map(|descriptor| {
            RegexGrammar::compile(descriptor).unwrap_or_else(|err| {
                panic!("built-in grammar {} failed to compile: {err}", descriptor.name)
            })
        })
        .collect()
});

static DEFAULT_GRAMMARS: Lazy<Vec<&'static dyn ArchiveGrammar>> = Lazy::new(|| {
    COMPILED
        .iter()
        .map(|grammar| grammar as &dyn ArchiveGrammar)
        .collect()
});

pub fn all_grammar_descriptors() -> &'static [GrammarDescriptor] {
    GRAMMARS.as_slice()
}

pub fn default_grammars() -> &'static [&'static dyn ArchiveGrammar] {
    DEFAULT_GRAMMARS.as_slice()
}

pub fn grammar_by_name(name: &str) -> Option<&'static RegexGrammar> {
    COMPILED.iter().find(|grammar| grammar.name == name)
}

/// A grammar backed by a compiled pattern. Grammars with an optional exhibit
/// slot keep a second pattern without it, used when the exhibit-shaped token
/// turns out to be an ignored marker.
#[derive(Debug)]
pub struct RegexGrammar {
    name: &'static str,
    pattern: Regex,
    without_exhibit: Option<Regex>,
}

impl RegexGrammar {
    pub fn compile(descriptor: &GrammarDescriptor) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&expand(descriptor.template, true))?;
        let without_exhibit = if has_optional_exhibit(descriptor.template) {
            Some(Regex::new(&expand(descriptor.template, false))?)
        } else {
            None
        };
        Ok(Self {
            name: descriptor.name,
            pattern,
            without_exhibit,
        })
    }

    fn mismatch(&self, reason: impl Into<String>) -> ParseError {
        ParseError::GrammarMismatch {
            grammar: self.name,
            reason: reason.into(),
        }
    }
}

impl ArchiveGrammar for RegexGrammar {
    fn name(&self) -> &'static str {
        self.name
    }

    fn match_name(&self, archive_name: &str) -> Result<GrammarMatch, ParseError> {
        let captures = self
            .pattern
            .captures(archive_name)
            .ok_or_else(|| self.mismatch("pattern did not match"))?;
        let matched = to_grammar_match(&captures);

        let Some(exhibit) = matched.exhibit.as_deref() else {
            return Ok(matched);
        };
        if !starts_with_ignored_word(exhibit) {
            return Ok(matched);
        }

        match &self.without_exhibit {
            Some(fallback) => fallback
                .captures(archive_name)
                .map(|captures| to_grammar_match(&captures))
                .ok_or_else(|| {
                    self.mismatch(format!("exhibit slot holds ignored word '{exhibit}'"))
                }),
            None => Err(self.mismatch(format!("exhibit slot holds ignored word '{exhibit}'"))),
        }
    }
}

fn to_grammar_match(captures: &Captures<'_>) -> GrammarMatch {
    let field = |name: &str| {
        captures
            .name(name)
            .map(|m| m.as_str().trim().to_string())
            .filter(|value| !value.is_empty())
    };

    GrammarMatch {
        court: field("court"),
        date: field("date"),
        urn: field("urn"),
        urn2: field("urn2"),
        exhibit: field("exhibit"),
        exhibit2: field("exhibit2"),
        defendant: field("defendant"),
        witness: field("witness"),
        version_type: field("version_type"),
        version_number: field("version_number"),
        extension: field("ext"),
    }
}
