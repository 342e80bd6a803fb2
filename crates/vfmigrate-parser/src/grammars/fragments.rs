//! Pattern fragments shared by the grammar templates.
//!
//! Templates reference fragments by `{token}`. The optional exhibit slots
//! (`{exhibit?}`, `{exhibit0?}`) expand to nothing when a template is built
//! without its exhibit.

pub(crate) const SEPARATOR: &str = r"[-_\s]+";
pub(crate) const SEPARATOR_OPTIONAL: &str = r"[-_\s]?";
pub(crate) const COURT: &str = r"(?P<court>[A-Za-z]+)";
pub(crate) const DATE: &str = r"(?P<date>\d{6}|\d{2}-\d{2}-\d{4}|\d{2}/\d{2}/\d{4})";
pub(crate) const URN: &str = r"(?P<urn>[A-Za-z0-9]{2,14})";
pub(crate) const EXHIBIT: &str = r"(?P<exhibit>[A-Za-z][A-Za-z0-9]{5,9})";
pub(crate) const NAMES: &str = concat!(
    r"(?P<defendant>[A-Za-z']+(?:[-\s][A-Za-z0-9&]+)*)",
    r"[-_\s]+",
    r"(?P<witness>[A-Za-z0-9&']+(?:[-'\s][A-Za-z]+)*)"
);
pub(crate) const VERSION: &str = concat!(
    r"(?:(?P<version_type>ORIG|COPY|CPY|ORG|ORI|OR|CO|COP)",
    r"(?:[-_\s]*(?P<version_number>\d+(?:\.\d+)?))?)?"
);
pub(crate) const EXTENSION: &str = r"(?:\.(?P<ext>[A-Za-z0-9]{2,4}))?";

/// Tokens an exhibit capture must not start with.
pub(crate) const IGNORED_WORDS: &[&str] = &["QC", "CP-Case", "CP CASE", "-CP-", "AS URN"];

pub(crate) fn starts_with_ignored_word(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    IGNORED_WORDS
        .iter()
        .any(|word| upper.starts_with(&word.to_ascii_uppercase()))
}

/// Expands a grammar template into an anchored, case-insensitive pattern.
pub(crate) fn expand(template: &str, with_exhibit: bool) -> String {
    let optional_exhibit = if with_exhibit {
        format!("(?:{EXHIBIT}{SEPARATOR})?")
    } else {
        String::new()
    };
    let optional_exhibit_tight = if with_exhibit {
        format!("(?:{EXHIBIT}{SEPARATOR_OPTIONAL})?")
    } else {
        String::new()
    };

    let body = template
        .replace("{exhibit?}", &optional_exhibit)
        .replace("{exhibit0?}", &optional_exhibit_tight)
        .replace("{court}", COURT)
        .replace("{date}", DATE)
        .replace("{urn}", URN)
        .replace("{exhibit}", EXHIBIT)
        .replace("{names}", NAMES)
        .replace("{sep0}", SEPARATOR_OPTIONAL)
        .replace("{sep}", SEPARATOR)
        .replace("{version}", VERSION)
        .replace("{ext}", EXTENSION);

    format!("(?i)^{body}$")
}

pub(crate) fn has_optional_exhibit(template: &str) -> bool {
    template.contains("{exhibit?}") || template.contains("{exhibit0?}")
}
