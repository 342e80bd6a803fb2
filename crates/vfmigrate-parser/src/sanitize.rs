use once_cell::sync::Lazy;
use regex::Regex;

static LEADING_QC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^QC(?:[_\d]|[-\s]+)").expect("leading QC pattern"));
static TRAILING_QC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[-_\s]QC\d*(\.[A-Za-z0-9]+)?$").expect("trailing QC pattern")
});
static TRAILING_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[-_\s]*(?:CP[-\s]Case|AS URN)(\.[A-Za-z0-9]+)?$").expect("marker pattern")
});
static UNDERSCORE_BEFORE_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\.[A-Za-z0-9]+)$").expect("underscore pattern"));
static SEPARATOR_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_\s]{2,}").expect("separator pattern"));

/// Removes quality-control and case markers that operators appended to
/// archive names, leaving a name the grammars can match.
pub fn sanitize_archive_name(archive_name: &str) -> String {
    let mut name = archive_name.trim().to_string();
    name = LEADING_QC.replace(&name, "").into_owned();
    name = TRAILING_QC.replace(&name, "${1}").into_owned();
    name = TRAILING_MARKER.replace(&name, "${1}").into_owned();
    name = UNDERSCORE_BEFORE_EXTENSION.replace(&name, "${1}").into_owned();
    name = SEPARATOR_RUNS.replace_all(&name, "-").into_owned();
    name.trim().to_string()
}

/// Names carrying `-PRE-` belong to recordings that already exist in the
/// target system.
pub fn is_pre_existing(archive_name: &str) -> bool {
    archive_name.to_ascii_uppercase().contains("-PRE-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_qc_markers() {
        assert_eq!(
            sanitize_archive_name("QC_Leeds-010620-12AB345678-Smith-John-ORIG.mp4"),
            "Leeds-010620-12AB345678-Smith-John-ORIG.mp4"
        );
        assert_eq!(
            sanitize_archive_name("Leeds-010620-12AB345678-Smith-John-ORIG_QC2.mp4"),
            "Leeds-010620-12AB345678-Smith-John-ORIG.mp4"
        );
    }

    #[test]
    fn strips_trailing_case_markers_and_collapses_separators() {
        assert_eq!(
            sanitize_archive_name("Leeds-010620-12AB345678--Smith__John-ORIG CP-Case.mp4"),
            "Leeds-010620-12AB345678-Smith-John-ORIG.mp4"
        );
        assert_eq!(
            sanitize_archive_name("Leeds-010620-12AB345678-Smith-John-ORIG_.mp4"),
            "Leeds-010620-12AB345678-Smith-John-ORIG.mp4"
        );
    }

    #[test]
    fn leaves_plain_names_alone() {
        let name = "Leeds-010620-12AB345678-T12345-Smith-John-ORIG.mp4";
        assert_eq!(sanitize_archive_name(name), name);
    }

    #[test]
    fn detects_pre_existing_names() {
        assert!(is_pre_existing("Leeds-PRE-Smith-John-ORIG.mp4"));
        assert!(!is_pre_existing("Leeds-010620-PREST-Smith-ORIG.mp4"));
    }
}
