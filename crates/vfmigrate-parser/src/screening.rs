/// Keywords that mark an archive as test or training material.
pub const DEFAULT_TEST_KEYWORDS: &[&str] = &[
    "test",
    "demo",
    "training",
    "sample",
    "mock",
    "dummy",
    "example",
    "playback",
    "predefined",
    "unknown",
    "t35t",
];

/// Returns the first keyword contained in `archive_name`, compared without
/// regard to case.
pub fn matched_test_keyword<'a, S: AsRef<str>>(
    archive_name: &str,
    keywords: &'a [S],
) -> Option<&'a str> {
    let lowered = archive_name.to_lowercase();
    keywords
        .iter()
        .map(|keyword| -> &'a str { keyword.as_ref() })
        .find(|keyword| !keyword.is_empty() && lowered.contains(&keyword.to_lowercase()))
}
