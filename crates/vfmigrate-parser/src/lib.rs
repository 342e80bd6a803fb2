pub mod errors;
pub mod grammars;
pub mod model;
mod registry;
pub mod sanitize;
pub mod screening;

pub use errors::{GrammarAttempt, ParseError};
pub use grammars::{
    all_grammar_descriptors, default_grammars, grammar_by_name, GrammarDescriptor, RegexGrammar,
};
pub use model::{
    group_key, normalize_name, strip_extension, ExtractedMetadata, GrammarMatch, ParseHints,
    VersionLabel,
};
pub use registry::{
    parse_archive_name, parse_with, parse_with_grammars, parse_with_hints, ArchiveGrammar,
    STRUCTURED_GRAMMAR,
};
pub use sanitize::{is_pre_existing, sanitize_archive_name};
pub use screening::{matched_test_keyword, DEFAULT_TEST_KEYWORDS};
