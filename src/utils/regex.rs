use regex::Regex;
use std::sync::LazyLock;

/// Compiled regex patterns that are reused across the codebase
pub struct RegexPatterns;

impl RegexPatterns {
    /// Regex for matching punctuation (anything that is not a word char or whitespace)
    pub fn punctuation() -> &'static Regex {
        static RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"[^\w\s]").expect("Failed to compile punctuation regex"));
        &RE
    }

    /// Regex for matching whitespace runs before a newline
    pub fn space_before_newline() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"[ \t]+\n").expect("Failed to compile space-before-newline regex")
        });
        &RE
    }

    /// Regex for matching runs of two or more spaces/tabs
    pub fn space_runs() -> &'static Regex {
        static RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("Failed to compile space-runs regex"));
        &RE
    }
}
