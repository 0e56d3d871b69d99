//! Commit-message keyword filter.
//!
//! A message passes when any of its word tokens stems to one of the configured
//! keywords (`fixes`, `fixed`, `fixing` all stem to `fix`).

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("valid regex"));

/// Stemmed keyword matcher over commit messages.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    stems: BTreeSet<String>,
}

impl MessageFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stems: keywords
                .into_iter()
                .map(|keyword| stem(&keyword.as_ref().to_ascii_lowercase()))
                .collect(),
        }
    }

    pub fn matches(&self, message: &str) -> bool {
        WORD.find_iter(message)
            .map(|token| stem(&token.as_str().to_ascii_lowercase()))
            .any(|token| self.stems.contains(&token))
    }
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self::new(["fix"])
    }
}

/// Reduce an inflected lowercase word to its stem.
///
/// Covers plural and verb-inflection suffixes (`-s`, `-es`, `-ies`, `-ed`,
/// `-ing`) and a trailing silent `e`, which is all a keyword match needs.
pub fn stem(word: &str) -> String {
    let mut word = word.to_string();

    if let Some(base) = word.strip_suffix("sses") {
        word = format!("{base}ss");
    } else if let Some(base) = word.strip_suffix("ies") {
        word = format!("{base}i");
    } else if word.ends_with("xes") || word.ends_with("ches") || word.ends_with("shes") {
        word.truncate(word.len() - 2);
    } else if word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") && word.len() > 3
    {
        word.pop();
    }

    for suffix in ["ing", "ed"] {
        if let Some(base) = word.strip_suffix(suffix)
            && base.len() >= 2
            && base.chars().any(is_vowel)
        {
            word = undouble(base);
            break;
        }
    }
    if word.len() > 3 && word.ends_with('e') {
        word.pop();
    }
    word
}

fn is_vowel(ch: char) -> bool {
    matches!(ch, 'a' | 'e' | 'i' | 'o' | 'u')
}

/// `stopped` -> `stopp` -> `stop`; leaves `fix`, `fall` untouched.
fn undouble(base: &str) -> String {
    let bytes = base.as_bytes();
    let n = bytes.len();
    if n >= 2 && bytes[n - 1] == bytes[n - 2] && !matches!(bytes[n - 1], b'l' | b's' | b'z') {
        return base[..n - 1].to_string();
    }
    base.to_string()
}
