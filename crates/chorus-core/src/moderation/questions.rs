// Chorus Moderation — Question Detector
// Flags chat lines that look like questions to the streamer, in English and
// Russian. Links and messages outside a sane length window never qualify.

use super::lexicon::{QUESTION_EMOJI, QUESTION_OPENERS};
use crate::atoms::constants::{QUESTION_MAX_CHARS, QUESTION_MIN_CHARS};
use regex::Regex;
use std::sync::LazyLock;

static QUESTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [
        r"(?i)можно ли",
        r"(?i)как (?:мне|ты|он|она|мы|это)",
        r"(?i)что если",
        r"(?i)почему",
        r"(?i)зачем",
        r"(?i)где находится",
        r"(?i)не знаешь ли",
        r"(?i)\b(?:is it|can i|how to|what if|why)\b",
    ];
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
});

static LINK_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)https?://|www\.|\.com|\.ru|\.net").ok());

pub fn looks_like_link(text: &str) -> bool {
    LINK_PATTERN.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
}

pub fn is_question(text: &str) -> bool {
    let raw = text.trim();
    let len = raw.chars().count();
    if !(QUESTION_MIN_CHARS..=QUESTION_MAX_CHARS).contains(&len) || looks_like_link(raw) {
        return false;
    }

    let low = raw.to_lowercase();
    let opens = QUESTION_OPENERS.iter().any(|w| {
        low == *w || low.strip_prefix(w).map(|rest| rest.starts_with(' ')).unwrap_or(false)
    });
    opens
        || QUESTION_PATTERNS.iter().any(|re| re.is_match(raw))
        || QUESTION_EMOJI.iter().any(|e| raw.contains(e))
        || raw.ends_with('?')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openers() {
        assert!(is_question("how do you aim so well"));
        assert!(is_question("Что за игра"));
        assert!(is_question("есть ли тут модеры"));
        // "is" must be a whole word
        assert!(!is_question("isolation gameplay is great"));
    }

    #[test]
    fn test_trailing_mark_and_emoji() {
        assert!(is_question("you good?"));
        assert!(is_question("that build 🤔"));
    }

    #[test]
    fn test_patterns() {
        assert!(is_question("tell me how to get that skin"));
        assert!(is_question("а можно ли так делать"));
    }

    #[test]
    fn test_exclusions() {
        assert!(!is_question("?"));
        assert!(!is_question("what is https://spam.example"));
        assert!(!is_question("check www.site.org?"));
        assert!(!is_question(&format!("what {}", "a".repeat(600))));
        assert!(!is_question("nice shot"));
    }
}
