// Chorus Moderation — Feature Extraction
// Pure, allocation-light text features shared by the classifier and the scorer.

use super::lexicon;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    /// Characters after trimming.
    pub length: usize,
    pub word_count: usize,
    /// Share of characters that sit in a run of two or more identical chars.
    pub repetition: f64,
    pub emoji_ratio: f64,
    /// Uppercase share of ASCII letters.
    pub caps_ratio: f64,
    /// `!` and `?` per character.
    pub punctuation_ratio: f64,
    pub filler_ratio: f64,
    /// Occurrences of the most frequent word.
    pub max_word_repeat: usize,
    /// (words − distinct words) / words.
    pub duplicate_ratio: f64,
    /// Longest run of the same word back to back.
    pub longest_duplicate_run: usize,
}

/// Lowercased words with surrounding punctuation removed. A token made only
/// of punctuation is kept as-is so "!!!" still counts as a word.
pub fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|raw| {
            let lower = raw.to_lowercase();
            let clean = lower.trim_matches(|c: char| !c.is_alphanumeric());
            if clean.is_empty() {
                lower.clone()
            } else {
                clean.to_string()
            }
        })
        .collect()
}

pub fn count_emoji(text: &str) -> usize {
    text.chars().filter(|c| lexicon::is_emoji(*c)).count()
}

fn repetition(chars: &[char]) -> f64 {
    if chars.is_empty() {
        return 0.0;
    }
    let mut repeated = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let mut j = i + 1;
        while j < chars.len() && chars[j] == chars[i] {
            j += 1;
        }
        if j - i >= 2 {
            repeated += j - i;
        }
        i = j;
    }
    repeated as f64 / chars.len() as f64
}

pub fn extract(text: &str) -> Features {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let length = chars.len();
    if length == 0 {
        return Features::default();
    }

    let letters = chars.iter().filter(|c| c.is_ascii_alphabetic()).count();
    let caps = chars.iter().filter(|c| c.is_ascii_uppercase()).count();
    let bursts = chars.iter().filter(|c| **c == '!' || **c == '?').count();

    let words = words(trimmed);
    let word_count = words.len();
    let filler = words.iter().filter(|w| lexicon::is_filler(w)).count();

    let mut freq: HashMap<&str, usize> = HashMap::new();
    for w in &words {
        *freq.entry(w.as_str()).or_insert(0) += 1;
    }
    let max_word_repeat = freq.values().copied().max().unwrap_or(0);
    let duplicate_ratio = if word_count > 0 {
        (word_count - freq.len()) as f64 / word_count as f64
    } else {
        0.0
    };

    let mut longest_duplicate_run = 0;
    let mut run = 0;
    for (i, w) in words.iter().enumerate() {
        run = if i > 0 && words[i - 1] == *w { run + 1 } else { 1 };
        longest_duplicate_run = longest_duplicate_run.max(run);
    }

    Features {
        length,
        word_count,
        repetition: repetition(&chars),
        emoji_ratio: count_emoji(trimmed) as f64 / length as f64,
        caps_ratio: if letters > 0 { caps as f64 / letters as f64 } else { 0.0 },
        punctuation_ratio: bursts as f64 / length as f64,
        filler_ratio: if word_count > 0 { filler as f64 / word_count as f64 } else { 0.0 },
        max_word_repeat,
        duplicate_ratio,
        longest_duplicate_run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_word_features() {
        let f = extract("lol lol lol lol");
        assert_eq!(f.length, 15);
        assert_eq!(f.word_count, 4);
        assert_eq!(f.max_word_repeat, 4);
        assert_eq!(f.longest_duplicate_run, 4);
        assert!((f.duplicate_ratio - 0.75).abs() < 1e-9);
        assert!((f.filler_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_char_repetition() {
        // "ll" and "oooo" are runs: 6 of 10 chars
        let f = extract("hello oooo");
        assert!((f.repetition - 0.6).abs() < 1e-9);
        assert_eq!(extract("abc").repetition, 0.0);
    }

    #[test]
    fn test_caps_and_punctuation() {
        let f = extract("WOW!!");
        assert!((f.caps_ratio - 1.0).abs() < 1e-9);
        assert!((f.punctuation_ratio - 0.4).abs() < 1e-9);
        // Cyrillic letters do not count toward the caps ratio
        assert_eq!(extract("ПРИВЕТ").caps_ratio, 0.0);
    }

    #[test]
    fn test_emoji_ratio_counts_chars() {
        let f = extract("hi 🔥🔥");
        assert_eq!(f.length, 5);
        assert!((f.emoji_ratio - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_punctuation_is_stripped_from_words() {
        assert_eq!(words("GG, well played!"), vec!["gg", "well", "played"]);
        assert_eq!(words("!!! ok"), vec!["!!!", "ok"]);
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(extract("   "), Features::default());
    }
}
