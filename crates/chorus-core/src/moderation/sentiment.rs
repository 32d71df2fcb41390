// Chorus Moderation — Sentiment Analyzer
// Lexicon-based mood tagging plus a rolling aggregate for the dashboard.

use super::features::count_emoji;
use super::lexicon::{NEGATIVE_EMOJI, NEGATIVE_WORDS, POSITIVE_EMOJI, POSITIVE_WORDS};
use crate::atoms::constants::MOOD_TIMELINE_LEN;
use crate::atoms::types::Mood;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentBreakdown {
    pub words: i32,
    pub emoji: i32,
    pub patterns: i32,
}

impl SentimentBreakdown {
    pub fn total(&self) -> i32 {
        self.words + self.emoji + self.patterns
    }

    pub fn mood(&self) -> Mood {
        match self.total() {
            t if t >= 2 => Mood::Happy,
            t if t <= -2 => Mood::Sad,
            _ => Mood::Neutral,
        }
    }
}

fn word_score(lower: &str) -> i32 {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            if POSITIVE_WORDS.contains(&w) {
                1
            } else if NEGATIVE_WORDS.contains(&w) {
                -1
            } else {
                0
            }
        })
        .sum()
}

fn emoji_score(text: &str) -> i32 {
    let mut score = 0i32;
    for e in POSITIVE_EMOJI {
        score += 2 * text.matches(e).count() as i32;
    }
    for e in NEGATIVE_EMOJI {
        score -= 2 * text.matches(e).count() as i32;
    }
    // A wall of emoji reads as excitement.
    let total = count_emoji(text) as i32;
    if total > 5 {
        score += (total - 5).min(5);
    }
    score
}

fn pattern_score(text: &str) -> i32 {
    let mut score = 0;
    let has_upper = text.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = text.chars().any(|c| c.is_lowercase());
    if has_upper && !has_lower && text.chars().count() > 3 {
        score += 2;
    }
    if text.matches('!').count() >= 3 {
        score += 2;
    }
    if text.matches('?').count() >= 2 {
        score -= 1;
    }

    // Stretched letters: "noooo" is a groan, "aaaah" is a cheer.
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let mut j = i + 1;
        while j < chars.len() && chars[j] == chars[i] {
            j += 1;
        }
        if j - i >= 4 {
            match chars[i] {
                'n' | 'o' => score -= 2,
                'a' | 'e' | 'i' | 'u' => score += 1,
                _ => {}
            }
        }
        i = j;
    }
    score
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SentimentAnalyzer;

impl SentimentAnalyzer {
    pub fn breakdown(&self, text: &str) -> SentimentBreakdown {
        if text.trim().is_empty() {
            return SentimentBreakdown::default();
        }
        SentimentBreakdown {
            words: word_score(&text.to_lowercase()),
            emoji: emoji_score(text),
            patterns: pattern_score(text),
        }
    }

    pub fn analyze(&self, text: &str) -> Mood {
        self.breakdown(text).mood()
    }
}

// ── Mood aggregate ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoodCounts {
    pub happy: u64,
    pub neutral: u64,
    pub sad: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoodEntry {
    pub mood: Mood,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct MoodState {
    counts: MoodCounts,
    timeline: VecDeque<MoodEntry>,
}

/// Running happy/neutral/sad counters and a bounded timeline.
pub struct MoodTracker {
    capacity: usize,
    state: Mutex<MoodState>,
}

impl MoodTracker {
    pub fn new(capacity: usize) -> Self {
        MoodTracker { capacity: capacity.max(1), state: Mutex::new(MoodState::default()) }
    }

    pub fn record(&self, mood: Mood) {
        self.record_at(mood, Utc::now());
    }

    pub fn record_at(&self, mood: Mood, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        match mood {
            Mood::Happy => state.counts.happy += 1,
            Mood::Neutral => state.counts.neutral += 1,
            Mood::Sad => state.counts.sad += 1,
        }
        state.counts.total += 1;
        state.timeline.push_back(MoodEntry { mood, at });
        while state.timeline.len() > self.capacity {
            state.timeline.pop_front();
        }
    }

    pub fn counts(&self) -> MoodCounts {
        self.state.lock().counts
    }

    /// Timeline entries newer than `window` before now.
    pub fn timeline(&self, window: Duration) -> Vec<MoodEntry> {
        let cutoff = Utc::now() - window;
        self.state.lock().timeline.iter().filter(|e| e.at > cutoff).copied().collect()
    }

    pub fn reset(&self) {
        *self.state.lock() = MoodState::default();
    }
}

impl Default for MoodTracker {
    fn default() -> Self {
        MoodTracker::new(MOOD_TIMELINE_LEN)
    }
}
