// Chorus Moderation — Message Quality Scorer
// Composite 0–100 score: semantic density base, low-repetition and low-filler
// bonuses, a length bonus or short-message penalty, capped penalties softened
// or sharpened by the sender's reputation, then a reputation bonus/malus.

use super::features::{self, Features};
use super::lexicon;
use crate::atoms::constants::{
    REPUTATION_HISTORY_LEN, REPUTATION_PROBLEMATIC_BELOW, REPUTATION_RELIABLE_ABOVE,
    SCORE_LOW_QUALITY_BELOW, SCORE_MAX_PENALTY, SCORE_MAX_REPUTATION_ADJUST, SCORE_SPAM_BELOW,
};
use crate::atoms::types::Classification;
use serde::{Deserialize, Serialize};

// ── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Reputation strictly above this is "reliable".
    pub reliable_above: i64,
    /// Reputation strictly below this is "problematic".
    pub problematic_below: i64,
    /// Penalty divisor for reliable senders (> 1 softens).
    pub reliable_modifier: f64,
    /// Penalty divisor for problematic senders (< 1 sharpens).
    pub problematic_modifier: f64,
    /// Reputation changes remembered per identity.
    pub history_len: usize,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        ScoringSettings {
            reliable_above: REPUTATION_RELIABLE_ABOVE,
            problematic_below: REPUTATION_PROBLEMATIC_BELOW,
            reliable_modifier: 1.5,
            problematic_modifier: 0.7,
            history_len: REPUTATION_HISTORY_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationStatus {
    Reliable,
    Normal,
    Problematic,
}

impl ScoringSettings {
    pub fn status(&self, reputation: i64) -> ReputationStatus {
        if reputation > self.reliable_above {
            ReputationStatus::Reliable
        } else if reputation < self.problematic_below {
            ReputationStatus::Problematic
        } else {
            ReputationStatus::Normal
        }
    }

    /// Penalties are divided by this. Unknown and normal senders get 1.0.
    pub fn modifier(&self, reputation: i64) -> f64 {
        match self.status(reputation) {
            ReputationStatus::Reliable => self.reliable_modifier,
            ReputationStatus::Problematic => self.problematic_modifier,
            ReputationStatus::Normal => 1.0,
        }
    }
}

// ── Scoring ────────────────────────────────────────────────────────────────

/// Fraction of words found in the curated meaningful vocabulary.
pub fn semantic_density(text: &str) -> f64 {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect()
        })
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| lexicon::is_semantic(w)).count();
    (hits as f64 / words.len() as f64).min(1.0)
}

/// Sum of threshold penalties, capped.
pub fn penalties(f: &Features) -> f64 {
    let mut p = 0.0;
    if f.repetition > 0.3 {
        p += (f.repetition - 0.3) * 20.0;
    }
    if f.emoji_ratio > 0.2 {
        p += (f.emoji_ratio - 0.2) * 30.0;
    }
    if f.caps_ratio > 0.5 && f.length > 5 {
        p += (f.caps_ratio - 0.5) * 10.0;
    }
    if f.filler_ratio > 0.3 {
        p += (f.filler_ratio - 0.3) * 15.0;
    }
    if f.length < 5 {
        p += (5 - f.length) as f64 * 5.0;
    }
    p.min(SCORE_MAX_PENALTY)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub semantic_density: f64,
    pub penalties: f64,
    pub modifier: f64,
    pub reputation_adjust: f64,
    pub score: f64,
    pub classification: Classification,
}

pub fn classify_score(score: f64) -> Classification {
    if score < SCORE_SPAM_BELOW {
        Classification::Spam
    } else if score < SCORE_LOW_QUALITY_BELOW {
        Classification::LowQuality
    } else {
        Classification::Quality
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    settings: ScoringSettings,
}

impl QualityScorer {
    pub fn new(settings: ScoringSettings) -> Self {
        QualityScorer { settings }
    }

    pub fn settings(&self) -> &ScoringSettings {
        &self.settings
    }

    pub fn score_text(&self, text: &str, reputation: i64) -> ScoreBreakdown {
        self.score(text, &features::extract(text), reputation)
    }

    pub fn score(&self, text: &str, f: &Features, reputation: i64) -> ScoreBreakdown {
        let density = semantic_density(text);
        let mut score = density * 40.0;
        score += (1.0 - f.repetition) * 10.0;
        score += (1.0 - f.filler_ratio) * 10.0;

        if f.length > 20 {
            score += ((f.length - 20) as f64 / 2.0).min(20.0);
        } else if f.length < 5 && density < 0.2 {
            score -= 15.0;
        }

        let modifier = self.settings.modifier(reputation);
        let raw_penalties = penalties(f);
        score -= raw_penalties / modifier;

        let magnitude = (reputation.unsigned_abs() as f64 * 0.5).min(SCORE_MAX_REPUTATION_ADJUST);
        let reputation_adjust = match self.settings.status(reputation) {
            ReputationStatus::Reliable => magnitude,
            ReputationStatus::Problematic => -magnitude,
            ReputationStatus::Normal => 0.0,
        };
        score += reputation_adjust;

        let score = score.clamp(0.0, 100.0);
        ScoreBreakdown {
            semantic_density: density,
            penalties: raw_penalties,
            modifier,
            reputation_adjust,
            score,
            classification: classify_score(score),
        }
    }
}
