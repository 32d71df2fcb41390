// Chorus Moderation — Adaptive Content Classifier
//
// Two layers:
//   • Fast-path rules that mark spam unconditionally (too short, one word
//     hammered inside a short message, long duplicate-word runs).
//   • A weighted score over threshold breaches. Thresholds are self-tuned:
//     every classified message becomes a sample labelled with the verdict,
//     and a periodic task moves each threshold to the clamped midpoint of the
//     spam and normal running averages.
//
// The hot path only reads thresholds and appends a sample. Recomputation
// snapshots the sample rings and swaps the whole Thresholds value at once.

use super::features::{self, Features};
use crate::atoms::constants::{
    CLASSIFIER_RECOMPUTE_EVERY, CLASSIFIER_SAMPLE_CAPACITY, CLASSIFIER_SPAM_CUTOFF,
    FAST_PATH_DUPLICATE_RATIO, FAST_PATH_DUPLICATE_RUN, FAST_PATH_MAX_WORDS,
    FAST_PATH_MAX_WORD_REPEAT, FAST_PATH_MIN_CHARS,
};
use crate::atoms::error::{EngineError, EngineResult};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Messages shorter than this breach.
    pub length: f64,
    pub repetition: f64,
    pub emoji: f64,
    pub caps: f64,
    pub filler: f64,
    pub punctuation: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            length: 20.0,
            repetition: 0.1,
            emoji: 0.2,
            caps: 0.5,
            filler: 0.3,
            punctuation: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    const fn new(min: f64, max: f64) -> Self {
        Range { min, max }
    }

    fn clamp(&self, v: f64) -> f64 {
        v.max(self.min).min(self.max)
    }
}

/// Where each threshold may drift to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdBounds {
    pub length: Range,
    pub repetition: Range,
    pub emoji: Range,
    pub caps: Range,
    pub filler: Range,
    pub punctuation: Range,
}

impl Default for ThresholdBounds {
    fn default() -> Self {
        ThresholdBounds {
            length: Range::new(3.0, 20.0),
            repetition: Range::new(0.1, 0.5),
            emoji: Range::new(0.1, 0.5),
            caps: Range::new(0.3, 0.9),
            filler: Range::new(0.2, 0.6),
            punctuation: Range::new(0.1, 0.5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Ring capacity per class.
    pub sample_capacity: usize,
    /// Samples between threshold recomputations.
    pub recompute_every: u64,
    /// Weighted score at or above which a message is spam.
    pub spam_cutoff: u32,
    pub initial: Thresholds,
    pub bounds: ThresholdBounds,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        ClassifierSettings {
            sample_capacity: CLASSIFIER_SAMPLE_CAPACITY,
            recompute_every: CLASSIFIER_RECOMPUTE_EVERY,
            spam_cutoff: CLASSIFIER_SPAM_CUTOFF,
            initial: Thresholds::default(),
            bounds: ThresholdBounds::default(),
        }
    }
}

// ── Verdicts ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastPath {
    TooShort,
    WordRepeat,
    DuplicateRatio,
    DuplicateRun,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub is_spam: bool,
    pub fast_path: Option<FastPath>,
    /// Weighted breach score (0 when a fast path fired).
    pub score: u32,
    pub features: Features,
}

/// Fast-path rules. They ignore the adaptive thresholds entirely.
pub fn fast_path(f: &Features) -> Option<FastPath> {
    if f.length < FAST_PATH_MIN_CHARS {
        return Some(FastPath::TooShort);
    }
    if f.longest_duplicate_run >= FAST_PATH_DUPLICATE_RUN {
        return Some(FastPath::DuplicateRun);
    }
    let short = f.word_count >= 3 && f.word_count <= FAST_PATH_MAX_WORDS;
    if short && f.max_word_repeat >= FAST_PATH_MAX_WORD_REPEAT {
        return Some(FastPath::WordRepeat);
    }
    if short && f.duplicate_ratio >= FAST_PATH_DUPLICATE_RATIO {
        return Some(FastPath::DuplicateRatio);
    }
    None
}

/// Weighted breach score against a set of thresholds.
pub fn breach_score(f: &Features, t: &Thresholds) -> u32 {
    let mut score = 0;
    if (f.length as f64) < t.length {
        score += 2;
    }
    if f.repetition > t.repetition {
        score += 2;
    }
    if f.emoji_ratio > t.emoji {
        score += 1;
    }
    if f.caps_ratio > t.caps && f.length > 5 {
        score += 1;
    }
    if f.filler_ratio > t.filler {
        score += 2;
    }
    if f.punctuation_ratio > t.punctuation {
        score += 1;
    }
    score
}

// ── Samples ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Samples {
    spam: VecDeque<Features>,
    normal: VecDeque<Features>,
    total: u64,
    since_recompute: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FeatureAverages {
    pub length: f64,
    pub repetition: f64,
    pub emoji: f64,
    pub caps: f64,
    pub filler: f64,
    pub punctuation: f64,
}

fn averages(samples: &[Features]) -> Option<FeatureAverages> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mut avg = FeatureAverages::default();
    for f in samples {
        avg.length += f.length as f64;
        avg.repetition += f.repetition;
        avg.emoji += f.emoji_ratio;
        avg.caps += f.caps_ratio;
        avg.filler += f.filler_ratio;
        avg.punctuation += f.punctuation_ratio;
    }
    avg.length /= n;
    avg.repetition /= n;
    avg.emoji /= n;
    avg.caps /= n;
    avg.filler /= n;
    avg.punctuation /= n;
    Some(avg)
}

/// Introspection snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierStats {
    pub thresholds: Thresholds,
    pub spam_samples: usize,
    pub normal_samples: usize,
    pub total_samples: u64,
    pub recomputations: u64,
    pub spam_averages: Option<FeatureAverages>,
    pub normal_averages: Option<FeatureAverages>,
}

// ── Classifier ─────────────────────────────────────────────────────────────

pub struct AdaptiveClassifier {
    settings: ClassifierSettings,
    thresholds: RwLock<Thresholds>,
    samples: Mutex<Samples>,
    recomputations: Mutex<u64>,
}

impl AdaptiveClassifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        let initial = settings.initial;
        AdaptiveClassifier {
            settings,
            thresholds: RwLock::new(initial),
            samples: Mutex::new(Samples::default()),
            recomputations: Mutex::new(0),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read()
    }

    /// Classify `text` and record it as a training sample.
    /// Empty text is an input error: never spam, never sampled.
    pub fn classify(&self, text: &str) -> EngineResult<Verdict> {
        if text.trim().is_empty() {
            return Err(EngineError::ClassificationInput("empty message text".into()));
        }
        let features = features::extract(text);
        let verdict = self.evaluate(features);
        self.record(features, verdict.is_spam);
        Ok(verdict)
    }

    /// Classify without recording a sample.
    pub fn evaluate(&self, features: Features) -> Verdict {
        if let Some(rule) = fast_path(&features) {
            return Verdict { is_spam: true, fast_path: Some(rule), score: 0, features };
        }
        let score = breach_score(&features, &self.thresholds.read());
        Verdict {
            is_spam: score >= self.settings.spam_cutoff,
            fast_path: None,
            score,
            features,
        }
    }

    fn record(&self, features: Features, is_spam: bool) {
        let cap = self.settings.sample_capacity.max(1);
        let mut samples = self.samples.lock();
        let ring = if is_spam { &mut samples.spam } else { &mut samples.normal };
        if ring.len() >= cap {
            ring.pop_front();
        }
        ring.push_back(features);
        samples.total += 1;
        samples.since_recompute += 1;
        if samples.total % 50 == 0 {
            debug!(
                "[classifier] {} samples ({} spam / {} normal)",
                samples.total,
                samples.spam.len(),
                samples.normal.len()
            );
        }
    }

    pub fn recompute_due(&self) -> bool {
        self.samples.lock().since_recompute >= self.settings.recompute_every.max(1)
    }

    /// Recompute if enough samples arrived since the last pass.
    pub fn recompute_if_due(&self) -> Option<Thresholds> {
        if self.recompute_due() {
            self.recompute()
        } else {
            None
        }
    }

    /// Move every threshold to the clamped midpoint of the two classes'
    /// averages. Needs at least one sample of each class.
    pub fn recompute(&self) -> Option<Thresholds> {
        let (spam, normal) = {
            let mut samples = self.samples.lock();
            samples.since_recompute = 0;
            (
                samples.spam.iter().copied().collect::<Vec<_>>(),
                samples.normal.iter().copied().collect::<Vec<_>>(),
            )
        };
        let (s, n) = (averages(&spam)?, averages(&normal)?);
        let b = &self.settings.bounds;
        let mid = |a: f64, c: f64| (a + c) / 2.0;
        let next = Thresholds {
            length: b.length.clamp(mid(s.length, n.length)),
            repetition: b.repetition.clamp(mid(s.repetition, n.repetition)),
            emoji: b.emoji.clamp(mid(s.emoji, n.emoji)),
            caps: b.caps.clamp(mid(s.caps, n.caps)),
            filler: b.filler.clamp(mid(s.filler, n.filler)),
            punctuation: b.punctuation.clamp(mid(s.punctuation, n.punctuation)),
        };
        *self.thresholds.write() = next;
        *self.recomputations.lock() += 1;
        info!(
            "[classifier] Thresholds updated: length {:.1}, repetition {:.2}, filler {:.2} ({} spam / {} normal samples)",
            next.length,
            next.repetition,
            next.filler,
            spam.len(),
            normal.len()
        );
        Some(next)
    }

    pub fn stats(&self) -> ClassifierStats {
        let samples = self.samples.lock();
        let spam: Vec<Features> = samples.spam.iter().copied().collect();
        let normal: Vec<Features> = samples.normal.iter().copied().collect();
        ClassifierStats {
            thresholds: self.thresholds(),
            spam_samples: spam.len(),
            normal_samples: normal.len(),
            total_samples: samples.total,
            recomputations: *self.recomputations.lock(),
            spam_averages: averages(&spam),
            normal_averages: averages(&normal),
        }
    }

    /// Drop all samples and return to the configured initial thresholds.
    pub fn reset(&self) {
        *self.samples.lock() = Samples::default();
        *self.thresholds.write() = self.settings.initial;
        info!("[classifier] Reset to initial thresholds");
    }
}

impl Default for AdaptiveClassifier {
    fn default() -> Self {
        AdaptiveClassifier::new(ClassifierSettings::default())
    }
}
