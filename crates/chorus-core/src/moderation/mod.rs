// Chorus Moderation
// Classifier → scorer → reputation update → sentiment tag, for one message.
//
// Module layout:
//   lexicon     — curated word and emoji lists
//   features    — text feature extraction
//   classifier  — fast-path rules + self-tuning weighted spam score
//   scorer      — 0–100 quality score, reputation-aware
//   reputation  — per-identity trust score with bounded history
//   sentiment   — lexicon mood tagging + rolling aggregate
//   questions   — question detection
//
// The Moderator holds one gate across classify → score → reputation update so
// concurrent streams never interleave inside a single message's sequence.
// Everything inside the gate is synchronous.

pub mod classifier;
pub mod features;
pub mod lexicon;
pub mod questions;
pub mod reputation;
pub mod scorer;
pub mod sentiment;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CanonicalMessage, ChannelKey, ChatDraft, Classification, Mood};
use classifier::{AdaptiveClassifier, ClassifierSettings, Verdict};
use parking_lot::Mutex;
use reputation::ReputationStore;
use scorer::{QualityScorer, ScoringSettings};
use sentiment::{MoodTracker, SentimentAnalyzer};
use serde::Serialize;

/// Everything the pipeline learns about one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub is_spam: bool,
    pub classification: Classification,
    pub score: f64,
    pub is_question: bool,
    pub sentiment: Mood,
    /// Sender reputation after this message.
    pub reputation: i64,
    pub verdict: Verdict,
}

pub struct Moderator {
    classifier: AdaptiveClassifier,
    scorer: QualityScorer,
    reputation: ReputationStore,
    sentiment: SentimentAnalyzer,
    moods: MoodTracker,
    gate: Mutex<()>,
}

impl Moderator {
    pub fn new(classifier: ClassifierSettings, scoring: ScoringSettings) -> Self {
        Moderator {
            classifier: AdaptiveClassifier::new(classifier),
            reputation: ReputationStore::new(scoring.clone()),
            scorer: QualityScorer::new(scoring),
            sentiment: SentimentAnalyzer,
            moods: MoodTracker::default(),
            gate: Mutex::new(()),
        }
    }

    pub fn classifier(&self) -> &AdaptiveClassifier {
        &self.classifier
    }

    pub fn reputation(&self) -> &ReputationStore {
        &self.reputation
    }

    pub fn moods(&self) -> &MoodTracker {
        &self.moods
    }

    /// Assess one message from `identity`. Empty text is an input error and
    /// leaves the classifier samples and the reputation untouched.
    ///
    /// A classifier spam verdict overrides the scorer's band, so the sender
    /// loses a point either way.
    pub fn assess(&self, identity: &str, text: &str) -> EngineResult<Assessment> {
        if text.trim().is_empty() {
            return Err(EngineError::ClassificationInput(format!("empty text from {}", identity)));
        }

        let (verdict, breakdown, is_spam, classification, reputation) = {
            let _gate = self.gate.lock();
            let verdict = self.classifier.classify(text)?;
            let current = self.reputation.get(identity);
            let breakdown = self.scorer.score(text, &verdict.features, current);
            let is_spam = verdict.is_spam || breakdown.classification == Classification::Spam;
            let classification =
                if verdict.is_spam { Classification::Spam } else { breakdown.classification };
            let reputation = self.reputation.apply(identity, classification, breakdown.score);
            (verdict, breakdown, is_spam, classification, reputation)
        };

        let sentiment = self.sentiment.analyze(text);
        self.moods.record(sentiment);

        Ok(Assessment {
            is_spam,
            classification,
            score: breakdown.score,
            is_question: questions::is_question(text),
            sentiment,
            reputation,
            verdict,
        })
    }

    /// Assess a draft and build the canonical record for `key`'s stream.
    pub fn moderate(&self, key: &ChannelKey, draft: ChatDraft) -> EngineResult<(CanonicalMessage, Assessment)> {
        let assessment = self.assess(&draft.identity, &draft.text)?;
        let message = CanonicalMessage {
            id: draft.id,
            stream_id: key.stream_id(),
            platform: key.platform,
            identity: draft.identity,
            text: draft.text,
            timestamp: draft.timestamp,
            is_question: assessment.is_question,
            is_spam: assessment.is_spam,
            score: assessment.score,
            classification: assessment.classification,
            sentiment: assessment.sentiment,
        };
        Ok((message, assessment))
    }
}

impl Default for Moderator {
    fn default() -> Self {
        Moderator::new(ClassifierSettings::default(), ScoringSettings::default())
    }
}
