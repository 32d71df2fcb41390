// Chorus Moderation — Reputation Store
// Per-identity integer trust score. Quality messages add one, spam subtracts
// one, low-quality leaves it alone. No decay; only an explicit reset clears it.

use super::scorer::{ReputationStatus, ScoringSettings};
use crate::atoms::types::Classification;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationChange {
    pub message_score: f64,
    pub classification: Classification,
    pub old: i64,
    pub new: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationView {
    pub identity: String,
    pub reputation: i64,
    pub status: ReputationStatus,
    pub modifier: f64,
    /// Oldest first.
    pub history: Vec<ReputationChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReputationStats {
    pub identities: usize,
    pub reliable: usize,
    pub normal: usize,
    pub problematic: usize,
    pub average: f64,
}

#[derive(Default)]
struct Record {
    score: i64,
    history: VecDeque<ReputationChange>,
}

pub struct ReputationStore {
    settings: ScoringSettings,
    records: RwLock<HashMap<String, Record>>,
}

impl ReputationStore {
    pub fn new(settings: ScoringSettings) -> Self {
        ReputationStore { settings, records: RwLock::new(HashMap::new()) }
    }

    /// Unknown identities are neutral (0).
    pub fn get(&self, identity: &str) -> i64 {
        self.records.read().get(identity).map(|r| r.score).unwrap_or(0)
    }

    /// Apply one scored message. Returns the new reputation.
    pub fn apply(&self, identity: &str, classification: Classification, message_score: f64) -> i64 {
        let delta = match classification {
            Classification::Quality => 1,
            Classification::Spam => -1,
            Classification::LowQuality => 0,
        };
        let mut records = self.records.write();
        let record = records.entry(identity.to_string()).or_default();
        let old = record.score;
        record.score += delta;
        record.history.push_back(ReputationChange {
            message_score,
            classification,
            old,
            new: record.score,
            at: Utc::now(),
        });
        while record.history.len() > self.settings.history_len.max(1) {
            record.history.pop_front();
        }
        if delta != 0 {
            debug!("[reputation] {} {} → {}", identity, old, record.score);
        }
        record.score
    }

    pub fn status(&self, identity: &str) -> ReputationStatus {
        self.settings.status(self.get(identity))
    }

    pub fn view(&self, identity: &str, history_limit: usize) -> ReputationView {
        let records = self.records.read();
        let (reputation, history) = match records.get(identity) {
            Some(r) => {
                let skip = r.history.len().saturating_sub(history_limit);
                (r.score, r.history.iter().skip(skip).cloned().collect())
            }
            None => (0, Vec::new()),
        };
        ReputationView {
            identity: identity.to_string(),
            reputation,
            status: self.settings.status(reputation),
            modifier: self.settings.modifier(reputation),
            history,
        }
    }

    /// Forget one identity. Returns whether it was known.
    pub fn reset(&self, identity: &str) -> bool {
        let removed = self.records.write().remove(identity).is_some();
        if removed {
            info!("[reputation] Reset {}", identity);
        }
        removed
    }

    pub fn reset_all(&self) -> usize {
        let mut records = self.records.write();
        let n = records.len();
        records.clear();
        info!("[reputation] Reset all ({} identities)", n);
        n
    }

    pub fn stats(&self) -> ReputationStats {
        let records = self.records.read();
        let mut stats = ReputationStats { identities: records.len(), ..Default::default() };
        let mut sum = 0i64;
        for r in records.values() {
            sum += r.score;
            match self.settings.status(r.score) {
                ReputationStatus::Reliable => stats.reliable += 1,
                ReputationStatus::Normal => stats.normal += 1,
                ReputationStatus::Problematic => stats.problematic += 1,
            }
        }
        if !records.is_empty() {
            stats.average = sum as f64 / records.len() as f64;
        }
        stats
    }
}

impl Default for ReputationStore {
    fn default() -> Self {
        ReputationStore::new(ScoringSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_identity_is_neutral() {
        let store = ReputationStore::default();
        assert_eq!(store.get("nobody"), 0);
        assert_eq!(store.status("nobody"), ReputationStatus::Normal);
        assert_eq!(store.view("nobody", 10).modifier, 1.0);
    }

    #[test]
    fn test_apply_is_plus_minus_one() {
        let store = ReputationStore::default();
        assert_eq!(store.apply("a", Classification::Quality, 50.0), 1);
        assert_eq!(store.apply("a", Classification::Quality, 50.0), 2);
        assert_eq!(store.apply("a", Classification::LowQuality, 30.0), 2);
        assert_eq!(store.apply("a", Classification::Spam, 5.0), 1);
        assert_eq!(store.get("b"), 0);
    }

    #[test]
    fn test_identities_are_isolated() {
        let store = ReputationStore::default();
        store.apply("a", Classification::Spam, 0.0);
        store.apply("b", Classification::Quality, 80.0);
        assert_eq!(store.get("a"), -1);
        assert_eq!(store.get("b"), 1);
    }

    #[test]
    fn test_raw_value_is_unbounded() {
        let store = ReputationStore::default();
        for _ in 0..120 {
            store.apply("fan", Classification::Quality, 60.0);
        }
        let view = store.view("fan", 10);
        assert_eq!(view.reputation, 120);
        assert_eq!(view.status, ReputationStatus::Reliable);
        assert_eq!(view.history.len(), 10);
        assert_eq!(view.history.last().unwrap().new, 120);
    }

    #[test]
    fn test_history_is_bounded() {
        let settings = ScoringSettings { history_len: 5, ..Default::default() };
        let store = ReputationStore::new(settings);
        for _ in 0..20 {
            store.apply("x", Classification::Spam, 1.0);
        }
        assert_eq!(store.view("x", 100).history.len(), 5);
    }

    #[test]
    fn test_reset_and_stats() {
        let store = ReputationStore::default();
        for _ in 0..12 {
            store.apply("good", Classification::Quality, 60.0);
            store.apply("bad", Classification::Spam, 10.0);
        }
        store.apply("meh", Classification::LowQuality, 30.0);
        let stats = store.stats();
        assert_eq!(stats.identities, 3);
        assert_eq!(stats.reliable, 1);
        assert_eq!(stats.problematic, 1);
        assert_eq!(stats.normal, 1);
        assert_eq!(stats.average, 0.0);

        assert!(store.reset("bad"));
        assert!(!store.reset("bad"));
        assert_eq!(store.get("bad"), 0);
        assert_eq!(store.reset_all(), 2);
        assert_eq!(store.stats().identities, 0);
    }
}
