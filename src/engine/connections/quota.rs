// Provider call-volume tracking for poll-based connections.
// Calls per minute since the first call, extrapolated to a day and compared
// against the provider ceiling. One warning per crossing; the warning re-arms
// once the projection falls back under the line.

use serde::Serialize;
use tokio::time::Instant;

const MINUTES_PER_DAY: f64 = 1440.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub calls: u64,
    pub calls_per_minute: f64,
    pub projected_daily: u64,
    pub ceiling: u64,
}

impl QuotaUsage {
    pub fn used_ratio(&self) -> f64 {
        if self.ceiling == 0 {
            return 0.0;
        }
        self.projected_daily as f64 / self.ceiling as f64
    }
}

#[derive(Debug)]
pub struct QuotaTracker {
    ceiling: u64,
    warn_ratio: f64,
    started: Option<Instant>,
    calls: u64,
    warned: bool,
}

impl QuotaTracker {
    pub fn new(ceiling: u64, warn_ratio: f64) -> Self {
        QuotaTracker { ceiling, warn_ratio, started: None, calls: 0, warned: false }
    }

    pub fn record(&mut self, calls: u32) -> Option<QuotaUsage> {
        self.record_at(calls, Instant::now())
    }

    /// Count `calls` made at `now`. Returns the usage when this call pushed
    /// the projection over the warning line.
    pub fn record_at(&mut self, calls: u32, now: Instant) -> Option<QuotaUsage> {
        let started = *self.started.get_or_insert(now);
        self.calls += calls as u64;

        let usage = self.usage_at(started, now);
        let line = self.ceiling as f64 * self.warn_ratio;
        if usage.projected_daily as f64 >= line {
            if !self.warned {
                self.warned = true;
                return Some(usage);
            }
        } else {
            self.warned = false;
        }
        None
    }

    pub fn usage(&self) -> QuotaUsage {
        match self.started {
            Some(started) => self.usage_at(started, Instant::now()),
            None => QuotaUsage { calls: 0, calls_per_minute: 0.0, projected_daily: 0, ceiling: self.ceiling },
        }
    }

    fn usage_at(&self, started: Instant, now: Instant) -> QuotaUsage {
        // Less than a minute of history projects as if it were a full minute.
        let minutes = (now.saturating_duration_since(started).as_secs_f64() / 60.0).max(1.0);
        let per_minute = self.calls as f64 / minutes;
        QuotaUsage {
            calls: self.calls,
            calls_per_minute: per_minute,
            projected_daily: (per_minute * MINUTES_PER_DAY).round() as u64,
            ceiling: self.ceiling,
        }
    }
}
