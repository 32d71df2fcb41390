// Chorus Engine — Batch Accumulator
// Per-stream ordered batches. A batch flushes when it reaches `size` or when
// its oldest message has waited `interval`, whichever comes first.

use chorus_core::{CanonicalMessage, FlushUnit};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct PendingBatch {
    messages: Vec<CanonicalMessage>,
    started: Instant,
}

pub struct BatchAccumulator {
    size: usize,
    interval: Duration,
    pending: HashMap<String, PendingBatch>,
}

impl BatchAccumulator {
    pub fn new(size: usize, interval: Duration) -> Self {
        BatchAccumulator { size: size.max(1), interval, pending: HashMap::new() }
    }

    /// Append in arrival order. Returns the flushed unit when this message
    /// filled the batch.
    pub fn push(&mut self, message: CanonicalMessage, now: Instant) -> Option<FlushUnit> {
        let stream_id = message.stream_id.clone();
        let size = self.size;
        let batch = self
            .pending
            .entry(stream_id.clone())
            .or_insert_with(|| PendingBatch { messages: Vec::with_capacity(size), started: now });
        batch.messages.push(message);
        if batch.messages.len() >= size {
            return self.take(&stream_id);
        }
        None
    }

    /// Batches whose oldest message has waited at least `interval`.
    pub fn due(&mut self, now: Instant) -> Vec<FlushUnit> {
        let mut expired: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.started) >= self.interval)
            .map(|(stream, b)| (b.started, stream.clone()))
            .collect();
        expired.sort();
        expired.into_iter().filter_map(|(_, stream)| self.take(&stream)).collect()
    }

    pub fn drain_stream(&mut self, stream_id: &str) -> Option<FlushUnit> {
        self.take(stream_id)
    }

    pub fn drain_all(&mut self) -> Vec<FlushUnit> {
        let mut streams: Vec<(Instant, String)> =
            self.pending.iter().map(|(stream, b)| (b.started, stream.clone())).collect();
        streams.sort();
        streams.into_iter().filter_map(|(_, stream)| self.take(&stream)).collect()
    }

    /// Messages waiting across all streams.
    pub fn pending(&self) -> usize {
        self.pending.values().map(|b| b.messages.len()).sum()
    }

    fn take(&mut self, stream_id: &str) -> Option<FlushUnit> {
        let batch = self.pending.remove(stream_id)?;
        if batch.messages.is_empty() {
            return None;
        }
        Some(FlushUnit::new(stream_id, batch.messages))
    }
}
