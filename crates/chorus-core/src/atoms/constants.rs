// ── Chorus Atoms: Constants ────────────────────────────────────────────────
// Named constants shared by the core and the runtime. Values that operators
// may want to tune are mirrored as defaults in the runtime's ChorusConfig.

// ── Connection lifecycle ──────────────────────────────────────────────────
pub const DEFAULT_BASE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Poll cadence used when the upstream sends no hint.
pub const DEFAULT_POLL_MS: u64 = 30_000;
/// Server hints below this are raised to it.
pub const MIN_POLL_MS: u64 = 15_000;

// ── Checkpoints ───────────────────────────────────────────────────────────
// Stored under `connection:{connection_id}`. Changing the prefix orphans
// every checkpoint written by an older build.
pub const CHECKPOINT_KEY_PREFIX: &str = "connection:";
pub const DEFAULT_CHECKPOINT_TTL_SECS: u64 = 3_600;
/// Checkpoints older than this are discarded on startup instead of resumed.
pub const DEFAULT_CHECKPOINT_FRESHNESS_SECS: u64 = 600;

// ── Provider quota ────────────────────────────────────────────────────────
/// YouTube Data API default daily unit budget per key.
pub const DEFAULT_QUOTA_DAILY_CEILING: u64 = 10_000;
pub const DEFAULT_QUOTA_WARN_RATIO: f64 = 0.8;
/// A key flagged as exhausted becomes eligible again after this long.
pub const QUOTA_KEY_RESET_SECS: u64 = 3_600;

// ── Classifier ────────────────────────────────────────────────────────────
/// Ring capacity per class (spam / normal).
pub const CLASSIFIER_SAMPLE_CAPACITY: usize = 500;
pub const CLASSIFIER_RECOMPUTE_EVERY: u64 = 50;
pub const CLASSIFIER_SPAM_CUTOFF: u32 = 3;
/// Texts shorter than this (in chars, after trimming) are spam outright.
pub const FAST_PATH_MIN_CHARS: usize = 3;
/// Word-repetition fast paths only apply to messages of at most this many words.
pub const FAST_PATH_MAX_WORDS: usize = 7;
pub const FAST_PATH_MAX_WORD_REPEAT: usize = 3;
pub const FAST_PATH_DUPLICATE_RATIO: f64 = 0.5;
pub const FAST_PATH_DUPLICATE_RUN: usize = 4;

// ── Scorer ────────────────────────────────────────────────────────────────
pub const SCORE_SPAM_BELOW: f64 = 25.0;
pub const SCORE_LOW_QUALITY_BELOW: f64 = 40.0;
pub const SCORE_MAX_PENALTY: f64 = 50.0;
pub const SCORE_MAX_REPUTATION_ADJUST: f64 = 15.0;

// ── Reputation ────────────────────────────────────────────────────────────
pub const REPUTATION_RELIABLE_ABOVE: i64 = 10;
pub const REPUTATION_PROBLEMATIC_BELOW: i64 = -10;
pub const REPUTATION_HISTORY_LEN: usize = 100;

// ── Sentiment ─────────────────────────────────────────────────────────────
pub const MOOD_TIMELINE_LEN: usize = 100;

// ── Question detection ────────────────────────────────────────────────────
pub const QUESTION_MIN_CHARS: usize = 3;
pub const QUESTION_MAX_CHARS: usize = 500;

// ── Batching & persistence ────────────────────────────────────────────────
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 1_000;
/// Name of the durable queue that carries flushed batches.
pub const FLUSH_QUEUE_NAME: &str = "chat-batches";
pub const DEFAULT_PER_IDENTITY_CAP: i64 = 200;
pub const DEFAULT_PER_STREAM_CAP: i64 = 10_000;
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_LEASE_SECS: u64 = 30;

// ── Fan-out hub ───────────────────────────────────────────────────────────
pub const DEFAULT_LISTENER_BUFFER: usize = 256;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_INACTIVITY_SECS: u64 = 900;
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;
/// Recently seen message ids remembered per stream for duplicate suppression.
pub const DEFAULT_DEDUPE_WINDOW: usize = 512;
