// Chorus — multi-platform live chat aggregator.
//
// Module layout:
//   config  — TOML configuration with production defaults
//   engine  — connection lifecycle, platform sessions, batching, persistence
//             queue, fan-out hub and the Engine orchestrator
//
// Moderation, canonical types and the SQLite store live in `chorus-core`.

pub mod config;
pub mod engine;

pub use chorus_core::{EngineError, EngineResult};
pub use config::ChorusConfig;
pub use engine::connections::{ConnectionEvent, ConnectionHandle};
pub use engine::hub::{HubFrame, Subscriber};
pub use engine::orchestrator::{Engine, EngineDeps, Ingested};
pub use engine::stats::{EngineStats, MetricsSnapshot};
