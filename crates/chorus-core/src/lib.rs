// Chorus Core — moderation, canonical types and the SQLite store.
//
// Module layout:
//   atoms       — constants, error taxonomy, canonical types, collaborator traits
//   moderation  — feature extraction, adaptive classifier, scorer, reputation,
//                 sentiment, question detection, and the Moderator that ties them
//   store       — bounded SQLite pool, migrations, message/checkpoint/queue stores
//
// Nothing in this crate opens a network socket. Platform sessions, timers and
// fan-out live in the `chorus` runtime crate.

pub mod atoms;
pub mod moderation;
pub mod store;

pub use atoms::error::{EngineError, EngineResult, ErrorClass};
pub use atoms::types::*;
