// Chorus Engine — the real-time chat pipeline runtime.
// Upstream sessions feed a single pipeline that moderates, fans out and
// batches messages for durable writes.

pub mod batch;
pub mod connections;
pub mod hub;
pub mod orchestrator;
pub mod persistence;
pub mod platforms;
pub mod stats;
