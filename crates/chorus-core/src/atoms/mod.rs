// ── Chorus Atoms Layer ─────────────────────────────────────────────────────
// Pure constants, error types, canonical records and collaborator traits.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from moderation/ or store/.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
