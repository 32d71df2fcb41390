// Chorus integration tests — one binary, in-process platform doubles.

mod lifecycle;
mod persistence;
mod pipeline;
mod support;
