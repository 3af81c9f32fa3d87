//! Pipeline runner behind the `ingest` binary.

pub mod pipeline;

pub use pipeline::{run_pipeline, LoadOutcome};
