//! Batch processing of the inbox: worker pool, progress events and
//! cost bookkeeping.

pub mod orchestrator;

pub use orchestrator::{BatchOrchestrator, ProgressCallback};
