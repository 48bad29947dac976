//! Stage execution module.
//!
//! This module fans tile stages out over a worker pool and tracks their
//! progress.

pub mod progress;
pub mod runner;

pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate};
pub use runner::{RunnerOptions, StageRunSummary, StageRunner, TileOutcome};
