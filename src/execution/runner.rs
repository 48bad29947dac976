//! Stage runner: fans one stage out over the tile grid.
//!
//! Tiles are independent, so the runner hands them to a rayon pool and
//! drains worker reports on the calling thread, which keeps progress
//! callbacks ordered. A tile that was already materialised in the store is
//! skipped, which is what makes an interrupted run resumable. Per-tile
//! failures are collected, not fatal; the caller decides what the stage
//! outcome is by holding them against the failure threshold.

use crate::core::error::{AvaniError, PipelineError, StageError};
use crate::core::grid::{Tile, TileId};
use crate::execution::progress::ProgressTracker;
use crate::stages::{StageContext, StageId, TileStage};
use crossbeam::channel;
use rayon::prelude::*;
use std::time::Instant;

/// Options for stage runs.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Worker threads. 0 means one per core.
    pub workers: usize,
    /// Skip tiles whose artifact is already in the store.
    pub resume: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            resume: true,
        }
    }
}

impl RunnerOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Enable or disable skipping of existing artifacts.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// What happened to one tile during a stage run.
#[derive(Debug)]
pub enum TileOutcome {
    /// Artifact computed and persisted.
    Completed { tile: TileId, duration_ms: u64 },
    /// Artifact was already in the store.
    Skipped { tile: TileId },
    /// The tile failed.
    Failed { tile: TileId, error: StageError },
}

/// Tally of one stage run over the whole grid.
#[derive(Debug)]
pub struct StageRunSummary {
    /// Stage that ran.
    pub stage: StageId,
    /// Number of tiles in the grid.
    pub total: usize,
    /// Tiles computed this run.
    pub completed: usize,
    /// Tiles skipped because their artifact already existed.
    pub skipped: usize,
    /// Failed tiles with their error messages.
    pub failed: Vec<(TileId, String)>,
    /// Wall time of the run.
    pub duration_ms: u64,
}

impl StageRunSummary {
    /// Fraction of all tiles that failed.
    pub fn failed_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.failed.len() as f64 / self.total as f64
    }

    /// Ids of the failed tiles.
    pub fn failed_tiles(&self) -> Vec<TileId> {
        self.failed.iter().map(|(tile, _)| *tile).collect()
    }
}

/// Runs tile stages on a dedicated thread pool.
pub struct StageRunner {
    options: RunnerOptions,
    pool: rayon::ThreadPool,
}

impl StageRunner {
    /// Build a runner and its thread pool.
    pub fn new(options: RunnerOptions) -> Result<Self, AvaniError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("avani-worker-{i}"))
            .build()?;
        Ok(Self { options, pool })
    }

    /// Run `stage` over every tile of the grid.
    ///
    /// Returns an error only for conditions that invalidate the run as a
    /// whole: cancellation, or a store failure that no retry of a single
    /// tile can repair.
    pub fn run(
        &self,
        stage: &dyn TileStage,
        ctx: &StageContext<'_>,
        tracker: &ProgressTracker,
    ) -> Result<StageRunSummary, AvaniError> {
        let started = Instant::now();
        let tiles = ctx.grid.tiles();
        let resume = self.options.resume;

        let (tx, rx) = channel::unbounded();
        let mut outcomes: Vec<TileOutcome> = Vec::with_capacity(tiles.len());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                self.pool.install(|| {
                    tiles.par_iter().for_each_with(tx, |tx, tile| {
                        if tracker.is_cancelled() {
                            return;
                        }
                        let outcome = run_one(stage, ctx, tile, resume);
                        if let TileOutcome::Failed { error, .. } = &outcome {
                            if !error.is_recoverable() {
                                tracker.cancel();
                            }
                        }
                        let _ = tx.send(outcome);
                    });
                });
            });

            // Drain reports as they arrive; the loop ends once every worker
            // has dropped its sender.
            for outcome in rx.iter() {
                match &outcome {
                    TileOutcome::Completed { tile, duration_ms } => {
                        tracker.tile_completed(*tile, *duration_ms)
                    }
                    TileOutcome::Skipped { tile } => tracker.tile_skipped(*tile),
                    TileOutcome::Failed { tile, error } => {
                        tracker.tile_failed(*tile, error.to_string())
                    }
                }
                outcomes.push(outcome);
            }
        });

        let mut completed = 0usize;
        let mut skipped = 0usize;
        let mut failed = Vec::new();
        let mut fatal: Option<StageError> = None;
        for outcome in outcomes {
            match outcome {
                TileOutcome::Completed { .. } => completed += 1,
                TileOutcome::Skipped { .. } => skipped += 1,
                TileOutcome::Failed { tile, error } => {
                    if !error.is_recoverable() && fatal.is_none() {
                        fatal = Some(error);
                    } else {
                        failed.push((tile, error.to_string()));
                    }
                }
            }
        }

        if let Some(error) = fatal {
            return Err(error.into());
        }
        if tracker.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: stage.id(),
                completed: completed + skipped,
                total: tiles.len(),
            }
            .into());
        }

        Ok(StageRunSummary {
            stage: stage.id(),
            total: tiles.len(),
            completed,
            skipped,
            failed,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn run_one(stage: &dyn TileStage, ctx: &StageContext<'_>, tile: &Tile, resume: bool) -> TileOutcome {
    if resume && ctx.store.contains(stage.id(), tile.id) {
        return TileOutcome::Skipped { tile: tile.id };
    }

    let tile_start = Instant::now();
    let result = stage.run_tile(ctx, tile).and_then(|artifact| {
        ctx.store
            .put(stage.id(), artifact)
            .map_err(|source| StageError::Persist {
                tile: tile.id,
                source,
            })
    });
    match result {
        Ok(()) => TileOutcome::Completed {
            tile: tile.id,
            duration_ms: tile_start.elapsed().as_millis() as u64,
        },
        Err(error) => TileOutcome::Failed {
            tile: tile.id,
            error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{StageResult, StoreError};
    use crate::stages::fixtures::{test_run, TestRun};
    use crate::stages::ConvertStage;
    use crate::store::{ArtifactBand, TileArtifact};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn four_tile_run() -> TestRun {
        test_run(
            8,
            8,
            &[("geo_060619-061002_unw", (1..=64).map(|i| i as f32).collect())],
            |config| *config = std::mem::take(config).with_grid(2, 2),
        )
    }

    fn started_tracker(stage: StageId, total: usize) -> ProgressTracker {
        let mut tracker = ProgressTracker::new(stage, total);
        tracker.start();
        tracker
    }

    fn flat_artifact(tile: &Tile) -> TileArtifact {
        TileArtifact::new(
            tile.id,
            tile.bounds,
            tile.bounds,
            vec![ArtifactBand {
                name: "flat".to_string(),
                span_years: None,
                data: vec![1.0; tile.bounds.area() as usize],
            }],
        )
    }

    struct CountingStage {
        calls: AtomicUsize,
    }

    impl CountingStage {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TileStage for CountingStage {
        fn id(&self) -> StageId {
            StageId::Convert
        }

        fn name(&self) -> &str {
            "counting"
        }

        fn run_tile(&self, _ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(flat_artifact(tile))
        }
    }

    struct TopRowFails;

    impl TileStage for TopRowFails {
        fn id(&self) -> StageId {
            StageId::Convert
        }

        fn name(&self) -> &str {
            "top-row-fails"
        }

        fn run_tile(&self, _ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact> {
            if tile.id.row == 0 {
                return Err(StageError::InsufficientData {
                    tile: tile.id,
                    fraction: 1.0,
                    limit: 0.5,
                });
            }
            Ok(flat_artifact(tile))
        }
    }

    struct BrokenStore;

    impl TileStage for BrokenStore {
        fn id(&self) -> StageId {
            StageId::Convert
        }

        fn name(&self) -> &str {
            "broken-store"
        }

        fn run_tile(&self, _ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact> {
            Err(StageError::Persist {
                tile: tile.id,
                source: StoreError::Write {
                    path: PathBuf::from("/nowhere"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                },
            })
        }
    }

    #[test]
    fn test_runs_every_tile() {
        let run = four_tile_run();
        let runner = StageRunner::new(RunnerOptions::new().with_workers(2)).unwrap();
        let tracker = started_tracker(StageId::Convert, 4);

        let summary = runner
            .run(&ConvertStage, &run.ctx(), &tracker)
            .unwrap();

        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.skipped, 0);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.failed_fraction(), 0.0);
        assert_eq!(run.store.tile_ids(StageId::Convert).len(), 4);
    }

    #[test]
    fn test_resume_skips_stored_tiles() {
        let run = four_tile_run();
        for tile in &run.grid.tiles()[..2] {
            run.store.put(StageId::Convert, flat_artifact(tile)).unwrap();
        }

        let stage = CountingStage::new();
        let runner = StageRunner::new(RunnerOptions::default()).unwrap();
        let tracker = started_tracker(StageId::Convert, 4);
        let summary = runner.run(&stage, &run.ctx(), &tracker).unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(stage.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_resume_disabled_recomputes() {
        let run = four_tile_run();
        for tile in run.grid.tiles() {
            run.store.put(StageId::Convert, flat_artifact(tile)).unwrap();
        }

        let stage = CountingStage::new();
        let runner = StageRunner::new(RunnerOptions::new().with_resume(false)).unwrap();
        let tracker = started_tracker(StageId::Convert, 4);
        let summary = runner.run(&stage, &run.ctx(), &tracker).unwrap();

        assert_eq!(summary.completed, 4);
        assert_eq!(summary.skipped, 0);
        assert_eq!(stage.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_failures_recorded_without_aborting() {
        let run = four_tile_run();
        let runner = StageRunner::new(RunnerOptions::default()).unwrap();
        let tracker = started_tracker(StageId::Convert, 4);

        let summary = runner.run(&TopRowFails, &run.ctx(), &tracker).unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(summary.failed_fraction(), 0.5);

        let mut failed = summary.failed_tiles();
        failed.sort();
        assert_eq!(failed, vec![TileId::new(0, 0), TileId::new(0, 1)]);
        // only the surviving tiles were persisted
        assert_eq!(
            run.store.tile_ids(StageId::Convert),
            vec![TileId::new(1, 0), TileId::new(1, 1)]
        );
    }

    #[test]
    fn test_cancelled_run_reports_progress() {
        let run = four_tile_run();
        let flag = Arc::new(AtomicBool::new(true));
        let mut tracker =
            ProgressTracker::new(StageId::Convert, 4).with_cancel_flag(flag);
        tracker.start();

        let runner = StageRunner::new(RunnerOptions::default()).unwrap();
        let err = runner.run(&ConvertStage, &run.ctx(), &tracker).unwrap_err();

        match err {
            AvaniError::Pipeline(PipelineError::Cancelled {
                stage,
                completed,
                total,
            }) => {
                assert_eq!(stage, StageId::Convert);
                assert_eq!(completed, 0);
                assert_eq!(total, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(run.store.is_empty());
    }

    #[test]
    fn test_unrecoverable_error_aborts_run() {
        let run = four_tile_run();
        let runner = StageRunner::new(RunnerOptions::default()).unwrap();
        let tracker = started_tracker(StageId::Convert, 4);

        let err = runner.run(&BrokenStore, &run.ctx(), &tracker).unwrap_err();
        assert!(matches!(
            err,
            AvaniError::Stage(StageError::Persist { .. })
        ));
    }
}
