//! Pipeline orchestration.
//!
//! Ties the pieces together: resolves the input stack, computes the grid,
//! enforces the stage barrier against the recorded run state, fans tile
//! stages out through the runner and drives the merge. Every stage
//! invocation stands on its own, so the stages of one run can be spread
//! over separate processes and still resume cleanly.

pub mod state;

pub use state::{RunState, StageRecord, StageState};

use crate::config::PipelineConfig;
use crate::core::error::{AvaniError, PipelineError};
use crate::core::grid::TileGrid;
use crate::core::raster::RasterMeta;
use crate::execution::{
    ProgressCallback, ProgressTracker, ProgressUpdate, RunnerOptions, StageRunner,
};
use crate::io::geotiff;
use crate::merge::MergeCoordinator;
use crate::stages::velocity::{ERROR_BAND, RATE_BAND, SAMPLES_BAND};
use crate::stages::{tile_stage, StackManifest, StageContext, StageId, TileStage};
use crate::store::TileStore;
use crate::core::grid::TileId;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Name of the artifact store directory inside the output directory.
pub const STORE_DIR: &str = "store";

/// Drives stages over one configured run.
pub struct Pipeline {
    config: PipelineConfig,
    cancel_flag: Arc<AtomicBool>,
}

impl Pipeline {
    /// Build a pipeline over a validated configuration.
    pub fn new(config: PipelineConfig) -> Result<Self, AvaniError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share the flag that requests cancellation. A signal handler can set
    /// it to stop tile dispatch between tiles.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// The configuration this pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage in order.
    pub fn run_all(&self) -> Result<(), AvaniError> {
        for id in StageId::all() {
            self.run_stage(id)?;
        }
        Ok(())
    }

    /// Run one stage, honouring the barrier and the recorded run state.
    ///
    /// A stage that is already complete returns immediately; a failed or
    /// interrupted stage runs again, skipping tiles whose artifacts
    /// survived the previous attempt.
    pub fn run_stage(&self, id: StageId) -> Result<(), AvaniError> {
        let out_dir = self.config.output.dir.clone();
        fs::create_dir_all(&out_dir)?;

        let stack = StackManifest::resolve(&self.config)?;
        let grid = TileGrid::compute(
            stack.meta.width,
            stack.meta.height,
            self.config.tiling.rows,
            self.config.tiling.cols,
        )?;

        let mut state = if id == StageId::Merge {
            // Merge only assembles what earlier stages recorded; a missing
            // state means there is nothing to assemble.
            match RunState::load(&out_dir)? {
                Some(state) => {
                    state.ensure_grid(&grid, &RunState::path(&out_dir))?;
                    state
                }
                None => return Err(PipelineError::NoRunState { dir: out_dir }.into()),
            }
        } else {
            RunState::load_or_create(&out_dir, &grid)?
        };
        state.workers = self.config.execution.workers;
        state.inputs = stack
            .layers
            .iter()
            .map(|layer| layer.path.display().to_string())
            .collect();

        if let Some(predecessor) = id.predecessor() {
            let record = state.stage(predecessor);
            if record.state == StageState::Failed {
                return Err(PipelineError::RunFailed {
                    failed: predecessor,
                }
                .into());
            }
            if !record.is_complete() {
                return Err(PipelineError::PredecessorIncomplete {
                    stage: id,
                    predecessor,
                }
                .into());
            }
        }
        if state.stage(id).is_complete() {
            log::info!("stage {id} is already complete; nothing to do");
            return Ok(());
        }

        let store = TileStore::open(out_dir.join(STORE_DIR))?;
        let ctx = StageContext {
            config: &self.config,
            grid: &grid,
            store: &store,
            stack: &stack,
        };

        match tile_stage(id) {
            Some(stage) => self.run_tile_stage(stage.as_ref(), &ctx, &mut state, &out_dir),
            None => self.run_merge(&ctx, &mut state, &out_dir),
        }
    }

    fn run_tile_stage(
        &self,
        stage: &dyn TileStage,
        ctx: &StageContext<'_>,
        state: &mut RunState,
        out_dir: &Path,
    ) -> Result<(), AvaniError> {
        let id = stage.id();
        state.stage_mut(id).mark_running();
        state.save(out_dir)?;

        let mut tracker = ProgressTracker::new(id, ctx.grid.len())
            .with_cancel_flag(self.cancel_flag.clone())
            .with_callback(progress_logger());
        tracker.start();

        let runner = StageRunner::new(
            RunnerOptions::new().with_workers(self.config.execution.workers),
        )?;
        let result = runner.run(stage, ctx, &tracker);
        tracker.finish();

        match result {
            Ok(summary) => {
                let limit = self.config.execution.fail_threshold;
                let fraction = summary.failed_fraction();
                if fraction > limit {
                    let error = PipelineError::ThresholdExceeded {
                        stage: id,
                        failed: summary.failed.len(),
                        total: summary.total,
                        fraction,
                        limit,
                    };
                    state
                        .stage_mut(id)
                        .mark_failed(error.to_string(), summary.failed_tiles());
                    state.save(out_dir)?;
                    Err(error.into())
                } else {
                    for (tile, message) in &summary.failed {
                        log::warn!(
                            "{id}: tile {tile} failed and its footprint will be nodata: {message}"
                        );
                    }
                    state
                        .stage_mut(id)
                        .mark_complete(summary.completed + summary.skipped, summary.failed_tiles());
                    state.save(out_dir)?;
                    Ok(())
                }
            }
            Err(error) => {
                match &error {
                    AvaniError::Pipeline(PipelineError::Cancelled { .. }) => {
                        state.stage_mut(id).mark_pending();
                    }
                    _ => {
                        state.stage_mut(id).mark_failed(error.to_string(), vec![]);
                    }
                }
                state.save(out_dir)?;
                Err(error)
            }
        }
    }

    fn run_merge(
        &self,
        ctx: &StageContext<'_>,
        state: &mut RunState,
        out_dir: &Path,
    ) -> Result<(), AvaniError> {
        state.stage_mut(StageId::Merge).mark_running();
        state.save(out_dir)?;

        // Tiles the rate stage recorded as failed become nodata holes.
        let failed = state.stage(StageId::Process).failed_tiles.clone();
        let mut meta = ctx.stack.meta.clone();
        meta.nodata = f32::NAN;

        let merger = MergeCoordinator::new(ctx.grid, ctx.store);
        match self.write_products(&merger, &meta, &failed, out_dir) {
            Ok(products) => {
                if !self.config.output.keep_artifacts {
                    ctx.store.clear()?;
                }
                for path in &products {
                    log::info!("wrote {}", path.display());
                }
                let merged = ctx.grid.len() - failed.len();
                state.stage_mut(StageId::Merge).mark_complete(merged, failed);
                state.save(out_dir)?;
                Ok(())
            }
            Err(error) => {
                state
                    .stage_mut(StageId::Merge)
                    .mark_failed(error.to_string(), vec![]);
                state.save(out_dir)?;
                Err(error)
            }
        }
    }

    fn write_products(
        &self,
        merger: &MergeCoordinator<'_>,
        meta: &RasterMeta,
        failed: &[TileId],
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, AvaniError> {
        let mut written = Vec::new();
        for band in [RATE_BAND, ERROR_BAND, SAMPLES_BAND] {
            let raster = merger.merge_band(StageId::Process, band, meta, failed)?;
            let path = out_dir.join(format!("{band}.tif"));
            geotiff::write(&path, &raster)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn progress_logger() -> ProgressCallback {
    Box::new(|update| match update {
        ProgressUpdate::Started { stage, total_tiles } => {
            log::info!("{stage}: running {total_tiles} tile(s)");
        }
        ProgressUpdate::TileCompleted {
            tile,
            duration_ms,
            done,
            total,
            estimated_remaining_ms,
        } => match estimated_remaining_ms {
            Some(eta) => {
                log::debug!("{tile} done in {duration_ms} ms ({done}/{total}, ~{eta} ms left)")
            }
            None => log::debug!("{tile} done in {duration_ms} ms ({done}/{total})"),
        },
        ProgressUpdate::TileSkipped { tile } => {
            log::debug!("{tile}: artifact exists, skipping");
        }
        ProgressUpdate::TileFailed { tile, message } => {
            log::warn!("{tile}: {message}");
        }
        ProgressUpdate::Completed {
            stage,
            duration_ms,
            completed,
            skipped,
            failed,
        } => {
            log::info!(
                "{stage}: {completed} computed, {skipped} skipped, {failed} failed in {duration_ms} ms"
            );
        }
        ProgressUpdate::Cancelled { stage } => {
            log::warn!("{stage}: cancellation requested");
        }
    })
}
