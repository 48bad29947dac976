//! # Avani - Tiled Raster Stack Processing
//!
//! Avani turns a stack of co-registered interferograms into displacement
//! rate maps. The raster extent is partitioned into a grid of tiles and
//! every pipeline stage materialises one artifact per tile in a durable
//! store, so peak memory follows tile size rather than raster size and an
//! interrupted run picks up where it stopped.
//!
//! ## Features
//!
//! - **Tiled processing**: exact-cover grid partition with clamped halo
//!   reads for neighbourhood operations
//! - **Resumable stages**: artifacts already in the store are skipped, and
//!   a JSON run state pins the partition across invocations
//! - **Failure budget**: individual tiles may fail without sinking a run
//!   until their share exceeds the configured threshold
//! - **Reproducible products**: merging the same store twice yields
//!   bit-identical rasters, with failed tiles filled as nodata
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use avani::prelude::*;
//! use std::path::Path;
//!
//! let config = PipelineConfig::load(Path::new("pipeline.toml"))?;
//! let pipeline = Pipeline::new(config)?;
//! pipeline.run_all()?;
//! ```
//!
//! Stages can also run one at a time, in order, possibly from separate
//! processes:
//!
//! ```rust,ignore
//! pipeline.run_stage(StageId::Convert)?;
//! pipeline.run_stage(StageId::Prepare)?;
//! pipeline.run_stage(StageId::Process)?;
//! pipeline.run_stage(StageId::Merge)?;
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`core`]: tile grid, raster types, acquisition epochs, error handling
//! - [`io`]: GeoTIFF reading and writing
//! - [`config`]: run configuration and input resolution
//! - [`store`]: durable per-tile artifact store with a hot cache
//! - [`stages`]: the tile stages and the [`stages::TileStage`] trait
//! - [`execution`]: worker pool fan-out and progress tracking
//! - [`merge`]: assembly of tile artifacts into full-extent products
//! - [`pipeline`]: stage orchestration and persistent run state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod execution;
pub mod io;
pub mod merge;
pub mod pipeline;
pub mod stages;
pub mod store;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use avani::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::epoch::EpochPair;
    pub use crate::core::grid::{PixelWindow, Tile, TileGrid, TileId};
    pub use crate::core::raster::{CrsDefinition, GeoTransform, Raster, RasterMeta};

    // Errors
    pub use crate::core::error::{
        AvaniError, AvaniResult, ConfigError, GridError, MergeError, PipelineError,
        RasterIoError, StageError, StoreError,
    };

    // Configuration
    pub use crate::config::PipelineConfig;

    // Store
    pub use crate::store::{ArtifactBand, StoreStats, TileArtifact, TileStore};

    // Stages
    pub use crate::stages::{
        ConvertStage, LayerSource, PrepareStage, StackManifest, StageContext, StageId,
        TileStage, VelocityStage,
    };

    // Execution
    pub use crate::execution::progress::{ProgressCallback, ProgressTracker, ProgressUpdate};
    pub use crate::execution::runner::{
        RunnerOptions, StageRunSummary, StageRunner, TileOutcome,
    };

    // Merge and pipeline
    pub use crate::merge::MergeCoordinator;
    pub use crate::pipeline::{Pipeline, RunState, StageRecord, StageState};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
        assert_eq!(super::NAME, "avani");
    }

    #[test]
    fn test_grid_partition_through_prelude() {
        let grid = TileGrid::compute(100, 100, 2, 2).unwrap();
        assert_eq!(grid.len(), 4);
        assert_eq!(grid.tiles()[0].bounds, PixelWindow::new(0, 0, 50, 50));
    }

    #[test]
    fn test_stage_order_through_prelude() {
        assert_eq!(StageId::Merge.predecessor(), Some(StageId::Process));
        assert_eq!(StageId::from_slug("conv2tif"), Some(StageId::Convert));
    }

    #[test]
    fn test_default_config_validates_without_scaling() {
        let mut config = PipelineConfig::default();
        config.processing.scale_to_mm = false;
        assert!(config.validate().is_ok());
    }
}
