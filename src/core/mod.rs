//! Core types for the Avani tiled raster pipeline.
//!
//! This module contains the foundational types the stages are built from:
//! - Tile grid partitioning and pixel windows
//! - Raster values with geotransform and CRS metadata
//! - Acquisition epoch pairs
//! - Error types

pub mod epoch;
pub mod error;
pub mod grid;
pub mod raster;

// Re-export commonly used types
pub use epoch::EpochPair;
pub use error::{AvaniError, ConfigError, GridError, MergeError, PipelineError, StageError, StoreError};
pub use grid::{PixelWindow, Tile, TileGrid, TileId};
pub use raster::{CrsDefinition, GeoTransform, Raster, RasterMeta};
