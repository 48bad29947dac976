//! Error types for Avani.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Carry the tile and stage they belong to
//! - Include actionable information (which file, what to fix)
//! - Support error chaining for context

use crate::core::grid::TileId;
use crate::stages::StageId;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for Avani.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum AvaniError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Raster I/O error: {0}")]
    Raster(#[from] RasterIoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{0}")]
    Other(String),
}

/// Errors from tile grid construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Grid needs at least one row and one column, got {rows}x{cols}")]
    EmptyGrid { rows: usize, cols: usize },

    #[error("Cannot split {height} pixel rows into {rows} tile rows")]
    RowsExceedHeight { rows: usize, height: u32 },

    #[error("Cannot split {width} pixel columns into {cols} tile columns")]
    ColsExceedWidth { cols: usize, width: u32 },

    #[error("Raster extent is empty ({width}x{height})")]
    EmptyExtent { width: u32, height: u32 },
}

/// Errors while reading or writing GeoTIFF rasters.
#[derive(Error, Debug)]
pub enum RasterIoError {
    #[error("Failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TIFF error in {}: {source}", path.display())]
    Tiff {
        path: PathBuf,
        source: tiff::TiffError,
    },

    #[error("{} is not a single-band 32-bit float raster", path.display())]
    UnsupportedLayout { path: PathBuf },

    #[error("{} carries no pixel scale / tie point georeferencing", path.display())]
    MissingGeoreference { path: PathBuf },

    #[error("Window {window} does not fit inside {} ({width}x{height})", path.display())]
    WindowOutOfBounds {
        path: PathBuf,
        window: String,
        width: u32,
        height: u32,
    },
}

/// Errors from run configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Failed to read raster list {}: {source}", path.display())]
    ListRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No input rasters configured")]
    NoInputs,

    #[error("Input raster does not exist: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("No epoch pair in file name {}: expected yymmdd-yymmdd or yyyymmdd-yyyymmdd", path.display())]
    MissingEpochPair { path: PathBuf },

    #[error("File name {} does not contain a valid calendar date pair", path.display())]
    InvalidEpochPair { path: PathBuf },

    #[error("{field} must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: String,
    },

    #[error("Input rasters are not co-registered: {} is {got}, expected {expected}", path.display())]
    InconsistentGeometry {
        path: PathBuf,
        expected: String,
        got: String,
    },

    #[error("Tile grid {requested} conflicts with the recorded grid {recorded}; remove {} to start over", state_path.display())]
    GridMismatch {
        requested: String,
        recorded: String,
        state_path: PathBuf,
    },
}

/// Errors from the tile artifact store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No artifact for stage '{stage}' tile {tile}")]
    NotFound { stage: StageId, tile: TileId },

    #[error("Failed to create store directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write artifact {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read artifact {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode artifact for stage '{stage}' tile {tile}: {source}")]
    Encode {
        stage: StageId,
        tile: TileId,
        source: bincode::Error,
    },

    #[error("Corrupt artifact {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },
}

/// Per-tile failures inside a stage run.
///
/// These are collected by the stage runner rather than aborting the run;
/// whether the run as a whole fails is decided against the configured
/// failure threshold.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Tile {tile}: {:.1}% nodata exceeds the {:.1}% limit", fraction * 100.0, limit * 100.0)]
    InsufficientData {
        tile: TileId,
        fraction: f64,
        limit: f64,
    },

    #[error("Tile {tile}: singular design, no layer has a non-zero time span")]
    SingularDesign { tile: TileId },

    #[error("Tile {tile}: missing upstream artifact from stage '{stage}'")]
    MissingUpstream { tile: TileId, stage: StageId },

    #[error("Tile {tile}: upstream artifact has no '{band}' band")]
    MissingBand { tile: TileId, band: String },

    #[error("Tile {tile}: {source}")]
    Raster {
        tile: TileId,
        source: RasterIoError,
    },

    #[error("Tile {tile}: failed to load upstream artifact: {source}")]
    Load { tile: TileId, source: StoreError },

    #[error("Tile {tile}: failed to persist artifact: {source}")]
    Persist { tile: TileId, source: StoreError },
}

/// Errors while assembling tiles into full-extent rasters.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Stage '{stage}' left {} tile(s) unaccounted for: {}", missing.len(), format_tiles(missing))]
    Incomplete {
        stage: StageId,
        missing: Vec<TileId>,
    },

    #[error("Tile {tile} artifact has no '{band}' band")]
    MissingBand { tile: TileId, band: String },

    #[error("Tile {tile}: {source}")]
    Artifact { tile: TileId, source: StoreError },
}

/// Errors from the stage state machine.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage '{stage}' requires stage '{predecessor}' to be complete; run that first")]
    PredecessorIncomplete {
        stage: StageId,
        predecessor: StageId,
    },

    #[error("Run already failed at stage '{failed}'; re-run that stage or remove the output directory")]
    RunFailed { failed: StageId },

    #[error("Stage '{stage}' failed on {failed} of {total} tiles ({:.0}% > {:.0}% limit)", fraction * 100.0, limit * 100.0)]
    ThresholdExceeded {
        stage: StageId,
        failed: usize,
        total: usize,
        fraction: f64,
        limit: f64,
    },

    #[error("Stage '{stage}' cancelled after {completed} of {total} tiles")]
    Cancelled {
        stage: StageId,
        completed: usize,
        total: usize,
    },

    #[error("No run state found in {}; run conv2tif first", dir.display())]
    NoRunState { dir: PathBuf },
}

fn format_tiles(tiles: &[TileId]) -> String {
    const SHOWN: usize = 8;
    let listed: Vec<String> = tiles.iter().take(SHOWN).map(|t| t.to_string()).collect();
    if tiles.len() > SHOWN {
        format!("{}, ... ({} more)", listed.join(", "), tiles.len() - SHOWN)
    } else {
        listed.join(", ")
    }
}

// ============================================================================
// Error Utilities
// ============================================================================

impl StageError {
    /// Get the tile this error belongs to.
    pub fn tile(&self) -> TileId {
        match self {
            StageError::InsufficientData { tile, .. }
            | StageError::SingularDesign { tile }
            | StageError::MissingUpstream { tile, .. }
            | StageError::MissingBand { tile, .. }
            | StageError::Raster { tile, .. }
            | StageError::Load { tile, .. }
            | StageError::Persist { tile, .. } => *tile,
        }
    }

    /// Check if the run can keep scheduling other tiles after this error.
    ///
    /// Data problems are confined to one tile; store failures usually mean
    /// the disk is unhappy and every following tile would fail the same way.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StageError::Load { .. } | StageError::Persist { .. }
        )
    }
}

/// Result type alias for Avani operations.
pub type AvaniResult<T> = Result<T, AvaniError>;

/// Result type alias for grid construction.
pub type GridResult<T> = Result<T, GridError>;

/// Result type alias for per-tile stage work.
pub type StageResult<T> = Result<T, StageError>;

/// Result type alias for artifact store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_tile() {
        let err = StageError::SingularDesign {
            tile: TileId::new(2, 3),
        };
        assert_eq!(err.tile(), TileId::new(2, 3));
    }

    #[test]
    fn test_stage_error_recoverability() {
        let data = StageError::InsufficientData {
            tile: TileId::new(0, 0),
            fraction: 0.95,
            limit: 0.9,
        };
        assert!(data.is_recoverable());

        let persist = StageError::Persist {
            tile: TileId::new(0, 0),
            source: StoreError::NotFound {
                stage: StageId::Convert,
                tile: TileId::new(0, 0),
            },
        };
        assert!(!persist.is_recoverable());
    }

    #[test]
    fn test_insufficient_data_message_is_percent() {
        let err = StageError::InsufficientData {
            tile: TileId::new(1, 1),
            fraction: 0.925,
            limit: 0.9,
        };
        let msg = err.to_string();
        assert!(msg.contains("92.5%"), "unexpected message: {msg}");
        assert!(msg.contains("90.0%"), "unexpected message: {msg}");
    }

    #[test]
    fn test_missing_tile_list_is_truncated() {
        let missing: Vec<TileId> = (0..20).map(|r| TileId::new(r, 0)).collect();
        let err = MergeError::Incomplete {
            stage: StageId::Process,
            missing,
        };
        let msg = err.to_string();
        assert!(msg.contains("20 tile(s)"));
        assert!(msg.contains("(12 more)"));
    }
}
