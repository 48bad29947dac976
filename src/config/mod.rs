//! Run configuration.
//!
//! A run is described by one TOML file with four tables: `[input]`,
//! `[output]`, `[tiling]` and `[execution]`, plus `[processing]` knobs for
//! the stages themselves. Every field has a default except the input rasters
//! and the output directory, so a minimal config is a handful of lines.
//!
//! Input rasters can be listed explicitly, read from a list file (one path
//! per line, `#` comments allowed), or collected with a glob pattern; the
//! three sources are combined in that order and deduplicated, and the
//! resulting order fixes the layer order of the stack.

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Default fraction of failed tiles a stage tolerates before halting.
pub const DEFAULT_FAIL_THRESHOLD: f64 = 0.5;

/// Default limit on the nodata fraction of a tile's input window.
pub const DEFAULT_MAX_NAN_FRACTION: f64 = 0.9;

/// Default minimum number of finite observations a pixel needs for a rate.
pub const DEFAULT_MIN_OBSERVATIONS: usize = 3;

/// Complete configuration for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Input stack description.
    pub input: InputConfig,
    /// Output locations.
    pub output: OutputConfig,
    /// Tile grid shape and halo width.
    pub tiling: TilingConfig,
    /// Worker pool and failure policy.
    pub execution: ExecutionConfig,
    /// Stage computation knobs.
    pub processing: ProcessingConfig,
}

/// The interferogram stack to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Explicit raster paths, in stack order.
    pub rasters: Vec<PathBuf>,
    /// Optional list file with one raster path per line. Relative entries
    /// resolve against the list file's directory.
    pub list: Option<PathBuf>,
    /// Optional glob pattern; matches are appended in alphabetical order.
    pub glob: Option<String>,
    /// Nodata sentinel of the input rasters.
    pub nodata: f32,
    /// Radar wavelength in metres, needed to scale phase to millimetres.
    pub wavelength: Option<f64>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            rasters: Vec::new(),
            list: None,
            glob: None,
            nodata: 0.0,
            wavelength: None,
        }
    }
}

/// Where results and intermediate artifacts live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Output directory; also holds the run state and the tile store.
    pub dir: PathBuf,
    /// Keep the tile store after a successful merge instead of deleting it.
    pub keep_artifacts: bool,
}

/// Tile grid shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TilingConfig {
    /// Number of tile rows.
    pub rows: usize,
    /// Number of tile columns.
    pub cols: usize,
    /// Read-only border in pixels around each tile, consumed by spatial
    /// filters. Output pixels always come from the tile interior.
    pub halo: u32,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            rows: 1,
            cols: 1,
            halo: 0,
        }
    }
}

/// Worker pool size and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Number of worker threads (0 = one per core).
    pub workers: usize,
    /// Fraction of failed tiles above which a stage halts the run.
    pub fail_threshold: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
        }
    }
}

/// Stage computation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Tiles whose input window exceeds this nodata fraction fail.
    pub max_nan_fraction: f64,
    /// Convert phase radians to millimetres of displacement.
    pub scale_to_mm: bool,
    /// NaN-aware mean filter radius in pixels (0 = off).
    pub smoothing_radius: u32,
    /// Minimum finite observations a pixel needs for a rate estimate.
    pub min_observations: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_nan_fraction: DEFAULT_MAX_NAN_FRACTION,
            scale_to_mm: true,
            smoothing_radius: 0,
            min_observations: DEFAULT_MIN_OBSERVATIONS,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Parse and validate configuration text. `origin` is only used in
    /// error messages.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiling.rows == 0 || self.tiling.cols == 0 {
            return Err(ConfigError::OutOfRange {
                field: "tiling.rows/cols",
                requirement: "at least 1",
                value: format!("{}x{}", self.tiling.rows, self.tiling.cols),
            });
        }
        if !(0.0..=1.0).contains(&self.execution.fail_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "execution.fail_threshold",
                requirement: "between 0 and 1",
                value: self.execution.fail_threshold.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.processing.max_nan_fraction) {
            return Err(ConfigError::OutOfRange {
                field: "processing.max_nan_fraction",
                requirement: "between 0 and 1",
                value: self.processing.max_nan_fraction.to_string(),
            });
        }
        if self.processing.min_observations == 0 {
            return Err(ConfigError::OutOfRange {
                field: "processing.min_observations",
                requirement: "at least 1",
                value: "0".to_string(),
            });
        }
        if self.tiling.halo < self.processing.smoothing_radius {
            return Err(ConfigError::OutOfRange {
                field: "tiling.halo",
                requirement: "at least processing.smoothing_radius",
                value: format!(
                    "{} (radius {})",
                    self.tiling.halo, self.processing.smoothing_radius
                ),
            });
        }
        if self.processing.scale_to_mm {
            match self.input.wavelength {
                Some(w) if w > 0.0 => {}
                Some(w) => {
                    return Err(ConfigError::OutOfRange {
                        field: "input.wavelength",
                        requirement: "positive",
                        value: w.to_string(),
                    })
                }
                None => {
                    return Err(ConfigError::OutOfRange {
                        field: "input.wavelength",
                        requirement: "set when processing.scale_to_mm is on",
                        value: "missing".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Collect the input stack: explicit paths, then the list file, then
    /// glob matches. Order is preserved, duplicates are dropped, and every
    /// path must exist.
    pub fn resolve_inputs(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let mut paths = self.input.rasters.clone();

        if let Some(list) = &self.input.list {
            let text = fs::read_to_string(list).map_err(|source| ConfigError::ListRead {
                path: list.clone(),
                source,
            })?;
            let base = list.parent().unwrap_or_else(|| Path::new("."));
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let entry = PathBuf::from(line);
                if entry.is_absolute() {
                    paths.push(entry);
                } else {
                    paths.push(base.join(entry));
                }
            }
        }

        if let Some(pattern) = &self.input.glob {
            let matches = glob::glob(pattern).map_err(|source| ConfigError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            for entry in matches {
                match entry {
                    Ok(path) => paths.push(path),
                    Err(err) => log::warn!("skipping unreadable glob match: {err}"),
                }
            }
        }

        let mut seen = HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));

        if paths.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        for path in &paths {
            if !path.is_file() {
                return Err(ConfigError::MissingInput { path: path.clone() });
            }
        }
        Ok(paths)
    }

    /// Apply command line grid overrides.
    pub fn apply_grid_override(&mut self, rows: Option<usize>, cols: Option<usize>) {
        if let Some(rows) = rows {
            self.tiling.rows = rows;
        }
        if let Some(cols) = cols {
            self.tiling.cols = cols;
        }
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output.dir = dir.into();
        self
    }

    /// Set the explicit input rasters.
    pub fn with_rasters(mut self, rasters: Vec<PathBuf>) -> Self {
        self.input.rasters = rasters;
        self
    }

    /// Set the tile grid shape.
    pub fn with_grid(mut self, rows: usize, cols: usize) -> Self {
        self.tiling.rows = rows;
        self.tiling.cols = cols;
        self
    }

    /// Set the number of worker threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.execution.workers = workers;
        self
    }
}
