//! Pipeline stages.
//!
//! The pipeline is four discrete stages run in a fixed order: `conv2tif`
//! pulls the input stack apart into per-tile artifacts, `prepifg` normalises
//! them, `process` estimates displacement rates and `merge` assembles the
//! full-extent products. The first three are tile stages: pure per-tile
//! computations fanned out over the worker pool, each producing exactly one
//! artifact per tile. Merge is not tiled and lives in its own module.

pub mod convert;
pub mod prepare;
pub mod velocity;

pub use convert::ConvertStage;
pub use prepare::PrepareStage;
pub use velocity::VelocityStage;

use crate::config::PipelineConfig;
use crate::core::epoch::EpochPair;
use crate::core::error::{AvaniError, ConfigError, StageError, StageResult, StoreError};
use crate::core::grid::{Tile, TileGrid, TileId};
use crate::core::raster::RasterMeta;
use crate::io::geotiff;
use crate::store::{TileArtifact, TileStore};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// The pipeline stages in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    /// Stack conversion into per-tile artifacts.
    Convert,
    /// Phase scaling and smoothing.
    Prepare,
    /// Displacement rate estimation.
    Process,
    /// Product assembly.
    Merge,
}

impl StageId {
    /// All stages in run order.
    pub fn all() -> [StageId; 4] {
        [
            StageId::Convert,
            StageId::Prepare,
            StageId::Process,
            StageId::Merge,
        ]
    }

    /// Stable short name, used for CLI commands, store directories and the
    /// run state file.
    pub fn slug(&self) -> &'static str {
        match self {
            StageId::Convert => "conv2tif",
            StageId::Prepare => "prepifg",
            StageId::Process => "process",
            StageId::Merge => "merge",
        }
    }

    /// Parse a slug back into a stage.
    pub fn from_slug(slug: &str) -> Option<StageId> {
        StageId::all().into_iter().find(|s| s.slug() == slug)
    }

    /// The stage that must complete before this one may run.
    pub fn predecessor(&self) -> Option<StageId> {
        match self {
            StageId::Convert => None,
            StageId::Prepare => Some(StageId::Convert),
            StageId::Process => Some(StageId::Prepare),
            StageId::Merge => Some(StageId::Process),
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// One input interferogram of the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSource {
    /// Raster file.
    pub path: PathBuf,
    /// Band name carried through the artifacts, taken from the file stem.
    pub band_name: String,
    /// Acquisition pair recovered from the file name.
    pub epochs: EpochPair,
}

impl LayerSource {
    /// Describe one input raster.
    pub fn from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let epochs = EpochPair::from_path(&path)?;
        let band_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("layer")
            .to_string();
        Ok(Self {
            path,
            band_name,
            epochs,
        })
    }

    /// Time span of the acquisition pair in years.
    pub fn span_years(&self) -> f64 {
        self.epochs.span_years()
    }
}

/// The resolved input stack: every layer plus the geometry they all share.
///
/// Resolution reads only file headers. Every layer must be co-registered
/// with the first; the configured nodata sentinel overrides whatever the
/// individual files declare, which keeps one sentinel across the stack.
#[derive(Debug, Clone)]
pub struct StackManifest {
    /// Input layers in stack order.
    pub layers: Vec<LayerSource>,
    /// Geometry shared by every layer, with the configured nodata sentinel.
    pub meta: RasterMeta,
}

impl StackManifest {
    /// Resolve the configured inputs into a manifest.
    pub fn resolve(config: &PipelineConfig) -> Result<Self, AvaniError> {
        let paths = config.resolve_inputs()?;

        let mut layers = Vec::with_capacity(paths.len());
        let mut shared: Option<RasterMeta> = None;
        for path in paths {
            let meta = geotiff::read_meta(&path)?;
            match &shared {
                None => shared = Some(meta),
                Some(reference) => {
                    if !reference.same_geometry(&meta) {
                        return Err(ConfigError::InconsistentGeometry {
                            path,
                            expected: reference.geometry_string(),
                            got: meta.geometry_string(),
                        }
                        .into());
                    }
                }
            }
            layers.push(LayerSource::from_path(path)?);
        }

        // resolve_inputs never returns an empty set
        let mut meta = shared.ok_or(ConfigError::NoInputs)?;
        meta.nodata = config.input.nodata;

        let t = meta.transform;
        let crs = match meta.crs.epsg() {
            Some(code) => format!(" EPSG:{code}"),
            None => String::new(),
        };
        log::info!(
            "stack: {} layer(s), {}x{} px, x {}..{}, y {}..{}{crs}",
            layers.len(),
            meta.width,
            meta.height,
            t.x_first,
            t.x_last(meta.width),
            t.y_first,
            t.y_last(meta.height),
        );

        Ok(Self { layers, meta })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Everything a tile stage needs to do its work.
pub struct StageContext<'a> {
    /// Run configuration.
    pub config: &'a PipelineConfig,
    /// Tile partition of the stack extent.
    pub grid: &'a TileGrid,
    /// Artifact store shared by all stages.
    pub store: &'a TileStore,
    /// Resolved input stack.
    pub stack: &'a StackManifest,
}

impl StageContext<'_> {
    /// Fetch the artifact a predecessor stage produced for `tile`.
    pub fn upstream(&self, stage: StageId, tile: TileId) -> StageResult<Arc<TileArtifact>> {
        self.store.get(stage, tile).map_err(|source| match source {
            StoreError::NotFound { .. } => StageError::MissingUpstream { tile, stage },
            other => StageError::Load { tile, source: other },
        })
    }
}

/// A per-tile computation.
///
/// Implementations read inputs and upstream artifacts and return a new
/// artifact; the runner is the only writer into the store, which keeps the
/// one-artifact-per-tile rule in one place.
pub trait TileStage: Send + Sync {
    /// Stage identity.
    fn id(&self) -> StageId;

    /// Name of this stage for logs.
    fn name(&self) -> &str;

    /// Compute this tile's artifact.
    fn run_tile(&self, ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact>;
}

/// The tile stage registered for `id`, if `id` is a tile stage.
pub fn tile_stage(id: StageId) -> Option<Box<dyn TileStage>> {
    match id {
        StageId::Convert => Some(Box::new(ConvertStage)),
        StageId::Prepare => Some(Box::new(PrepareStage)),
        StageId::Process => Some(Box::new(VelocityStage)),
        StageId::Merge => None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared scaffolding for stage, runner and merge tests: builds a small
    //! co-registered stack on disk plus the context pieces around it.

    use super::*;
    use crate::core::raster::{CrsDefinition, GeoTransform, Raster};
    use tempfile::TempDir;

    pub(crate) fn stack_meta(width: u32, height: u32) -> RasterMeta {
        RasterMeta {
            width,
            height,
            transform: GeoTransform {
                x_first: 150.91,
                y_first: -34.17,
                x_step: 0.001,
                y_step: -0.001,
            },
            crs: CrsDefinition::geographic_wgs84(),
            nodata: 0.0,
        }
    }

    pub(crate) struct TestRun {
        pub dir: TempDir,
        pub config: PipelineConfig,
        pub grid: TileGrid,
        pub store: TileStore,
        pub stack: StackManifest,
    }

    impl TestRun {
        pub(crate) fn ctx(&self) -> StageContext<'_> {
            StageContext {
                config: &self.config,
                grid: &self.grid,
                store: &self.store,
                stack: &self.stack,
            }
        }
    }

    /// Write `layers` as GeoTIFFs named `<stem>.tif`, then resolve the run
    /// pieces around them. `configure` tweaks the config before resolution.
    pub(crate) fn test_run(
        width: u32,
        height: u32,
        layers: &[(&str, Vec<f32>)],
        configure: impl FnOnce(&mut PipelineConfig),
    ) -> TestRun {
        let dir = TempDir::new().unwrap();
        let meta = stack_meta(width, height);

        let mut paths = Vec::new();
        for (stem, data) in layers {
            let path = dir.path().join(format!("{stem}.tif"));
            geotiff::write(&path, &Raster::new(meta.clone(), data.clone())).unwrap();
            paths.push(path);
        }

        let mut config = PipelineConfig::default()
            .with_rasters(paths)
            .with_output_dir(dir.path().join("out"));
        config.processing.scale_to_mm = false;
        configure(&mut config);
        config.validate().unwrap();

        let stack = StackManifest::resolve(&config).unwrap();
        let grid = TileGrid::compute(width, height, config.tiling.rows, config.tiling.cols).unwrap();
        let store = TileStore::open(dir.path().join("out").join("store")).unwrap();

        TestRun {
            dir,
            config,
            grid,
            store,
            stack,
        }
    }
}
