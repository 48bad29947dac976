//! Stack conversion: `conv2tif`.
//!
//! The first tile stage reads the halo'd window of every input layer,
//! translates the nodata sentinel to NaN and checks data coverage over the
//! tile interior. Its artifact carries one band per input layer, so every
//! downstream stage works from the store and never touches the inputs again.

use crate::core::error::{StageError, StageResult};
use crate::core::grid::{PixelWindow, Tile};
use crate::io::geotiff;
use crate::stages::{StageContext, StageId, TileStage};
use crate::store::{ArtifactBand, TileArtifact};

/// Converts the raw input stack into per-tile artifacts.
pub struct ConvertStage;

impl TileStage for ConvertStage {
    fn id(&self) -> StageId {
        StageId::Convert
    }

    fn name(&self) -> &str {
        "conv2tif"
    }

    fn run_tile(&self, ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact> {
        let meta = &ctx.stack.meta;
        let window = tile.read_window(ctx.config.tiling.halo, meta.width, meta.height);
        let sentinel = meta.nodata;

        let mut bands = Vec::with_capacity(ctx.stack.len());
        for layer in &ctx.stack.layers {
            let mut chip = geotiff::read_window(&layer.path, &window)
                .map_err(|source| StageError::Raster {
                    tile: tile.id,
                    source,
                })?;
            // the stack-wide sentinel overrides whatever the file declares
            chip.meta.nodata = sentinel;
            chip.convert_nodata_to_nan();
            bands.push(ArtifactBand {
                name: layer.band_name.clone(),
                span_years: Some(layer.span_years()),
                data: chip.data,
            });
        }

        let fraction = interior_nan_fraction(&bands, &window, &tile.bounds);
        let limit = ctx.config.processing.max_nan_fraction;
        if fraction > limit {
            return Err(StageError::InsufficientData {
                tile: tile.id,
                fraction,
                limit,
            });
        }

        Ok(TileArtifact::new(tile.id, window, tile.bounds, bands))
    }
}

/// Fraction of NaN cells over the tile interior, across all bands. Halo
/// pixels are excluded so a tile is never failed for gaps it does not own.
fn interior_nan_fraction(bands: &[ArtifactBand], window: &PixelWindow, interior: &PixelWindow) -> f64 {
    let total = bands.len() as u64 * interior.area();
    if total == 0 {
        return 0.0;
    }

    let (dx, dy) = window.offset_of(interior);
    let mut nans = 0u64;
    for band in bands {
        for row in 0..interior.height {
            let start = ((dy + row) as usize) * window.width as usize + dx as usize;
            let end = start + interior.width as usize;
            nans += crate::core::raster::nan_count(&band.data[start..end]) as u64;
        }
    }
    nans as f64 / total as f64
}
