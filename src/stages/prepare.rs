//! Stack preparation: `prepifg`.
//!
//! Normalises converted tiles for regression. Phase values are scaled to
//! millimetres of line-of-sight displacement using the radar wavelength, and
//! each band is optionally smoothed with a NaN-aware box mean. The halo read
//! by the conversion stage gives the filter real neighbours at tile edges,
//! so smoothing a tile in isolation matches smoothing the full raster.

use crate::config::PipelineConfig;
use crate::core::error::StageResult;
use crate::core::grid::Tile;
use crate::stages::{StageContext, StageId, TileStage};
use crate::store::{ArtifactBand, TileArtifact};
use std::f64::consts::PI;

/// Millimetres per metre, for wavelength scaling.
pub const MM_PER_METRE: f64 = 1000.0;

/// Scales and smooths converted tiles.
pub struct PrepareStage;

impl TileStage for PrepareStage {
    fn id(&self) -> StageId {
        StageId::Prepare
    }

    fn name(&self) -> &str {
        "prepifg"
    }

    fn run_tile(&self, ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact> {
        let upstream = ctx.upstream(StageId::Convert, tile.id)?;
        let scale = displacement_scale(ctx.config);
        let radius = ctx.config.processing.smoothing_radius;
        let window = upstream.window;

        let bands = upstream
            .bands
            .iter()
            .map(|band| {
                let mut data: Vec<f32> = band
                    .data
                    .iter()
                    .map(|v| (f64::from(*v) * scale) as f32)
                    .collect();
                if radius > 0 {
                    data = mean_filter(&data, window.width, window.height, radius);
                }
                ArtifactBand {
                    name: band.name.clone(),
                    span_years: band.span_years,
                    data,
                }
            })
            .collect();

        Ok(TileArtifact::new(tile.id, window, upstream.interior, bands))
    }
}

/// Factor turning raw phase into millimetres of displacement.
///
/// One phase cycle corresponds to half a wavelength of two-way path length,
/// so displacement is `phase * wavelength / (4 pi)`. Identity when scaling
/// is disabled; validation guarantees a wavelength whenever it is enabled.
fn displacement_scale(config: &PipelineConfig) -> f64 {
    if !config.processing.scale_to_mm {
        return 1.0;
    }
    match config.input.wavelength {
        Some(wavelength) => wavelength * MM_PER_METRE / (4.0 * PI),
        None => 1.0,
    }
}

/// NaN-aware box mean over a `2 * radius + 1` square neighbourhood.
///
/// NaN cells stay NaN and never contribute to a neighbour's mean; the
/// neighbourhood is clamped at the window edge, matching the clamped halo.
fn mean_filter(data: &[f32], width: u32, height: u32, radius: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity(data.len());
    for y in 0..height {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius).min(height - 1);
        for x in 0..width {
            let center = data[(y * width + x) as usize];
            if center.is_nan() {
                out.push(f32::NAN);
                continue;
            }
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(width - 1);

            let mut sum = 0.0f64;
            let mut count = 0u32;
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let value = data[(ny * width + nx) as usize];
                    if !value.is_nan() {
                        sum += f64::from(value);
                        count += 1;
                    }
                }
            }
            out.push((sum / f64::from(count)) as f32);
        }
    }
    out
}
