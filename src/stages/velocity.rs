//! Rate estimation: `process`.
//!
//! Fits a displacement rate per pixel by least squares through the origin.
//! Each layer contributes one observation: displacement `y` over time span
//! `t`, and the slope minimising the squared residuals is `v = sum(t y) /
//! sum(t^2)`. The standard error follows from the residual variance,
//! `sqrt(sum(r^2) / ((n - 1) sum(t^2)))`. Accumulation is in f64 and in
//! fixed layer order, so the result for a pixel never depends on tile
//! shape or worker scheduling.
//!
//! Pixels with fewer usable observations than the configured minimum come
//! out as NaN in all three products. Zero-span layers never qualify as
//! observations; a tile whose layers all have zero span has a singular
//! design and fails as a whole.

use crate::core::error::{StageError, StageResult};
use crate::core::grid::Tile;
use crate::stages::{StageContext, StageId, TileStage};
use crate::store::{ArtifactBand, TileArtifact};

/// Band name of the displacement rate product, in units per year.
pub const RATE_BAND: &str = "rate";
/// Band name of the rate standard error product.
pub const ERROR_BAND: &str = "rate_error";
/// Band name of the per-pixel observation count product.
pub const SAMPLES_BAND: &str = "rate_samples";

/// Estimates per-pixel displacement rates from prepared tiles.
pub struct VelocityStage;

impl TileStage for VelocityStage {
    fn id(&self) -> StageId {
        StageId::Process
    }

    fn name(&self) -> &str {
        "process"
    }

    fn run_tile(&self, ctx: &StageContext<'_>, tile: &Tile) -> StageResult<TileArtifact> {
        let upstream = ctx.upstream(StageId::Prepare, tile.id)?;

        let spans: Vec<f64> = upstream
            .bands
            .iter()
            .map(|b| b.span_years.unwrap_or(0.0))
            .collect();
        if spans.iter().all(|t| *t == 0.0) {
            return Err(StageError::SingularDesign { tile: tile.id });
        }

        let window = upstream.window;
        let interior = upstream.interior;
        let (dx, dy) = window.offset_of(&interior);
        let min_obs = ctx.config.processing.min_observations;

        let cells = interior.area() as usize;
        let mut rate = Vec::with_capacity(cells);
        let mut error = Vec::with_capacity(cells);
        let mut samples = Vec::with_capacity(cells);

        for row in 0..interior.height {
            for col in 0..interior.width {
                let idx = ((dy + row) as usize) * window.width as usize + (dx + col) as usize;

                let mut n = 0u32;
                let mut sum_tt = 0.0f64;
                let mut sum_ty = 0.0f64;
                for (band, t) in upstream.bands.iter().zip(spans.iter().copied()) {
                    if t == 0.0 {
                        continue;
                    }
                    let y = band.data[idx];
                    if y.is_nan() {
                        continue;
                    }
                    n += 1;
                    sum_tt += t * t;
                    sum_ty += t * f64::from(y);
                }

                if (n as usize) < min_obs {
                    rate.push(f32::NAN);
                    error.push(f32::NAN);
                    samples.push(f32::NAN);
                    continue;
                }

                let v = sum_ty / sum_tt;
                let mut sum_rr = 0.0f64;
                for (band, t) in upstream.bands.iter().zip(spans.iter().copied()) {
                    if t == 0.0 {
                        continue;
                    }
                    let y = band.data[idx];
                    if y.is_nan() {
                        continue;
                    }
                    let residual = f64::from(y) - v * t;
                    sum_rr += residual * residual;
                }
                let stderr = if n >= 2 {
                    ((sum_rr / f64::from(n - 1)) / sum_tt).sqrt()
                } else {
                    f64::NAN
                };

                rate.push(v as f32);
                error.push(stderr as f32);
                samples.push(n as f32);
            }
        }

        let bands = vec![
            ArtifactBand {
                name: RATE_BAND.to_string(),
                span_years: None,
                data: rate,
            },
            ArtifactBand {
                name: ERROR_BAND.to_string(),
                span_years: None,
                data: error,
            },
            ArtifactBand {
                name: SAMPLES_BAND.to_string(),
                span_years: None,
                data: samples,
            },
        ];
        Ok(TileArtifact::new(tile.id, interior, interior, bands))
    }
}
