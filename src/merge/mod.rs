//! Product assembly: `merge`.
//!
//! Stitches per-tile artifacts back into full-extent rasters. Only interior
//! pixels are copied, so overlapping halos never reach a product, and tiles
//! are visited in a fixed row-major order; merging the same store twice
//! yields bit-identical output. Tiles recorded as failed are filled with
//! nodata, while a tile that is neither stored nor recorded means the stage
//! did not actually cover the grid and stops the merge.

use crate::core::error::{MergeError, StoreError};
use crate::core::grid::{TileGrid, TileId};
use crate::core::raster::{Raster, RasterMeta};
use crate::stages::StageId;
use crate::store::TileStore;
use std::collections::HashSet;

/// Assembles full-extent rasters from tile artifacts.
pub struct MergeCoordinator<'a> {
    grid: &'a TileGrid,
    store: &'a TileStore,
}

impl<'a> MergeCoordinator<'a> {
    /// Create a coordinator over a grid and its artifact store.
    pub fn new(grid: &'a TileGrid, store: &'a TileStore) -> Self {
        Self { grid, store }
    }

    /// Assemble one band of `stage` into a full-extent raster.
    ///
    /// `failed` lists tiles the stage recorded as failed; their footprint is
    /// left as NaN. Any other tile without an artifact makes the result
    /// [`MergeError::Incomplete`], listing every such tile.
    pub fn merge_band(
        &self,
        stage: StageId,
        band: &str,
        meta: &RasterMeta,
        failed: &[TileId],
    ) -> Result<Raster, MergeError> {
        let failed: HashSet<TileId> = failed.iter().copied().collect();
        let mut raster = Raster::filled(meta.clone(), f32::NAN);
        let mut missing = Vec::new();

        for tile in self.grid.tiles() {
            if failed.contains(&tile.id) {
                continue;
            }
            let artifact = match self.store.get(stage, tile.id) {
                Ok(artifact) => artifact,
                Err(StoreError::NotFound { .. }) => {
                    missing.push(tile.id);
                    continue;
                }
                Err(source) => {
                    return Err(MergeError::Artifact {
                        tile: tile.id,
                        source,
                    })
                }
            };
            let data = &artifact
                .band(band)
                .ok_or_else(|| MergeError::MissingBand {
                    tile: tile.id,
                    band: band.to_string(),
                })?
                .data;

            let window = &artifact.window;
            let interior = &artifact.interior;
            let (dx, dy) = window.offset_of(interior);
            for row in 0..interior.height {
                let src = ((dy + row) as usize) * window.width as usize + dx as usize;
                let dst = ((interior.y + row) as usize) * meta.width as usize + interior.x as usize;
                let len = interior.width as usize;
                raster.data[dst..dst + len].copy_from_slice(&data[src..src + len]);
            }
        }

        if !missing.is_empty() {
            return Err(MergeError::Incomplete { stage, missing });
        }
        Ok(raster)
    }
}
