//! Tile grid partitioning of a raster extent.
//!
//! A raster extent is divided into a fixed `rows x cols` grid of rectangular
//! tiles. Together the tiles cover every pixel exactly once, with no overlap
//! and no gaps. A tile may additionally be *read* with a halo, a clamped
//! border of neighbouring pixels that spatial filters consume but never
//! write; ownership of output pixels always follows the tile bounds.
//!
//! Tiles are ordered row-major and the partition is fully determined by
//! `(width, height, rows, cols)`, so two runs over the same inputs always
//! agree on tile identity.

use crate::core::error::{GridError, GridResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a tile by its position in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId {
    /// Zero-based grid row.
    pub row: usize,
    /// Zero-based grid column.
    pub col: usize,
}

impl TileId {
    /// Create a tile ID from grid coordinates.
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}c{}", self.row, self.col)
    }
}

/// A rectangular pixel window within a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelWindow {
    /// X offset from the raster origin.
    pub x: u32,
    /// Y offset from the raster origin.
    pub y: u32,
    /// Width of the window.
    pub width: u32,
    /// Height of the window.
    pub height: u32,
}

impl PixelWindow {
    /// Create a new pixel window.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Get the right edge coordinate (exclusive).
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Get the bottom edge coordinate (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Calculate the area of this window in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Expand this window by `border` pixels on every side, clamping to the
    /// raster extent.
    pub fn expand(&self, border: u32, extent_width: u32, extent_height: u32) -> Self {
        let new_x = self.x.saturating_sub(border);
        let new_y = self.y.saturating_sub(border);
        let new_right = (self.right() + border).min(extent_width);
        let new_bottom = (self.bottom() + border).min(extent_height);

        Self {
            x: new_x,
            y: new_y,
            width: new_right - new_x,
            height: new_bottom - new_y,
        }
    }

    /// Check if `inner` lies entirely within this window.
    pub fn contains(&self, inner: &PixelWindow) -> bool {
        inner.x >= self.x
            && inner.y >= self.y
            && inner.right() <= self.right()
            && inner.bottom() <= self.bottom()
    }

    /// Check if this window is entirely within the given extent.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }

    /// Offset of `inner` relative to this window's origin.
    ///
    /// Callers must ensure `self.contains(inner)` holds.
    pub fn offset_of(&self, inner: &PixelWindow) -> (u32, u32) {
        debug_assert!(self.contains(inner));
        (inner.x - self.x, inner.y - self.y)
    }
}

impl fmt::Display for PixelWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// One grid cell: its identity and the pixels it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    /// Grid position.
    pub id: TileId,
    /// The pixels this tile owns within the raster extent.
    pub bounds: PixelWindow,
}

impl Tile {
    /// The window a stage reads for this tile: the owned bounds expanded by
    /// `halo`, clamped to the raster extent. At the raster edge the halo is
    /// simply smaller; no pixels outside the extent are ever referenced.
    pub fn read_window(&self, halo: u32, extent_width: u32, extent_height: u32) -> PixelWindow {
        self.bounds.expand(halo, extent_width, extent_height)
    }
}

/// A fixed partition of a raster extent into `rows x cols` tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    rows: usize,
    cols: usize,
    tiles: Vec<Tile>,
}

impl TileGrid {
    /// Partition a `width x height` extent into `rows x cols` tiles.
    ///
    /// Spans along each axis differ in length by at most one pixel; when the
    /// extent does not divide evenly, the leading tiles take the extra pixel
    /// (splitting 101 pixels in two gives spans of 51 and 50).
    pub fn compute(width: u32, height: u32, rows: usize, cols: usize) -> GridResult<Self> {
        if width == 0 || height == 0 {
            return Err(GridError::EmptyExtent { width, height });
        }
        if rows == 0 || cols == 0 {
            return Err(GridError::EmptyGrid { rows, cols });
        }
        if rows as u64 > height as u64 {
            return Err(GridError::RowsExceedHeight { rows, height });
        }
        if cols as u64 > width as u64 {
            return Err(GridError::ColsExceedWidth { cols, width });
        }

        let row_spans = split_extent(height, rows as u32);
        let col_spans = split_extent(width, cols as u32);

        let mut tiles = Vec::with_capacity(rows * cols);
        for (row, &(y, tile_height)) in row_spans.iter().enumerate() {
            for (col, &(x, tile_width)) in col_spans.iter().enumerate() {
                tiles.push(Tile {
                    id: TileId::new(row, col),
                    bounds: PixelWindow::new(x, y, tile_width, tile_height),
                });
            }
        }

        Ok(Self {
            width,
            height,
            rows,
            cols,
            tiles,
        })
    }

    /// Raster extent width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Raster extent height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of tile rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of tile columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// A grid always carries at least one tile.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// All tiles in row-major order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Look up a tile by its grid position.
    pub fn get(&self, id: TileId) -> Option<&Tile> {
        if id.row < self.rows && id.col < self.cols {
            self.tiles.get(id.row * self.cols + id.col)
        } else {
            None
        }
    }

    /// Tile IDs in row-major order.
    pub fn tile_ids(&self) -> impl Iterator<Item = TileId> + '_ {
        self.tiles.iter().map(|t| t.id)
    }

    /// Grid shape as `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// Split `extent` pixels into `count` contiguous `(offset, size)` spans.
///
/// Sizes differ by at most one; the first `extent % count` spans take the
/// extra pixel.
fn split_extent(extent: u32, count: u32) -> Vec<(u32, u32)> {
    let base = extent / count;
    let extra = extent % count;

    (0..count)
        .map(|i| {
            let offset = i * base + i.min(extra);
            let size = if i < extra { base + 1 } else { base };
            (offset, size)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_even_partition() {
        let grid = TileGrid::compute(100, 100, 2, 2).unwrap();
        assert_eq!(grid.len(), 4);
        for tile in grid.tiles() {
            assert_eq!(tile.bounds.width, 50);
            assert_eq!(tile.bounds.height, 50);
        }
        assert_eq!(grid.tiles()[3].bounds, PixelWindow::new(50, 50, 50, 50));
    }

    #[test]
    fn test_remainder_goes_to_leading_tiles() {
        let grid = TileGrid::compute(100, 101, 2, 1).unwrap();
        let heights: Vec<u32> = grid.tiles().iter().map(|t| t.bounds.height).collect();
        assert_eq!(heights, vec![51, 50]);
        for tile in grid.tiles() {
            assert_eq!(tile.bounds.width, 100);
        }

        let grid = TileGrid::compute(101, 100, 1, 2).unwrap();
        let widths: Vec<u32> = grid.tiles().iter().map(|t| t.bounds.width).collect();
        assert_eq!(widths, vec![51, 50]);
    }

    #[test]
    fn test_single_tile_owns_everything() {
        let grid = TileGrid::compute(640, 480, 1, 1).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.tiles()[0].bounds, PixelWindow::new(0, 0, 640, 480));
    }

    #[test]
    fn test_row_major_order() {
        let grid = TileGrid::compute(30, 30, 2, 3).unwrap();
        let ids: Vec<TileId> = grid.tile_ids().collect();
        assert_eq!(
            ids,
            vec![
                TileId::new(0, 0),
                TileId::new(0, 1),
                TileId::new(0, 2),
                TileId::new(1, 0),
                TileId::new(1, 1),
                TileId::new(1, 2),
            ]
        );
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_lookup_by_id() {
        let grid = TileGrid::compute(64, 64, 4, 4).unwrap();
        let tile = grid.get(TileId::new(2, 1)).unwrap();
        assert_eq!(tile.id, TileId::new(2, 1));
        assert_eq!(tile.bounds, PixelWindow::new(16, 32, 16, 16));
        assert!(grid.get(TileId::new(4, 0)).is_none());
        assert!(grid.get(TileId::new(0, 4)).is_none());
    }

    #[test]
    fn test_invalid_grids_rejected() {
        assert!(matches!(
            TileGrid::compute(10, 10, 0, 2),
            Err(GridError::EmptyGrid { .. })
        ));
        assert!(matches!(
            TileGrid::compute(10, 10, 2, 0),
            Err(GridError::EmptyGrid { .. })
        ));
        assert!(matches!(
            TileGrid::compute(10, 10, 11, 2),
            Err(GridError::RowsExceedHeight { .. })
        ));
        assert!(matches!(
            TileGrid::compute(10, 10, 2, 11),
            Err(GridError::ColsExceedWidth { .. })
        ));
        assert!(matches!(
            TileGrid::compute(0, 10, 1, 1),
            Err(GridError::EmptyExtent { .. })
        ));
    }

    #[test]
    fn test_one_pixel_per_tile_is_allowed() {
        let grid = TileGrid::compute(3, 2, 2, 3).unwrap();
        assert_eq!(grid.len(), 6);
        for tile in grid.tiles() {
            assert_eq!(tile.bounds.area(), 1);
        }
    }

    #[test]
    fn test_halo_window_clamped_at_edges() {
        let grid = TileGrid::compute(100, 100, 2, 2).unwrap();

        let corner = grid.get(TileId::new(0, 0)).unwrap();
        assert_eq!(corner.read_window(10, 100, 100), PixelWindow::new(0, 0, 60, 60));

        let last = grid.get(TileId::new(1, 1)).unwrap();
        assert_eq!(
            last.read_window(10, 100, 100),
            PixelWindow::new(40, 40, 60, 60)
        );

        // Zero halo reads exactly the owned bounds.
        assert_eq!(corner.read_window(0, 100, 100), corner.bounds);
    }

    #[test]
    fn test_window_containment_and_offset() {
        let outer = PixelWindow::new(40, 40, 60, 60);
        let inner = PixelWindow::new(50, 50, 50, 50);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert_eq!(outer.offset_of(&inner), (10, 10));
    }

    proptest! {
        /// Tiles cover every pixel of the extent exactly once.
        #[test]
        fn prop_exact_cover(
            width in 1u32..96,
            height in 1u32..96,
            rows in 1usize..8,
            cols in 1usize..8,
        ) {
            prop_assume!(rows as u32 <= height && cols as u32 <= width);
            let grid = TileGrid::compute(width, height, rows, cols).unwrap();
            prop_assert_eq!(grid.len(), rows * cols);

            let mut covered = vec![0u8; (width * height) as usize];
            for tile in grid.tiles() {
                for y in tile.bounds.y..tile.bounds.bottom() {
                    for x in tile.bounds.x..tile.bounds.right() {
                        covered[(y * width + x) as usize] += 1;
                    }
                }
            }
            prop_assert!(covered.iter().all(|&c| c == 1));
        }

        /// Tile extents along each axis differ by at most one pixel.
        #[test]
        fn prop_balanced_spans(extent in 1u32..10_000, count in 1u32..64) {
            prop_assume!(count <= extent);
            let spans = split_extent(extent, count);
            prop_assert_eq!(spans.len(), count as usize);
            prop_assert_eq!(spans.iter().map(|&(_, s)| s).sum::<u32>(), extent);

            let min = spans.iter().map(|&(_, s)| s).min().unwrap();
            let max = spans.iter().map(|&(_, s)| s).max().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
