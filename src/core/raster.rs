//! Raster values and their geospatial metadata.
//!
//! Every raster in the pipeline is a single band of 32-bit floats:
//! - Missing observations are NaN in memory; nodata sentinels exist only at
//!   the file boundary and are translated on read and write
//! - Georeferencing is an affine transform plus an uninterpreted CRS blob,
//!   so outputs carry exactly the bytes their inputs carried
//! - Metadata is separate from pixel data, letting co-registration checks
//!   run without decoding whole files

use crate::core::grid::PixelWindow;
use std::fmt;

/// Affine georeferencing for an axis-aligned raster.
///
/// `(x_first, y_first)` is the outer corner of the top-left pixel. `y_step`
/// is negative for the usual north-up rasters, where the row index grows
/// southward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// X coordinate of the outer corner of the top-left pixel.
    pub x_first: f64,
    /// Y coordinate of the outer corner of the top-left pixel.
    pub y_first: f64,
    /// Pixel width in CRS units.
    pub x_step: f64,
    /// Pixel height in CRS units.
    pub y_step: f64,
}

impl GeoTransform {
    /// Transform for a window whose top-left pixel is `(x, y)` in this
    /// raster. Steps never change, only the origin shifts.
    pub fn shifted(&self, x: u32, y: u32) -> Self {
        Self {
            x_first: self.x_first + self.x_step * x as f64,
            y_first: self.y_first + self.y_step * y as f64,
            x_step: self.x_step,
            y_step: self.y_step,
        }
    }

    /// X coordinate of the outer edge past the last column.
    pub fn x_last(&self, width: u32) -> f64 {
        self.x_first + self.x_step * width as f64
    }

    /// Y coordinate of the outer edge past the last row.
    pub fn y_last(&self, height: u32) -> f64 {
        self.y_first + self.y_step * height as f64
    }
}

impl fmt::Display for GeoTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "origin ({}, {}) step ({}, {})",
            self.x_first, self.y_first, self.x_step, self.y_step
        )
    }
}

/// Coordinate reference system as raw GeoTIFF key data.
///
/// The CRS is carried, never interpreted: whatever key directory, double
/// and ASCII parameters the inputs declare are written back unchanged.
/// `epsg()` peeks at the two standard CS type keys for log messages only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CrsDefinition {
    /// Raw GeoKeyDirectoryTag values (header plus 4-value key entries).
    pub key_directory: Vec<u16>,
    /// Raw GeoDoubleParamsTag values.
    pub double_params: Vec<f64>,
    /// Raw GeoAsciiParamsTag value.
    pub ascii_params: Option<String>,
}

impl CrsDefinition {
    /// Whether any CRS information is present.
    pub fn is_empty(&self) -> bool {
        self.key_directory.is_empty()
    }

    /// EPSG code from the projected or geographic CS type key, if one is
    /// stored inline in the key directory.
    pub fn epsg(&self) -> Option<u16> {
        const GEOGRAPHIC_TYPE: u16 = 2048;
        const PROJECTED_CS_TYPE: u16 = 3072;

        let mut geographic = None;
        for entry in self.key_directory.get(4..)?.chunks_exact(4) {
            // entry = [key id, tag location, count, value]; location 0 means
            // the value is stored inline.
            if entry[1] != 0 {
                continue;
            }
            match entry[0] {
                PROJECTED_CS_TYPE => return Some(entry[3]),
                GEOGRAPHIC_TYPE => geographic = Some(entry[3]),
                _ => {}
            }
        }
        geographic
    }

    /// Plain geographic WGS84, the usual CRS of unwrapped interferograms.
    pub fn geographic_wgs84() -> Self {
        Self {
            key_directory: vec![
                1, 1, 0, 3, // header: version 1.1, 3 keys
                1024, 0, 1, 2, // model type: geographic
                1025, 0, 1, 1, // raster type: pixel is area
                2048, 0, 1, 4326, // geographic CS: WGS84
            ],
            double_params: Vec::new(),
            ascii_params: None,
        }
    }
}

/// Raster geometry and georeferencing without the pixel data.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMeta {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Affine georeferencing.
    pub transform: GeoTransform,
    /// Uninterpreted CRS keys.
    pub crs: CrsDefinition,
    /// Nodata sentinel used at the file boundary. NaN means values are
    /// stored as-is.
    pub nodata: f32,
}

impl RasterMeta {
    /// Number of pixels.
    pub fn num_cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Metadata for a sub-window of this raster.
    pub fn windowed(&self, window: &PixelWindow) -> Self {
        Self {
            width: window.width,
            height: window.height,
            transform: self.transform.shifted(window.x, window.y),
            crs: self.crs.clone(),
            nodata: self.nodata,
        }
    }

    /// Check that another raster shares this extent, transform and CRS.
    ///
    /// The nodata sentinel is allowed to differ between files.
    pub fn same_geometry(&self, other: &RasterMeta) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.transform == other.transform
            && self.crs == other.crs
    }

    /// Short geometry description for error messages.
    pub fn geometry_string(&self) -> String {
        format!("{}x{} {}", self.width, self.height, self.transform)
    }
}

/// A single-band f32 raster: metadata plus row-major pixel data.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    /// Geometry and georeferencing.
    pub meta: RasterMeta,
    /// Row-major pixels, `meta.num_cells()` long.
    pub data: Vec<f32>,
}

impl Raster {
    /// Wrap pixel data with its metadata.
    pub fn new(meta: RasterMeta, data: Vec<f32>) -> Self {
        debug_assert_eq!(meta.num_cells(), data.len());
        Self { meta, data }
    }

    /// A raster with every pixel set to `value`.
    pub fn filled(meta: RasterMeta, value: f32) -> Self {
        let cells = meta.num_cells();
        Self {
            meta,
            data: vec![value; cells],
        }
    }

    /// Pixel at `(x, y)`.
    pub fn get(&self, x: u32, y: u32) -> f32 {
        debug_assert!(x < self.meta.width && y < self.meta.height);
        self.data[(y * self.meta.width + x) as usize]
    }

    /// Replace every occurrence of the nodata sentinel with NaN.
    ///
    /// Returns the number of pixels converted. A NaN sentinel means the
    /// data already uses the in-memory convention and nothing changes.
    pub fn convert_nodata_to_nan(&mut self) -> usize {
        let sentinel = self.meta.nodata;
        if sentinel.is_nan() {
            return 0;
        }
        let mut converted = 0;
        for value in &mut self.data {
            if *value == sentinel {
                *value = f32::NAN;
                converted += 1;
            }
        }
        converted
    }
}

/// Count NaNs in a pixel slice.
pub fn nan_count(data: &[f32]) -> usize {
    data.iter().filter(|v| v.is_nan()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: u32, height: u32) -> RasterMeta {
        RasterMeta {
            width,
            height,
            transform: GeoTransform {
                x_first: 150.0,
                y_first: -34.0,
                x_step: 0.05,
                y_step: -0.05,
            },
            crs: CrsDefinition::geographic_wgs84(),
            nodata: 0.0,
        }
    }

    #[test]
    fn test_transform_window_shift() {
        let t = meta(10, 10).transform;
        let shifted = t.shifted(4, 2);
        assert_eq!(shifted.x_first, 150.0 + 0.05 * 4.0);
        assert_eq!(shifted.y_first, -34.0 - 0.05 * 2.0);
        assert_eq!(shifted.x_step, t.x_step);
        assert_eq!(shifted.y_step, t.y_step);
    }

    #[test]
    fn test_transform_outer_edges() {
        let t = meta(10, 8).transform;
        assert_eq!(t.x_last(10), 150.5);
        assert_eq!(t.y_last(8), -34.4);
    }

    #[test]
    fn test_nodata_conversion_counts_cells() {
        let mut raster = Raster::new(meta(2, 2), vec![0.0, 1.5, 0.0, -2.0]);
        let converted = raster.convert_nodata_to_nan();
        assert_eq!(converted, 2);
        assert!(raster.get(0, 0).is_nan());
        assert_eq!(raster.get(1, 0), 1.5);
        assert_eq!(nan_count(&raster.data), 2);

        // Converting again is a no-op.
        assert_eq!(raster.convert_nodata_to_nan(), 0);
    }

    #[test]
    fn test_nan_sentinel_leaves_data_alone() {
        let mut m = meta(2, 1);
        m.nodata = f32::NAN;
        let mut raster = Raster::new(m, vec![0.0, f32::NAN]);
        assert_eq!(raster.convert_nodata_to_nan(), 0);
        assert_eq!(raster.get(0, 0), 0.0);
    }

    #[test]
    fn test_windowed_meta() {
        let m = meta(10, 10);
        let w = m.windowed(&PixelWindow::new(2, 3, 4, 5));
        assert_eq!(w.width, 4);
        assert_eq!(w.height, 5);
        assert_eq!(w.transform.x_first, 150.0 + 0.05 * 2.0);
        assert_eq!(w.transform.y_first, -34.0 - 0.05 * 3.0);
        assert!(m.same_geometry(&m.clone()));
        assert!(!m.same_geometry(&w));
    }

    #[test]
    fn test_epsg_lookup() {
        let crs = CrsDefinition::geographic_wgs84();
        assert_eq!(crs.epsg(), Some(4326));
        assert_eq!(CrsDefinition::default().epsg(), None);

        let projected = CrsDefinition {
            key_directory: vec![1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32755],
            double_params: Vec::new(),
            ascii_params: None,
        };
        assert_eq!(projected.epsg(), Some(32755));
    }

    #[test]
    fn test_filled_raster() {
        let raster = Raster::filled(meta(3, 2), f32::NAN);
        assert_eq!(raster.data.len(), 6);
        assert_eq!(nan_count(&raster.data), 6);
    }
}
