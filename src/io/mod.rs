//! Raster file I/O.

pub mod geotiff;
