//! Single-band f32 GeoTIFF reading and writing.
//!
//! Inputs and outputs are plain striped GeoTIFFs with one 32-bit float
//! sample per pixel. Georeferencing is read from the pixel scale and tie
//! point tags; the CRS key tags are carried as raw values and written back
//! untouched, so a merged product keeps the exact key bytes of its inputs.
//!
//! The nodata sentinel travels in the `GDAL_NODATA` ASCII tag. Reading does
//! not translate sentinels to NaN; that is a processing decision made by
//! the conversion stage.

use crate::core::error::RasterIoError;
use crate::core::grid::PixelWindow;
use crate::core::raster::{CrsDefinition, GeoTransform, Raster, RasterMeta};
use std::fs::File;
use std::io::{BufReader, Cursor, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::{ColorType, TiffError};

/// Read a full raster: metadata and pixels.
pub fn read(path: &Path) -> Result<Raster, RasterIoError> {
    let mut decoder = open(path)?;
    let meta = decode_meta(&mut decoder, path)?;
    let data = decode_pixels(&mut decoder, path)?;
    Ok(Raster::new(meta, data))
}

/// Read only the metadata: dimensions, transform, CRS and nodata.
pub fn read_meta(path: &Path) -> Result<RasterMeta, RasterIoError> {
    let mut decoder = open(path)?;
    decode_meta(&mut decoder, path)
}

/// Read one window as a raster of its own.
///
/// The returned metadata carries the origin shifted to the window's top-left
/// pixel, so a window is georeferenced exactly like a full read.
pub fn read_window(path: &Path, window: &PixelWindow) -> Result<Raster, RasterIoError> {
    let mut decoder = open(path)?;
    let meta = decode_meta(&mut decoder, path)?;
    if !window.fits_within(meta.width, meta.height) {
        return Err(RasterIoError::WindowOutOfBounds {
            path: path.to_path_buf(),
            window: window.to_string(),
            width: meta.width,
            height: meta.height,
        });
    }

    let data = decode_pixels(&mut decoder, path)?;
    let mut out = Vec::with_capacity(window.area() as usize);
    for row in 0..window.height {
        let offset = (window.y + row) as usize * meta.width as usize + window.x as usize;
        out.extend_from_slice(&data[offset..offset + window.width as usize]);
    }
    Ok(Raster::new(meta.windowed(window), out))
}

/// Write a raster as a striped single-band f32 GeoTIFF.
///
/// NaN pixels are written as the metadata's nodata sentinel; a NaN sentinel
/// writes the data unchanged. The file is encoded in memory first so an
/// encoding failure never leaves a half-written product behind.
pub fn write(path: &Path, raster: &Raster) -> Result<(), RasterIoError> {
    let mut bytes = Cursor::new(Vec::new());
    encode(&mut bytes, raster).map_err(|source| tiff_error(path, source))?;

    let mut file = File::create(path).map_err(|source| RasterIoError::Create {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(bytes.get_ref())
        .and_then(|_| file.sync_all())
        .map_err(|source| RasterIoError::Create {
            path: path.to_path_buf(),
            source,
        })
}

fn open(path: &Path) -> Result<Decoder<BufReader<File>>, RasterIoError> {
    let file = File::open(path).map_err(|source| RasterIoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|source| tiff_error(path, source))?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

fn decode_meta(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
) -> Result<RasterMeta, RasterIoError> {
    let (width, height) = decoder
        .dimensions()
        .map_err(|source| tiff_error(path, source))?;

    let scale = tag_f64_vec(decoder, path, Tag::ModelPixelScaleTag)?;
    let tiepoint = tag_f64_vec(decoder, path, Tag::ModelTiepointTag)?;
    let transform = match (scale, tiepoint) {
        (Some(scale), Some(tie))
            if scale.len() >= 2 && tie.len() >= 5 && tie[0] == 0.0 && tie[1] == 0.0 =>
        {
            GeoTransform {
                x_first: tie[3],
                y_first: tie[4],
                x_step: scale[0],
                // Pixel scale stores a magnitude; rows grow against the Y axis.
                y_step: -scale[1],
            }
        }
        _ => {
            return Err(RasterIoError::MissingGeoreference {
                path: path.to_path_buf(),
            })
        }
    };

    let crs = CrsDefinition {
        key_directory: tag_u16_vec(decoder, path, Tag::GeoKeyDirectoryTag)?.unwrap_or_default(),
        double_params: tag_f64_vec(decoder, path, Tag::GeoDoubleParamsTag)?.unwrap_or_default(),
        ascii_params: tag_string(decoder, path, Tag::GeoAsciiParamsTag)?,
    };

    let nodata = tag_string(decoder, path, Tag::GdalNodata)?
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f32>().ok())
        .unwrap_or(f32::NAN);

    Ok(RasterMeta {
        width,
        height,
        transform,
        crs,
        nodata,
    })
}

fn decode_pixels(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
) -> Result<Vec<f32>, RasterIoError> {
    match decoder
        .colortype()
        .map_err(|source| tiff_error(path, source))?
    {
        ColorType::Gray(32) => {}
        _ => {
            return Err(RasterIoError::UnsupportedLayout {
                path: path.to_path_buf(),
            })
        }
    }
    match decoder
        .read_image()
        .map_err(|source| tiff_error(path, source))?
    {
        DecodingResult::F32(data) => Ok(data),
        _ => Err(RasterIoError::UnsupportedLayout {
            path: path.to_path_buf(),
        }),
    }
}

fn encode(bytes: &mut Cursor<Vec<u8>>, raster: &Raster) -> Result<(), TiffError> {
    let meta = &raster.meta;
    let mut encoder = TiffEncoder::new(bytes)?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(meta.width, meta.height)?;

    let scale = [meta.transform.x_step, -meta.transform.y_step, 0.0];
    let tiepoint = [
        0.0,
        0.0,
        0.0,
        meta.transform.x_first,
        meta.transform.y_first,
        0.0,
    ];
    image.encoder().write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image.encoder().write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;

    if !meta.crs.key_directory.is_empty() {
        image
            .encoder()
            .write_tag(Tag::GeoKeyDirectoryTag, meta.crs.key_directory.as_slice())?;
    }
    if !meta.crs.double_params.is_empty() {
        image
            .encoder()
            .write_tag(Tag::GeoDoubleParamsTag, meta.crs.double_params.as_slice())?;
    }
    if let Some(ascii) = &meta.crs.ascii_params {
        image
            .encoder()
            .write_tag(Tag::GeoAsciiParamsTag, ascii.as_str())?;
    }
    image
        .encoder()
        .write_tag(Tag::GdalNodata, format_nodata(meta.nodata).as_str())?;

    if meta.nodata.is_nan() {
        image.write_data(&raster.data)?;
    } else {
        let sentinel = meta.nodata;
        let restored: Vec<f32> = raster
            .data
            .iter()
            .map(|v| if v.is_nan() { sentinel } else { *v })
            .collect();
        image.write_data(&restored)?;
    }
    Ok(())
}

fn format_nodata(nodata: f32) -> String {
    if nodata.is_nan() {
        "nan".to_string()
    } else {
        format!("{}", nodata)
    }
}

fn tiff_error(path: &Path, source: TiffError) -> RasterIoError {
    RasterIoError::Tiff {
        path: path.to_path_buf(),
        source,
    }
}

fn tag_f64_vec(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
    tag: Tag,
) -> Result<Option<Vec<f64>>, RasterIoError> {
    match decoder.find_tag(tag).map_err(|e| tiff_error(path, e))? {
        Some(value) => Ok(Some(
            value.into_f64_vec().map_err(|e| tiff_error(path, e))?,
        )),
        None => Ok(None),
    }
}

fn tag_u16_vec(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
    tag: Tag,
) -> Result<Option<Vec<u16>>, RasterIoError> {
    match decoder.find_tag(tag).map_err(|e| tiff_error(path, e))? {
        Some(value) => Ok(Some(
            value.into_u16_vec().map_err(|e| tiff_error(path, e))?,
        )),
        None => Ok(None),
    }
}

fn tag_string(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
    tag: Tag,
) -> Result<Option<String>, RasterIoError> {
    match decoder.find_tag(tag).map_err(|e| tiff_error(path, e))? {
        Some(value) => Ok(Some(value.into_string().map_err(|e| tiff_error(path, e))?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_meta(width: u32, height: u32, nodata: f32) -> RasterMeta {
        RasterMeta {
            width,
            height,
            transform: GeoTransform {
                x_first: 150.91,
                y_first: -34.17,
                x_step: 0.000833333,
                y_step: -0.000833333,
            },
            crs: CrsDefinition::geographic_wgs84(),
            nodata,
        }
    }

    #[test]
    fn test_round_trip_preserves_geometry_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.tif");

        let data: Vec<f32> = (0..48).map(|i| i as f32 * 0.5).collect();
        let raster = Raster::new(sample_meta(8, 6, -9999.0), data.clone());
        write(&path, &raster).unwrap();

        let back = read(&path).unwrap();
        assert_eq!(back.meta.width, 8);
        assert_eq!(back.meta.height, 6);
        assert_eq!(back.data, data);
        assert_eq!(back.meta.nodata, -9999.0);
        assert_eq!(back.meta.crs, raster.meta.crs);

        let t = raster.meta.transform;
        let b = back.meta.transform;
        assert_eq!(t.x_first.to_bits(), b.x_first.to_bits());
        assert_eq!(t.y_first.to_bits(), b.y_first.to_bits());
        assert_eq!(t.x_step.to_bits(), b.x_step.to_bits());
        assert_eq!(t.y_step.to_bits(), b.y_step.to_bits());
    }

    #[test]
    fn test_nan_restored_as_sentinel_on_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.tif");

        let raster = Raster::new(sample_meta(2, 2, 0.0), vec![1.0, f32::NAN, 3.0, f32::NAN]);
        write(&path, &raster).unwrap();

        let back = read(&path).unwrap();
        assert_eq!(back.data, vec![1.0, 0.0, 3.0, 0.0]);
        assert_eq!(back.meta.nodata, 0.0);
    }

    #[test]
    fn test_nan_sentinel_keeps_nan_pixels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.tif");

        let raster = Raster::new(sample_meta(2, 1, f32::NAN), vec![f32::NAN, 2.5]);
        write(&path, &raster).unwrap();

        let back = read(&path).unwrap();
        assert!(back.meta.nodata.is_nan());
        assert!(back.data[0].is_nan());
        assert_eq!(back.data[1], 2.5);
    }

    #[test]
    fn test_read_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.tif");

        let data: Vec<f32> = (0..48).map(|i| i as f32).collect();
        write(&path, &Raster::new(sample_meta(8, 6, f32::NAN), data)).unwrap();

        let window = PixelWindow::new(2, 1, 4, 3);
        let chip = read_window(&path, &window).unwrap();
        assert_eq!(
            chip.data,
            vec![
                10.0, 11.0, 12.0, 13.0, //
                18.0, 19.0, 20.0, 21.0, //
                26.0, 27.0, 28.0, 29.0,
            ]
        );

        // the window's metadata is shifted to its own origin
        let full = sample_meta(8, 6, f32::NAN);
        assert_eq!(chip.meta.width, 4);
        assert_eq!(chip.meta.height, 3);
        assert_eq!(
            chip.meta.transform.x_first,
            full.transform.x_first + full.transform.x_step * 2.0
        );
        assert_eq!(
            chip.meta.transform.y_first,
            full.transform.y_first + full.transform.y_step * 1.0
        );
        assert_eq!(chip.meta.crs, full.crs);

        let err = read_window(&path, &PixelWindow::new(5, 0, 4, 3)).unwrap_err();
        assert!(matches!(err, RasterIoError::WindowOutOfBounds { .. }));
    }

    #[test]
    fn test_plain_tiff_has_no_georeference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tif");

        let mut bytes = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut bytes).unwrap();
            let image = encoder
                .new_image::<colortype::Gray32Float>(2, 2)
                .unwrap();
            image.write_data(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        }
        std::fs::write(&path, bytes.get_ref()).unwrap();

        let err = read_meta(&path).unwrap_err();
        assert!(matches!(err, RasterIoError::MissingGeoreference { .. }));
    }

    #[test]
    fn test_non_float_raster_is_rejected() {
        // Georeferenced, so the reader gets past the metadata and trips on
        // the sample format.
        let dir = tempdir().unwrap();
        let path = dir.path().join("gray8.tif");

        let mut bytes = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut bytes).unwrap();
            let mut image = encoder.new_image::<colortype::Gray8>(2, 2).unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &[0.05f64, 0.05, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(
                    Tag::ModelTiepointTag,
                    &[0.0f64, 0.0, 0.0, 150.91, -34.17, 0.0][..],
                )
                .unwrap();
            image.write_data(&[0u8, 1, 2, 3]).unwrap();
        }
        std::fs::write(&path, bytes.get_ref()).unwrap();

        assert!(read_meta(&path).is_ok());
        let err = read(&path).unwrap_err();
        assert!(matches!(err, RasterIoError::UnsupportedLayout { .. }));
    }
}
