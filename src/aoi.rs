//! Cropping a classification raster to a study area.
//!
//! Runs on raw codes, before reclassification. The output carries nodata 0
//! and the source colormap.

use crate::clip::{clip_with_fill, polygon_window, rasterize_mask};
use crate::crs::reproject_polygons;
use crate::error::{CdlError, Result};
use crate::io::{ClassRasterWriter, GdalRaster, RasterWriteOptions};
use crate::parcels::PolygonSet;
use crate::raster::{ClassRaster, RasterSource, Window, SCAN_STRIP_ROWS};
use geo_types::MultiPolygon;
use log::info;
use std::path::Path;

const AOI_FEATURE: &str = "area of interest";
const AOI_NODATA: u8 = 0;

/// Reproject the AOI into the raster CRS and flatten it to one multipolygon.
fn aoi_in_raster_crs<R: RasterSource + ?Sized>(raster: &R, aoi: &PolygonSet) -> Result<MultiPolygon<f64>> {
    let polygons = reproject_polygons(&aoi.polygons, &aoi.srs_wkt, &raster.metadata().projection)?;
    Ok(PolygonSet {
        polygons,
        srs_wkt: raster.metadata().projection.clone(),
    }
    .merged())
}

/// Crop an in-memory (or open) raster to the AOI's bounding box, masking
/// everything outside the AOI to 0.
pub fn clip_to_aoi<R: RasterSource + ?Sized>(raster: &R, aoi: &PolygonSet) -> Result<ClassRaster> {
    let polygon = aoi_in_raster_crs(raster, aoi)?;
    let mut clipped = clip_with_fill(raster, &polygon, AOI_FEATURE, AOI_NODATA)?.into_class_raster();
    clipped.metadata.nodata = Some(f64::from(AOI_NODATA));
    Ok(clipped)
}

/// File-to-file AOI crop, streamed in row strips of the cropped window.
pub fn clip_file_to_aoi(
    input: &Path,
    output: &Path,
    aoi: &PolygonSet,
    options: &RasterWriteOptions,
) -> Result<()> {
    info!("Clipping {} to the area of interest", input.display());

    let source = GdalRaster::open(input)?;
    let polygon = aoi_in_raster_crs(&source, aoi)?;
    let window = polygon_window(source.metadata(), &polygon).ok_or_else(|| {
        CdlError::EmptyIntersection {
            feature: AOI_FEATURE.to_string(),
        }
    })?;

    let mut metadata = source.metadata().clone();
    metadata.width = window.width;
    metadata.height = window.height;
    metadata.geotransform = source.metadata().window_transform(window.col_off, window.row_off);
    metadata.nodata = Some(f64::from(AOI_NODATA));

    let mut writer = ClassRasterWriter::create(output, &metadata, source.colormap(), options)?;

    for strip in Window::strips(&metadata, SCAN_STRIP_ROWS) {
        let source_window = Window {
            col_off: window.col_off + strip.col_off,
            row_off: window.row_off + strip.row_off,
            width: strip.width,
            height: strip.height,
        };
        let geotransform = metadata.window_transform(strip.col_off, strip.row_off);
        let mask = rasterize_mask(&polygon, &geotransform, strip.width, strip.height);

        let mut data = source.read_window(&source_window)?;
        data.zip_mut_with(&mask, |value, &inside| {
            if !inside {
                *value = AOI_NODATA;
            }
        });
        writer.write_window(&strip, &data)?;
    }

    info!(
        "AOI raster {}x{} written to {}",
        metadata.width,
        metadata.height,
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Colormap;
    use geo_types::polygon;
    use ndarray::Array2;

    const GT: [f64; 6] = [0.0, 10.0, 0.0, 60.0, 0.0, -10.0];

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
        ]])
    }

    #[test]
    fn test_crop_to_union_bbox() {
        let colormap: Colormap = [(1, [1, 2, 3]), (5, [9, 9, 9])].into_iter().collect();
        let raster = ClassRaster::new(Array2::from_elem((6, 6), 5u8), GT, "")
            .unwrap()
            .with_nodata(Some(255))
            .with_colormap(Some(colormap.clone()));

        // two disjoint squares: bbox covers cols 1..5, rows 1..3
        let aoi = PolygonSet {
            polygons: vec![square(10.0, 30.0, 20.0, 50.0), square(40.0, 30.0, 50.0, 50.0)],
            srs_wkt: String::new(),
        };
        let out = clip_to_aoi(&raster, &aoi).unwrap();

        assert_eq!((out.width(), out.height()), (4, 2));
        assert_eq!(out.metadata.geotransform, [10.0, 10.0, 0.0, 50.0, 0.0, -10.0]);
        assert_eq!(out.nodata_code(), Some(0));
        assert_eq!(out.colormap, Some(colormap));
        // columns between the squares are masked out
        assert_eq!(out.pixel_counts().get(5), 4);
        assert_eq!(out.pixel_counts().get(0), 4);
    }

    #[test]
    fn test_aoi_outside_raster() {
        let raster = ClassRaster::new(Array2::from_elem((6, 6), 5u8), GT, "").unwrap();
        let aoi = PolygonSet {
            polygons: vec![square(500.0, 500.0, 600.0, 600.0)],
            srs_wkt: String::new(),
        };
        assert!(matches!(
            clip_to_aoi(&raster, &aoi),
            Err(CdlError::EmptyIntersection { .. })
        ));
    }
}
