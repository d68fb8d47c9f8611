//! Geometry clipping: the minimal pixel window covering a polygon, masked to
//! the polygon's footprint.
//!
//! A pixel belongs to the footprint when its center falls inside the polygon
//! (even-odd rule per polygon, union across the parts of a multipolygon).
//! Polygons must already be in the raster's CRS.

use crate::error::{CdlError, Result};
use crate::raster::{
    count_masked_pixels, ClassRaster, Colormap, PixelCounts, RasterMetadata, RasterSource, Window,
};
use geo::BoundingRect;
use geo_types::MultiPolygon;
use log::trace;
use ndarray::Array2;
use std::iter;

/// Output of clipping one raster by one polygon (or polygon set).
#[derive(Debug, Clone)]
pub struct ClippedRaster {
    /// Window pixels, with everything outside the mask set to `fill`.
    pub data: Array2<u8>,
    pub mask: Array2<bool>,
    pub window: Window,
    pub metadata: RasterMetadata,
    pub colormap: Option<Colormap>,
    pub fill: u8,
}

impl ClippedRaster {
    /// Histogram of the pixels inside the footprint only.
    pub fn pixel_counts(&self) -> PixelCounts {
        count_masked_pixels(&self.data, &self.mask)
    }

    pub fn masked_pixels(&self) -> usize {
        self.mask.iter().filter(|&&inside| inside).count()
    }

    pub fn into_class_raster(self) -> ClassRaster {
        ClassRaster {
            data: self.data,
            metadata: self.metadata,
            colormap: self.colormap,
        }
    }
}

/// Clip `raster` to `polygon`, filling outside pixels with the raster's
/// nodata code (or 0 when it has none).
pub fn clip<R: RasterSource + ?Sized>(
    raster: &R,
    polygon: &MultiPolygon<f64>,
    feature: &str,
) -> Result<ClippedRaster> {
    let fill = raster
        .metadata()
        .nodata
        .filter(|v| v.fract() == 0.0 && (0.0..=255.0).contains(v))
        .map(|v| v as u8)
        .unwrap_or(0);
    clip_with_fill(raster, polygon, feature, fill)
}

pub fn clip_with_fill<R: RasterSource + ?Sized>(
    raster: &R,
    polygon: &MultiPolygon<f64>,
    feature: &str,
    fill: u8,
) -> Result<ClippedRaster> {
    validate_polygon(polygon, feature)?;

    let source = raster.metadata();
    let window = polygon_window(source, polygon).ok_or_else(|| CdlError::EmptyIntersection {
        feature: feature.to_string(),
    })?;

    let geotransform = source.window_transform(window.col_off, window.row_off);
    let mask = rasterize_mask(polygon, &geotransform, window.width, window.height);

    let mut data = raster.read_window(&window)?;
    data.zip_mut_with(&mask, |value, &inside| {
        if !inside {
            *value = fill;
        }
    });

    let mut metadata = source.clone();
    metadata.width = window.width;
    metadata.height = window.height;
    metadata.geotransform = geotransform;

    trace!(
        "Clipped '{}' to window {:?} ({} pixels in footprint)",
        feature,
        window,
        mask.iter().filter(|&&inside| inside).count()
    );

    Ok(ClippedRaster {
        data,
        mask,
        window,
        metadata,
        colormap: raster.colormap().cloned(),
        fill,
    })
}

fn validate_polygon(polygon: &MultiPolygon<f64>, feature: &str) -> Result<()> {
    let invalid = |reason: &str| CdlError::InvalidGeometry {
        feature: feature.to_string(),
        reason: reason.to_string(),
    };

    if polygon.0.is_empty() {
        return Err(invalid("empty geometry"));
    }

    for part in &polygon.0 {
        if part.exterior().0.len() < 4 {
            return Err(invalid("polygon ring has fewer than three vertices"));
        }
        let rings = iter::once(part.exterior()).chain(part.interiors());
        if rings
            .flat_map(|ring| ring.coords())
            .any(|c| !c.x.is_finite() || !c.y.is_finite())
        {
            return Err(invalid("non-finite coordinate"));
        }
    }

    Ok(())
}

/// Smallest pixel window containing the polygon's bounding box, intersected
/// with the raster extent. `None` when they do not overlap.
pub fn polygon_window(metadata: &RasterMetadata, polygon: &MultiPolygon<f64>) -> Option<Window> {
    let rect = polygon.bounding_rect()?;

    let (c0, r0) = metadata.world_to_pixel(rect.min().x, rect.max().y);
    let (c1, r1) = metadata.world_to_pixel(rect.max().x, rect.min().y);

    let col_start = c0.min(c1).floor().max(0.0);
    let col_end = c0.max(c1).ceil().min(metadata.width as f64);
    let row_start = r0.min(r1).floor().max(0.0);
    let row_end = r0.max(r1).ceil().min(metadata.height as f64);

    if col_end <= col_start || row_end <= row_start {
        return None;
    }

    Some(Window {
        col_off: col_start as usize,
        row_off: row_start as usize,
        width: (col_end - col_start) as usize,
        height: (row_end - row_start) as usize,
    })
}

/// Burn the polygon into a `height x width` mask laid out by `geotransform`.
pub fn rasterize_mask(
    polygon: &MultiPolygon<f64>,
    geotransform: &[f64; 6],
    width: usize,
    height: usize,
) -> Array2<bool> {
    let mut mask = Array2::from_elem((height, width), false);
    let mut crossings: Vec<f64> = Vec::new();

    for part in &polygon.0 {
        for row in 0..height {
            let y = geotransform[3] + (row as f64 + 0.5) * geotransform[5];

            crossings.clear();
            for ring in iter::once(part.exterior()).chain(part.interiors()) {
                for line in ring.lines() {
                    let (a, b) = (line.start, line.end);
                    if (a.y > y) != (b.y > y) {
                        let x = a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y);
                        crossings.push((x - geotransform[0]) / geotransform[1]);
                    }
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));

            // pixel center col + 0.5 must fall in [enter, exit)
            for span in crossings.chunks_exact(2) {
                let start = (span[0] - 0.5).ceil().max(0.0) as usize;
                let end = ((span[1] - 0.5).ceil().max(0.0) as usize).min(width);
                for col in start..end {
                    mask[[row, col]] = true;
                }
            }
        }
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{polygon, MultiPolygon};
    use ndarray::arr2;

    // 4x4 raster, 10 m pixels, origin (0, 40)
    const GT: [f64; 6] = [0.0, 10.0, 0.0, 40.0, 0.0, -10.0];

    fn raster() -> ClassRaster {
        let data = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as u8);
        ClassRaster::new(data, GT, "").unwrap()
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
        ]])
    }

    #[test]
    fn test_aligned_square_window_and_mask() {
        let clipped = clip(&raster(), &square(10.0, 10.0, 30.0, 30.0), "p").unwrap();
        assert_eq!(
            clipped.window,
            Window {
                col_off: 1,
                row_off: 1,
                width: 2,
                height: 2
            }
        );
        assert_eq!(clipped.data, arr2(&[[5u8, 6], [9, 10]]));
        assert!(clipped.mask.iter().all(|&m| m));
        assert_eq!(clipped.metadata.geotransform, [10.0, 10.0, 0.0, 30.0, 0.0, -10.0]);
        assert_eq!(clipped.pixel_counts().total(), 4);
    }

    #[test]
    fn test_triangle_masks_outside_pixels() {
        // hypotenuse x + y = 45 passes between pixel centers
        let tri = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 45.0, y: 0.0),
            (x: 0.0, y: 45.0),
        ]]);
        let src = raster().with_nodata(Some(250));
        let clipped = clip(&src, &tri, "tri").unwrap();
        assert_eq!(clipped.window, Window::full(&src.metadata));
        let expected_mask = arr2(&[
            [true, false, false, false],
            [true, true, false, false],
            [true, true, true, false],
            [true, true, true, true],
        ]);
        assert_eq!(clipped.mask, expected_mask);
        assert_eq!(clipped.masked_pixels(), 10);
        assert_eq!(clipped.data[[0, 1]], 250);
        assert_eq!(clipped.data[[3, 3]], 15);
        assert_eq!(clipped.pixel_counts().total(), 10);
    }

    #[test]
    fn test_hole_is_excluded() {
        let with_hole = MultiPolygon(vec![geo_types::Polygon::new(
            geo_types::LineString::from(vec![(0.0, 0.0), (40.0, 0.0), (40.0, 40.0), (0.0, 40.0)]),
            vec![geo_types::LineString::from(vec![
                (10.0, 10.0),
                (30.0, 10.0),
                (30.0, 30.0),
                (10.0, 30.0),
            ])],
        )]);
        let clipped = clip(&raster(), &with_hole, "donut").unwrap();
        assert_eq!(clipped.masked_pixels(), 12);
        assert!(!clipped.mask[[1, 1]]);
        assert!(!clipped.mask[[2, 2]]);
    }

    #[test]
    fn test_partial_overlap_is_cropped_to_extent() {
        let clipped = clip(&raster(), &square(30.0, 30.0, 70.0, 70.0), "edge").unwrap();
        assert_eq!(clipped.window.col_off, 3);
        assert_eq!(clipped.window.row_off, 0);
        assert_eq!((clipped.window.width, clipped.window.height), (1, 1));
        assert_eq!(clipped.pixel_counts().get(3), 1);
    }

    #[test]
    fn test_outside_extent_is_empty_intersection() {
        let result = clip(&raster(), &square(100.0, 100.0, 120.0, 120.0), "far");
        match result {
            Err(CdlError::EmptyIntersection { feature }) => assert_eq!(feature, "far"),
            other => panic!("expected EmptyIntersection, got {:?}", other.map(|c| c.window)),
        }
    }

    #[test]
    fn test_sliver_inside_extent_has_no_pixels() {
        // overlaps the extent but covers no pixel center
        let clipped = clip(&raster(), &square(11.0, 11.0, 14.0, 14.0), "sliver").unwrap();
        assert_eq!(clipped.masked_pixels(), 0);
        assert!(clipped.pixel_counts().is_empty());
    }

    #[test]
    fn test_invalid_geometry() {
        let empty = MultiPolygon::<f64>(vec![]);
        assert!(matches!(
            clip(&raster(), &empty, "e"),
            Err(CdlError::InvalidGeometry { .. })
        ));
        let nan = square(f64::NAN, 0.0, 10.0, 10.0);
        let err = clip(&raster(), &nan, "n").unwrap_err();
        assert!(err.is_recoverable_per_feature());
    }

    #[test]
    fn test_source_is_untouched() {
        let src = raster();
        let before = src.clone();
        let _ = clip(&src, &square(0.0, 0.0, 20.0, 20.0), "p").unwrap();
        assert_eq!(src, before);
    }
}
