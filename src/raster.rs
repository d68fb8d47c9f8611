//! In-memory classification rasters and pixel-class histograms.

use crate::error::{CdlError, Result};
use ndarray::parallel::prelude::*;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Display colors keyed by class code.
pub type Colormap = BTreeMap<u8, [u8; 3]>;

#[derive(Debug, Clone, PartialEq)]
pub struct RasterMetadata {
    pub width: usize,
    pub height: usize,
    pub geotransform: [f64; 6],
    pub projection: String,
    pub nodata: Option<f64>,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl RasterMetadata {
    pub fn new(
        width: usize,
        height: usize,
        geotransform: [f64; 6],
        projection: String,
        nodata: Option<f64>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CdlError::InvalidDimensions(width, height));
        }

        let pixel_width = geotransform[1].abs();
        let pixel_height = geotransform[5].abs();
        if pixel_width <= 0.0 {
            return Err(CdlError::InvalidPixelSize(pixel_width));
        }
        if pixel_height <= 0.0 {
            return Err(CdlError::InvalidPixelSize(pixel_height));
        }

        Ok(Self {
            width,
            height,
            geotransform,
            projection,
            nodata,
            pixel_width,
            pixel_height,
        })
    }

    pub fn is_north_up(&self) -> bool {
        self.geotransform[2] == 0.0 && self.geotransform[4] == 0.0
    }

    /// Fractional (col, row) of a world coordinate.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let gt = &self.geotransform;
        ((x - gt[0]) / gt[1], (y - gt[3]) / gt[5])
    }

    /// World coordinate of a fractional (col, row).
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let gt = &self.geotransform;
        (
            gt[0] + col * gt[1] + row * gt[2],
            gt[3] + col * gt[4] + row * gt[5],
        )
    }

    /// Geotransform of a window whose top-left pixel is (col_off, row_off).
    pub fn window_transform(&self, col_off: usize, row_off: usize) -> [f64; 6] {
        let (x, y) = self.pixel_to_world(col_off as f64, row_off as f64);
        let gt = &self.geotransform;
        [x, gt[1], gt[2], y, gt[4], gt[5]]
    }
}

/// A single-band grid of class codes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRaster {
    pub data: Array2<u8>,
    pub metadata: RasterMetadata,
    pub colormap: Option<Colormap>,
}

impl ClassRaster {
    pub fn new(data: Array2<u8>, geotransform: [f64; 6], projection: &str) -> Result<Self> {
        let (height, width) = data.dim();
        let metadata =
            RasterMetadata::new(width, height, geotransform, projection.to_string(), None)?;
        if !metadata.is_north_up() {
            return Err(CdlError::RotatedRaster {
                path: "<in-memory>".to_string(),
            });
        }
        Ok(Self {
            data,
            metadata,
            colormap: None,
        })
    }

    pub fn with_nodata(mut self, nodata: Option<u8>) -> Self {
        self.metadata.nodata = nodata.map(f64::from);
        self
    }

    pub fn with_colormap(mut self, colormap: Option<Colormap>) -> Self {
        self.colormap = colormap;
        self
    }

    pub fn width(&self) -> usize {
        self.metadata.width
    }

    pub fn height(&self) -> usize {
        self.metadata.height
    }

    /// Nodata as a class code, if it is representable as one.
    pub fn nodata_code(&self) -> Option<u8> {
        self.metadata
            .nodata
            .filter(|v| v.fract() == 0.0 && (0.0..=255.0).contains(v))
            .map(|v| v as u8)
    }

    /// Whole-raster histogram in a single pass over the band.
    pub fn pixel_counts(&self) -> PixelCounts {
        count_pixels(&self.data)
    }
}

/// Pixel window into a raster, in raster pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn full(metadata: &RasterMetadata) -> Self {
        Self {
            col_off: 0,
            row_off: 0,
            width: metadata.width,
            height: metadata.height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Full-width row strips of at most `rows` rows covering the raster.
    pub fn strips(metadata: &RasterMetadata, rows: usize) -> Vec<Window> {
        let rows = rows.max(1);
        (0..metadata.height)
            .step_by(rows)
            .map(|row_off| Window {
                col_off: 0,
                row_off,
                width: metadata.width,
                height: rows.min(metadata.height - row_off),
            })
            .collect()
    }
}

/// Anything that can hand out windows of class codes: an in-memory raster
/// or an open raster file.
pub trait RasterSource {
    fn metadata(&self) -> &RasterMetadata;

    fn colormap(&self) -> Option<&Colormap>;

    fn read_window(&self, window: &Window) -> Result<Array2<u8>>;

    /// Whole-band histogram, scanned in row strips so the band never has to
    /// be resident at once.
    fn histogram(&self) -> Result<PixelCounts> {
        let mut counts = PixelCounts::default();
        for window in Window::strips(self.metadata(), SCAN_STRIP_ROWS) {
            for (code, n) in count_pixels(&self.read_window(&window)?).iter() {
                counts.add(code, n);
            }
        }
        Ok(counts)
    }
}

pub const SCAN_STRIP_ROWS: usize = 2000;

impl RasterSource for ClassRaster {
    fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    fn colormap(&self) -> Option<&Colormap> {
        self.colormap.as_ref()
    }

    fn read_window(&self, window: &Window) -> Result<Array2<u8>> {
        let row_end = window.row_off + window.height;
        let col_end = window.col_off + window.width;
        if row_end > self.height() || col_end > self.width() {
            return Err(CdlError::InvalidDimensions(col_end, row_end));
        }
        Ok(self
            .data
            .slice(s![window.row_off..row_end, window.col_off..col_end])
            .to_owned())
    }

    fn histogram(&self) -> Result<PixelCounts> {
        Ok(count_pixels(&self.data))
    }
}

/// Pixel count per class code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelCounts(BTreeMap<u8, u64>);

impl PixelCounts {
    pub fn from_bins(bins: &[u64; 256]) -> Self {
        let counts = bins
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n > 0)
            .map(|(code, &n)| (code as u8, n))
            .collect();
        Self(counts)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn get(&self, code: u8) -> u64 {
        self.0.get(&code).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.0.iter().map(|(&code, &n)| (code, n))
    }

    pub fn add(&mut self, code: u8, n: u64) {
        if n > 0 {
            *self.0.entry(code).or_insert(0) += n;
        }
    }

    /// Class with the most pixels; ties go to the lowest code. `background`
    /// only wins when it is the sole class present.
    pub fn dominant(&self, background: Option<u8>) -> Option<u8> {
        let pick = |skip_background: bool| {
            self.iter()
                .filter(|&(code, _)| !(skip_background && Some(code) == background))
                .fold(None, |best: Option<(u8, u64)>, (code, n)| match best {
                    Some((_, best_n)) if best_n >= n => best,
                    _ => Some((code, n)),
                })
                .map(|(code, _)| code)
        };
        pick(true).or_else(|| pick(false))
    }
}

impl FromIterator<(u8, u64)> for PixelCounts {
    fn from_iter<I: IntoIterator<Item = (u8, u64)>>(iter: I) -> Self {
        let mut counts = PixelCounts::default();
        for (code, n) in iter {
            counts.add(code, n);
        }
        counts
    }
}

/// Distinct-value-and-count over a whole band.
pub fn count_pixels(data: &Array2<u8>) -> PixelCounts {
    let bins = data
        .par_iter()
        .fold(
            || [0u64; 256],
            |mut bins, &value| {
                bins[value as usize] += 1;
                bins
            },
        )
        .reduce(
            || [0u64; 256],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                a
            },
        );
    PixelCounts::from_bins(&bins)
}

/// Counts only the pixels where `mask` is set.
pub fn count_masked_pixels(data: &Array2<u8>, mask: &Array2<bool>) -> PixelCounts {
    let mut bins = [0u64; 256];
    for (&value, &inside) in data.iter().zip(mask.iter()) {
        if inside {
            bins[value as usize] += 1;
        }
    }
    PixelCounts::from_bins(&bins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    const GT: [f64; 6] = [100.0, 30.0, 0.0, 500.0, 0.0, -30.0];

    #[test]
    fn test_histogram_conservation() {
        let data = arr2(&[[0u8, 1, 61, 195], [1, 1, 0, 61], [195, 195, 1, 0], [0, 0, 0, 1]]);
        let raster = ClassRaster::new(data, GT, "").unwrap();
        let counts = raster.pixel_counts();
        assert_eq!(counts.total(), 16);
        assert_eq!(counts.get(0), 6);
        assert_eq!(counts.get(1), 5);
        assert_eq!(counts.get(61), 2);
        assert_eq!(counts.get(195), 3);
    }

    #[test]
    fn test_masked_count() {
        let data = arr2(&[[1u8, 2], [2, 2]]);
        let mask = arr2(&[[true, false], [true, true]]);
        let counts = count_masked_pixels(&data, &mask);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.get(1), 1);
        assert_eq!(counts.get(2), 2);
    }

    #[test]
    fn test_invalid_dimensions() {
        let data = Array2::<u8>::zeros((0, 4));
        assert!(matches!(
            ClassRaster::new(data, GT, ""),
            Err(CdlError::InvalidDimensions(4, 0))
        ));
    }

    #[test]
    fn test_rotated_geotransform_rejected() {
        let rotated = [100.0, 30.0, 2.0, 500.0, 0.0, -30.0];
        assert!(matches!(
            ClassRaster::new(Array2::zeros((2, 2)), rotated, ""),
            Err(CdlError::RotatedRaster { .. })
        ));
        let skewed = [100.0, 30.0, 0.0, 500.0, 1.5, -30.0];
        assert!(ClassRaster::new(Array2::zeros((2, 2)), skewed, "").is_err());
    }

    #[test]
    fn test_pixel_world_roundtrip() {
        let raster = ClassRaster::new(Array2::zeros((4, 4)), GT, "").unwrap();
        let (x, y) = raster.metadata.pixel_to_world(2.0, 3.0);
        assert_eq!((x, y), (160.0, 410.0));
        assert_eq!(raster.metadata.world_to_pixel(x, y), (2.0, 3.0));
        assert_eq!(raster.metadata.window_transform(1, 2)[0], 130.0);
        assert_eq!(raster.metadata.window_transform(1, 2)[3], 440.0);
    }

    #[test]
    fn test_dominant_prefers_non_background() {
        let counts: PixelCounts = vec![(254u8, 10u64), (1, 3), (2, 3)].into_iter().collect();
        assert_eq!(counts.dominant(Some(254)), Some(1));
        assert_eq!(counts.dominant(None), Some(254));

        let only_background: PixelCounts = vec![(254u8, 4u64)].into_iter().collect();
        assert_eq!(only_background.dominant(Some(254)), Some(254));
        assert_eq!(PixelCounts::default().dominant(Some(254)), None);
    }

    #[test]
    fn test_window_read_and_strip_histogram() {
        let data = Array2::from_shape_fn((5, 3), |(r, c)| (r * 3 + c) as u8 % 4);
        let raster = ClassRaster::new(data, GT, "").unwrap();
        let window = Window {
            col_off: 1,
            row_off: 2,
            width: 2,
            height: 2,
        };
        let part = raster.read_window(&window).unwrap();
        assert_eq!(part, arr2(&[[3u8, 0], [2, 3]]));

        let out_of_range = Window { width: 3, ..window };
        assert!(raster.read_window(&out_of_range).is_err());

        let strips = Window::strips(&raster.metadata, 2);
        assert_eq!(strips.len(), 3);
        assert_eq!(strips[2].height, 1);

        let counts = RasterSource::histogram(&raster).unwrap();
        assert_eq!(counts.total(), 15);
        assert_eq!(counts, raster.pixel_counts());
    }

    #[test]
    fn test_nodata_code() {
        let raster = ClassRaster::new(Array2::zeros((1, 1)), GT, "").unwrap();
        assert_eq!(raster.clone().with_nodata(Some(254)).nodata_code(), Some(254));
        let mut odd = raster;
        odd.metadata.nodata = Some(-9999.0);
        assert_eq!(odd.nodata_code(), None);
    }
}
