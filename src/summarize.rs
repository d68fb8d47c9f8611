//! Zonal statistics: whole-raster and per-parcel pixel-class histograms.

use crate::clip::clip;
use crate::error::{CdlError, Result};
use crate::io::{write_class_raster, GdalRaster, RasterWriteOptions};
use crate::parcels::{Parcel, ParcelLayer};
use crate::raster::{PixelCounts, RasterSource};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Histogram of one parcel's footprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub id: String,
    pub total_pixels: u64,
    pub pixel_counts: PixelCounts,
}

impl FeatureSummary {
    pub fn new(id: &str, pixel_counts: PixelCounts) -> Self {
        Self {
            id: id.to_string(),
            total_pixels: pixel_counts.total(),
            pixel_counts,
        }
    }

    pub fn empty(id: &str) -> Self {
        Self::new(id, PixelCounts::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterSummary {
    pub total_pixels: u64,
    pub pixel_counts: PixelCounts,
    pub breakdown: Option<Vec<FeatureSummary>>,
}

/// What happens to per-parcel clipped rasters and JSON records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPolicy {
    Discard,
    /// Write `<folder>/<id>/<raster>__<layer>.tiff` and `.json`.
    PersistTo(PathBuf),
}

/// Count of parcels summarized so far, shared by concurrent workers.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<Mutex<u64>>);

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the updated value.
    pub fn increment(&self) -> u64 {
        let mut count = self.0.lock();
        *count += 1;
        *count
    }

    pub fn get(&self) -> u64 {
        *self.0.lock()
    }
}

#[derive(Debug, Clone)]
pub struct Summarizer {
    policy: OutputPolicy,
    progress: Option<ProgressCounter>,
    write_options: RasterWriteOptions,
}

impl Summarizer {
    pub fn new(policy: OutputPolicy) -> Self {
        Self {
            policy,
            progress: None,
            write_options: RasterWriteOptions::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCounter) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_write_options(mut self, write_options: RasterWriteOptions) -> Self {
        self.write_options = write_options;
        self
    }

    pub fn policy(&self) -> &OutputPolicy {
        &self.policy
    }

    /// Summarize a raster file. The file is open only for the duration of
    /// this call.
    pub fn summarize_file(&self, path: &Path, parcels: Option<&ParcelLayer>) -> Result<RasterSummary> {
        let raster = GdalRaster::open(path)?;
        let raster_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "raster".to_string());
        self.summarize(&raster, &raster_name, parcels)
    }

    /// Whole-raster histogram, plus one histogram per parcel in layer order
    /// when `parcels` is given. Parcels must be in the raster's CRS.
    pub fn summarize<R: RasterSource + ?Sized>(
        &self,
        raster: &R,
        raster_name: &str,
        parcels: Option<&ParcelLayer>,
    ) -> Result<RasterSummary> {
        let pixel_counts = raster.histogram()?;
        debug!(
            "{}: {} pixels across {} classes",
            raster_name,
            pixel_counts.total(),
            pixel_counts.len()
        );

        let breakdown = match parcels {
            Some(layer) => {
                let mut breakdown = Vec::with_capacity(layer.len());
                for parcel in &layer.parcels {
                    breakdown.push(self.summarize_parcel(raster, raster_name, &layer.name, parcel)?);
                    if let Some(progress) = &self.progress {
                        progress.increment();
                    }
                }
                info!(
                    "Summarized {} parcels of '{}' against {}",
                    breakdown.len(),
                    layer.name,
                    raster_name
                );
                Some(breakdown)
            }
            None => None,
        };

        Ok(RasterSummary {
            total_pixels: pixel_counts.total(),
            pixel_counts,
            breakdown,
        })
    }

    fn summarize_parcel<R: RasterSource + ?Sized>(
        &self,
        raster: &R,
        raster_name: &str,
        layer_name: &str,
        parcel: &Parcel,
    ) -> Result<FeatureSummary> {
        let clipped = match clip(raster, &parcel.geometry, &parcel.id) {
            Ok(clipped) => clipped,
            Err(e) if e.is_recoverable_per_feature() => {
                warn!("{}: recording empty histogram: {}", raster_name, e);
                return Ok(FeatureSummary::empty(&parcel.id));
            }
            Err(e) => return Err(e),
        };

        let summary = FeatureSummary::new(&parcel.id, clipped.pixel_counts());

        if let OutputPolicy::PersistTo(folder) = &self.policy {
            let stem = format!("{}__{}", raster_name, layer_name);
            let dir = folder.join(path_safe(&parcel.id));
            if let Err(e) = persist_feature(&dir, &stem, clipped.into_class_raster(), &summary, &self.write_options) {
                error!(
                    "Failed to persist artifacts for parcel '{}' ({}): {}",
                    parcel.id, raster_name, e
                );
            }
        }

        Ok(summary)
    }
}

fn persist_feature(
    dir: &Path,
    stem: &str,
    raster: crate::raster::ClassRaster,
    summary: &FeatureSummary,
    options: &RasterWriteOptions,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_class_raster(&dir.join(format!("{}.tiff", stem)), &raster, options)?;
    write_json(&dir.join(format!("{}.json", stem)), summary)
}

/// A single path component for `id`; never empty, `.` or `..`.
fn path_safe(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("_{}", name),
        _ => name,
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(CdlError::MissingPath(path.to_path_buf()));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::ClassRaster;
    use geo_types::{polygon, MultiPolygon};
    use ndarray::Array2;

    const GT: [f64; 6] = [0.0, 30.0, 0.0, 300.0, 0.0, -30.0];

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
        ]])
    }

    fn parcels() -> ParcelLayer {
        ParcelLayer::from_rows(
            "parcels",
            "id",
            "",
            vec![
                (Some("a".to_string()), square(0.0, 240.0, 60.0, 300.0)),
                (Some("far".to_string()), square(900.0, 900.0, 960.0, 960.0)),
                (Some("b".to_string()), square(150.0, 0.0, 300.0, 90.0)),
            ],
        )
    }

    fn raster() -> ClassRaster {
        let data = Array2::from_shape_fn((10, 10), |(r, _)| if r < 5 { 1u8 } else { 2 });
        ClassRaster::new(data, GT, "").unwrap()
    }

    #[test]
    fn test_whole_raster_only() {
        let summary = Summarizer::new(OutputPolicy::Discard)
            .summarize(&raster(), "r", None)
            .unwrap();
        assert_eq!(summary.total_pixels, 100);
        assert_eq!(summary.pixel_counts.get(1), 50);
        assert!(summary.breakdown.is_none());
    }

    #[test]
    fn test_breakdown_keeps_order_and_empty_parcels() {
        let progress = ProgressCounter::new();
        let summary = Summarizer::new(OutputPolicy::Discard)
            .with_progress(progress.clone())
            .summarize(&raster(), "r", Some(&parcels()))
            .unwrap();

        let breakdown = summary.breakdown.unwrap();
        let ids: Vec<&str> = breakdown.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "far", "b"]);

        assert_eq!(breakdown[0].total_pixels, 4);
        assert_eq!(breakdown[0].pixel_counts.get(1), 4);
        assert_eq!(breakdown[1].total_pixels, 0);
        assert!(breakdown[1].pixel_counts.is_empty());
        assert_eq!(breakdown[2].total_pixels, 15);
        assert_eq!(breakdown[2].pixel_counts.get(2), 15);
        assert_eq!(progress.get(), 3);
    }

    #[test]
    fn test_persisted_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Summarizer::new(OutputPolicy::PersistTo(dir.path().to_path_buf()));
        summarizer
            .summarize(&raster(), "2020_30m_cdls", Some(&parcels()))
            .unwrap();

        let record: FeatureSummary =
            read_json(&dir.path().join("a").join("2020_30m_cdls__parcels.json")).unwrap();
        assert_eq!(record, FeatureSummary::new("a", [(1, 4)].into_iter().collect()));
        assert!(dir.path().join("a").join("2020_30m_cdls__parcels.tiff").exists());
        assert!(!dir.path().join("far").exists());
    }

    #[test]
    fn test_path_safe_stays_inside_folder() {
        assert_eq!(path_safe("a/b:c"), "a_b_c");
        assert_eq!(path_safe(".."), "_..");
        assert_eq!(path_safe("."), "_.");
        assert_eq!(path_safe(""), "_");
        assert_eq!(path_safe("..x"), "..x");

        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("clips");
        let parcels = ParcelLayer::from_rows(
            "parcels",
            "id",
            "",
            vec![(Some("..".to_string()), square(0.0, 240.0, 60.0, 300.0))],
        );
        Summarizer::new(OutputPolicy::PersistTo(folder.clone()))
            .summarize(&raster(), "r", Some(&parcels))
            .unwrap();

        assert!(folder.join("_..").join("r__parcels.json").exists());
        assert!(!dir.path().join("r__parcels.json").exists());
    }

    #[test]
    fn test_counter_is_shared_across_threads() {
        let progress = ProgressCounter::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let progress = progress.clone();
                s.spawn(move || {
                    for _ in 0..250 {
                        progress.increment();
                    }
                });
            }
        });
        assert_eq!(progress.get(), 1000);
    }

    #[test]
    fn test_summary_json_shape() {
        let summary = RasterSummary {
            total_pixels: 3,
            pixel_counts: [(1, 2), (254, 1)].into_iter().collect(),
            breakdown: None,
        };
        let json: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["total_pixels"], 3);
        assert_eq!(json["pixel_counts"]["254"], 1);
        assert!(json["breakdown"].is_null());
    }
}
