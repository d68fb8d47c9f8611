//! Per-year raster preparation (raw → AOI-clipped → reclassified) and the
//! per-chunk engine that turns prepared years into counts and trajectories.

use crate::aoi::clip_file_to_aoi;
use crate::chunking::ChunkPlan;
use crate::crs::{reproject_polygons, same_crs};
use crate::error::{CdlError, Result};
use crate::io::{GdalRaster, RasterWriteOptions};
use crate::parcels::{Parcel, ParcelLayer, PolygonSet};
use crate::raster::RasterSource;
use crate::reclassify::{reclassify_file, RemapSpec};
use crate::summarize::{write_json, RasterSummary, Summarizer};
use crate::trajectory::{write_tables, CountsTable, TableOutput, TrajectoryTable};
use clap::ValueEnum;
use glob::Pattern;
use log::{debug, info, warn};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const RASTER_SUFFIX: &str = "_30m_cdls.tif";

/// Processing stages of one archive year, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Stage {
    Raw,
    AoiClipped,
    Reclassified,
    #[value(skip)]
    Summarized,
}

impl Stage {
    fn previous(self) -> Stage {
        match self {
            Stage::Raw | Stage::AoiClipped => Stage::Raw,
            Stage::Reclassified => Stage::AoiClipped,
            Stage::Summarized => Stage::Reclassified,
        }
    }
}

/// Which result tables a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Products {
    Counts,
    Trajectories,
    Both,
}

impl Products {
    pub fn counts(self) -> bool {
        matches!(self, Products::Counts | Products::Both)
    }

    pub fn trajectories(self) -> bool {
        matches!(self, Products::Trajectories | Products::Both)
    }
}

/// One yearly raster of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveYear {
    pub year: u16,
    pub path: PathBuf,
}

fn year_of(path: &Path) -> Option<u16> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(RASTER_SUFFIX)?.get(..4)?.parse().ok()
}

/// Find `YYYY_30m_cdls.tif` rasters directly in `folder` or one level down,
/// in ascending year order. The first file found for a year wins.
pub fn discover_archive(folder: &Path) -> Result<Vec<ArchiveYear>> {
    if !folder.is_dir() {
        return Err(CdlError::MissingPath(folder.to_path_buf()));
    }

    let root = Pattern::escape(&folder.to_string_lossy());
    let mut years: BTreeMap<u16, PathBuf> = BTreeMap::new();
    for pattern in [
        format!("{}/*{}", root, RASTER_SUFFIX),
        format!("{}/*/*{}", root, RASTER_SUFFIX),
    ] {
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Unreadable archive entry: {}", e);
                    continue;
                }
            };
            match year_of(&path) {
                Some(year) => {
                    years.entry(year).or_insert(path);
                }
                None => debug!("Ignoring {}", path.display()),
            }
        }
    }

    if years.is_empty() {
        return Err(CdlError::EmptyArchive(folder.to_path_buf()));
    }

    info!(
        "Found {} archive year(s): {:?}",
        years.len(),
        years.keys().collect::<Vec<_>>()
    );
    Ok(years
        .into_iter()
        .map(|(year, path)| ArchiveYear { year, path })
        .collect())
}

/// Known locations of each year's intermediate rasters.
#[derive(Debug, Clone)]
pub struct RasterCache {
    root: PathBuf,
}

impl RasterCache {
    pub fn new(working_folder: &Path) -> Self {
        Self {
            root: working_folder.to_path_buf(),
        }
    }

    pub fn clipped_path(&self, year: u16) -> PathBuf {
        self.root
            .join("clipped")
            .join(format!("{}{}", year, RASTER_SUFFIX))
    }

    pub fn consolidated_path(&self, year: u16) -> PathBuf {
        self.root
            .join("consolidated")
            .join(format!("{}{}", year, RASTER_SUFFIX))
    }

    pub fn parcel_clips_folder(&self) -> PathBuf {
        self.root.join("clipped_parcels_rasters")
    }
}

/// A reclassified raster ready for summarization.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedYear {
    pub year: u16,
    pub path: PathBuf,
    pub projection: String,
}

pub struct PrepareOptions<'a> {
    pub aoi: Option<&'a PolygonSet>,
    pub spec: &'a RemapSpec,
    pub cache: &'a RasterCache,
    pub resume_from: Stage,
    pub write_options: &'a RasterWriteOptions,
}

impl PrepareOptions<'_> {
    /// Input of the reclassification step.
    fn clipped_source(&self, year: &ArchiveYear) -> PathBuf {
        match self.aoi {
            Some(_) => self.cache.clipped_path(year.year),
            None => year.path.clone(),
        }
    }

    /// The requested stage, moved back until its cached input exists.
    fn start_stage(&self, year: &ArchiveYear) -> Stage {
        let mut stage = self.resume_from.min(Stage::Reclassified);
        loop {
            let cached = match stage {
                Stage::Raw => return Stage::Raw,
                Stage::AoiClipped => self.clipped_source(year).exists(),
                Stage::Reclassified | Stage::Summarized => {
                    self.cache.consolidated_path(year.year).exists()
                }
            };
            if cached {
                return stage;
            }
            warn!(
                "{}: no cached output before stage {:?}, starting earlier",
                year.year, stage
            );
            stage = stage.previous();
        }
    }
}

/// Bring one year up to `Reclassified`, reusing cached stage outputs.
pub fn prepare_year(year: &ArchiveYear, options: &PrepareOptions) -> Result<PreparedYear> {
    let consolidated = options.cache.consolidated_path(year.year);
    let mut stage = options.start_stage(year);
    debug!("{}: starting at stage {:?}", year.year, stage);

    while stage < Stage::Reclassified {
        match stage {
            Stage::Raw => {
                if let Some(aoi) = options.aoi {
                    clip_file_to_aoi(
                        &year.path,
                        &options.cache.clipped_path(year.year),
                        aoi,
                        options.write_options,
                    )?;
                }
            }
            Stage::AoiClipped => reclassify_file(
                &options.clipped_source(year),
                &consolidated,
                options.spec,
                options.write_options,
            )?,
            Stage::Reclassified | Stage::Summarized => {}
        }
        stage = match stage {
            Stage::Raw => Stage::AoiClipped,
            _ => Stage::Reclassified,
        };
    }

    let projection = GdalRaster::open(&consolidated)?.metadata().projection.clone();
    Ok(PreparedYear {
        year: year.year,
        path: consolidated,
        projection,
    })
}

/// Prepare every year in ascending order.
pub fn prepare_archive(
    years: &[ArchiveYear],
    options: &PrepareOptions,
    interrupt: &AtomicBool,
) -> Result<Vec<PreparedYear>> {
    let mut prepared = Vec::with_capacity(years.len());
    for year in years {
        if interrupt.load(Ordering::SeqCst) {
            return Err(CdlError::Interrupted);
        }
        info!("Preparing {} raster", year.year);
        prepared.push(prepare_year(year, options).map_err(|e| e.in_year(year.year))?);
    }
    prepared.sort_by_key(|p| p.year);
    Ok(prepared)
}

/// Everything one chunk produces.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub counts: CountsTable,
    pub trajectories: TrajectoryTable,
    pub summaries: BTreeMap<u16, RasterSummary>,
}

impl ChunkResult {
    pub fn new(spec: &RemapSpec) -> Self {
        Self {
            counts: CountsTable::new(),
            trajectories: TrajectoryTable::new(spec),
            summaries: BTreeMap::new(),
        }
    }

    /// Fold one year's summary into the tables `products` asks for.
    pub fn add_year(
        &mut self,
        year: u16,
        summary: RasterSummary,
        parcels: &ParcelLayer,
        spec: &RemapSpec,
        products: Products,
    ) {
        let breakdown = summary.breakdown.as_deref().unwrap_or(&[]);
        if products.counts() {
            self.counts.add_year(year, breakdown, spec);
        }
        if products.trajectories() {
            self.trajectories.add_year(year, breakdown, parcels);
        }
        self.summaries.insert(year, summary);
    }
}

fn parcels_in_crs<'a>(parcels: &'a ParcelLayer, wkt: &str) -> Result<Cow<'a, ParcelLayer>> {
    if same_crs(&parcels.srs_wkt, wkt)? {
        return Ok(Cow::Borrowed(parcels));
    }

    let geometries: Vec<_> = parcels.parcels.iter().map(|p| p.geometry.clone()).collect();
    let reprojected = reproject_polygons(&geometries, &parcels.srs_wkt, wkt)?;
    Ok(Cow::Owned(ParcelLayer {
        name: parcels.name.clone(),
        id_key: parcels.id_key.clone(),
        srs_wkt: wkt.to_string(),
        parcels: parcels
            .parcels
            .iter()
            .zip(reprojected)
            .map(|(parcel, geometry)| Parcel {
                id: parcel.id.clone(),
                geometry,
            })
            .collect(),
    }))
}

/// Summarize `parcels` against every prepared year, strictly in year order.
pub fn summarize_years(
    years: &[PreparedYear],
    parcels: &ParcelLayer,
    spec: &RemapSpec,
    summarizer: &Summarizer,
    products: Products,
    interrupt: &AtomicBool,
) -> Result<ChunkResult> {
    let mut result = ChunkResult::new(spec);
    let mut ordered: Vec<&PreparedYear> = years.iter().collect();
    ordered.sort_by_key(|y| y.year);

    for year in ordered {
        if interrupt.load(Ordering::SeqCst) {
            return Err(CdlError::Interrupted);
        }
        let summary = parcels_in_crs(parcels, &year.projection)
            .and_then(|layer| summarizer.summarize_file(&year.path, Some(layer.as_ref())))
            .map_err(|e| e.in_year(year.year))?;
        result.add_year(year.year, summary, parcels, spec, products);
    }

    Ok(result)
}

/// Output locations of one chunk under the summary folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPaths {
    pub output: PathBuf,
    pub summary_json: PathBuf,
    pub trajectories_json: PathBuf,
}

impl ChunkPaths {
    pub fn new(summary_folder: &Path, layer_name: &str, chunk_name: &str) -> Self {
        let chunked = summary_folder.join("chunked");
        Self {
            output: chunked.join(format!("{}__{}__output.gpkg", layer_name, chunk_name)),
            summary_json: chunked.join(format!("{}__summary_data.json", chunk_name)),
            trajectories_json: chunked.join(format!("{}__trajectories.json", chunk_name)),
        }
    }
}

/// Chunk output files already on disk for `layer_name`, by chunk name.
pub fn find_chunk_outputs(summary_folder: &Path, layer_name: &str) -> Result<Vec<(String, PathBuf)>> {
    let prefix = format!("{}__", layer_name);
    let pattern = format!(
        "{}/{}*__output.gpkg",
        Pattern::escape(&summary_folder.join("chunked").to_string_lossy()),
        Pattern::escape(&prefix)
    );

    let mut outputs: Vec<(usize, String, PathBuf)> = glob::glob(&pattern)?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let chunk = name.strip_prefix(&prefix)?.strip_suffix("__output.gpkg")?;
            match ChunkPlan::parse_chunk_name(chunk) {
                Some(index) => Some((index, chunk.to_string(), path.clone())),
                None => {
                    debug!("Ignoring {}: not a chunk of '{}'", path.display(), layer_name);
                    None
                }
            }
        })
        .collect();

    // chunk_10 after chunk_9
    outputs.sort_by_key(|(index, _, _)| *index);
    Ok(outputs
        .into_iter()
        .map(|(_, chunk, path)| (chunk, path))
        .collect())
}

/// Shared settings for processing chunks.
pub struct ChunkContext<'a> {
    pub spec: &'a RemapSpec,
    pub summarizer: &'a Summarizer,
    pub products: Products,
    pub summary_folder: &'a Path,
    pub layer_name: &'a str,
    pub interrupt: &'a AtomicBool,
}

/// Run one chunk end to end and write its outputs. Returns the chunk's
/// GeoPackage path.
pub fn apply_cdl_data_to_parcels(
    years: &[PreparedYear],
    parcels: &ParcelLayer,
    chunk_name: &str,
    context: &ChunkContext,
) -> Result<PathBuf> {
    info!("Processing chunk '{}' ({} parcels)", chunk_name, parcels.len());
    let paths = ChunkPaths::new(context.summary_folder, context.layer_name, chunk_name);

    let result = summarize_years(
        years,
        parcels,
        context.spec,
        context.summarizer,
        context.products,
        context.interrupt,
    )?;

    write_json(&paths.summary_json, &result.summaries)?;
    if context.products.trajectories() {
        write_json(&paths.trajectories_json, &result.trajectories.records())?;
    }

    write_tables(
        &paths.output,
        &TableOutput {
            id_key: &parcels.id_key,
            srs_wkt: &parcels.srs_wkt,
            counts: context.products.counts().then_some(&result.counts),
            trajectories: context.products.trajectories().then_some(&result.trajectories),
        },
    )?;

    info!("Chunk '{}' written to {}", chunk_name, paths.output.display());
    Ok(paths.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_year_of() {
        assert_eq!(year_of(Path::new("/a/2019_30m_cdls.tif")), Some(2019));
        assert_eq!(year_of(Path::new("/a/2019_30m_cdls.tif.aux.xml")), None);
        assert_eq!(year_of(Path::new("/a/xx_30m_cdls.tif")), None);
    }

    #[test]
    fn test_discover_flat_and_nested() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2021_30m_cdls.tif"), b"").unwrap();
        fs::create_dir(dir.path().join("2019_30m_cdls")).unwrap();
        fs::write(dir.path().join("2019_30m_cdls").join("2019_30m_cdls.tif"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let years = discover_archive(dir.path()).unwrap();
        let found: Vec<u16> = years.iter().map(|y| y.year).collect();
        assert_eq!(found, vec![2019, 2021]);
    }

    #[test]
    fn test_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_archive(dir.path()),
            Err(CdlError::EmptyArchive(_))
        ));
        assert!(matches!(
            discover_archive(&dir.path().join("missing")),
            Err(CdlError::MissingPath(_))
        ));
    }

    #[test]
    fn test_resume_falls_back_to_cached_stage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RasterCache::new(dir.path());
        let spec = RemapSpec::cdl_default();
        let write_options = RasterWriteOptions::default();
        let aoi = PolygonSet {
            polygons: vec![],
            srs_wkt: String::new(),
        };
        let year = ArchiveYear {
            year: 2020,
            path: dir.path().join("2020_30m_cdls.tif"),
        };
        let options = PrepareOptions {
            aoi: Some(&aoi),
            spec: &spec,
            cache: &cache,
            resume_from: Stage::Reclassified,
            write_options: &write_options,
        };

        assert_eq!(options.start_stage(&year), Stage::Raw);

        fs::create_dir_all(cache.clipped_path(2020).parent().unwrap()).unwrap();
        fs::write(cache.clipped_path(2020), b"").unwrap();
        assert_eq!(options.start_stage(&year), Stage::AoiClipped);

        fs::create_dir_all(cache.consolidated_path(2020).parent().unwrap()).unwrap();
        fs::write(cache.consolidated_path(2020), b"").unwrap();
        assert_eq!(options.start_stage(&year), Stage::Reclassified);

        let from_raw = PrepareOptions {
            resume_from: Stage::Raw,
            ..options
        };
        assert_eq!(from_raw.start_stage(&year), Stage::Raw);
    }

    #[test]
    fn test_chunk_paths_and_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChunkPaths::new(dir.path(), "parcels", "chunk_3");
        assert!(paths.output.ends_with("chunked/parcels__chunk_3__output.gpkg"));
        assert!(paths.summary_json.ends_with("chunked/chunk_3__summary_data.json"));

        let chunked = dir.path().join("chunked");
        fs::create_dir_all(&chunked).unwrap();
        for chunk in ["chunk_10", "chunk_2", "chunk_0"] {
            fs::write(ChunkPaths::new(dir.path(), "parcels", chunk).output, b"").unwrap();
        }
        fs::write(chunked.join("other__chunk_1__output.gpkg"), b"").unwrap();
        // another layer whose name starts with "parcels__"
        fs::write(chunked.join("parcels__other__chunk_0__output.gpkg"), b"").unwrap();

        let names: Vec<String> = find_chunk_outputs(dir.path(), "parcels")
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["chunk_0", "chunk_2", "chunk_10"]);
    }

    #[test]
    fn test_products() {
        assert!(Products::Both.counts() && Products::Both.trajectories());
        assert!(!Products::Counts.trajectories());
        assert!(!Products::Trajectories.counts());
    }
}
