//! Whole-run driver: cleanup, chunking, per-chunk processing and the final
//! merge of chunk outputs.

use crate::chunking::ChunkPlan;
use crate::error::{CdlError, Result};
use crate::filter::filter_within;
use crate::io::RasterWriteOptions;
use crate::parcels::{
    read_parcel_layer, read_polygon_set, truncate_id_key, write_parcel_layer, LayerCache,
    PolygonSet,
};
use crate::pipeline::{
    apply_cdl_data_to_parcels, discover_archive, find_chunk_outputs, prepare_archive,
    ChunkContext, ChunkPaths, PrepareOptions, PreparedYear, Products, RasterCache, Stage,
};
use crate::reclassify::RemapSpec;
use crate::summarize::{OutputPolicy, ProgressCounter, Summarizer};
use crate::trajectory::{
    read_counts_layer, read_trajectory_layer, write_tables, CountsTable, TableOutput,
    TrajectoryTable,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything a run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: PathBuf,
    pub layer_name: String,
    pub id_key: String,
    pub output: PathBuf,
    pub chunk_size: usize,
    pub filter: Option<PathBuf>,
    pub invert_filter: bool,
    pub archive_folder: PathBuf,
    pub aoi: Option<PathBuf>,
    pub summary_folder: PathBuf,
    pub working_folder: PathBuf,
    pub remove_io: bool,
    pub skip_processing: bool,
    pub skip_merge: bool,
    pub resume_from: Stage,
    pub products: Products,
    pub spec: RemapSpec,
    pub persist_clips: bool,
    pub write_options: RasterWriteOptions,
}

impl RunConfig {
    /// Fail fast on configuration errors, before anything is touched.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CdlError::InvalidChunkSize(self.chunk_size));
        }
        self.spec.validate()?;

        if !self.skip_processing {
            let mut required = vec![&self.input, &self.archive_folder];
            required.extend(self.aoi.iter());
            required.extend(self.filter.iter());
            if let Some(missing) = required.into_iter().find(|p| !p.exists()) {
                return Err(CdlError::MissingPath(missing.clone()));
            }
        }
        Ok(())
    }

    fn id_key(&self) -> String {
        truncate_id_key(&self.id_key)
    }

    fn chunk_input_path(&self, chunk_name: &str) -> PathBuf {
        self.working_folder
            .join("chunks")
            .join(format!("{}__{}.gpkg", self.layer_name, chunk_name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub failed_chunks: Vec<String>,
    pub merged_chunks: usize,
    pub skipped_chunks: Vec<String>,
    pub merged_parcels: usize,
    pub output: Option<PathBuf>,
}

/// Run the configured stages. Chunk failures are logged and excluded from
/// the merge, then reported as `ChunksFailed` once the merge has finished.
pub fn run(config: &RunConfig, interrupt: &AtomicBool) -> Result<RunReport> {
    config.validate()?;

    if config.remove_io {
        clean_io(config)?;
    }

    let mut report = RunReport::default();

    let outputs: Vec<(String, PathBuf)> = if config.skip_processing {
        let found = find_chunk_outputs(&config.summary_folder, &config.layer_name)?;
        info!("Found {} chunk output(s) on disk", found.len());
        found
    } else {
        process(config, interrupt, &mut report)?
    };

    if interrupt.load(Ordering::SeqCst) {
        return Err(CdlError::Interrupted);
    }

    if !config.skip_merge {
        merge(config, &outputs, &mut report)?;
    }

    if !report.failed_chunks.is_empty() {
        error!("Failed chunks: {}", report.failed_chunks.join(", "));
        return Err(CdlError::ChunksFailed(report.failed_chunks.len()));
    }
    Ok(report)
}

/// Remove previous working files and outputs. The raster cache survives when
/// the run resumes past the raw stage; chunk outputs survive a merge-only run.
pub fn clean_io(config: &RunConfig) -> Result<()> {
    if config.working_folder.is_dir() {
        if config.resume_from > Stage::Raw {
            for sub in ["chunks", "clipped_parcels_rasters"] {
                remove_path(&config.working_folder.join(sub))?;
            }
        } else {
            remove_path(&config.working_folder)?;
        }
    }

    if config.skip_processing {
        warn!("Merge-only run: keeping {}", config.summary_folder.display());
    } else if config.summary_folder.is_dir() {
        for entry in fs::read_dir(&config.summary_folder)? {
            remove_path(&entry?.path())?;
        }
    }

    remove_path(&config.output)?;
    info!("Removed previous working files and outputs");
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Split the input into chunk files and apply an optional spatial filter to
/// each. Returns the chunk names with their input layer files.
pub fn write_chunks(
    config: &RunConfig,
    cache: &LayerCache,
    filter: Option<&PolygonSet>,
) -> Result<Vec<(String, PathBuf)>> {
    let layer = read_parcel_layer(&config.input, Some(&config.layer_name), &config.id_key)?;
    let plan = ChunkPlan::new(layer.len(), config.chunk_size)?;
    info!(
        "Chunking {} parcels of '{}' into {} chunk(s) of up to {}",
        layer.len(),
        config.layer_name,
        plan.total_chunks,
        config.chunk_size
    );

    let mut chunks = Vec::with_capacity(plan.total_chunks);
    for bounds in plan.iter() {
        let mut chunk = layer.slice(
            &format!("{}__{}", config.layer_name, bounds.name),
            bounds.rows.clone(),
        );
        if let Some(boundary) = filter {
            chunk = filter_within(&chunk, boundary, config.invert_filter)?;
        }
        if chunk.is_empty() {
            info!("Chunk '{}' has no parcels left, skipping", bounds.name);
            continue;
        }

        let path = config.chunk_input_path(&bounds.name);
        write_parcel_layer(&path, &chunk)?;
        let id_key = chunk.id_key.clone();
        cache.insert(&path, &id_key, chunk);
        chunks.push((bounds.name, path));
    }
    Ok(chunks)
}

fn progress_bar(len: usize) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let pb = ProgressBar::new(len as u64);
    pb.set_style(style);
    pb
}

fn process(
    config: &RunConfig,
    interrupt: &AtomicBool,
    report: &mut RunReport,
) -> Result<Vec<(String, PathBuf)>> {
    let layer_cache = LayerCache::new();
    let filter = config.filter.as_deref().map(read_polygon_set).transpose()?;
    let chunks = write_chunks(config, &layer_cache, filter.as_ref())?;
    report.chunks_total = chunks.len();

    let years = discover_archive(&config.archive_folder)?;
    let aoi = config.aoi.as_deref().map(read_polygon_set).transpose()?;
    let raster_cache = RasterCache::new(&config.working_folder);
    let prepared = prepare_archive(
        &years,
        &PrepareOptions {
            aoi: aoi.as_ref(),
            spec: &config.spec,
            cache: &raster_cache,
            resume_from: config.resume_from,
            write_options: &config.write_options,
        },
        interrupt,
    )?;

    let policy = if config.persist_clips {
        OutputPolicy::PersistTo(raster_cache.parcel_clips_folder())
    } else {
        OutputPolicy::Discard
    };
    let progress = ProgressCounter::new();
    let summarizer = Summarizer::new(policy)
        .with_progress(progress.clone())
        .with_write_options(config.write_options.clone());

    let context = ChunkContext {
        spec: &config.spec,
        summarizer: &summarizer,
        products: config.products,
        summary_folder: &config.summary_folder,
        layer_name: &config.layer_name,
        interrupt,
    };

    let failures = process_chunks(&chunks, &prepared, &layer_cache, &config.id_key(), &context, &progress);

    if interrupt.load(Ordering::SeqCst) {
        return Err(CdlError::Interrupted);
    }

    report.chunks_processed = chunks.len() - failures.len();
    report.failed_chunks = failures;
    info!(
        "Processed {} of {} chunk(s); {} parcel summaries",
        report.chunks_processed,
        report.chunks_total,
        progress.get()
    );

    Ok(chunks
        .into_iter()
        .map(|(name, _)| {
            let output = ChunkPaths::new(&config.summary_folder, &config.layer_name, &name).output;
            (name, output)
        })
        .collect())
}

/// Run chunks concurrently. Returns the names of the chunks that failed.
fn process_chunks(
    chunks: &[(String, PathBuf)],
    prepared: &[PreparedYear],
    layer_cache: &LayerCache,
    id_key: &str,
    context: &ChunkContext,
    progress: &ProgressCounter,
) -> Vec<String> {
    let pb = progress_bar(chunks.len());
    let failures = Mutex::new(Vec::new());

    chunks.par_iter().for_each(|(name, path)| {
        if context.interrupt.load(Ordering::SeqCst) {
            return;
        }

        let result = layer_cache
            .get_or_load(path, id_key)
            .and_then(|parcels| apply_cdl_data_to_parcels(prepared, &parcels, name, context))
            .map_err(|e| e.in_chunk(name));

        match result {
            Ok(_) | Err(CdlError::Interrupted) => {}
            Err(e) => {
                error!("{}", e);
                failures.lock().push(name.clone());
            }
        }

        pb.inc(1);
        pb.set_message(format!("{} parcel summaries", progress.get()));
    });

    pb.finish_with_message("done");
    let mut failures = failures.into_inner();
    failures.sort();
    failures
}

/// Merge chunk outputs into the final GeoPackage. Missing or unreadable
/// chunks are logged and left out.
pub fn merge(config: &RunConfig, outputs: &[(String, PathBuf)], report: &mut RunReport) -> Result<()> {
    info!(
        "Merging {} chunk output(s) into {}",
        outputs.len(),
        config.output.display()
    );

    let mut counts = CountsTable::new();
    let mut trajectories = TrajectoryTable::new(&config.spec);

    for (name, path) in outputs {
        let chunk_counts = if config.products.counts() {
            read_counts_layer(path, &config.spec).map(Some)
        } else {
            Ok(None)
        };
        let chunk_trajectories = if config.products.trajectories() {
            read_trajectory_layer(path, &config.spec).map(Some)
        } else {
            Ok(None)
        };

        match (chunk_counts, chunk_trajectories) {
            (Ok(c), Ok(t)) => {
                counts.merge(c.unwrap_or_default());
                if let Some(t) = t {
                    trajectories.merge(t);
                }
                report.merged_chunks += 1;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Skipping chunk '{}' in merge: {}", name, e);
                report.skipped_chunks.push(name.clone());
            }
        }
    }

    let id_key = config.id_key();
    let srs_wkt = trajectories.srs_wkt().to_string();
    write_tables(
        &config.output,
        &TableOutput {
            id_key: &id_key,
            srs_wkt: &srs_wkt,
            counts: config.products.counts().then_some(&counts),
            trajectories: config.products.trajectories().then_some(&trajectories),
        },
    )?;

    report.merged_parcels = counts.parcel_ids().len().max(trajectories.len());
    report.output = Some(config.output.clone());
    info!(
        "Merged {} chunk(s), {} parcels; skipped {}",
        report.merged_chunks,
        report.merged_parcels,
        report.skipped_chunks.len()
    );
    Ok(())
}
