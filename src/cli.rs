use crate::error::Result;
use crate::io::RasterWriteOptions;
use crate::orchestrator::RunConfig;
use crate::pipeline::{Products, Stage};
use crate::reclassify::RemapSpec;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cdl-parcels")]
#[command(about = "Summarize Cropland Data Layer land cover per parcel across a multi-year archive")]
#[command(version)]
#[command(author = "Huimori Project")]
pub struct Args {
    /// Input vector dataset holding the parcels (geodatabase, GeoPackage, ...)
    #[arg(short, long, value_name = "PATH")]
    pub input: PathBuf,

    /// Parcel layer name inside the input dataset
    #[arg(short, long, value_name = "NAME")]
    pub layer_name: String,

    /// Unique parcel identifier column (truncated to 10 characters on output)
    #[arg(long, value_name = "FIELD")]
    pub id_key: String,

    /// Output GeoPackage with the merged layers
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Maximum parcels per chunk
    #[arg(short, long, value_name = "N", default_value_t = 10000)]
    pub chunk_size: usize,

    /// Keep only parcels within this layer's polygons
    #[arg(long, value_name = "PATH")]
    pub filter_layer: Option<PathBuf>,

    /// Keep parcels outside the filter layer instead
    #[arg(long, requires = "filter_layer")]
    pub invert_filter: bool,

    /// Folder of YYYY_30m_cdls.tif rasters (directly or in per-year folders)
    #[arg(long, value_name = "DIR")]
    pub cdls_folder: PathBuf,

    /// Area of interest the rasters are cropped to before reclassification
    #[arg(long, value_name = "PATH")]
    pub cdls_aoi: Option<PathBuf>,

    /// Folder for chunk outputs and summaries
    #[arg(long, value_name = "DIR", default_value = "./output")]
    pub summary_folder: PathBuf,

    /// Folder for chunk inputs and the raster cache
    #[arg(long, value_name = "DIR", default_value = "./working")]
    pub working_folder: PathBuf,

    /// Folder for the run log
    #[arg(long, value_name = "DIR", default_value = "./logging")]
    pub log_folder: PathBuf,

    /// Keep working files and previous outputs
    #[arg(long)]
    pub skip_remove_io: bool,

    /// Only merge chunk outputs already on disk
    #[arg(long)]
    pub skip_processing: bool,

    /// Do not merge chunk outputs
    #[arg(long)]
    pub skip_merge: bool,

    /// Earliest raster stage to reuse from the working folder
    #[arg(long, value_enum, default_value_t = Stage::Raw)]
    pub resume_from: Stage,

    /// Tables to produce
    #[arg(long, value_enum, default_value_t = Products::Both)]
    pub products: Products,

    /// JSON remap table (default: built-in CDL consolidation)
    #[arg(long, value_name = "FILE")]
    pub remap_spec: Option<PathBuf>,

    /// Keep per-parcel clipped rasters and JSON records
    #[arg(long)]
    pub persist_clips: bool,

    /// GeoTIFF compression (DEFLATE, LZW, ZSTD, NONE)
    #[arg(long, value_name = "TYPE", default_value = "DEFLATE")]
    pub compression: String,

    /// GeoTIFF tile size (multiple of 16)
    #[arg(long, value_name = "PIXELS", default_value_t = 256)]
    pub tile_size: usize,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Resolve into a run configuration, loading and validating the remap
    /// table and write options.
    pub fn to_config(&self) -> Result<RunConfig> {
        let spec = match &self.remap_spec {
            Some(path) => RemapSpec::from_json_file(path)?,
            None => RemapSpec::cdl_default(),
        };

        Ok(RunConfig {
            input: self.input.clone(),
            layer_name: self.layer_name.clone(),
            id_key: self.id_key.clone(),
            output: self.output.clone(),
            chunk_size: self.chunk_size,
            filter: self.filter_layer.clone(),
            invert_filter: self.invert_filter,
            archive_folder: self.cdls_folder.clone(),
            aoi: self.cdls_aoi.clone(),
            summary_folder: self.summary_folder.clone(),
            working_folder: self.working_folder.clone(),
            remove_io: !self.skip_remove_io,
            skip_processing: self.skip_processing,
            skip_merge: self.skip_merge,
            resume_from: self.resume_from,
            products: self.products,
            spec,
            persist_clips: self.persist_clips,
            write_options: RasterWriteOptions::new(&self.compression, self.tile_size)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "cdl-parcels",
            "--input",
            "parcels.gdb",
            "--layer-name",
            "Parcels",
            "--id-key",
            "PARCEL_IDENTIFIER",
            "--output",
            "out.gpkg",
            "--cdls-folder",
            "cdls",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.chunk_size, 10000);
        assert_eq!(args.resume_from, Stage::Raw);
        assert_eq!(args.products, Products::Both);
        assert_eq!(args.working_folder, PathBuf::from("./working"));

        let config = args.to_config().unwrap();
        assert!(config.remove_io);
        assert_eq!(config.spec, RemapSpec::cdl_default());
        assert_eq!(config.write_options, RasterWriteOptions::default());
    }

    #[test]
    fn test_stage_and_products_values() {
        let args = parse(&["--resume-from", "reclassified", "--products", "trajectories"]);
        assert_eq!(args.resume_from, Stage::Reclassified);
        assert_eq!(args.products, Products::Trajectories);

        let args = parse(&["--resume-from", "aoi-clipped"]);
        assert_eq!(args.resume_from, Stage::AoiClipped);
    }

    #[test]
    fn test_invert_requires_filter() {
        let argv = [
            "cdl-parcels", "-i", "p.gdb", "-l", "P", "--id-key", "id", "-o", "o.gpkg",
            "--cdls-folder", "c", "--invert-filter",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_bad_compression_is_config_error() {
        let args = parse(&["--compression", "jpeg"]);
        assert!(args.to_config().is_err());
    }
}
