// Library exports for testing and reuse

pub mod aoi;
pub mod chunking;
pub mod cli;
pub mod clip;
pub mod crs;
pub mod error;
pub mod filter;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod parcels;
pub mod pipeline;
pub mod raster;
pub mod reclassify;
pub mod summarize;
pub mod trajectory;

// Re-export commonly used types
pub use clip::{clip, ClippedRaster};
pub use error::{CdlError, Result};
pub use orchestrator::{run, RunConfig, RunReport};
pub use parcels::{LayerCache, Parcel, ParcelLayer};
pub use raster::{ClassRaster, PixelCounts, RasterMetadata, RasterSource};
pub use reclassify::{reclassify, RemapSpec};
pub use summarize::{OutputPolicy, ProgressCounter, RasterSummary, Summarizer};
