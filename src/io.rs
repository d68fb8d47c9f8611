use crate::error::{CdlError, Result};
use crate::raster::{ClassRaster, Colormap, RasterMetadata, RasterSource, Window};
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, ColorEntry, ColorTable, PaletteInterpretation, RasterBand};
use gdal::{Dataset, DriverManager};
use log::{debug, info};
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};

/// An open single-band classification raster on disk.
///
/// The underlying dataset is closed when this value is dropped, on every
/// exit path, so callers scope it to one summarization pass.
pub struct GdalRaster {
    path: PathBuf,
    dataset: Dataset,
    metadata: RasterMetadata,
    colormap: Option<Colormap>,
}

impl GdalRaster {
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening raster: {}", path.display());
        if !path.exists() {
            return Err(CdlError::MissingPath(path.to_path_buf()));
        }

        let dataset = Dataset::open(path)?;
        let metadata = extract_metadata_from_dataset(&dataset)?;
        if !metadata.is_north_up() {
            return Err(CdlError::RotatedRaster {
                path: path.display().to_string(),
            });
        }

        let colormap = read_colormap(&dataset.rasterband(1)?);

        Ok(Self {
            path: path.to_path_buf(),
            dataset,
            metadata,
            colormap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole band into memory.
    pub fn into_class_raster(self) -> Result<ClassRaster> {
        let data = self.read_window(&Window::full(&self.metadata))?;
        Ok(ClassRaster {
            data,
            metadata: self.metadata,
            colormap: self.colormap,
        })
    }
}

impl RasterSource for GdalRaster {
    fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    fn colormap(&self) -> Option<&Colormap> {
        self.colormap.as_ref()
    }

    fn read_window(&self, window: &Window) -> Result<Array2<u8>> {
        let rasterband = self.dataset.rasterband(1)?;

        debug!(
            "Reading window: offset=({},{}), size=({},{})",
            window.col_off, window.row_off, window.width, window.height
        );

        let buffer = rasterband.read_as::<u8>(
            (window.col_off as isize, window.row_off as isize),
            (window.width, window.height),
            (window.width, window.height),
            None,
        )?;

        let data_vec: Vec<u8> = buffer.into_iter().collect();
        let data = Array2::from_shape_vec((window.height, window.width), data_vec)?;

        Ok(data)
    }
}

/// Read a classification raster and its metadata fully into memory.
pub fn read_class_raster(path: &Path) -> Result<ClassRaster> {
    GdalRaster::open(path)?.into_class_raster()
}

/// Extract metadata from a dataset without reading any pixels
pub fn extract_metadata_from_dataset(dataset: &Dataset) -> Result<RasterMetadata> {
    let rasterband: RasterBand = dataset.rasterband(1)?;

    let width = rasterband.x_size() as usize;
    let height = rasterband.y_size() as usize;
    let nodata = rasterband.no_data_value();
    let geotransform = dataset.geo_transform()?;

    RasterMetadata::new(width, height, geotransform, dataset.projection(), nodata)
}

fn read_colormap(rasterband: &RasterBand) -> Option<Colormap> {
    let table = rasterband.color_table()?;
    let channel = |v: i16| v.clamp(0, 255) as u8;

    let colormap: Colormap = (0..table.entry_count().min(256))
        .filter_map(|i| {
            table
                .entry_as_rgb(i)
                .map(|e| (i as u8, [channel(e.r), channel(e.g), channel(e.b)]))
        })
        .collect();

    Some(colormap)
}

/// GeoTIFF creation options shared by every raster this tool writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterWriteOptions {
    pub compression: String,
    pub tile_size: usize,
}

impl Default for RasterWriteOptions {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            tile_size: 256,
        }
    }
}

impl RasterWriteOptions {
    pub fn new(compression: &str, tile_size: usize) -> Result<Self> {
        let compression = compression.to_uppercase();
        validate_compression(&compression)?;
        validate_tile_size(tile_size)?;
        Ok(Self {
            compression,
            tile_size,
        })
    }

    pub fn creation_options(&self) -> Vec<String> {
        vec![
            format!("COMPRESS={}", self.compression),
            "TILED=YES".to_string(),
            format!("BLOCKXSIZE={}", self.tile_size),
            format!("BLOCKYSIZE={}", self.tile_size),
            "BIGTIFF=IF_SAFER".to_string(),
        ]
    }
}

/// Validate compression type
pub fn validate_compression(compression: &str) -> Result<()> {
    let valid_types = ["DEFLATE", "LZW", "ZSTD", "NONE"];
    if !valid_types.contains(&compression) {
        return Err(CdlError::InvalidCompression(compression.to_string()));
    }
    Ok(())
}

/// Validate tile size (must be multiple of 16)
pub fn validate_tile_size(tile_size: usize) -> Result<()> {
    if tile_size == 0 || tile_size % 16 != 0 {
        return Err(CdlError::InvalidTileSize(tile_size));
    }
    Ok(())
}

/// An output GeoTIFF that is filled window by window.
///
/// Georeferencing, nodata and the colormap are fixed at creation; the file is
/// flushed and closed when the writer is dropped.
pub struct ClassRasterWriter {
    path: PathBuf,
    dataset: Dataset,
    width: usize,
    height: usize,
}

impl ClassRasterWriter {
    pub fn create(
        path: &Path,
        metadata: &RasterMetadata,
        colormap: Option<&Colormap>,
        options: &RasterWriteOptions,
    ) -> Result<Self> {
        debug!("Creating output raster: {}", path.display());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let driver = DriverManager::get_driver_by_name("GTiff")?;

        let mut gdal_options = CslStringList::new();
        for opt in options.creation_options() {
            gdal_options.add_string(&opt)?;
        }

        let mut dataset = driver.create_with_band_type_with_options::<u8, _>(
            path,
            metadata.width,
            metadata.height,
            1,
            &gdal_options,
        )?;

        dataset.set_geo_transform(&metadata.geotransform)?;
        if !metadata.projection.is_empty() {
            dataset.set_projection(&metadata.projection)?;
        }

        {
            let mut raster_band = dataset.rasterband(1)?;
            if let Some(nodata) = metadata.nodata {
                raster_band.set_no_data_value(Some(nodata))?;
            }

            if let Some(colormap) = colormap {
                let mut table = ColorTable::new(PaletteInterpretation::Rgba);
                for (&code, &[r, g, b]) in colormap {
                    table.set_color_entry(
                        u16::from(code),
                        &ColorEntry::rgba(i16::from(r), i16::from(g), i16::from(b), 255),
                    );
                }
                raster_band.set_color_table(&table);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            dataset,
            width: metadata.width,
            height: metadata.height,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` at the window's offset.
    pub fn write_window(&mut self, window: &Window, data: &Array2<u8>) -> Result<()> {
        let (array_height, array_width) = data.dim();
        if array_height != window.height
            || array_width != window.width
            || window.col_off + window.width > self.width
            || window.row_off + window.height > self.height
        {
            return Err(CdlError::InvalidDimensions(array_width, array_height));
        }

        let mut raster_band = self.dataset.rasterband(1)?;

        // GDAL expects row-major order
        let data_vec: Vec<u8> = data.iter().copied().collect();
        let mut buffer = Buffer::new((window.width, window.height), data_vec);

        raster_band.write(
            (window.col_off as isize, window.row_off as isize),
            (window.width, window.height),
            &mut buffer,
        )?;

        debug!(
            "Wrote window at ({},{}) size {}x{} to {}",
            window.col_off,
            window.row_off,
            window.width,
            window.height,
            self.path.display()
        );

        Ok(())
    }
}

/// Write a single-band byte GeoTIFF with nodata and colormap attached.
pub fn write_class_raster(
    path: &Path,
    raster: &ClassRaster,
    options: &RasterWriteOptions,
) -> Result<()> {
    let mut writer =
        ClassRasterWriter::create(path, &raster.metadata, raster.colormap.as_ref(), options)?;
    writer.write_window(&Window::full(&raster.metadata), &raster.data)?;

    info!(
        "Wrote {}x{} raster to {}",
        raster.width(),
        raster.height(),
        path.display()
    );
    Ok(())
}
