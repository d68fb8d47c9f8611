//! Consolidation of raw land-cover codes into a small analysis taxonomy.

use crate::error::{CdlError, Result};
use crate::io::{ClassRasterWriter, GdalRaster, RasterWriteOptions};
use crate::raster::{ClassRaster, Colormap, RasterSource, Window, SCAN_STRIP_ROWS};
use log::{debug, info, warn};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One consolidated class and the raw codes folded into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapClass {
    pub color: [u8; 3],
    pub name: String,
    #[serde(default)]
    pub original: Vec<u8>,
}

/// Many-to-one remap table keyed by the new code.
///
/// `background` receives raw code 0 and is the nodata value of every
/// reclassified raster; `missing` receives every raw code no class claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapSpec {
    pub background: u8,
    pub missing: u8,
    pub classes: BTreeMap<u8, RemapClass>,
}

impl RemapSpec {
    pub fn new(classes: BTreeMap<u8, RemapClass>, background: u8, missing: u8) -> Result<Self> {
        let spec = Self {
            background,
            missing,
            classes,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        info!("Reading remap spec: {}", path.display());
        if !path.exists() {
            return Err(CdlError::MissingPath(path.to_path_buf()));
        }
        let spec: RemapSpec = serde_json::from_str(&fs::read_to_string(path)?)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(CdlError::InvalidRemapSpec("no classes defined".to_string()));
        }
        if self.classes.contains_key(&0) {
            return Err(CdlError::InvalidRemapSpec(
                "0 cannot be used as a new code".to_string(),
            ));
        }
        for (role, code) in [("background", self.background), ("missing", self.missing)] {
            if !self.classes.contains_key(&code) {
                return Err(CdlError::InvalidRemapSpec(format!(
                    "{} code {} has no class entry",
                    role, code
                )));
            }
        }
        if self.background == self.missing {
            return Err(CdlError::InvalidRemapSpec(format!(
                "background and missing share code {}",
                self.background
            )));
        }

        // raw 0 is unusable as a class and must land in background alone
        let zero_claims: Vec<u8> = self
            .classes
            .iter()
            .filter(|(_, class)| class.original.contains(&0))
            .map(|(&code, _)| code)
            .collect();
        if zero_claims != [self.background] {
            return Err(CdlError::InvalidRemapSpec(format!(
                "raw code 0 must map to background {} only, claimed by {:?}",
                self.background, zero_claims
            )));
        }

        let mut claimed: BTreeMap<u8, u8> = BTreeMap::new();
        for (&code, class) in &self.classes {
            for &raw in &class.original {
                if let Some(previous) = claimed.insert(raw, code) {
                    warn!(
                        "Raw code {} is claimed by classes {} and {}; {} ({}) wins",
                        raw, previous, code, code, class.name
                    );
                }
            }
        }

        Ok(())
    }

    /// Lookup table from raw code to new code. Classes are applied in
    /// ascending new-code order, so the highest code claiming a raw value wins.
    pub fn lookup_table(&self) -> [u8; 256] {
        let mut lut = [self.missing; 256];
        for (&code, class) in &self.classes {
            for &raw in &class.original {
                lut[raw as usize] = code;
            }
        }
        lut
    }

    pub fn colormap(&self) -> Colormap {
        self.classes
            .iter()
            .map(|(&code, class)| (code, class.color))
            .collect()
    }

    pub fn name_of(&self, code: u8) -> Option<&str> {
        self.classes.get(&code).map(|c| c.name.as_str())
    }

    /// The same taxonomy with every class mapping only to itself.
    pub fn identity(&self) -> Self {
        let classes = self
            .classes
            .iter()
            .map(|(&code, class)| {
                let mut class = class.clone();
                class.original = vec![code];
                (code, class)
            })
            .collect();
        Self {
            background: self.background,
            missing: self.missing,
            classes,
        }
    }

    /// The Cropland Data Layer consolidation used for parcel analysis.
    pub fn cdl_default() -> Self {
        let class = |color: [u8; 3], name: &str, original: Vec<u8>| RemapClass {
            color,
            name: name.to_string(),
            original,
        };
        let crops: Vec<u8> = (1..=60).chain(66..=80).chain(195..=255).collect();

        let classes = BTreeMap::from([
            (254, class([0, 0, 0], "background", vec![0])),
            (1, class([147, 105, 48], "crops", crops)),
            (2, class([100, 100, 100], "idle", vec![61])),
            (3, class([74, 59, 7], "grassland", vec![62, 176])),
            (4, class([53, 65, 22], "forest", vec![63, 141, 142, 143])),
            (5, class([78, 67, 27], "shrubland", vec![64, 152])),
            (6, class([50, 47, 36], "barren", vec![65, 131])),
            (10, class([195, 29, 20], "developed", vec![82])),
            (11, class([60, 32, 32], "developed_open", vec![121])),
            (12, class([106, 47, 31], "developed_low", vec![122])),
            (13, class([195, 29, 20], "developed_med", vec![123])),
            (14, class([139, 17, 11], "developed_high", vec![124])),
            (20, class([72, 93, 133], "water", vec![83, 111, 112])),
            (21, class([50, 103, 132], "wetlands", vec![87, 190])),
            (22, class([42, 45, 47], "woody_wetlands", vec![190])),
            (28, class([64, 76, 97], "aquaculture", vec![92])),
            (255, class([0, 0, 0], "missing", vec![])),
        ]);

        Self {
            background: 254,
            missing: 255,
            classes,
        }
    }
}

/// Bulk remap of a band through a 256-entry lookup table.
pub fn remap(data: &Array2<u8>, lut: &[u8; 256]) -> Array2<u8> {
    let mut out = Array2::zeros(data.raw_dim());
    Zip::from(&mut out)
        .and(data)
        .par_for_each(|o, &v| *o = lut[v as usize]);
    out
}

/// Reclassify an in-memory raster. Nodata becomes the background code and
/// the colormap is rebuilt from the class colors.
pub fn reclassify(raster: &ClassRaster, spec: &RemapSpec) -> ClassRaster {
    let data = remap(&raster.data, &spec.lookup_table());
    let mut metadata = raster.metadata.clone();
    metadata.nodata = Some(f64::from(spec.background));

    ClassRaster {
        data,
        metadata,
        colormap: Some(spec.colormap()),
    }
}

/// Reclassify a raster file strip by strip into a new GeoTIFF.
pub fn reclassify_file(
    input: &Path,
    output: &Path,
    spec: &RemapSpec,
    options: &RasterWriteOptions,
) -> Result<()> {
    info!(
        "Reclassifying {} -> {}",
        input.display(),
        output.display()
    );

    let source = GdalRaster::open(input)?;
    let mut metadata = source.metadata().clone();
    metadata.nodata = Some(f64::from(spec.background));

    let lut = spec.lookup_table();
    let colormap = spec.colormap();
    let mut writer = ClassRasterWriter::create(output, &metadata, Some(&colormap), options)?;

    for window in Window::strips(&metadata, SCAN_STRIP_ROWS) {
        let data = source.read_window(&window)?;
        writer.write_window(&window, &remap(&data, &lut))?;
    }

    debug!("Reclassified {}x{} pixels", metadata.width, metadata.height);
    Ok(())
}
