//! Per-parcel counts and year-over-year trajectories, accumulated across the
//! archive and stored as two named layers of one GeoPackage.

use crate::error::{CdlError, Result};
use crate::parcels::{to_multipolygon, ParcelLayer};
use crate::reclassify::RemapSpec;
use crate::summarize::FeatureSummary;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{
    Feature, FieldValue, LayerAccess, LayerOptions, OGRFieldType, OGRwkbGeometryType, ToGdal,
};
use gdal::{Dataset, DriverManager};
use geo_types::MultiPolygon;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

pub const COUNTS_LAYER: &str = "Parcels with CDL counts";
pub const TRAJECTORIES_LAYER: &str = "Parcels with CDL pixel trajectories";

const NO_DATA_STEP: &str = "-";
const STEP_SEPARATOR: &str = ">";

/// One (parcel, year, class) row of the counts table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelYearCount {
    pub parcel_id: String,
    pub year: u16,
    pub class_code: u8,
    pub class_name: String,
    pub pixel_count: u64,
    pub total_pixels: u64,
}

impl ParcelYearCount {
    pub fn fraction(&self) -> f64 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.pixel_count as f64 / self.total_pixels as f64
        }
    }
}

/// Counts keyed by (parcel, year, class); re-inserting a key replaces it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountsTable {
    rows: BTreeMap<(String, u16, u8), ParcelYearCount>,
}

impl CountsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: ParcelYearCount) {
        self.rows
            .insert((row.parcel_id.clone(), row.year, row.class_code), row);
    }

    /// Add one year's per-parcel histograms. Parcels without pixels add no rows.
    pub fn add_year(&mut self, year: u16, breakdown: &[FeatureSummary], spec: &RemapSpec) {
        for feature in breakdown {
            for (code, n) in feature.pixel_counts.iter() {
                self.insert(ParcelYearCount {
                    parcel_id: feature.id.clone(),
                    year,
                    class_code: code,
                    class_name: spec.name_of(code).unwrap_or("unknown").to_string(),
                    pixel_count: n,
                    total_pixels: feature.total_pixels,
                });
            }
        }
    }

    pub fn merge(&mut self, other: CountsTable) {
        self.rows.extend(other.rows);
    }

    pub fn rows(&self) -> impl Iterator<Item = &ParcelYearCount> {
        self.rows.values()
    }

    pub fn parcel_ids(&self) -> BTreeSet<&str> {
        self.rows.keys().map(|(id, _, _)| id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParcelTrajectory {
    pub parcel_id: String,
    pub geometry: MultiPolygon<f64>,
    /// Dominant class per year; `None` when the parcel had no pixels.
    pub dominant: BTreeMap<u16, Option<u8>>,
}

impl ParcelTrajectory {
    /// Years with data whose dominant class differs from the previous year
    /// with data.
    pub fn transitions(&self) -> usize {
        let classes: Vec<u8> = self.dominant.values().flatten().copied().collect();
        classes.windows(2).filter(|w| w[0] != w[1]).count()
    }
}

/// Serialized form of one trajectory row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub id: String,
    pub years: BTreeMap<u16, Option<u8>>,
    pub trajectory: String,
    pub transitions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryTable {
    background: u8,
    srs_wkt: String,
    class_names: BTreeMap<u8, String>,
    years: BTreeSet<u16>,
    parcels: BTreeMap<String, ParcelTrajectory>,
}

impl TrajectoryTable {
    pub fn new(spec: &RemapSpec) -> Self {
        Self {
            background: spec.background,
            srs_wkt: String::new(),
            class_names: spec
                .classes
                .iter()
                .map(|(&code, class)| (code, class.name.clone()))
                .collect(),
            years: BTreeSet::new(),
            parcels: BTreeMap::new(),
        }
    }

    /// Record the dominant class of every parcel for `year`. Parcels are
    /// matched to summaries by id; geometry comes from `layer`.
    pub fn add_year(&mut self, year: u16, breakdown: &[FeatureSummary], layer: &ParcelLayer) {
        self.years.insert(year);
        if self.srs_wkt.is_empty() {
            self.srs_wkt = layer.srs_wkt.clone();
        }
        let dominant: BTreeMap<&str, Option<u8>> = breakdown
            .iter()
            .map(|f| (f.id.as_str(), f.pixel_counts.dominant(Some(self.background))))
            .collect();

        for parcel in &layer.parcels {
            let entry = self
                .parcels
                .entry(parcel.id.clone())
                .or_insert_with(|| ParcelTrajectory {
                    parcel_id: parcel.id.clone(),
                    geometry: parcel.geometry.clone(),
                    dominant: BTreeMap::new(),
                });
            entry
                .dominant
                .insert(year, dominant.get(parcel.id.as_str()).copied().flatten());
        }
    }

    pub fn insert(&mut self, trajectory: ParcelTrajectory) {
        self.years.extend(trajectory.dominant.keys().copied());
        self.parcels.insert(trajectory.parcel_id.clone(), trajectory);
    }

    pub fn merge(&mut self, other: TrajectoryTable) {
        if self.srs_wkt.is_empty() {
            self.srs_wkt = other.srs_wkt;
        }
        for (_, trajectory) in other.parcels {
            self.insert(trajectory);
        }
        self.years.extend(other.years);
    }

    /// CRS of the stored geometries; empty when unknown.
    pub fn srs_wkt(&self) -> &str {
        &self.srs_wkt
    }

    pub fn years(&self) -> &BTreeSet<u16> {
        &self.years
    }

    pub fn get(&self, parcel_id: &str) -> Option<&ParcelTrajectory> {
        self.parcels.get(parcel_id)
    }

    pub fn trajectories(&self) -> impl Iterator<Item = &ParcelTrajectory> {
        self.parcels.values()
    }

    pub fn len(&self) -> usize {
        self.parcels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty()
    }

    /// Dominant class names in year order, `-` for years without pixels.
    pub fn trajectory_string(&self, trajectory: &ParcelTrajectory) -> String {
        self.years
            .iter()
            .map(|year| match trajectory.dominant.get(year).copied().flatten() {
                Some(code) => self
                    .class_names
                    .get(&code)
                    .cloned()
                    .unwrap_or_else(|| code.to_string()),
                None => NO_DATA_STEP.to_string(),
            })
            .collect::<Vec<_>>()
            .join(STEP_SEPARATOR)
    }

    pub fn records(&self) -> Vec<TrajectoryRecord> {
        self.parcels
            .values()
            .map(|t| TrajectoryRecord {
                id: t.parcel_id.clone(),
                years: self
                    .years
                    .iter()
                    .map(|&y| (y, t.dominant.get(&y).copied().flatten()))
                    .collect(),
                trajectory: self.trajectory_string(t),
                transitions: t.transitions(),
            })
            .collect()
    }
}

fn year_column(year: u16) -> String {
    format!("y{}", year)
}

fn parse_year_column(name: &str) -> Option<u16> {
    name.strip_prefix('y')
        .filter(|digits| digits.len() == 4)
        .and_then(|digits| digits.parse().ok())
}

/// Where and how the result tables are written.
pub struct TableOutput<'a> {
    pub id_key: &'a str,
    pub srs_wkt: &'a str,
    pub counts: Option<&'a CountsTable>,
    pub trajectories: Option<&'a TrajectoryTable>,
}

/// Write the requested tables as named layers of a new GeoPackage.
pub fn write_tables(path: &Path, output: &TableOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        fs::remove_file(path)?;
    }

    let driver = DriverManager::get_driver_by_name("GPKG")?;
    let mut dataset = driver.create_vector_only(path)?;

    if let Some(counts) = output.counts {
        write_counts_layer(&mut dataset, output.id_key, counts)?;
    }
    if let Some(trajectories) = output.trajectories {
        write_trajectory_layer(&mut dataset, output.id_key, output.srs_wkt, trajectories)?;
    }

    info!("Wrote output tables to {}", path.display());
    Ok(())
}

fn write_counts_layer(dataset: &mut Dataset, id_key: &str, counts: &CountsTable) -> Result<()> {
    let mut txn = dataset.start_transaction()?;
    {
        let layer = txn.create_layer(LayerOptions {
            name: COUNTS_LAYER,
            srs: None,
            ty: OGRwkbGeometryType::wkbNone,
            options: None,
        })?;
        layer.create_defn_fields(&[
            (id_key, OGRFieldType::OFTString),
            ("year", OGRFieldType::OFTInteger),
            ("class_code", OGRFieldType::OFTInteger),
            ("class_name", OGRFieldType::OFTString),
            ("pixel_count", OGRFieldType::OFTInteger64),
            ("total_pixels", OGRFieldType::OFTInteger64),
            ("fraction", OGRFieldType::OFTReal),
        ])?;

        for row in counts.rows() {
            let mut feature = Feature::new(layer.defn())?;
            feature.set_field(id_key, &FieldValue::StringValue(row.parcel_id.clone()))?;
            feature.set_field("year", &FieldValue::IntegerValue(i32::from(row.year)))?;
            feature.set_field("class_code", &FieldValue::IntegerValue(i32::from(row.class_code)))?;
            feature.set_field("class_name", &FieldValue::StringValue(row.class_name.clone()))?;
            feature.set_field("pixel_count", &FieldValue::Integer64Value(row.pixel_count as i64))?;
            feature.set_field("total_pixels", &FieldValue::Integer64Value(row.total_pixels as i64))?;
            feature.set_field("fraction", &FieldValue::RealValue(row.fraction()))?;
            feature.create(&layer)?;
        }
    }
    txn.commit()?;

    debug!("Wrote {} count rows", counts.len());
    Ok(())
}

fn write_trajectory_layer(
    dataset: &mut Dataset,
    id_key: &str,
    srs_wkt: &str,
    trajectories: &TrajectoryTable,
) -> Result<()> {
    let srs = if srs_wkt.is_empty() {
        None
    } else {
        Some(SpatialRef::from_wkt(srs_wkt)?)
    };
    let year_columns: Vec<(u16, String)> = trajectories
        .years()
        .iter()
        .map(|&y| (y, year_column(y)))
        .collect();

    let mut txn = dataset.start_transaction()?;
    {
        let layer = txn.create_layer(LayerOptions {
            name: TRAJECTORIES_LAYER,
            srs: srs.as_ref(),
            ty: OGRwkbGeometryType::wkbMultiPolygon,
            options: None,
        })?;

        let mut fields = vec![(id_key, OGRFieldType::OFTString)];
        fields.extend(
            year_columns
                .iter()
                .map(|(_, name)| (name.as_str(), OGRFieldType::OFTInteger)),
        );
        fields.push(("trajectory", OGRFieldType::OFTString));
        fields.push(("transitions", OGRFieldType::OFTInteger));
        layer.create_defn_fields(&fields)?;

        for trajectory in trajectories.trajectories() {
            let mut feature = Feature::new(layer.defn())?;
            feature.set_geometry(trajectory.geometry.to_gdal()?)?;
            feature.set_field(id_key, &FieldValue::StringValue(trajectory.parcel_id.clone()))?;
            for (year, name) in &year_columns {
                // unset fields stay null
                if let Some(Some(code)) = trajectory.dominant.get(year) {
                    feature.set_field(name, &FieldValue::IntegerValue(i32::from(*code)))?;
                }
            }
            feature.set_field(
                "trajectory",
                &FieldValue::StringValue(trajectories.trajectory_string(trajectory)),
            )?;
            feature.set_field(
                "transitions",
                &FieldValue::IntegerValue(trajectory.transitions() as i32),
            )?;
            feature.create(&layer)?;
        }
    }
    txn.commit()?;

    debug!("Wrote {} trajectory rows", trajectories.len());
    Ok(())
}

fn as_i64(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::IntegerValue(i) => Some(i64::from(*i)),
        FieldValue::Integer64Value(i) => Some(*i),
        FieldValue::RealValue(r) => Some(*r as i64),
        FieldValue::StringValue(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_string(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::StringValue(s) => Some(s.clone()),
        other => as_i64(other).map(|i| i.to_string()),
    }
}

fn open_layer_dataset(path: &Path) -> Result<Dataset> {
    if !path.exists() {
        return Err(CdlError::MissingPath(path.to_path_buf()));
    }
    Ok(Dataset::open(path)?)
}

fn missing_field(layer: &str, field: &str) -> CdlError {
    CdlError::FieldNotFound {
        layer: layer.to_string(),
        field: field.to_string(),
    }
}

/// Read a counts layer back. The id column is the layer's first field.
pub fn read_counts_layer(path: &Path, spec: &RemapSpec) -> Result<CountsTable> {
    let dataset = open_layer_dataset(path)?;
    let mut layer = dataset
        .layer_by_name(COUNTS_LAYER)
        .map_err(|_| CdlError::LayerNotFound {
            path: path.to_path_buf(),
            layer: COUNTS_LAYER.to_string(),
        })?;
    let id_key = layer
        .defn()
        .fields()
        .next()
        .map(|f| f.name())
        .ok_or_else(|| missing_field(COUNTS_LAYER, "<id>"))?;

    let mut table = CountsTable::new();
    for feature in layer.features() {
        let fields: BTreeMap<String, FieldValue> = feature
            .fields()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();
        let int = |name: &str| {
            fields
                .get(name)
                .and_then(as_i64)
                .ok_or_else(|| missing_field(COUNTS_LAYER, name))
        };

        let class_code = int("class_code")? as u8;
        table.insert(ParcelYearCount {
            parcel_id: fields
                .get(&id_key)
                .and_then(as_string)
                .ok_or_else(|| missing_field(COUNTS_LAYER, &id_key))?,
            year: int("year")? as u16,
            class_code,
            class_name: fields
                .get("class_name")
                .and_then(as_string)
                .or_else(|| spec.name_of(class_code).map(str::to_string))
                .unwrap_or_default(),
            pixel_count: int("pixel_count")? as u64,
            total_pixels: int("total_pixels")? as u64,
        });
    }

    Ok(table)
}

/// Read a trajectory layer back; `trajectory` and `transitions` are
/// recomputed from the year columns.
pub fn read_trajectory_layer(path: &Path, spec: &RemapSpec) -> Result<TrajectoryTable> {
    let dataset = open_layer_dataset(path)?;
    let mut layer = dataset
        .layer_by_name(TRAJECTORIES_LAYER)
        .map_err(|_| CdlError::LayerNotFound {
            path: path.to_path_buf(),
            layer: TRAJECTORIES_LAYER.to_string(),
        })?;

    let field_names: Vec<String> = layer.defn().fields().map(|f| f.name()).collect();
    let id_key = field_names
        .first()
        .cloned()
        .ok_or_else(|| missing_field(TRAJECTORIES_LAYER, "<id>"))?;
    let years: Vec<(String, u16)> = field_names
        .iter()
        .filter_map(|name| parse_year_column(name).map(|y| (name.clone(), y)))
        .collect();

    let mut table = TrajectoryTable::new(spec);
    table.years.extend(years.iter().map(|(_, y)| *y));
    if let Some(srs) = layer.spatial_ref() {
        table.srs_wkt = srs.to_wkt()?;
    }

    for feature in layer.features() {
        let fields: BTreeMap<String, FieldValue> = feature
            .fields()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();
        let parcel_id = fields
            .get(&id_key)
            .and_then(as_string)
            .ok_or_else(|| missing_field(TRAJECTORIES_LAYER, &id_key))?;

        let geometry = match feature.geometry() {
            Some(geometry) => to_multipolygon(geometry.to_geo()?, &parcel_id)?,
            None => MultiPolygon(vec![]),
        };
        let dominant = years
            .iter()
            .map(|(name, year)| (*year, fields.get(name).and_then(as_i64).map(|c| c as u8)))
            .collect();

        table.insert(ParcelTrajectory {
            parcel_id,
            geometry,
            dominant,
        });
    }

    Ok(table)
}
