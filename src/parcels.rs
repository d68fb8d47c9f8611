//! Parcel feature layers: reading, identifier sanitization, chunk files and
//! the per-run layer cache.

use crate::error::{CdlError, Result};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{
    FieldValue, LayerAccess, LayerOptions, OGRFieldType, OGRwkbGeometryType, ToGdal,
};
use gdal::{Dataset, DriverManager};
use geo_types::{Geometry, MultiPolygon};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Legacy attribute-name limit the id column is truncated to on write.
pub const ID_KEY_MAX_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParcelLayer {
    pub name: String,
    /// Identifier column, already truncated to `ID_KEY_MAX_LEN`.
    pub id_key: String,
    /// CRS as WKT; empty when unknown.
    pub srs_wkt: String,
    pub parcels: Vec<Parcel>,
}

impl ParcelLayer {
    /// Build a layer from raw rows, making every identifier unique.
    pub fn from_rows(
        name: &str,
        id_key: &str,
        srs_wkt: &str,
        rows: Vec<(Option<String>, MultiPolygon<f64>)>,
    ) -> Self {
        let (ids, geometries): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
        let parcels = sanitize_ids(ids)
            .into_iter()
            .zip(geometries)
            .map(|(id, geometry)| Parcel { id, geometry })
            .collect();

        Self {
            name: name.to_string(),
            id_key: truncate_id_key(id_key),
            srs_wkt: srs_wkt.to_string(),
            parcels,
        }
    }

    pub fn len(&self) -> usize {
        self.parcels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty()
    }

    /// A new layer holding `parcels[range]`, sharing name metadata.
    pub fn slice(&self, name: &str, range: std::ops::Range<usize>) -> Self {
        Self {
            name: name.to_string(),
            id_key: self.id_key.clone(),
            srs_wkt: self.srs_wkt.clone(),
            parcels: self.parcels[range].to_vec(),
        }
    }
}

pub fn truncate_id_key(id_key: &str) -> String {
    id_key.chars().take(ID_KEY_MAX_LEN).collect()
}

/// Make identifiers unique and non-null.
///
/// Nulls become `NULL[[index]]<i>`; every occurrence of a duplicated value
/// becomes `<id>[[index]]<i>`, repeated until no collision remains. `i` is
/// the row's position, so the result only depends on input order.
pub fn sanitize_ids(ids: Vec<Option<String>>) -> Vec<String> {
    let mut ids: Vec<String> = ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| match id {
            Some(id) => id,
            None => format!("NULL[[index]]{}", i),
        })
        .collect();

    loop {
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for id in &ids {
            *occurrences.entry(id.as_str()).or_insert(0) += 1;
        }
        let duplicated: Vec<usize> = ids
            .iter()
            .enumerate()
            .filter(|(_, id)| occurrences[id.as_str()] > 1)
            .map(|(i, _)| i)
            .collect();

        if duplicated.is_empty() {
            return ids;
        }

        debug!("Rewriting {} duplicated identifier(s)", duplicated.len());
        for i in duplicated {
            ids[i] = format!("{}[[index]]{}", ids[i], i);
        }
    }
}

/// Narrow a geometry to polygons; anything else is unusable for masking.
pub fn to_multipolygon(geometry: Geometry<f64>, feature: &str) -> Result<MultiPolygon<f64>> {
    let invalid = |kind: &str| CdlError::InvalidGeometry {
        feature: feature.to_string(),
        reason: format!("{} geometries are not supported", kind),
    };

    match geometry {
        Geometry::Polygon(polygon) => Ok(MultiPolygon(vec![polygon])),
        Geometry::MultiPolygon(multi) => Ok(multi),
        Geometry::Rect(rect) => Ok(MultiPolygon(vec![rect.to_polygon()])),
        Geometry::Triangle(triangle) => Ok(MultiPolygon(vec![triangle.to_polygon()])),
        Geometry::GeometryCollection(collection) => {
            let mut polygons = Vec::new();
            for member in collection {
                polygons.extend(to_multipolygon(member, feature)?.0);
            }
            Ok(MultiPolygon(polygons))
        }
        Geometry::Point(_) | Geometry::MultiPoint(_) => Err(invalid("point")),
        _ => Err(invalid("line")),
    }
}

fn field_to_string(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::StringValue(s) => Some(s),
        FieldValue::IntegerValue(i) => Some(i.to_string()),
        FieldValue::Integer64Value(i) => Some(i.to_string()),
        FieldValue::RealValue(r) => Some(r.to_string()),
        _ => None,
    }
}

fn resolve_id_field(field_names: &[String], id_key: &str, layer: &str) -> Result<String> {
    let truncated = truncate_id_key(id_key);
    [id_key.to_string(), truncated]
        .into_iter()
        .find(|candidate| field_names.contains(candidate))
        .ok_or_else(|| CdlError::FieldNotFound {
            layer: layer.to_string(),
            field: id_key.to_string(),
        })
}

/// Read a polygon layer (the first one when `layer_name` is `None`).
pub fn read_parcel_layer(path: &Path, layer_name: Option<&str>, id_key: &str) -> Result<ParcelLayer> {
    info!("Opening feature layer: {}", path.display());
    if !path.exists() {
        return Err(CdlError::MissingPath(path.to_path_buf()));
    }

    let dataset = Dataset::open(path)?;
    let mut layer = match layer_name {
        Some(name) => dataset
            .layer_by_name(name)
            .map_err(|_| CdlError::LayerNotFound {
                path: path.to_path_buf(),
                layer: name.to_string(),
            })?,
        None => dataset
            .layers()
            .next()
            .ok_or_else(|| CdlError::LayerNotFound {
                path: path.to_path_buf(),
                layer: "<first>".to_string(),
            })?,
    };

    let name = layer.name();
    let field_names: Vec<String> = layer.defn().fields().map(|f| f.name()).collect();
    let id_field = resolve_id_field(&field_names, id_key, &name)?;

    let srs_wkt = match layer.spatial_ref() {
        Some(srs) => srs.to_wkt()?,
        None => String::new(),
    };

    let mut rows = Vec::new();
    let mut unusable = 0usize;
    for (index, feature) in layer.features().enumerate() {
        let id = feature
            .fields()
            .find(|(field, _)| *field == id_field)
            .and_then(|(_, value)| value)
            .and_then(field_to_string);

        let label = id.clone().unwrap_or_else(|| format!("#{}", index));
        let geometry = match feature.geometry() {
            Some(geometry) => geometry
                .to_geo()
                .map_err(CdlError::from)
                .and_then(|g| to_multipolygon(g, &label)),
            None => Err(CdlError::InvalidGeometry {
                feature: label.clone(),
                reason: "missing geometry".to_string(),
            }),
        };

        let geometry = geometry.unwrap_or_else(|e| {
            warn!("Feature {} keeps an empty footprint: {}", label, e);
            unusable += 1;
            MultiPolygon(vec![])
        });
        rows.push((id, geometry));
    }

    if unusable > 0 {
        warn!("{} feature(s) in '{}' have no usable polygon", unusable, name);
    }

    let parcel_layer = ParcelLayer::from_rows(&name, &id_field, &srs_wkt, rows);
    info!(
        "Loaded {} features from layer '{}'",
        parcel_layer.len(),
        parcel_layer.name
    );
    Ok(parcel_layer)
}

/// Unlabelled polygons with their CRS: an area of interest or a filter
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonSet {
    pub polygons: Vec<MultiPolygon<f64>>,
    pub srs_wkt: String,
}

impl PolygonSet {
    /// All parts as a single multipolygon.
    pub fn merged(&self) -> MultiPolygon<f64> {
        MultiPolygon(self.polygons.iter().flat_map(|p| p.0.iter().cloned()).collect())
    }
}

/// Read every polygon of the first layer in `path`, skipping unusable
/// features.
pub fn read_polygon_set(path: &Path) -> Result<PolygonSet> {
    debug!("Reading polygons from {}", path.display());
    if !path.exists() {
        return Err(CdlError::MissingPath(path.to_path_buf()));
    }

    let dataset = Dataset::open(path)?;
    let mut layer = dataset
        .layers()
        .next()
        .ok_or_else(|| CdlError::LayerNotFound {
            path: path.to_path_buf(),
            layer: "<first>".to_string(),
        })?;

    let srs_wkt = match layer.spatial_ref() {
        Some(srs) => srs.to_wkt()?,
        None => String::new(),
    };

    let mut polygons = Vec::new();
    for (index, feature) in layer.features().enumerate() {
        let Some(geometry) = feature.geometry() else {
            continue;
        };
        match geometry
            .to_geo()
            .map_err(CdlError::from)
            .and_then(|g| to_multipolygon(g, &format!("#{}", index)))
        {
            Ok(polygon) => polygons.push(polygon),
            Err(e) => warn!("Skipping polygon in {}: {}", path.display(), e),
        }
    }

    if polygons.is_empty() {
        return Err(CdlError::InvalidGeometry {
            feature: path.display().to_string(),
            reason: "layer holds no polygons".to_string(),
        });
    }

    Ok(PolygonSet { polygons, srs_wkt })
}

/// Write a parcel layer as the only layer of a new GeoPackage at `path`.
pub fn write_parcel_layer(path: &Path, layer: &ParcelLayer) -> Result<()> {
    debug!("Writing {} parcels to {}", layer.len(), path.display());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        fs::remove_file(path)?;
    }

    let driver = DriverManager::get_driver_by_name("GPKG")?;
    let mut dataset = driver.create_vector_only(path)?;
    let srs = if layer.srs_wkt.is_empty() {
        None
    } else {
        Some(SpatialRef::from_wkt(&layer.srs_wkt)?)
    };

    let mut txn = dataset.start_transaction()?;
    {
        let mut out = txn.create_layer(LayerOptions {
            name: &layer.name,
            srs: srs.as_ref(),
            ty: OGRwkbGeometryType::wkbMultiPolygon,
            options: None,
        })?;
        out.create_defn_fields(&[(layer.id_key.as_str(), OGRFieldType::OFTString)])?;

        for parcel in &layer.parcels {
            out.create_feature_fields(
                parcel.geometry.to_gdal()?,
                &[layer.id_key.as_str()],
                &[FieldValue::StringValue(parcel.id.clone())],
            )?;
        }
    }
    txn.commit()?;

    Ok(())
}

/// Parsed feature layers keyed by (path, id key), shared read-only for the
/// whole run. Entries are never evicted.
#[derive(Default)]
pub struct LayerCache {
    layers: RwLock<HashMap<(PathBuf, String), Arc<ParcelLayer>>>,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&self, path: &Path, id_key: &str) -> Result<Arc<ParcelLayer>> {
        let key = (path.to_path_buf(), id_key.to_string());
        if let Some(layer) = self.layers.read().get(&key) {
            return Ok(Arc::clone(layer));
        }

        // parse outside the lock; a concurrent loader of the same key yields
        // identical content, so whichever lands first is kept
        let layer = Arc::new(read_parcel_layer(path, None, id_key)?);
        let mut layers = self.layers.write();
        Ok(Arc::clone(layers.entry(key).or_insert(layer)))
    }

    pub fn insert(&self, path: &Path, id_key: &str, layer: ParcelLayer) -> Arc<ParcelLayer> {
        let layer = Arc::new(layer);
        self.layers
            .write()
            .insert((path.to_path_buf(), id_key.to_string()), Arc::clone(&layer));
        layer
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{line_string, point, polygon, GeometryCollection};
    use std::collections::HashSet;

    fn ids(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn test_unique_ids_untouched() {
        let out = sanitize_ids(ids(&[Some("a"), Some("b"), Some("c")]));
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_null_and_duplicate_ids() {
        let out = sanitize_ids(ids(&[Some("a"), None, Some("a"), Some("b"), None]));
        assert_eq!(
            out,
            vec![
                "a[[index]]0",
                "NULL[[index]]1",
                "a[[index]]2",
                "b",
                "NULL[[index]]4"
            ]
        );
    }

    #[test]
    fn test_residual_collision_resolved() {
        let out = sanitize_ids(ids(&[Some("x"), Some("x"), Some("x[[index]]0")]));
        let unique: HashSet<&String> = out.iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(out[1], "x[[index]]1");
    }

    #[test]
    fn test_sanitization_is_reproducible() {
        let input = ids(&[None, Some("1"), Some("1"), None, Some("2")]);
        assert_eq!(sanitize_ids(input.clone()), sanitize_ids(input));
    }

    #[test]
    fn test_truncate_id_key() {
        assert_eq!(truncate_id_key("PARCEL_IDENTIFIER"), "PARCEL_IDE");
        assert_eq!(truncate_id_key("APN"), "APN");
    }

    #[test]
    fn test_resolve_truncated_field() {
        let fields = vec!["PARCEL_IDE".to_string(), "lat".to_string()];
        assert_eq!(
            resolve_id_field(&fields, "PARCEL_IDENTIFIER", "l").unwrap(),
            "PARCEL_IDE"
        );
        assert!(matches!(
            resolve_id_field(&fields, "OTHER", "l"),
            Err(CdlError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_to_multipolygon() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)];
        let multi = to_multipolygon(Geometry::Polygon(square.clone()), "p").unwrap();
        assert_eq!(multi.0.len(), 1);

        let collection = Geometry::GeometryCollection(GeometryCollection(vec![
            Geometry::Polygon(square.clone()),
            Geometry::Polygon(square),
        ]));
        assert_eq!(to_multipolygon(collection, "c").unwrap().0.len(), 2);

        assert!(to_multipolygon(Geometry::Point(point!(x: 1.0, y: 1.0)), "pt").is_err());
        let line = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]);
        assert!(to_multipolygon(line, "ln").is_err());
    }

    #[test]
    fn test_layer_slice_and_cache_insert() {
        let square = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0)
        ]]);
        let rows = (0..5)
            .map(|i| (Some(format!("p{}", i)), square.clone()))
            .collect();
        let layer = ParcelLayer::from_rows("parcels", "PARCEL_IDENTIFIER", "", rows);
        assert_eq!(layer.id_key, "PARCEL_IDE");

        let part = layer.slice("chunk_2", 3..5);
        assert_eq!(part.len(), 2);
        assert_eq!(part.parcels[0].id, "p3");

        let cache = LayerCache::new();
        let path = Path::new("/virtual/parcels.gpkg");
        let inserted = cache.insert(path, "PARCEL_IDE", layer);
        let fetched = cache.get_or_load(path, "PARCEL_IDE").unwrap();
        assert!(Arc::ptr_eq(&inserted, &fetched));
        assert_eq!(cache.len(), 1);
    }
}
