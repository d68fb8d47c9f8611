//! Spatial "within" filtering of parcels against a boundary layer.

use crate::crs::reproject_polygons;
use crate::error::Result;
use crate::parcels::{read_polygon_set, ParcelLayer, PolygonSet};
use geo::{BooleanOps, BoundingRect, Intersects, Relate};
use geo_types::MultiPolygon;
use log::info;
use std::path::Path;

/// Union of every boundary polygon.
pub fn union_all(polygons: &[MultiPolygon<f64>]) -> MultiPolygon<f64> {
    polygons
        .iter()
        .fold(MultiPolygon(vec![]), |acc, polygon| acc.union(polygon))
}

/// Keep the parcels lying within the boundary union, or with `invert` the
/// parcels that do not. Input order is preserved.
pub fn filter_within(parcels: &ParcelLayer, boundary: &PolygonSet, invert: bool) -> Result<ParcelLayer> {
    let polygons = reproject_polygons(&boundary.polygons, &boundary.srs_wkt, &parcels.srs_wkt)?;
    let union = union_all(&polygons);
    let envelope = union.bounding_rect();

    let kept: Vec<_> = parcels
        .parcels
        .iter()
        .filter(|parcel| {
            let within = match (envelope, parcel.geometry.bounding_rect()) {
                (Some(outer), Some(inner)) if outer.intersects(&inner) => {
                    parcel.geometry.relate(&union).is_within()
                }
                _ => false,
            };
            within != invert
        })
        .cloned()
        .collect();

    info!(
        "Spatial filter kept {} of {} parcels{}",
        kept.len(),
        parcels.len(),
        if invert { " (inverted)" } else { "" }
    );

    Ok(ParcelLayer {
        name: parcels.name.clone(),
        id_key: parcels.id_key.clone(),
        srs_wkt: parcels.srs_wkt.clone(),
        parcels: kept,
    })
}

pub fn filter_within_file(parcels: &ParcelLayer, boundary: &Path, invert: bool) -> Result<ParcelLayer> {
    let boundary = read_polygon_set(boundary)?;
    filter_within(parcels, &boundary, invert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::polygon;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
        ]])
    }

    fn layer() -> ParcelLayer {
        ParcelLayer::from_rows(
            "parcels",
            "id",
            "",
            vec![
                (Some("inside".to_string()), square(1.0, 1.0, 2.0, 2.0)),
                (Some("straddle".to_string()), square(9.0, 9.0, 12.0, 12.0)),
                (Some("outside".to_string()), square(50.0, 50.0, 51.0, 51.0)),
                (Some("bridged".to_string()), square(8.0, 1.0, 12.0, 2.0)),
            ],
        )
    }

    fn boundary() -> PolygonSet {
        PolygonSet {
            polygons: vec![square(0.0, 0.0, 10.0, 10.0), square(10.0, 0.0, 20.0, 5.0)],
            srs_wkt: String::new(),
        }
    }

    fn ids(layer: &ParcelLayer) -> Vec<&str> {
        layer.parcels.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_within_union() {
        let kept = filter_within(&layer(), &boundary(), false).unwrap();
        assert_eq!(ids(&kept), vec!["inside", "bridged"]);
        assert_eq!(kept.id_key, "id");
    }

    #[test]
    fn test_inverted() {
        let kept = filter_within(&layer(), &boundary(), true).unwrap();
        assert_eq!(ids(&kept), vec!["straddle", "outside"]);
    }
}
