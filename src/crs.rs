use crate::error::{CdlError, Result};
use crate::parcels::to_multipolygon;
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::vector::ToGdal;
use geo_types::MultiPolygon;
use log::{debug, info, warn};

/// Parse WKT into a spatial reference using x=easting/lon, y=northing/lat
/// axis order, matching how OGR hands out geometries.
fn parse_spatial_ref(wkt: &str) -> Result<SpatialRef> {
    let mut spatial_ref = SpatialRef::from_wkt(wkt)
        .map_err(|e| CdlError::CrsError(format!("failed to parse WKT: {}", e)))?;
    spatial_ref.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    Ok(spatial_ref)
}

/// Whether two CRS definitions describe the same system. Unknown (empty)
/// definitions are treated as matching anything.
pub fn same_crs(a_wkt: &str, b_wkt: &str) -> Result<bool> {
    if a_wkt.is_empty() || b_wkt.is_empty() || a_wkt == b_wkt {
        return Ok(true);
    }
    Ok(parse_spatial_ref(a_wkt)? == parse_spatial_ref(b_wkt)?)
}

/// Reproject polygons from `src_wkt` into `dst_wkt`.
pub fn reproject_polygons(
    polygons: &[MultiPolygon<f64>],
    src_wkt: &str,
    dst_wkt: &str,
) -> Result<Vec<MultiPolygon<f64>>> {
    if src_wkt.is_empty() || dst_wkt.is_empty() {
        warn!("Missing CRS definition, assuming coordinates already match");
        return Ok(polygons.to_vec());
    }

    if same_crs(src_wkt, dst_wkt)? {
        debug!("CRS already matches, skipping reprojection");
        return Ok(polygons.to_vec());
    }

    let src = parse_spatial_ref(src_wkt)?;
    let dst = parse_spatial_ref(dst_wkt)?;
    let transform = CoordTransform::new(&src, &dst)
        .map_err(|e| CdlError::CrsError(format!("no transformation available: {}", e)))?;

    info!("Reprojecting {} polygon(s) to the target CRS", polygons.len());

    polygons
        .iter()
        .enumerate()
        .map(|(i, polygon)| {
            let geometry = polygon.to_gdal()?;
            let reprojected = geometry
                .transform(&transform)
                .map_err(|e| CdlError::CrsError(format!("polygon {}: {}", i, e)))?;
            to_multipolygon(reprojected.to_geo()?, &i.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::polygon;

    #[test]
    fn test_unknown_crs_is_passthrough() {
        let polys = vec![MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
        ]])];
        let out = reproject_polygons(&polys, "", "anything").unwrap();
        assert_eq!(out, polys);
    }

    fn wkt(epsg: u32) -> String {
        SpatialRef::from_epsg(epsg).unwrap().to_wkt().unwrap()
    }

    #[test]
    fn test_geographic_to_web_mercator() {
        // lon/lat order on input, easting/northing on output
        let lonlat = vec![MultiPolygon(vec![polygon![
            (x: 10.0, y: 0.0),
            (x: 11.0, y: 0.0),
            (x: 11.0, y: 1.0),
            (x: 10.0, y: 1.0),
        ]])];
        let out = reproject_polygons(&lonlat, &wkt(4326), &wkt(3857)).unwrap();

        let radius = 6_378_137.0_f64;
        let easting = |lon: f64| radius * lon.to_radians();
        let northing = |lat: f64| {
            radius * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln()
        };

        let coords: Vec<_> = out[0].0[0].exterior().coords().copied().collect();
        let expected = [(10.0, 0.0), (11.0, 0.0), (11.0, 1.0), (10.0, 1.0)];
        for (c, (lon, lat)) in coords.iter().zip(expected) {
            assert!((c.x - easting(lon)).abs() < 0.01, "x {} vs lon {}", c.x, lon);
            assert!((c.y - northing(lat)).abs() < 0.01, "y {} vs lat {}", c.y, lat);
        }
        assert!((coords[1].x - 1_224_514.398).abs() < 0.01);
    }

    #[test]
    fn test_reprojection_roundtrip() {
        let metres = vec![MultiPolygon(vec![polygon![
            (x: 1_000_000.0, y: 2_000_000.0),
            (x: 1_000_600.0, y: 2_000_000.0),
            (x: 1_000_600.0, y: 2_000_360.0),
        ]])];
        let degrees = reproject_polygons(&metres, &wkt(3857), &wkt(4326)).unwrap();
        let first = degrees[0].0[0].exterior().0[0];
        assert!(first.x > 8.9 && first.x < 9.0, "lon {}", first.x);
        assert!(first.y > 17.7 && first.y < 17.8, "lat {}", first.y);

        let back = reproject_polygons(&degrees, &wkt(4326), &wkt(3857)).unwrap();
        for (a, b) in back[0].0[0].exterior().coords().zip(metres[0].0[0].exterior().coords()) {
            assert!((a.x - b.x).abs() < 1e-6 && (a.y - b.y).abs() < 1e-6);
        }
        assert!(!same_crs(&wkt(3857), &wkt(4326)).unwrap());
    }

    #[test]
    fn test_identical_wkt_matches() {
        assert!(same_crs("", "PROJCS[...]").unwrap());
        assert!(same_crs("PROJCS[\"x\"]", "PROJCS[\"x\"]").unwrap());
    }
}
