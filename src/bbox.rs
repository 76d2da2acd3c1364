//! # Bounding-Box Extraction
//!
//! Selects the grid cells belonging to a region using the axis-aligned lat/lon
//! envelope of its polygon. Every cell whose centre lies inside the envelope is
//! kept, including cells outside the true polygon outline, so the selection is
//! always a superset of the cells inside the polygon.

use std::fmt;

use geo::BoundingRect;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::grid::{GriddedVariable, LongitudeConvention};
use crate::regions::Region;

/// Axis-aligned latitude/longitude rectangle, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> PipelineResult<Self> {
        let bbox = BoundingBox {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Checks ordering and coordinate ranges.
    pub fn validate(&self) -> PipelineResult<()> {
        let values = [self.min_lat, self.max_lat, self.min_lon, self.max_lon];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Geometry(format!("Non-finite bounding box {}", self)));
        }
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err(PipelineError::Geometry(format!("Inverted bounding box {}", self)));
        }
        if self.min_lat < -90.0 || self.max_lat > 90.0 || self.min_lon < -180.0 || self.max_lon > 360.0 {
            return Err(PipelineError::Geometry(format!("Bounding box {} out of range", self)));
        }
        Ok(())
    }

    /// Envelope of all polygon vertices of a region.
    ///
    /// # Errors
    ///
    /// Returns `Geometry` if the region has no vertices.
    pub fn from_region(region: &Region) -> PipelineResult<Self> {
        let rect = region.boundary.bounding_rect().ok_or_else(|| {
            PipelineError::Geometry(format!("Region {} has no polygon vertices", region.id))
        })?;
        let bbox = BoundingBox {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lon: rect.min().x,
            max_lon: rect.max().x,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn lat_range(&self) -> (f64, f64) {
        (self.min_lat, self.max_lat)
    }

    pub fn lon_range(&self) -> (f64, f64) {
        (self.min_lon, self.max_lon)
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Longitude intervals covering the box in the convention of a grid.
    ///
    /// A box crossing the grid's seam (0/360 for `Positive`, 180/-180 for
    /// `Signed`) splits into two intervals, west part first.
    pub fn lon_intervals(&self, convention: LongitudeConvention) -> Vec<(f64, f64)> {
        let (min, max) = (self.min_lon, self.max_lon);
        match convention {
            LongitudeConvention::Signed if min > 180.0 => vec![(min - 360.0, max - 360.0)],
            LongitudeConvention::Signed if max > 180.0 => vec![(min, 180.0), (-180.0, max - 360.0)],
            LongitudeConvention::Positive if max < 0.0 => vec![(min + 360.0, max + 360.0)],
            LongitudeConvention::Positive if min < 0.0 => vec![(min + 360.0, 360.0), (0.0, max)],
            _ => vec![(min, max)],
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[lat {:.4}..{:.4}, lon {:.4}..{:.4}]",
            self.min_lat, self.max_lat, self.min_lon, self.max_lon
        )
    }
}

/// Strategy selecting the part of a gridded variable that belongs to a region.
pub trait RegionSelector {
    fn select(&self, region: &Region, variable: &GriddedVariable) -> PipelineResult<GriddedVariable>;
}

/// Selects all cells inside the rectangular envelope of the region polygon.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundingBoxExtractor;

impl BoundingBoxExtractor {
    /// Subsets `variable` to the envelope of `region`, without averaging.
    ///
    /// # Errors
    ///
    /// Returns `Geometry` for regions without vertices and
    /// `EmptyIntersection` when the envelope contains no cell centre.
    pub fn extract(&self, region: &Region, variable: &GriddedVariable) -> PipelineResult<GriddedVariable> {
        let bbox = BoundingBox::from_region(region)?;
        variable
            .subset_bbox(bbox.lat_range(), &bbox.lon_intervals(variable.longitude_convention()))
            .map_err(|e| match e {
                PipelineError::EmptyIntersection { variable, .. } => PipelineError::EmptyIntersection {
                    variable,
                    bbox: format!("{} of region {}", bbox, region.id),
                },
                other => other,
            })
    }
}

impl RegionSelector for BoundingBoxExtractor {
    fn select(&self, region: &Region, variable: &GriddedVariable) -> PipelineResult<GriddedVariable> {
        self.extract(region, variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Coord, LineString, MultiPolygon, Polygon};
    use std::collections::BTreeMap;

    fn square_region(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Region {
        let ring = LineString::from(vec![
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
            Coord { x: min_lon, y: max_lat },
            Coord { x: min_lon, y: min_lat },
        ]);
        Region::new(7, MultiPolygon(vec![Polygon::new(ring, vec![])]), BTreeMap::new())
    }

    #[test]
    fn test_envelope_of_region() {
        let region = square_region(-122.5, 37.7, -122.3, 37.8);
        let bbox = BoundingBox::from_region(&region).unwrap();
        assert_eq!(bbox.lat_range(), (37.7, 37.8));
        assert_eq!(bbox.lon_range(), (-122.5, -122.3));
        assert!(bbox.contains(37.75, -122.4));
        assert!(!bbox.contains(37.9, -122.4));
    }

    #[test]
    fn test_empty_region_is_geometry_error() {
        let region = Region::new(1, MultiPolygon(vec![]), BTreeMap::new());
        let err = BoundingBox::from_region(&region).unwrap_err();
        assert!(matches!(err, PipelineError::Geometry(_)));
    }

    #[test]
    fn test_validation() {
        assert!(BoundingBox::new(20.0, 50.0, -130.0, -60.0).is_ok());
        assert!(BoundingBox::new(50.0, 20.0, -130.0, -60.0).is_err());
        assert!(BoundingBox::new(20.0, 95.0, -130.0, -60.0).is_err());
        assert!(BoundingBox::new(f64::NAN, 50.0, -130.0, -60.0).is_err());
    }

    #[test]
    fn test_convention_shift() {
        let bbox = BoundingBox::new(37.0, 38.0, -123.0, -122.0).unwrap();
        assert_eq!(bbox.lon_intervals(LongitudeConvention::Positive), vec![(237.0, 238.0)]);
        assert_eq!(bbox.lon_intervals(LongitudeConvention::Signed), vec![(-123.0, -122.0)]);

        let east = BoundingBox::new(37.0, 38.0, 237.0, 238.0).unwrap();
        assert_eq!(east.lon_intervals(LongitudeConvention::Signed), vec![(-123.0, -122.0)]);
        assert_eq!(east.lon_intervals(LongitudeConvention::Positive), vec![(237.0, 238.0)]);
    }

    #[test]
    fn test_seam_crossing_splits_intervals() {
        let bbox = BoundingBox::new(49.0, 61.0, -11.0, 2.0).unwrap();
        assert_eq!(
            bbox.lon_intervals(LongitudeConvention::Positive),
            vec![(349.0, 360.0), (0.0, 2.0)]
        );
        assert_eq!(bbox.lon_intervals(LongitudeConvention::Signed), vec![(-11.0, 2.0)]);

        let pacific = BoundingBox::new(-20.0, -10.0, 170.0, 190.0).unwrap();
        assert_eq!(
            pacific.lon_intervals(LongitudeConvention::Signed),
            vec![(170.0, 180.0), (-180.0, -170.0)]
        );
    }
}
