//! # Region Catalog
//!
//! Reads region polygons and their attribute table from an ESRI shapefile.
//! Each record becomes a [`Region`] with an integer identifier, a
//! `geo::MultiPolygon` boundary and its attributes as text.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use geo::{Coord, LineString, MultiPolygon, Polygon};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shapefile::dbase::{Date, FieldValue};
use shapefile::{PolygonRing, Reader, Shape};

use crate::error::{PipelineError, PipelineResult};

/// Attribute table fields used to identify and describe regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFields {
    /// Integer identifier field; the record index is used when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_area_code_field")]
    pub area_code: String,
    #[serde(default = "default_name_field")]
    pub name: String,
    #[serde(default = "default_parent_name_field")]
    pub parent_name: String,
}

fn default_area_code_field() -> String {
    "GEOID".to_string()
}

fn default_name_field() -> String {
    "NAME".to_string()
}

fn default_parent_name_field() -> String {
    "STATE_NAME".to_string()
}

impl Default for RegionFields {
    fn default() -> Self {
        Self {
            id: None,
            area_code: default_area_code_field(),
            name: default_name_field(),
            parent_name: default_parent_name_field(),
        }
    }
}

/// A polygon-bounded administrative area.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: i64,
    pub boundary: MultiPolygon<f64>,
    pub attributes: BTreeMap<String, String>,
}

impl Region {
    pub fn new(id: i64, boundary: MultiPolygon<f64>, attributes: BTreeMap<String, String>) -> Self {
        Region {
            id,
            boundary,
            attributes,
        }
    }

    /// Value of an attribute field.
    ///
    /// # Errors
    ///
    /// Returns `MissingAttribute` if the field is absent or blank.
    pub fn attribute(&self, field: &str) -> PipelineResult<&str> {
        self.attributes
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PipelineError::MissingAttribute {
                region_id: self.id,
                field: field.to_string(),
            })
    }

    pub fn vertex_count(&self) -> usize {
        self.boundary
            .0
            .iter()
            .map(|p| p.exterior().0.len() + p.interiors().iter().map(|r| r.0.len()).sum::<usize>())
            .sum()
    }
}

/// Ordered, read-only collection of regions.
#[derive(Debug, Clone, Default)]
pub struct RegionCatalog {
    regions: Vec<Region>,
    crs_wkt: Option<String>,
    source: Option<PathBuf>,
}

impl RegionCatalog {
    /// Loads every record of a shapefile, in file order.
    ///
    /// The `.prj` sidecar, when present, is kept so the coordinate system can
    /// be checked against the grid before any region is processed.
    pub fn load<P: AsRef<Path>>(path: P, fields: &RegionFields) -> PipelineResult<Self> {
        let path = path.as_ref();
        let mut reader = Reader::from_path(path)?;
        let mut regions = Vec::new();

        for (index, result) in reader.iter_shapes_and_records().enumerate() {
            let (shape, record) = result?;
            let attributes: BTreeMap<String, String> = HashMap::<String, FieldValue>::from(record)
                .into_iter()
                .filter_map(|(k, v)| field_value_to_string(&v).map(|s| (k, s)))
                .collect();

            let id = match &fields.id {
                Some(field) => parse_id(&attributes, field, index)?,
                None => index as i64,
            };

            regions.push(Region::new(id, shape_to_multipolygon(shape), attributes));
        }

        let prj = path.with_extension("prj");
        let crs_wkt = if prj.exists() {
            Some(fs::read_to_string(&prj)?.trim().to_string())
        } else {
            warn!(
                "No {} sidecar found; assuming geographic WGS84 coordinates",
                prj.display()
            );
            None
        };

        debug!("Loaded {} regions from {}", regions.len(), path.display());

        Ok(RegionCatalog {
            regions,
            crs_wkt,
            source: Some(path.to_path_buf()),
        })
    }

    pub fn from_regions(regions: Vec<Region>) -> Self {
        RegionCatalog {
            regions,
            crs_wkt: None,
            source: None,
        }
    }

    /// Looks up a region by identifier with a linear scan; identifiers need
    /// not be contiguous.
    pub fn find(&self, id: i64) -> PipelineResult<&Region> {
        self.regions
            .iter()
            .find(|r| r.id == id)
            .ok_or(PipelineError::NotFound(id))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn crs_wkt(&self) -> Option<&str> {
        self.crs_wkt.as_deref()
    }

    /// Whether the polygons use a projected (non lat/lon) coordinate system.
    pub fn is_projected(&self) -> bool {
        self.crs_wkt
            .as_deref()
            .map(|wkt| {
                let head = wkt.trim_start().to_uppercase();
                head.starts_with("PROJCS") || head.starts_with("PROJCRS")
            })
            .unwrap_or(false)
    }

    /// Short CRS label for reports, e.g. `GCS_North_American_1983`.
    pub fn crs_name(&self) -> Option<String> {
        let wkt = self.crs_wkt.as_deref()?;
        let start = wkt.find('"')? + 1;
        let len = wkt[start..].find('"')?;
        Some(wkt[start..start + len].to_string())
    }
}

fn parse_id(attributes: &BTreeMap<String, String>, field: &str, index: usize) -> PipelineResult<i64> {
    let raw = attributes.get(field).ok_or_else(|| {
        PipelineError::Load(format!("Record {} has no identifier field '{}'", index, field))
    })?;
    raw.trim().parse::<i64>().map_err(|_| {
        PipelineError::Load(format!(
            "Record {} has non-integer identifier '{}' in field '{}'",
            index, raw, field
        ))
    })
}

fn field_value_to_string(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Character(s) => s.as_ref().map(|s| s.trim().to_string()),
        FieldValue::Numeric(n) => n.map(format_number),
        FieldValue::Integer(i) => Some(i.to_string()),
        FieldValue::Float(f) => f.map(|f| format_number(f as f64)),
        FieldValue::Double(d) => Some(format_number(*d)),
        FieldValue::Currency(c) => Some(c.to_string()),
        FieldValue::Logical(b) => b.map(|b| b.to_string()),
        FieldValue::Date(d) => d.as_ref().map(format_date),
        FieldValue::DateTime(dt) => {
            let time = dt.time();
            Some(format!(
                "{}T{:02}:{:02}:{:02}",
                format_date(&dt.date()),
                time.hours(),
                time.minutes(),
                time.seconds()
            ))
        }
        FieldValue::Memo(m) => Some(m.trim().to_string()),
    }
}

fn format_date(date: &Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Groups shapefile rings into polygons: every outer ring opens a polygon and
/// the inner rings that follow become its holes.
fn rings_to_multipolygon(rings: impl Iterator<Item = (bool, Vec<Coord<f64>>)>) -> MultiPolygon<f64> {
    let mut polygons: Vec<Polygon<f64>> = Vec::new();
    for (outer, coords) in rings {
        if coords.is_empty() {
            continue;
        }
        let ring = LineString::from(coords);
        match polygons.last_mut() {
            Some(polygon) if !outer => polygon.interiors_push(ring),
            _ => polygons.push(Polygon::new(ring, vec![])),
        }
    }
    MultiPolygon(polygons)
}

fn shape_to_multipolygon(shape: Shape) -> MultiPolygon<f64> {
    match shape {
        Shape::Polygon(polygon) => rings_to_multipolygon(polygon.rings().iter().map(|ring| match ring {
            PolygonRing::Outer(points) => (true, points.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
            PolygonRing::Inner(points) => (false, points.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
        })),
        Shape::PolygonZ(polygon) => rings_to_multipolygon(polygon.rings().iter().map(|ring| match ring {
            PolygonRing::Outer(points) => (true, points.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
            PolygonRing::Inner(points) => (false, points.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
        })),
        Shape::PolygonM(polygon) => rings_to_multipolygon(polygon.rings().iter().map(|ring| match ring {
            PolygonRing::Outer(points) => (true, points.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
            PolygonRing::Inner(points) => (false, points.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
        })),
        other => {
            debug!("Ignoring non-polygon shape {:?}", other.shapetype());
            MultiPolygon(vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with(id: i64, attrs: &[(&str, &str)]) -> Region {
        let attributes = attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Region::new(id, MultiPolygon(vec![]), attributes)
    }

    #[test]
    fn test_find_non_contiguous_ids() {
        let catalog = RegionCatalog::from_regions(vec![
            region_with(3, &[]),
            region_with(10, &[]),
            region_with(4, &[]),
        ]);
        assert_eq!(catalog.find(10).unwrap().id, 10);
        assert_eq!(catalog.find(4).unwrap().id, 4);
        assert!(matches!(catalog.find(5), Err(PipelineError::NotFound(5))));
    }

    #[test]
    fn test_attribute_lookup() {
        let region = region_with(1, &[("GEOID", "06075"), ("NAME", "")]);
        assert_eq!(region.attribute("GEOID").unwrap(), "06075");
        assert!(matches!(
            region.attribute("NAME"),
            Err(PipelineError::MissingAttribute { region_id: 1, .. })
        ));
        assert!(region.attribute("STATE_NAME").is_err());
    }

    #[test]
    fn test_rings_grouping() {
        let square = |o: f64, s: f64| {
            vec![
                Coord { x: o, y: o },
                Coord { x: o, y: o + s },
                Coord { x: o + s, y: o + s },
                Coord { x: o + s, y: o },
                Coord { x: o, y: o },
            ]
        };
        let mp = rings_to_multipolygon(
            vec![
                (true, square(0.0, 10.0)),
                (false, square(2.0, 1.0)),
                (false, square(5.0, 1.0)),
                (true, square(20.0, 5.0)),
            ]
            .into_iter(),
        );
        assert_eq!(mp.0.len(), 2);
        assert_eq!(mp.0[0].interiors().len(), 2);
        assert_eq!(mp.0[1].interiors().len(), 0);

        let region = Region::new(0, mp, BTreeMap::new());
        assert_eq!(region.vertex_count(), 20);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(6075.0), "6075");
        assert_eq!(format_number(1.5), "1.5");
    }

    #[test]
    fn test_projected_crs_detection() {
        let mut catalog = RegionCatalog::from_regions(vec![]);
        assert!(!catalog.is_projected());

        catalog.crs_wkt = Some(r#"GEOGCS["GCS_North_American_1983",DATUM["D_North_American_1983"]]"#.to_string());
        assert!(!catalog.is_projected());
        assert_eq!(catalog.crs_name().as_deref(), Some("GCS_North_American_1983"));

        catalog.crs_wkt = Some(r#"PROJCS["NAD83 / Conus Albers",GEOGCS["NAD83"]]"#.to_string());
        assert!(catalog.is_projected());
    }
}
