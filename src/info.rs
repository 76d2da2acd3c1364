//! # Input Information Module
//!
//! Summarizes a grid directory and a region shapefile without running the
//! extraction: variables with their column names, time spans and grid sizes,
//! and the region catalog with its coordinate system and attribute fields.

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::aggregate::{ColumnNaming, ColumnOverride};
use crate::bbox::BoundingBox;
use crate::grid::{GridOptions, GridStore, GriddedVariable};
use crate::regions::{RegionCatalog, RegionFields};

/// Information about one gridded variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub key: String,
    pub name: String,
    pub var_name: String,
    pub unit: String,
    pub method: Option<String>,
    /// Output column the variable is written to
    pub column: String,
    pub files: usize,
    pub time_steps: usize,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
    pub latitudes: usize,
    pub longitudes: usize,
    pub lat_range: Option<(f64, f64)>,
    pub lon_range: Option<(f64, f64)>,
}

/// Information about the region catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogInfo {
    pub path: String,
    pub total_regions: usize,
    pub crs: Option<String>,
    pub projected: bool,
    pub attribute_fields: Vec<String>,
    pub extent: Option<BoundingBox>,
    /// First few regions as `(id, area code, name)`
    pub sample: Vec<(i64, String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_dir: Option<String>,
    pub variables: Vec<VariableInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogInfo>,
}

const SAMPLE_SIZE: usize = 5;

/// Loads and describes whichever inputs are given.
pub fn get_input_info(
    grid_dir: Option<&Path>,
    shapefile: Option<&Path>,
    options: &GridOptions,
    fields: &RegionFields,
    overrides: &[ColumnOverride],
) -> Result<InputInfo> {
    let mut info = InputInfo::default();

    if let Some(dir) = grid_dir {
        debug!("Describing grid directory {}", dir.display());
        let store = GridStore::load(dir, options)
            .with_context(|| format!("Failed to load grid directory: {}", dir.display()))?;
        info.grid_dir = Some(dir.display().to_string());
        info.variables = describe_grid(&store, &ColumnNaming::new(overrides));
    }

    if let Some(path) = shapefile {
        debug!("Describing shapefile {}", path.display());
        let catalog = RegionCatalog::load(path, fields)
            .with_context(|| format!("Failed to load shapefile: {}", path.display()))?;
        info.catalog = Some(describe_catalog(&catalog, fields));
    }

    Ok(info)
}

pub fn describe_grid(store: &GridStore, naming: &ColumnNaming) -> Vec<VariableInfo> {
    store.variables().map(|v| describe_variable(v, naming)).collect()
}

fn describe_variable(variable: &GriddedVariable, naming: &ColumnNaming) -> VariableInfo {
    let dates = variable.dates();
    let (_, lat_len, lon_len) = variable.shape();
    VariableInfo {
        key: variable.key.clone(),
        name: variable.name.clone(),
        var_name: variable.var_name.clone(),
        unit: variable.unit.clone(),
        method: variable.method.clone(),
        column: naming.column_name(variable),
        files: variable.source_count(),
        time_steps: dates.len(),
        first_date: dates.first().map(|d| d.to_string()),
        last_date: dates.last().map(|d| d.to_string()),
        latitudes: lat_len,
        longitudes: lon_len,
        lat_range: min_max(variable.latitudes()),
        lon_range: min_max(&variable.longitudes()),
    }
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    values.iter().fold(None, |acc, v| match acc {
        None => Some((*v, *v)),
        Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
    })
}

pub fn describe_catalog(catalog: &RegionCatalog, fields: &RegionFields) -> CatalogInfo {
    let attribute_fields = catalog
        .regions()
        .first()
        .map(|r| r.attributes.keys().cloned().collect())
        .unwrap_or_default();

    let extent = catalog
        .regions()
        .iter()
        .filter_map(|r| BoundingBox::from_region(r).ok())
        .reduce(|a, b| BoundingBox {
            min_lat: a.min_lat.min(b.min_lat),
            max_lat: a.max_lat.max(b.max_lat),
            min_lon: a.min_lon.min(b.min_lon),
            max_lon: a.max_lon.max(b.max_lon),
        });

    let sample = catalog
        .regions()
        .iter()
        .take(SAMPLE_SIZE)
        .map(|r| {
            (
                r.id,
                r.attribute(&fields.area_code).unwrap_or("-").to_string(),
                r.attribute(&fields.name).unwrap_or("-").to_string(),
            )
        })
        .collect();

    CatalogInfo {
        path: catalog
            .source()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        total_regions: catalog.len(),
        crs: catalog.crs_name(),
        projected: catalog.is_projected(),
        attribute_fields,
        extent,
        sample,
    }
}

/// Print input info in human-readable format
pub fn print_input_info_human(info: &InputInfo) {
    if let Some(dir) = &info.grid_dir {
        println!("Grid Directory: {}", dir);
        println!("  Variables: {} total", info.variables.len());
        for var in &info.variables {
            println!("    {} -> \"{}\"", var.key, var.column);
            println!(
                "      {} ({}) from {} file(s), {} time steps [{} .. {}]",
                var.var_name,
                var.unit,
                var.files,
                var.time_steps,
                var.first_date.as_deref().unwrap_or("-"),
                var.last_date.as_deref().unwrap_or("-")
            );
            println!("      grid: {} x {} cells", var.latitudes, var.longitudes);
            if let (Some(lat), Some(lon)) = (var.lat_range, var.lon_range) {
                println!(
                    "      lat {:.4}..{:.4}, lon {:.4}..{:.4}",
                    lat.0, lat.1, lon.0, lon.1
                );
            }
        }
    }

    if let Some(catalog) = &info.catalog {
        println!("Shapefile: {}", catalog.path);
        println!("  Regions: {}", catalog.total_regions);
        println!(
            "  CRS: {}{}",
            catalog.crs.as_deref().unwrap_or("unknown (no .prj)"),
            if catalog.projected { " (projected)" } else { "" }
        );
        if let Some(extent) = &catalog.extent {
            println!("  Extent: {}", extent);
        }
        println!("  Fields: {}", catalog.attribute_fields.join(", "));
        for (id, code, name) in &catalog.sample {
            println!("    {:>6}  {:<12} {}", id, code, name);
        }
        if catalog.total_regions > catalog.sample.len() {
            println!("    ... {} more", catalog.total_regions - catalog.sample.len());
        }
    }
}

/// Print input info in JSON format
pub fn print_input_info_json(info: &InputInfo) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(info)?);
    Ok(())
}

/// Print input info in YAML format
pub fn print_input_info_yaml(info: &InputInfo) -> Result<()> {
    let yaml = serde_yaml::to_string(info).context("Failed to serialize input info to YAML")?;
    println!("{}", yaml);
    Ok(())
}

/// Print input info in CSV format (variables only)
pub fn print_input_info_csv(info: &InputInfo) -> Result<()> {
    println!("key,column,unit,files,time_steps,first_date,last_date,latitudes,longitudes");
    for var in &info.variables {
        println!(
            "{},\"{}\",\"{}\",{},{},{},{},{},{}",
            var.key,
            var.column,
            var.unit,
            var.files,
            var.time_steps,
            var.first_date.as_deref().unwrap_or(""),
            var.last_date.as_deref().unwrap_or(""),
            var.latitudes,
            var.longitudes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Coord, LineString, MultiPolygon, Polygon};
    use std::collections::BTreeMap;

    fn square(id: i64, lon: f64, lat: f64, code: &str) -> crate::regions::Region {
        let ring = LineString::from(vec![
            Coord { x: lon, y: lat },
            Coord { x: lon + 1.0, y: lat },
            Coord { x: lon + 1.0, y: lat + 1.0 },
            Coord { x: lon, y: lat },
        ]);
        let mut attributes = BTreeMap::new();
        attributes.insert("GEOID".to_string(), code.to_string());
        attributes.insert("NAME".to_string(), format!("Region {}", id));
        crate::regions::Region::new(id, MultiPolygon(vec![Polygon::new(ring, vec![])]), attributes)
    }

    #[test]
    fn test_min_max() {
        assert_eq!(min_max(&[]), None);
        assert_eq!(min_max(&[3.0, -1.0, 2.0]), Some((-1.0, 3.0)));
    }

    #[test]
    fn test_describe_catalog() {
        let catalog = RegionCatalog::from_regions(vec![
            square(0, -122.0, 37.0, "06075"),
            square(1, -120.0, 35.0, "06001"),
        ]);
        let info = describe_catalog(&catalog, &RegionFields::default());
        assert_eq!(info.total_regions, 2);
        assert!(!info.projected);
        assert_eq!(info.attribute_fields, vec!["GEOID".to_string(), "NAME".to_string()]);
        assert_eq!(info.sample[1], (1, "06001".to_string(), "Region 1".to_string()));

        let extent = info.extent.unwrap();
        assert_eq!(extent.lat_range(), (35.0, 38.0));
        assert_eq!(extent.lon_range(), (-122.0, -119.0));
    }

    #[test]
    fn test_info_serializes() {
        let info = InputInfo::default();
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"variables":[]}"#);
    }
}
