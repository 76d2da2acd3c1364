//! # Gridded Data Store
//!
//! Loads a directory tree of NetCDF files, one subdirectory per variable, into
//! lazily-evaluated [`GriddedVariable`]s. Loading only reads coordinates and
//! attributes; cell values stay on disk until [`GriddedVariable::values`] or
//! [`GriddedVariable::spatial_mean`] reads the current lat/lon window as a
//! hyperslab.
//!
//! ```text
//! grid_dir/
//!   tasmax/           -> variable "tasmax"
//!     2020-01.nc      \
//!     2020-02.nc       > concatenated along time, in file-name order
//!   m01s01i202/
//!     ...
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};
use ndarray::{Array3, Axis, Ix3};
use netcdf::AttributeValue;

use crate::bbox::BoundingBox;
use crate::error::{PipelineError, PipelineResult};
use crate::time::TimeAxis;

const COORD_TOLERANCE: f64 = 1e-6;

/// Options controlling which files and variables are read.
#[derive(Debug, Clone)]
pub struct GridOptions {
    /// File extension (without the dot) of data files
    pub extension: String,
    /// Explicit NetCDF variable name per subdirectory
    pub variables: HashMap<String, String>,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            extension: "nc".to_string(),
            variables: HashMap::new(),
        }
    }
}

/// Longitude range convention of a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongitudeConvention {
    /// Longitudes in [-180, 180]
    Signed,
    /// Longitudes in [0, 360]
    Positive,
}

/// One data file contributing time steps to a variable.
#[derive(Debug, Clone)]
pub struct GridSource {
    pub path: PathBuf,
    pub var_name: String,
    pub time_len: usize,
    fill_value: Option<f64>,
    missing_value: Option<f64>,
    scale_factor: Option<f64>,
    add_offset: Option<f64>,
}

impl GridSource {
    fn unpack(&self, raw: f64) -> f64 {
        if self.fill_value == Some(raw) || self.missing_value == Some(raw) || !raw.is_finite() {
            return f64::NAN;
        }
        raw * self.scale_factor.unwrap_or(1.0) + self.add_offset.unwrap_or(0.0)
    }
}

/// A named (time, latitude, longitude) variable, possibly restricted to a
/// lat/lon window.
///
/// Cloning and subsetting are cheap: coordinates and sources are shared, a
/// subset only narrows the index windows. The longitude window may consist of
/// several index ranges when a box wraps around the grid's seam; their cells
/// are joined in window order.
#[derive(Debug, Clone)]
pub struct GriddedVariable {
    /// Subdirectory name the variable was loaded from
    pub key: String,
    /// Semantic name (`standard_name`, `long_name`, or the NetCDF name)
    pub name: String,
    /// NetCDF variable name inside the source files
    pub var_name: String,
    pub unit: String,
    /// Aggregation method from `cell_methods`, e.g. `maximum`
    pub method: Option<String>,
    /// `grid_mapping_name` of a non lat/lon grid mapping, if any
    pub grid_mapping: Option<String>,
    times: Arc<[NaiveDateTime]>,
    latitudes: Arc<[f64]>,
    longitudes: Arc<[f64]>,
    lat_window: Range<usize>,
    lon_windows: Vec<Range<usize>>,
    sources: Arc<[GridSource]>,
}

impl GriddedVariable {
    pub fn times(&self) -> &[NaiveDateTime] {
        &self.times
    }

    /// Time axis as plain calendar dates, time of day dropped.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.times.iter().map(|t| t.date()).collect()
    }

    /// Latitudes of the current window.
    pub fn latitudes(&self) -> &[f64] {
        &self.latitudes[self.lat_window.clone()]
    }

    /// Longitudes of the current window.
    pub fn longitudes(&self) -> Vec<f64> {
        self.lon_windows
            .iter()
            .flat_map(|w| self.longitudes[w.clone()].iter().copied())
            .collect()
    }

    /// `(time, lat, lon)` shape of the current window.
    pub fn shape(&self) -> (usize, usize, usize) {
        let lon_len = self.lon_windows.iter().map(|w| w.len()).sum();
        (self.times.len(), self.lat_window.len(), lon_len)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_geographic(&self) -> bool {
        self.grid_mapping.is_none()
    }

    pub fn longitude_convention(&self) -> LongitudeConvention {
        if self.longitudes.iter().any(|lon| *lon > 180.0) {
            LongitudeConvention::Positive
        } else {
            LongitudeConvention::Signed
        }
    }

    /// Restricts the variable to cells whose latitude lies inside
    /// `lat_range` and whose longitude lies inside any of `lon_ranges`, all
    /// bounds inclusive. The full time axis is kept.
    ///
    /// # Errors
    ///
    /// Returns `EmptyIntersection` if no cell falls inside the ranges.
    pub fn subset_bbox(&self, lat_range: (f64, f64), lon_ranges: &[(f64, f64)]) -> PipelineResult<GriddedVariable> {
        let empty = || PipelineError::EmptyIntersection {
            variable: self.key.clone(),
            bbox: format!(
                "[lat {}..{}, lon {}]",
                lat_range.0,
                lat_range.1,
                lon_ranges
                    .iter()
                    .map(|(lo, hi)| format!("{}..{}", lo, hi))
                    .collect::<Vec<_>>()
                    .join(" + ")
            ),
        };
        let lat_window = index_window(&self.latitudes, &self.lat_window, lat_range).ok_or_else(empty)?;
        let lon_windows: Vec<Range<usize>> = lon_ranges
            .iter()
            .flat_map(|range| {
                self.lon_windows
                    .iter()
                    .filter_map(move |w| index_window(&self.longitudes, w, *range))
            })
            .collect();
        if lon_windows.is_empty() {
            return Err(empty());
        }

        debug!(
            "Subset '{}' to lat indices {:?}, lon indices {:?}",
            self.key, lat_window, lon_windows
        );

        Ok(GriddedVariable {
            lat_window,
            lon_windows,
            ..self.clone()
        })
    }

    /// Reads the cell values of the current window from disk.
    ///
    /// Fill and missing values become `NaN`; packed values are unpacked with
    /// `scale_factor`/`add_offset`.
    pub fn values(&self) -> PipelineResult<Array3<f64>> {
        let mut blocks = Vec::with_capacity(self.sources.len());
        for source in self.sources.iter() {
            let file = netcdf::open(&source.path)?;
            let var = file.variable(&source.var_name).ok_or_else(|| {
                PipelineError::Load(format!(
                    "Variable '{}' disappeared from {}",
                    source.var_name,
                    source.path.display()
                ))
            })?;
            let mut pieces = Vec::with_capacity(self.lon_windows.len());
            for lon_window in &self.lon_windows {
                let piece = var.get::<f64, _>((0..source.time_len, self.lat_window.clone(), lon_window.clone()))?;
                pieces.push(
                    piece
                        .into_dimensionality::<Ix3>()
                        .map_err(|e| PipelineError::Load(format!("{}: {}", source.path.display(), e)))?,
                );
            }
            let mut block = match pieces.len() {
                1 => pieces.remove(0),
                _ => {
                    let views: Vec<_> = pieces.iter().map(|p| p.view()).collect();
                    ndarray::concatenate(Axis(2), &views).map_err(|e| {
                        PipelineError::Load(format!("Cannot join longitude windows of '{}': {}", self.key, e))
                    })?
                }
            };
            block.mapv_inplace(|v| source.unpack(v));
            blocks.push(block);
        }

        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        ndarray::concatenate(Axis(0), &views)
            .map_err(|e| PipelineError::Load(format!("Cannot concatenate '{}' along time: {}", self.key, e)))
    }

    /// Collapses the window over latitude and longitude with the arithmetic
    /// mean, one value per time step. Missing cells are ignored; a time step
    /// with no valid cell yields `None`.
    pub fn spatial_mean(&self) -> PipelineResult<Vec<Option<f64>>> {
        let values = self.values()?;
        Ok(values
            .outer_iter()
            .map(|slab| {
                let (sum, count) = slab
                    .iter()
                    .filter(|v| v.is_finite())
                    .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if count == 0 { None } else { Some(sum / count as f64) }
            })
            .collect())
    }
}

/// Contiguous index range of the coordinates inside `range`, searched within
/// `window`. Works for ascending and descending coordinates.
fn index_window(coords: &[f64], window: &Range<usize>, range: (f64, f64)) -> Option<Range<usize>> {
    let (lo, hi) = if range.0 <= range.1 { range } else { (range.1, range.0) };
    let mut hits = coords[window.clone()]
        .iter()
        .enumerate()
        .filter(|(_, v)| **v >= lo && **v <= hi)
        .map(|(i, _)| i + window.start);
    let first = hits.next()?;
    let last = hits.last().unwrap_or(first);
    Some(first..last + 1)
}

/// Collection of gridded variables keyed by subdirectory name.
#[derive(Debug, Clone, Default)]
pub struct GridStore {
    variables: BTreeMap<String, GriddedVariable>,
}

impl GridStore {
    /// Loads every variable subdirectory of `root`.
    ///
    /// # Errors
    ///
    /// Returns `Load` if the directory has no variable subdirectories, a
    /// subdirectory has no data files, or files of one variable disagree on
    /// their latitude/longitude grid.
    pub fn load<P: AsRef<Path>>(root: P, options: &GridOptions) -> PipelineResult<Self> {
        let root = root.as_ref();
        let mut dirs = list_sorted(root, |p| p.is_dir())
            .map_err(|e| PipelineError::Load(format!("Cannot read grid directory {}: {}", root.display(), e)))?;
        dirs.retain(|d| d.file_name().is_some());

        if dirs.is_empty() {
            return Err(PipelineError::Load(format!(
                "Grid directory {} has no variable subdirectories",
                root.display()
            )));
        }

        let mut variables = BTreeMap::new();
        for dir in dirs {
            let key = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let variable = load_variable(&dir, &key, options)?;
            debug!(
                "Loaded '{}' as '{}' ({} files, shape {:?})",
                key,
                variable.name,
                variable.source_count(),
                variable.shape()
            );
            variables.insert(key, variable);
        }

        Ok(GridStore { variables })
    }

    pub fn from_variables(variables: impl IntoIterator<Item = GriddedVariable>) -> Self {
        GridStore {
            variables: variables.into_iter().map(|v| (v.key.clone(), v)).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&GriddedVariable> {
        self.variables.get(key)
    }

    pub fn variables(&self) -> impl Iterator<Item = &GriddedVariable> {
        self.variables.values()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Restricts every variable to `bbox`. Used once before the region loop.
    pub fn subset_bbox(&self, bbox: &BoundingBox) -> PipelineResult<GridStore> {
        let mut variables = BTreeMap::new();
        for (key, variable) in &self.variables {
            let lon_ranges = bbox.lon_intervals(variable.longitude_convention());
            variables.insert(key.clone(), variable.subset_bbox(bbox.lat_range(), &lon_ranges)?);
        }
        Ok(GridStore { variables })
    }
}

fn list_sorted(dir: &Path, keep: impl Fn(&Path) -> bool) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if keep(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Metadata and coordinates read from one data file.
struct FileContents {
    source: GridSource,
    name: String,
    unit: String,
    method: Option<String>,
    grid_mapping: Option<String>,
    times: Vec<NaiveDateTime>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
}

fn load_variable(dir: &Path, key: &str, options: &GridOptions) -> PipelineResult<GriddedVariable> {
    let extension = options.extension.trim_start_matches('.');
    let files = list_sorted(dir, |p| {
        p.is_file() && p.extension().map(|e| e == extension).unwrap_or(false)
    })?;

    if files.is_empty() {
        return Err(PipelineError::Load(format!(
            "Subdirectory '{}' contains no .{} files",
            key, extension
        )));
    }

    let configured = options.variables.get(key).map(String::as_str);
    let mut contents = files
        .iter()
        .map(|path| read_file(path, configured))
        .collect::<PipelineResult<Vec<_>>>()?
        .into_iter();

    // `files` is non-empty, so the first entry exists
    let Some(first) = contents.next() else {
        return Err(PipelineError::Load(format!("Subdirectory '{}' is empty", key)));
    };

    let mut times = first.times;
    let mut sources = vec![first.source];
    for other in contents {
        if !same_coords(&first.latitudes, &other.latitudes) || !same_coords(&first.longitudes, &other.longitudes) {
            return Err(PipelineError::Load(format!(
                "{} has a {}x{} grid incompatible with the {}x{} grid of '{}'",
                other.source.path.display(),
                other.latitudes.len(),
                other.longitudes.len(),
                first.latitudes.len(),
                first.longitudes.len(),
                key
            )));
        }
        if other.unit != first.unit {
            warn!(
                "{} declares unit '{}' but '{}' was loaded with '{}'",
                other.source.path.display(),
                other.unit,
                key,
                first.unit
            );
        }
        times.extend(other.times);
        sources.push(other.source);
    }

    let mut seen = HashSet::with_capacity(times.len());
    if let Some(repeated) = times.iter().map(|t| t.date()).find(|d| !seen.insert(*d)) {
        return Err(PipelineError::Load(format!(
            "Variable '{}' has more than one time step on {}; expected daily data",
            key, repeated
        )));
    }

    Ok(GriddedVariable {
        key: key.to_string(),
        name: first.name,
        var_name: sources[0].var_name.clone(),
        unit: first.unit,
        method: first.method,
        grid_mapping: first.grid_mapping,
        times: times.into(),
        lat_window: 0..first.latitudes.len(),
        lon_windows: vec![0..first.longitudes.len()],
        latitudes: first.latitudes.into(),
        longitudes: first.longitudes.into(),
        sources: sources.into(),
    })
}

fn same_coords(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= COORD_TOLERANCE)
}

fn read_file(path: &Path, configured: Option<&str>) -> PipelineResult<FileContents> {
    let load_err = |msg: String| PipelineError::Load(format!("{}: {}", path.display(), msg));

    let file = netcdf::open(path)?;
    let var = match configured {
        Some(name) => file
            .variable(name)
            .ok_or_else(|| load_err(format!("variable '{}' not found", name)))?,
        None => detect_data_variable(&file).map_err(load_err)?,
    };

    let dims: Vec<String> = var.dimensions().iter().map(|d| d.name().to_string()).collect();
    if dims.len() != 3 {
        return Err(load_err(format!(
            "variable '{}' has dimensions {:?}, expected (time, latitude, longitude)",
            var.name(),
            dims
        )));
    }

    let time_var = file
        .variable(&dims[0])
        .ok_or_else(|| load_err(format!("missing time coordinate '{}'", dims[0])))?;
    let time_units = attr_string(&time_var, "units").unwrap_or_default();
    if !time_units.contains(" since ") {
        return Err(load_err(format!(
            "first dimension '{}' is not a time coordinate (units '{}')",
            dims[0], time_units
        )));
    }
    let axis = TimeAxis::parse(&time_units, attr_string(&time_var, "calendar").as_deref())
        .map_err(|e| load_err(e.to_string()))?;
    let raw_times: Vec<f64> = time_var.get::<f64, _>(..)?.iter().cloned().collect();
    let times = axis.decode_all(&raw_times)?;

    let latitudes = read_axis(&file, &dims[1], is_latitude).map_err(load_err)?;
    let longitudes = read_axis(&file, &dims[2], is_longitude).map_err(load_err)?;

    let grid_mapping = attr_string(&var, "grid_mapping").and_then(|mapping| {
        let name = file
            .variable(&mapping)
            .and_then(|m| attr_string(&m, "grid_mapping_name"))
            .unwrap_or(mapping);
        (name != "latitude_longitude").then_some(name)
    });

    let var_name = var.name().to_string();
    let name = attr_string(&var, "standard_name")
        .or_else(|| attr_string(&var, "long_name"))
        .unwrap_or_else(|| var_name.clone());

    Ok(FileContents {
        source: GridSource {
            path: path.to_path_buf(),
            var_name,
            time_len: times.len(),
            fill_value: attr_f64(&var, "_FillValue"),
            missing_value: attr_f64(&var, "missing_value"),
            scale_factor: attr_f64(&var, "scale_factor"),
            add_offset: attr_f64(&var, "add_offset"),
        },
        name,
        unit: attr_string(&var, "units").unwrap_or_default(),
        method: attr_string(&var, "cell_methods").and_then(|m| parse_cell_method(&m)),
        grid_mapping,
        times,
        latitudes,
        longitudes,
    })
}

/// Picks the single 3-D variable that is not itself a coordinate.
fn detect_data_variable(file: &netcdf::File) -> Result<netcdf::Variable<'_>, String> {
    let dim_names: Vec<String> = file.dimensions().map(|d| d.name().to_string()).collect();
    let mut candidates: Vec<netcdf::Variable<'_>> = file
        .variables()
        .filter(|v| v.dimensions().len() == 3 && !dim_names.contains(&v.name().to_string()))
        .collect();

    match candidates.len() {
        0 => Err("no (time, latitude, longitude) data variable found".to_string()),
        1 => Ok(candidates.remove(0)),
        _ => Err(format!(
            "ambiguous data variables [{}]; configure one explicitly",
            candidates.iter().map(|v| v.name().to_string()).collect::<Vec<_>>().join(", ")
        )),
    }
}

fn read_axis(
    file: &netcdf::File,
    dim: &str,
    check: fn(&str, Option<&str>, Option<&str>) -> bool,
) -> Result<Vec<f64>, String> {
    let var = file
        .variable(dim)
        .ok_or_else(|| format!("missing coordinate variable '{}'", dim))?;
    let units = attr_string(&var, "units");
    let standard_name = attr_string(&var, "standard_name");
    if !check(dim, units.as_deref(), standard_name.as_deref()) {
        return Err(format!(
            "dimension '{}' (units {:?}) is not in the expected (time, latitude, longitude) order",
            dim, units
        ));
    }
    let values = var.get::<f64, _>(..).map_err(|e| e.to_string())?;
    Ok(values.iter().cloned().collect())
}

fn is_latitude(name: &str, units: Option<&str>, standard_name: Option<&str>) -> bool {
    standard_name == Some("latitude")
        || matches!(units, Some("degrees_north" | "degree_north" | "degree_N" | "degrees_N"))
        || matches!(name.to_lowercase().as_str(), "lat" | "latitude")
}

fn is_longitude(name: &str, units: Option<&str>, standard_name: Option<&str>) -> bool {
    standard_name == Some("longitude")
        || matches!(units, Some("degrees_east" | "degree_east" | "degree_E" | "degrees_E"))
        || matches!(name.to_lowercase().as_str(), "lon" | "longitude")
}

/// Extracts the aggregation method from a CF `cell_methods` string.
///
/// `"area: mean time: maximum (interval: 1 hour)"` yields `maximum`: the
/// method of the `time` axis wins, otherwise the last method listed.
pub fn parse_cell_method(cell_methods: &str) -> Option<String> {
    let mut time_method = None;
    let mut last_method = None;
    let mut axes_pending: Vec<&str> = Vec::new();
    let mut depth = 0usize;

    for token in cell_methods.split_whitespace() {
        if token.starts_with('(') {
            depth += 1;
        }
        if depth > 0 {
            if token.ends_with(')') {
                depth -= 1;
            }
            continue;
        }
        if let Some(axis) = token.strip_suffix(':') {
            axes_pending.push(axis);
        } else if !axes_pending.is_empty() {
            if axes_pending.contains(&"time") {
                time_method = Some(token.to_string());
            }
            last_method = Some(token.to_string());
            axes_pending.clear();
        }
    }

    time_method.or(last_method)
}

fn attr_string(var: &netcdf::Variable, name: &str) -> Option<String> {
    match var.attribute(name)?.value().ok()? {
        AttributeValue::Str(s) => Some(s),
        AttributeValue::Strs(v) => v.into_iter().next(),
        _ => None,
    }
}

fn attr_f64(var: &netcdf::Variable, name: &str) -> Option<f64> {
    match var.attribute(name)?.value().ok()? {
        AttributeValue::Double(v) => Some(v),
        AttributeValue::Float(v) => Some(v as f64),
        AttributeValue::Int(v) => Some(v as f64),
        AttributeValue::Short(v) => Some(v as f64),
        AttributeValue::Schar(v) => Some(v as f64),
        AttributeValue::Uchar(v) => Some(v as f64),
        AttributeValue::Ushort(v) => Some(v as f64),
        AttributeValue::Uint(v) => Some(v as f64),
        AttributeValue::Longlong(v) => Some(v as f64),
        AttributeValue::Ulonglong(v) => Some(v as f64),
        AttributeValue::Doubles(v) => v.first().copied(),
        AttributeValue::Floats(v) => v.first().map(|f| *f as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_window_ascending() {
        let coords = [30.0, 31.0, 32.0, 33.0, 34.0];
        assert_eq!(index_window(&coords, &(0..5), (31.0, 33.0)), Some(1..4));
        assert_eq!(index_window(&coords, &(0..5), (31.5, 31.9)), None);
        assert_eq!(index_window(&coords, &(0..5), (-10.0, 100.0)), Some(0..5));
    }

    #[test]
    fn test_index_window_descending_and_nested() {
        let coords = [50.0, 45.0, 40.0, 35.0, 30.0];
        assert_eq!(index_window(&coords, &(0..5), (34.0, 46.0)), Some(1..4));
        // search is confined to the current window
        assert_eq!(index_window(&coords, &(2..5), (34.0, 46.0)), Some(2..4));
        // reversed bounds behave like ordered ones
        assert_eq!(index_window(&coords, &(0..5), (46.0, 34.0)), Some(1..4));
    }

    #[test]
    fn test_parse_cell_method() {
        assert_eq!(parse_cell_method("time: maximum"), Some("maximum".to_string()));
        assert_eq!(
            parse_cell_method("area: mean time: minimum (interval: 1 hour)"),
            Some("minimum".to_string())
        );
        assert_eq!(
            parse_cell_method("time: mean (interval: 1 hour) area: sum"),
            Some("mean".to_string())
        );
        assert_eq!(parse_cell_method("lat: lon: mean"), Some("mean".to_string()));
        assert_eq!(parse_cell_method(""), None);
    }

    #[test]
    fn test_source_unpack() {
        let source = GridSource {
            path: PathBuf::from("x.nc"),
            var_name: "x".to_string(),
            time_len: 1,
            fill_value: Some(-999.0),
            missing_value: None,
            scale_factor: Some(0.5),
            add_offset: Some(10.0),
        };
        assert!(source.unpack(-999.0).is_nan());
        assert!(source.unpack(f64::NAN).is_nan());
        assert_eq!(source.unpack(4.0), 12.0);
    }

    #[test]
    fn test_latitude_longitude_detection() {
        assert!(is_latitude("y", Some("degrees_north"), None));
        assert!(is_latitude("lat", None, None));
        assert!(!is_latitude("lon", Some("degrees_east"), None));
        assert!(is_longitude("x", None, Some("longitude")));
        assert!(!is_longitude("grid_latitude", Some("degrees"), None));
    }
}
