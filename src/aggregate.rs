//! # Regional Aggregation
//!
//! Turns the per-region grid subsets into a table with one row per time step:
//! identifying columns first, then one column per variable holding the spatial
//! mean over the region's bounding box.
//!
//! ## Column naming
//!
//! A variable column is named `{name}_{method} ({unit})`, where `method` is the
//! variable's `cell_methods` entry with any `imum` suffix dropped
//! (`maximum` -> `max`). An override table can replace the name and unit of
//! specific variables; by default it maps the STASH code `m01s01i202` to
//! `short_wave_radiation` in `W/m2`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bbox::RegionSelector;
use crate::error::{PipelineError, PipelineResult};
use crate::grid::{GridStore, GriddedVariable};
use crate::regions::{Region, RegionFields};

/// Identifying columns, in output order
pub const BASE_COLUMNS: [&str; 5] = ["region_id", "area_code", "name", "parent_name", "date"];

/// Fixed replacement of a variable's column name and unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnOverride {
    /// Semantic or NetCDF name of the variable to match
    pub variable: String,
    pub name: String,
    pub unit: String,
}

pub fn default_column_overrides() -> Vec<ColumnOverride> {
    vec![ColumnOverride {
        variable: "m01s01i202".to_string(),
        name: "short_wave_radiation".to_string(),
        unit: "W/m2".to_string(),
    }]
}

/// Shortens an aggregation method: `maximum` -> `max`, `minimum` -> `min`.
pub fn abbreviate_method(method: &str) -> &str {
    method.strip_suffix("imum").unwrap_or(method)
}

pub fn format_column_name(name: &str, method: Option<&str>, unit: &str) -> String {
    match method {
        Some(m) => format!("{}_{} ({})", name, abbreviate_method(m), unit),
        None => format!("{} ({})", name, unit),
    }
}

/// Derives output column names for gridded variables.
#[derive(Debug, Clone, Default)]
pub struct ColumnNaming {
    overrides: HashMap<String, ColumnOverride>,
}

impl ColumnNaming {
    pub fn new(overrides: &[ColumnOverride]) -> Self {
        Self {
            overrides: overrides.iter().map(|o| (o.variable.clone(), o.clone())).collect(),
        }
    }

    pub fn column_name(&self, variable: &GriddedVariable) -> String {
        let method = variable.method.as_deref();
        match self
            .overrides
            .get(&variable.name)
            .or_else(|| self.overrides.get(&variable.var_name))
        {
            Some(o) => format_column_name(&o.name, method, &o.unit),
            None => format_column_name(&variable.name, method, &variable.unit),
        }
    }

    /// Computes the column order shared by every output table: the base
    /// columns, then variable columns sorted alphabetically.
    ///
    /// # Errors
    ///
    /// Returns `Load` if two variables map to the same column name.
    pub fn column_order(&self, store: &GridStore) -> PipelineResult<ColumnOrder> {
        let mut variables: Vec<(String, String)> = store
            .variables()
            .map(|v| (self.column_name(v), v.key.clone()))
            .collect();
        variables.sort();

        let mut seen = HashSet::new();
        for (column, key) in &variables {
            if !seen.insert(column.as_str()) || BASE_COLUMNS.contains(&column.as_str()) {
                return Err(PipelineError::Load(format!(
                    "Variable '{}' produces duplicate column '{}'",
                    key, column
                )));
            }
        }

        Ok(ColumnOrder { variables })
    }
}

/// The fixed column layout of every per-region and combined table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOrder {
    /// `(column name, variable key)`, sorted by column name
    variables: Vec<(String, String)>,
}

impl ColumnOrder {
    /// All column names, base columns first.
    pub fn columns(&self) -> Vec<String> {
        BASE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.variables.iter().map(|(c, _)| c.clone()))
            .collect()
    }

    pub fn variable_columns(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|(c, _)| c.as_str())
    }

    pub fn variable_keys(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|(_, k)| k.as_str())
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }
}

/// One output row: a region's values on one date.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTimeSeriesRecord {
    pub region_id: i64,
    pub area_code: String,
    pub name: String,
    pub parent_name: String,
    pub date: NaiveDate,
    /// One value per variable column, in column order
    pub values: Vec<Option<f64>>,
}

/// All records of one region, ordered by time.
#[derive(Debug, Clone)]
pub struct RegionTable {
    pub area_code: String,
    pub columns: Vec<String>,
    pub records: Vec<RegionTimeSeriesRecord>,
}

impl RegionTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_dataframe(&self) -> PipelineResult<DataFrame> {
        let ids: Vec<i64> = self.records.iter().map(|r| r.region_id).collect();
        let codes: Vec<&str> = self.records.iter().map(|r| r.area_code.as_str()).collect();
        let names: Vec<&str> = self.records.iter().map(|r| r.name.as_str()).collect();
        let parents: Vec<&str> = self.records.iter().map(|r| r.parent_name.as_str()).collect();
        let dates: Vec<String> = self
            .records
            .iter()
            .map(|r| r.date.format("%Y-%m-%d").to_string())
            .collect();

        let mut columns: Vec<Column> = vec![
            Series::new(BASE_COLUMNS[0].into(), ids).into(),
            Series::new(BASE_COLUMNS[1].into(), codes).into(),
            Series::new(BASE_COLUMNS[2].into(), names).into(),
            Series::new(BASE_COLUMNS[3].into(), parents).into(),
            Series::new(BASE_COLUMNS[4].into(), dates).into(),
        ];

        for (i, column) in self.columns.iter().skip(BASE_COLUMNS.len()).enumerate() {
            let values: Vec<Option<f64>> = self.records.iter().map(|r| r.values[i]).collect();
            columns.push(Series::new(column.as_str().into(), values).into());
        }

        Ok(DataFrame::new(columns)?)
    }
}

/// Builds a region's table from the spatial means of every variable.
pub struct RegionAggregator<'a> {
    order: &'a ColumnOrder,
    fields: &'a RegionFields,
    selector: &'a dyn RegionSelector,
}

impl<'a> RegionAggregator<'a> {
    pub fn new(order: &'a ColumnOrder, fields: &'a RegionFields, selector: &'a dyn RegionSelector) -> Self {
        Self {
            order,
            fields,
            selector,
        }
    }

    /// Aggregates every variable of `variables` over `region`.
    ///
    /// Rows are keyed by calendar date across all variables, time of day
    /// dropped; a variable missing a date another variable has leaves an
    /// empty cell.
    ///
    /// Each variable must contribute at most one time step per date.
    ///
    /// # Errors
    ///
    /// Any error of the selector (`Geometry`, `EmptyIntersection`), a missing
    /// identifying attribute, or a failure reading the grid cells.
    pub fn aggregate(&self, region: &Region, variables: &GridStore) -> PipelineResult<RegionTable> {
        let area_code = region.attribute(&self.fields.area_code)?.to_string();
        let name = region.attribute(&self.fields.name)?.to_string();
        let parent_name = region.attribute(&self.fields.parent_name)?.to_string();

        let n = self.order.variable_count();
        let mut rows: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();

        for (i, key) in self.order.variable_keys().enumerate() {
            let variable = variables.get(key).ok_or_else(|| {
                PipelineError::Load(format!("Variable '{}' is not part of the grid store", key))
            })?;
            let subset = self.selector.select(region, variable)?;
            debug!(
                "Region {} variable '{}': {:?} cells",
                region.id,
                key,
                subset.shape()
            );
            let means = subset.spatial_mean()?;
            let mut seen = HashSet::with_capacity(means.len());
            for (date, value) in subset.dates().into_iter().zip(means) {
                if !seen.insert(date) {
                    return Err(PipelineError::Load(format!(
                        "Variable '{}' has more than one time step on {}",
                        key, date
                    )));
                }
                rows.entry(date).or_insert_with(|| vec![None; n])[i] = value;
            }
        }

        let records = rows
            .into_iter()
            .map(|(date, values)| RegionTimeSeriesRecord {
                region_id: region.id,
                area_code: area_code.clone(),
                name: name.clone(),
                parent_name: parent_name.clone(),
                date,
                values,
            })
            .collect();

        Ok(RegionTable {
            area_code,
            columns: self.order.columns(),
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviate_method() {
        assert_eq!(abbreviate_method("maximum"), "max");
        assert_eq!(abbreviate_method("minimum"), "min");
        assert_eq!(abbreviate_method("mean"), "mean");
        assert_eq!(abbreviate_method("sum"), "sum");
    }

    #[test]
    fn test_format_column_name() {
        assert_eq!(
            format_column_name("air_temperature", Some("maximum"), "K"),
            "air_temperature_max (K)"
        );
        assert_eq!(format_column_name("precipitation_flux", None, "kg m-2 s-1"), "precipitation_flux (kg m-2 s-1)");
    }

    #[test]
    fn test_default_override_table() {
        let overrides = default_column_overrides();
        assert_eq!(overrides.len(), 1);
        let o = &overrides[0];
        assert_eq!(
            format_column_name(&o.name, Some("maximum"), &o.unit),
            "short_wave_radiation_max (W/m2)"
        );
    }

    #[test]
    fn test_column_order_from_empty_store() {
        let naming = ColumnNaming::new(&default_column_overrides());
        let order = naming.column_order(&GridStore::default()).unwrap();
        assert_eq!(order.columns(), BASE_COLUMNS.map(String::from).to_vec());
        assert_eq!(order.variable_count(), 0);
    }

    #[test]
    fn test_region_table_to_dataframe() {
        let order = ColumnOrder {
            variables: vec![
                ("a_max (K)".to_string(), "a".to_string()),
                ("b_min (K)".to_string(), "b".to_string()),
            ],
        };
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let table = RegionTable {
            area_code: "06075".to_string(),
            columns: order.columns(),
            records: vec![RegionTimeSeriesRecord {
                region_id: 4,
                area_code: "06075".to_string(),
                name: "San Francisco".to_string(),
                parent_name: "California".to_string(),
                date,
                values: vec![Some(280.5), None],
            }],
        };
        let df = table.to_dataframe().unwrap();
        assert_eq!(df.shape(), (1, 7));
        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, order.columns());
        assert_eq!(df.column("b_min (K)").unwrap().null_count(), 1);
    }
}
