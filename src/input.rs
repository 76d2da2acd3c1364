//! # Job Configuration
//!
//! Parses and validates the description of an extraction job. A job names the
//! gridded data directory, the region shapefile, the per-region output
//! directory and a handful of options; everything but the three paths has a
//! default.
//!
//! Configuration files may be JSON or YAML, chosen by file extension.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use nc2regions::input::JobConfig;
//!
//! let config = JobConfig::from_file("job.yaml")?;
//! config.validate()?;
//! println!("Writing regions to {}", config.output_dir.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::aggregate::{ColumnOverride, default_column_overrides};
use crate::bbox::BoundingBox;
use crate::error::{PipelineError, PipelineResult};
use crate::grid::GridOptions;
use crate::regions::RegionFields;

/// What to do with regions whose output file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Leave existing files alone and only process missing regions
    #[default]
    SkipExisting,
    /// Process every region again, overwriting existing files
    Regenerate,
}

/// Complete description of an extraction job.
///
/// # Examples
///
/// ```rust
/// use nc2regions::input::{JobConfig, ResumePolicy};
///
/// let yaml = r#"
/// grid_dir: data/ukcp
/// shapefile: data/counties.shp
/// output_dir: out/regions
/// "#;
/// let config = JobConfig::from_yaml(yaml).unwrap();
/// assert_eq!(config.resume, ResumePolicy::SkipExisting);
/// assert_eq!(config.combined_output_path().to_str(), Some("out/regions.csv"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Directory with one subdirectory of NetCDF files per variable
    pub grid_dir: PathBuf,
    /// Region polygons (`.shp`, with `.dbf` and optionally `.prj` alongside)
    pub shapefile: PathBuf,
    /// Directory receiving one CSV file per region
    pub output_dir: PathBuf,
    /// Collated table; defaults to `<output_dir>.csv`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_output: Option<PathBuf>,
    /// Coarse box applied to every variable before the region loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_bbox: Option<BoundingBox>,
    #[serde(default)]
    pub fields: RegionFields,
    #[serde(default)]
    pub resume: ResumePolicy,
    #[serde(default = "default_column_overrides")]
    pub column_overrides: Vec<ColumnOverride>,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// NetCDF variable name per subdirectory, for files holding several
    /// candidate variables
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

fn default_file_extension() -> String {
    "nc".to_string()
}

impl JobConfig {
    /// Creates a configuration with default options.
    pub fn new<P: Into<PathBuf>>(grid_dir: P, shapefile: P, output_dir: P) -> Self {
        JobConfig {
            grid_dir: grid_dir.into(),
            shapefile: shapefile.into(),
            output_dir: output_dir.into(),
            combined_output: None,
            country_bbox: None,
            fields: RegionFields::default(),
            resume: ResumePolicy::default(),
            column_overrides: default_column_overrides(),
            file_extension: default_file_extension(),
            variables: HashMap::new(),
        }
    }

    /// Loads a configuration file, YAML for `.yaml`/`.yml` and JSON otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("Cannot read {}: {}", path.display(), e)))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_lowercase().as_str(), "yaml" | "yml"))
            .unwrap_or(false);

        if is_yaml {
            Self::from_yaml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    pub fn from_json(json_str: &str) -> PipelineResult<Self> {
        serde_json::from_str(json_str).map_err(|e| PipelineError::Config(format!("Invalid JSON: {}", e)))
    }

    pub fn from_yaml(yaml_str: &str) -> PipelineResult<Self> {
        serde_yaml::from_str(yaml_str).map_err(|e| PipelineError::Config(format!("Invalid YAML: {}", e)))
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn to_yaml(&self) -> PipelineResult<String> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Checks the configuration for internal consistency. Paths are not
    /// touched; see [`JobConfig::check_paths`].
    pub fn validate(&self) -> PipelineResult<()> {
        for (label, path) in [
            ("grid_dir", &self.grid_dir),
            ("shapefile", &self.shapefile),
            ("output_dir", &self.output_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(PipelineError::Config(format!("'{}' must not be empty", label)));
            }
        }

        let combined = self.combined_output_path();
        if combined.starts_with(&self.output_dir) {
            return Err(PipelineError::Config(format!(
                "Combined output {} must not be inside the region directory {}",
                combined.display(),
                self.output_dir.display()
            )));
        }

        if let Some(bbox) = &self.country_bbox {
            bbox.validate()
                .map_err(|e| PipelineError::Config(format!("Invalid country_bbox: {}", e)))?;
        }

        if self.file_extension.trim_start_matches('.').is_empty() {
            return Err(PipelineError::Config("'file_extension' must not be empty".to_string()));
        }

        for o in &self.column_overrides {
            if o.variable.is_empty() || o.name.is_empty() {
                return Err(PipelineError::Config(format!(
                    "Column override {:?} needs both a variable and a name",
                    o
                )));
            }
        }

        if self.fields.area_code.is_empty() {
            return Err(PipelineError::Config("'fields.area_code' must not be empty".to_string()));
        }

        Ok(())
    }

    /// Checks that the input paths exist.
    pub fn check_paths(&self) -> PipelineResult<()> {
        if !self.grid_dir.is_dir() {
            return Err(PipelineError::Config(format!(
                "Grid directory {} does not exist",
                self.grid_dir.display()
            )));
        }
        if !self.shapefile.is_file() {
            return Err(PipelineError::Config(format!(
                "Shapefile {} does not exist",
                self.shapefile.display()
            )));
        }
        Ok(())
    }

    pub fn combined_output_path(&self) -> PathBuf {
        self.combined_output.clone().unwrap_or_else(|| {
            let mut name = self
                .output_dir
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "combined".into());
            name.push(".csv");
            self.output_dir.with_file_name(name)
        })
    }

    pub fn grid_options(&self) -> GridOptions {
        GridOptions {
            extension: self.file_extension.clone(),
            variables: self.variables.clone(),
        }
    }

    /// Example configuration with every option spelled out.
    pub fn template() -> Self {
        let mut config = JobConfig::new("data/grid", "data/regions.shp", "output/regions");
        config.combined_output = Some(PathBuf::from("output/regions.csv"));
        config.country_bbox = Some(BoundingBox {
            min_lat: 49.0,
            max_lat: 61.0,
            min_lon: -11.0,
            max_lon: 2.0,
        });
        config
    }
}
