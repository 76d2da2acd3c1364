//! # CLI Module
//!
//! This module provides the command-line interface for nc2regions, including:
//! - Argument parsing with clap
//! - Configuration file loading (JSON/YAML)
//! - Environment variable support with the NC2REGIONS_ prefix
//! - Multi-source configuration merging with priority system
//! - Subcommands for running, collating, inspecting and validating jobs

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};

use crate::aggregate::ColumnOverride;
use crate::bbox::BoundingBox;
use crate::error::{PipelineError, PipelineResult};
use crate::input::{JobConfig, ResumePolicy};

/// Regional time series extraction from gridded NetCDF climate data
#[derive(Parser, Debug)]
#[command(name = "nc2regions")]
#[command(about = "Extract per-region daily time series from gridded NetCDF data")]
#[command(version)]
#[command(long_about = "
nc2regions reduces gridded NetCDF climate data to one time series per administrative
region. Each region of a shapefile is matched to the grid cells inside its bounding
box, the cells are averaged per time step, and the result is written to one CSV file
per region. All region files are finally collated into a single table.

FEATURES:
  • One subdirectory of NetCDF files per variable, concatenated along time
  • Resumable batches: regions with an existing CSV are skipped
  • Per-region failures are logged and reported without stopping the batch
  • Configuration files: JSON and YAML format support with templates
  • Combined output as CSV or Parquet

EXAMPLES:
  # Basic run
  nc2regions run data/grid data/counties.shp out/counties

  # Regenerate everything and write Parquet
  nc2regions run data/grid data/counties.shp out/counties \\
    --regenerate --combined out/counties.parquet

  # Using config file
  nc2regions --config job.yaml run

  # Inspect inputs
  nc2regions info --grid data/grid --shapefile data/counties.shp

  # Generate a template
  nc2regions template --format yaml > job.yaml
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format for structured data
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,

    /// Configuration file path (JSON or YAML)
    #[arg(short, long, global = true, env = "NC2REGIONS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract, aggregate and write every region, then collate
    #[command(long_about = "
Run the extraction for every region of the shapefile that has no output yet.

Paths may come from positional arguments, NC2REGIONS_* environment variables or a
configuration file, in that order of priority.

EXAMPLES:
  # Process missing regions only
  nc2regions run data/grid data/counties.shp out/counties

  # Restrict the grid to a country box first
  nc2regions run data/grid data/counties.shp out/counties --bbox '24:50:-125:-66'

  # Re-run two specific regions
  nc2regions --config job.json run --region 12 --region 40

  # Rename a variable's column
  nc2regions run ... --override 'm01s03i236:air_temperature:K'

  # Show what would be processed
  nc2regions --config job.json run --dry-run
")]
    Run {
        /// Directory with one NetCDF subdirectory per variable
        #[arg(value_name = "GRID_DIR", env = "NC2REGIONS_GRID_DIR")]
        grid_dir: Option<PathBuf>,

        /// Region shapefile (.shp)
        #[arg(value_name = "SHAPEFILE", env = "NC2REGIONS_SHAPEFILE")]
        shapefile: Option<PathBuf>,

        /// Directory for the per-region CSV files
        #[arg(value_name = "OUTPUT_DIR", env = "NC2REGIONS_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,

        /// Combined output path (.csv or .parquet)
        #[arg(long, env = "NC2REGIONS_COMBINED")]
        combined: Option<PathBuf>,

        /// Country box applied before the region loop: min_lat:max_lat:min_lon:max_lon
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true, env = "NC2REGIONS_BBOX")]
        bbox: Option<BoundingBox>,

        /// Process regions even if their CSV already exists
        #[arg(long, env = "NC2REGIONS_REGENERATE")]
        regenerate: bool,

        /// Only process these region identifiers (can be used multiple times)
        #[arg(short = 'r', long = "region")]
        regions: Vec<i64>,

        /// Column override: variable:name:unit (can be used multiple times)
        #[arg(long = "override", value_parser = parse_column_override)]
        overrides: Vec<ColumnOverride>,

        /// Attribute field holding the area code
        #[arg(long, env = "NC2REGIONS_AREA_CODE_FIELD")]
        area_code_field: Option<String>,

        /// Attribute field holding the integer region identifier
        #[arg(long, env = "NC2REGIONS_ID_FIELD")]
        id_field: Option<String>,

        /// Data file extension inside the grid subdirectories
        #[arg(long, env = "NC2REGIONS_EXTENSION")]
        extension: Option<String>,

        /// Skip collating the region files into the combined output
        #[arg(long)]
        no_collate: bool,

        /// Dry run - load inputs and show the plan without processing
        #[arg(long, env = "NC2REGIONS_DRY_RUN")]
        dry_run: bool,
    },

    /// Concatenate the per-region CSV files into one table
    #[command(long_about = "
Concatenate every CSV file of the region directory, in file-name order, into the
combined output. Every file must have the same header.

EXAMPLES:
  nc2regions collate out/counties out/counties.csv
  nc2regions --config job.yaml collate
")]
    Collate {
        /// Directory with the per-region CSV files
        #[arg(value_name = "OUTPUT_DIR")]
        output_dir: Option<PathBuf>,

        /// Combined output path (.csv or .parquet)
        #[arg(value_name = "COMBINED")]
        combined: Option<PathBuf>,
    },

    /// Show information about the grid directory and shapefile
    #[command(long_about = "
Inspect the inputs of a job without running it: variables, their output column
names, time spans and grid sizes, and the region catalog.

EXAMPLES:
  nc2regions info --grid data/grid
  nc2regions info --shapefile data/counties.shp --format json
  nc2regions --config job.yaml info
")]
    Info {
        /// Grid directory to describe
        #[arg(long)]
        grid: Option<PathBuf>,

        /// Shapefile to describe
        #[arg(long)]
        shapefile: Option<PathBuf>,

        /// Output format for the information
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Validate a configuration file
    #[command(long_about = "
Validate a configuration file without processing.

Checks the file syntax, option consistency and that the input paths exist.

EXAMPLES:
  nc2regions validate job.json
  nc2regions validate job.yaml --detailed
")]
    Validate {
        /// Configuration file to validate
        config_file: Option<PathBuf>,

        /// Also load the inputs and check their coordinate systems
        #[arg(long)]
        detailed: bool,
    },

    /// Generate a configuration template
    Template {
        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Json)]
        format: ConfigFormat,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts for bash, zsh, fish and PowerShell.

EXAMPLES:
  nc2regions completions bash > ~/.bash_completion.d/nc2regions
  nc2regions completions zsh -o _nc2regions
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON structured output
    Json,
    /// YAML structured output
    Yaml,
    /// CSV output (where applicable)
    Csv,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON configuration format
    Json,
    /// YAML configuration format
    Yaml,
}

/// Parse a bounding box from a command line argument
/// Format: min_lat:max_lat:min_lon:max_lon
pub fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 4 {
        return Err("Bounding box must be in format 'min_lat:max_lat:min_lon:max_lon'".to_string());
    }

    let values = parts
        .iter()
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|_| "Invalid numeric value in bounding box")?;

    BoundingBox::new(values[0], values[1], values[2], values[3]).map_err(|e| e.to_string())
}

/// Parse a column override from a command line argument
/// Format: variable:name:unit
pub fn parse_column_override(s: &str) -> Result<ColumnOverride, String> {
    let parts: Vec<&str> = s.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err("Column override must be in format 'variable:name:unit'".to_string());
    }
    if parts[0].trim().is_empty() || parts[1].trim().is_empty() {
        return Err("Column override needs a variable and a name".to_string());
    }

    Ok(ColumnOverride {
        variable: parts[0].trim().to_string(),
        name: parts[1].trim().to_string(),
        unit: parts[2].trim().to_string(),
    })
}

/// Values of the `run` command that override the configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub grid_dir: Option<PathBuf>,
    pub shapefile: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub combined: Option<PathBuf>,
    pub bbox: Option<BoundingBox>,
    pub regenerate: bool,
    pub overrides: Vec<ColumnOverride>,
    pub area_code_field: Option<String>,
    pub id_field: Option<String>,
    pub extension: Option<String>,
}

/// Merges a configuration file with command line and environment values.
///
/// Priority: command line / environment (resolved by clap), then the file,
/// then defaults. Without a file all three paths must be given.
pub fn resolve_config(config_file: Option<&Path>, o: &RunOverrides) -> PipelineResult<JobConfig> {
    let mut config = match config_file {
        Some(path) => JobConfig::from_file(path)?,
        None => {
            let missing = |what: &str, env: &str| {
                PipelineError::Config(format!(
                    "No {} given: pass it as an argument, set {} or use --config",
                    what, env
                ))
            };
            JobConfig::new(
                o.grid_dir.clone().ok_or_else(|| missing("grid directory", "NC2REGIONS_GRID_DIR"))?,
                o.shapefile.clone().ok_or_else(|| missing("shapefile", "NC2REGIONS_SHAPEFILE"))?,
                o.output_dir.clone().ok_or_else(|| missing("output directory", "NC2REGIONS_OUTPUT_DIR"))?,
            )
        }
    };

    if let Some(dir) = &o.grid_dir {
        config.grid_dir = dir.clone();
    }
    if let Some(shp) = &o.shapefile {
        config.shapefile = shp.clone();
    }
    if let Some(dir) = &o.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(combined) = &o.combined {
        config.combined_output = Some(combined.clone());
    }
    if let Some(bbox) = o.bbox {
        config.country_bbox = Some(bbox);
    }
    if o.regenerate {
        config.resume = ResumePolicy::Regenerate;
    }
    if let Some(field) = &o.area_code_field {
        config.fields.area_code = field.clone();
    }
    if let Some(field) = &o.id_field {
        config.fields.id = Some(field.clone());
    }
    if let Some(ext) = &o.extension {
        config.file_extension = ext.clone();
    }
    for arg in &o.overrides {
        match config.column_overrides.iter_mut().find(|c| c.variable == arg.variable) {
            Some(existing) => *existing = arg.clone(),
            None => config.column_overrides.push(arg.clone()),
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Global mutex to ensure environment variable tests run sequentially
    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_bbox() {
        let bbox = parse_bbox("24:50:-125:-66").unwrap();
        assert_eq!(bbox.lat_range(), (24.0, 50.0));
        assert_eq!(bbox.lon_range(), (-125.0, -66.0));

        assert!(parse_bbox("24:50:-125").is_err());
        assert!(parse_bbox("24:50:x:-66").is_err());
        assert!(parse_bbox("50:24:-125:-66").is_err()); // inverted latitudes
    }

    #[test]
    fn test_parse_column_override() {
        let o = parse_column_override("m01s01i202:short_wave_radiation:W/m2").unwrap();
        assert_eq!(o.variable, "m01s01i202");
        assert_eq!(o.name, "short_wave_radiation");
        assert_eq!(o.unit, "W/m2");

        // units may contain colons
        assert_eq!(parse_column_override("a:b:m:s").unwrap().unit, "m:s");

        assert!(parse_column_override("a:b").is_err());
        assert!(parse_column_override(":b:K").is_err());
    }

    #[test]
    fn test_resolve_without_file_requires_paths() {
        let err = resolve_config(None, &RunOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("NC2REGIONS_GRID_DIR"));

        let o = RunOverrides {
            grid_dir: Some(PathBuf::from("grid")),
            shapefile: Some(PathBuf::from("regions.shp")),
            output_dir: Some(PathBuf::from("out")),
            regenerate: true,
            ..Default::default()
        };
        let config = resolve_config(None, &o).unwrap();
        assert_eq!(config.grid_dir, PathBuf::from("grid"));
        assert_eq!(config.resume, ResumePolicy::Regenerate);
    }

    #[test]
    fn test_resolve_priority_over_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        std::fs::write(
            &path,
            "grid_dir: file_grid\nshapefile: file.shp\noutput_dir: file_out\nresume: skip_existing\n",
        )
        .unwrap();

        let o = RunOverrides {
            output_dir: Some(PathBuf::from("cli_out")),
            overrides: vec![
                parse_column_override("m01s01i202:sw:W m-2").unwrap(),
                parse_column_override("tas:air_temperature:K").unwrap(),
            ],
            area_code_field: Some("LAD21CD".to_string()),
            ..Default::default()
        };
        let config = resolve_config(Some(&path), &o).unwrap();
        assert_eq!(config.grid_dir, PathBuf::from("file_grid"));
        assert_eq!(config.output_dir, PathBuf::from("cli_out"));
        assert_eq!(config.resume, ResumePolicy::SkipExisting);
        assert_eq!(config.fields.area_code, "LAD21CD");
        assert_eq!(config.column_overrides.len(), 2);
        assert_eq!(config.column_overrides[0].name, "sw");
    }

    #[test]
    fn test_environment_variables_fill_run_arguments() {
        // Prevent concurrent env var access
        let _guard = ENV_TEST_MUTEX.lock().unwrap();

        let originals: Vec<(&str, Option<String>)> = ["NC2REGIONS_GRID_DIR", "NC2REGIONS_BBOX"]
            .iter()
            .map(|k| (*k, env::var(k).ok()))
            .collect();

        unsafe {
            env::set_var("NC2REGIONS_GRID_DIR", "env_grid");
            env::set_var("NC2REGIONS_BBOX", "49:61:-11:2");
        }

        let cli = Cli::try_parse_from(["nc2regions", "run"]).unwrap();
        if let Commands::Run { grid_dir, bbox, .. } = cli.command {
            assert_eq!(grid_dir, Some(PathBuf::from("env_grid")));
            assert_eq!(bbox.map(|b| b.lon_range()), Some((-11.0, 2.0)));
        } else {
            panic!("Expected Run command");
        }

        let cli = Cli::try_parse_from(["nc2regions", "run", "cli_grid"]).unwrap();
        if let Commands::Run { grid_dir, .. } = cli.command {
            assert_eq!(grid_dir, Some(PathBuf::from("cli_grid")));
        }

        unsafe {
            for (key, value) in originals {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
