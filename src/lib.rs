//! # nc2regions
//!
//! A Rust library for reducing gridded NetCDF climate data to per-region time
//! series.
//!
//! ## Features
//!
//! - **Directory-based grids**: one subdirectory of NetCDF files per variable,
//!   concatenated along time and read lazily
//! - **Shapefile regions**: polygons and attributes read with the `shapefile` crate
//! - **Bounding-box extraction**: cells inside each region's envelope are averaged
//!   per time step
//! - **Resumable output**: one CSV per region, skipped when already present
//! - **Collation**: all region files concatenated into a CSV or Parquet table
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nc2regions::{process_job, RunOptions, input::JobConfig};
//!
//! let config = JobConfig::from_file("job.yaml").expect("Failed to load config");
//! let summary = process_job(&config, &RunOptions::default()).expect("Extraction failed");
//! println!("{} regions written", summary.report.map(|r| r.written_count()).unwrap_or(0));
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! grid_dir: data/grid
//! shapefile: data/counties.shp
//! output_dir: out/counties
//! combined_output: out/counties.parquet
//! resume: skip_existing
//! column_overrides:
//!   - variable: m01s01i202
//!     name: short_wave_radiation
//!     unit: W/m2
//! ```

pub mod aggregate;
pub mod bbox;
pub mod cli;
pub mod error;
pub mod grid;
pub mod info;
pub mod input;
pub mod log;
pub mod output;
pub mod pipeline;
pub mod regions;
pub mod time;

#[cfg(test)]
mod cli_tests;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ::log::info;

use crate::input::JobConfig;
use crate::output::{collate, write_combined};
use crate::pipeline::{BatchReport, PipelineContext, RegionSelection};

/// Options of a single run that are not part of the job configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub selection: RegionSelection,
    /// Load inputs and plan, but process nothing
    pub dry_run: bool,
    /// Collate region files into the combined output after the batch
    pub collate: bool,
    pub show_progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            selection: RegionSelection::All,
            dry_run: false,
            collate: true,
            show_progress: false,
        }
    }
}

/// The combined table written after a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedOutput {
    pub path: PathBuf,
    pub rows: usize,
}

/// What a run did.
#[derive(Debug)]
pub struct JobSummary {
    /// Column layout shared by every output table
    pub columns: Vec<String>,
    /// Region identifiers selected for processing
    pub planned: Vec<i64>,
    pub skipped_existing: usize,
    /// `None` for dry runs
    pub report: Option<BatchReport>,
    pub combined: Option<CombinedOutput>,
}

/// Runs an extraction job.
///
/// This function orchestrates the entire pipeline:
/// 1. Validates the configuration and loads the grid and the region catalog
/// 2. Rejects inputs that are not in latitude/longitude coordinates
/// 3. Works out which regions still need output
/// 4. Extracts, aggregates and writes each region, recording failures
/// 5. Collates all region files into the combined output
///
/// # Arguments
///
/// * `config` - The job configuration
/// * `options` - Region selection, dry-run and collation switches
///
/// # Errors
///
/// Setup failures (configuration, loading, coordinate systems, unknown
/// selected regions) and collation failures. Failures of individual regions
/// are reported in [`JobSummary::report`] instead.
pub fn process_job(config: &JobConfig, options: &RunOptions) -> Result<JobSummary> {
    let context = PipelineContext::prepare(config).context("Failed to prepare extraction")?;
    let columns = context.order.columns();

    let plan = context.plan(&options.selection)?;
    let planned: Vec<i64> = plan.regions.iter().map(|r| r.id).collect();
    info!(
        "{} regions to process, {} already written",
        planned.len(),
        plan.skipped_existing
    );

    if options.dry_run {
        return Ok(JobSummary {
            columns,
            planned,
            skipped_existing: plan.skipped_existing,
            report: None,
            combined: None,
        });
    }

    let report = context.run_batch(&plan, options.show_progress);
    info!(
        "Batch finished: {} written, {} failed",
        report.written_count(),
        report.failed_count()
    );

    let combined = if options.collate {
        let path = config.combined_output_path();
        let rows = collate_outputs(&config.output_dir, &path, Some(&columns))?;
        Some(CombinedOutput { path, rows })
    } else {
        None
    };

    Ok(JobSummary {
        columns,
        planned,
        skipped_existing: plan.skipped_existing,
        report: Some(report),
        combined,
    })
}

/// Collates the region files of `output_dir` into `combined`.
///
/// # Returns
///
/// The number of rows written.
pub fn collate_outputs(output_dir: &Path, combined: &Path, expected: Option<&[String]>) -> Result<usize> {
    let df = collate(output_dir, expected)
        .with_context(|| format!("Failed to collate {}", output_dir.display()))?;
    write_combined(&df, combined).with_context(|| format!("Failed to write {}", combined.display()))?;
    info!("Collated {} rows into {}", df.height(), combined.display());
    Ok(df.height())
}
