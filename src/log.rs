use std::time::Duration;

use crate::input::JobConfig;
use crate::pipeline::{BatchReport, RegionStatus};

pub fn show_greeting(config_source: &str) {
    println!("=== NetCDF Regional Time Series Extractor ===");
    println!("Configuration from: {}", config_source);
}

pub fn config_echo(config: &JobConfig) {
    println!("\nConfiguration:");
    println!("  Grid directory: {}", config.grid_dir.display());
    println!("  Shapefile: {}", config.shapefile.display());
    println!("  Region output: {}", config.output_dir.display());
    println!("  Combined output: {}", config.combined_output_path().display());
    println!("  Resume policy: {:?}", config.resume);
    if let Some(bbox) = &config.country_bbox {
        println!("  Country box: {}", bbox);
    }
    println!("  Column overrides: {}", config.column_overrides.len());
    for o in &config.column_overrides {
        println!("    {} -> {} ({})", o.variable, o.name, o.unit);
    }
}

pub fn show_plan(region_ids: &[i64], skipped_existing: usize, columns: &[String]) {
    println!("\nPlan:");
    println!("  Columns: {}", columns.join(", "));
    println!("  Regions to process: {}", region_ids.len());
    println!("  Already written: {}", skipped_existing);
    for chunk in region_ids.chunks(10) {
        let ids: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
        println!("    {}", ids.join(" "));
    }
}

pub fn show_batch_report(report: &BatchReport) {
    println!("\nBatch Results:");
    println!("  Written: {} regions, {} rows", report.written_count(), report.rows_written());
    println!("  Skipped (already written): {}", report.skipped_existing);
    println!("  Failed: {}", report.failed_count());
    for outcome in &report.outcomes {
        if let RegionStatus::Failed(e) = &outcome.status {
            println!(
                "    region {} ({}): {}",
                outcome.region_id,
                outcome.area_code.as_deref().unwrap_or("no area code"),
                e
            );
        }
    }
}

pub fn show_farewell_with_timing(elapsed: Duration) {
    println!("\n=== Extraction completed in {:.2?} ===", elapsed);
}
