//! # Error Types
//!
//! One error enum is shared by every stage of the extraction pipeline. Variants
//! fall in two groups: setup errors (grid or catalog cannot be loaded, invalid
//! configuration, mismatched coordinate systems) abort a run, while
//! region-scoped errors only cause the affected region to be skipped.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading, extracting, aggregating or writing
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load grid data: {0}")]
    Load(String),

    #[error("Region {0} not found in catalog")]
    NotFound(i64),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Bounding box {bbox} contains no grid cells of variable '{variable}'")]
    EmptyIntersection { variable: String, bbox: String },

    #[error("Column mismatch in {}: expected [{}], found [{}]", path.display(), expected.join(", "), found.join(", "))]
    Format {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Region {region_id} has no value for attribute '{field}'")]
    MissingAttribute { region_id: i64, field: String },

    #[error(
        "Region {region_id} (area code '{area_code}') would overwrite the output of region {owner} at {}",
        path.display()
    )]
    OutputCollision {
        region_id: i64,
        area_code: String,
        owner: i64,
        path: PathBuf,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("Shapefile error: {0}")]
    Shapefile(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl From<shapefile::Error> for PipelineError {
    fn from(e: shapefile::Error) -> Self {
        PipelineError::Shapefile(e.to_string())
    }
}

impl PipelineError {
    /// Whether the error concerns a single region and the batch may continue.
    ///
    /// Reading a region's hyperslab or writing its file can also fail with
    /// `Io`/`Netcdf`/`Polars`; inside the batch loop those are treated the same
    /// way, so only configuration and load failures are fatal.
    pub fn is_region_scoped(&self) -> bool {
        !matches!(self, PipelineError::Load(_) | PipelineError::Config(_))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_scoped_classification() {
        assert!(PipelineError::NotFound(3).is_region_scoped());
        assert!(PipelineError::Geometry("x".into()).is_region_scoped());
        assert!(
            PipelineError::EmptyIntersection {
                variable: "tas".into(),
                bbox: "[]".into()
            }
            .is_region_scoped()
        );
        assert!(
            PipelineError::OutputCollision {
                region_id: 2,
                area_code: "GB 1".into(),
                owner: 1,
                path: PathBuf::from("GB_1.csv"),
            }
            .is_region_scoped()
        );
        assert!(!PipelineError::Load("bad".into()).is_region_scoped());
        assert!(!PipelineError::Config("bad".into()).is_region_scoped());
    }

    #[test]
    fn test_format_error_message_lists_columns() {
        let err = PipelineError::Format {
            path: PathBuf::from("out/06075.csv"),
            expected: vec!["region_id".into(), "date".into()],
            found: vec!["date".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("out/06075.csv"));
        assert!(msg.contains("expected [region_id, date]"));
        assert!(msg.contains("found [date]"));
    }
}
