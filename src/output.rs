//! # CSV Output and Collation
//!
//! Writes one CSV file per region, named after the region's area code, and
//! concatenates a directory of such files into a single table.
//!
//! ## Features
//!
//! - **Resumable batches**: the set of already-written area codes is read back
//!   from the directory listing
//! - **Atomic writes**: a region file only appears under its final name once
//!   fully written, so an interrupted run never leaves a file that looks done
//! - **Strict collation**: every file must carry the same header, in order
//! - **Combined output**: CSV, or Parquet when the path ends in `.parquet`

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::debug;
use polars::prelude::*;

use crate::aggregate::{BASE_COLUMNS, RegionTable};
use crate::error::{PipelineError, PipelineResult};

const CSV_EXTENSION: &str = "csv";

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_stem(area_code: &str) -> String {
    let stem: String = area_code
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        format!("_{}", stem)
    } else {
        stem
    }
}

/// Directory of per-region CSV files.
#[derive(Debug, Clone)]
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    /// Opens the output directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> PipelineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(CsvSink { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, area_code: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_file_stem(area_code), CSV_EXTENSION))
    }

    pub fn exists(&self, area_code: &str) -> bool {
        self.path_for(area_code).is_file()
    }

    /// Writes a region table, replacing any previous file for the same area
    /// code.
    ///
    /// # Returns
    ///
    /// The path of the written file.
    pub fn write(&self, table: &RegionTable) -> PipelineResult<PathBuf> {
        let path = self.path_for(&table.area_code);
        let tmp = path.with_extension("csv.partial");
        let mut df = table.to_dataframe()?;

        {
            let mut file = File::create(&tmp)?;
            CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        }
        fs::rename(&tmp, &path)?;

        debug!("Wrote {} rows to {}", df.height(), path.display());
        Ok(path)
    }

    /// Deletes the file of `area_code`, if any. Returns whether one existed.
    pub fn remove(&self, area_code: &str) -> PipelineResult<bool> {
        let path = self.path_for(area_code);
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!("Removed {}", path.display());
        Ok(true)
    }

    /// File stems of the CSV files currently in the directory.
    pub fn written_stems(&self) -> PipelineResult<HashSet<String>> {
        Ok(list_csv_files(&self.dir)?
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect())
    }
}

fn list_csv_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == CSV_EXTENSION).unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_csv_as_text(path: &Path) -> PipelineResult<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

fn header_of(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|c| c.to_string()).collect()
}

/// Concatenates every CSV file in `dir`, in file-name order.
///
/// Values are carried over as text, exactly as they appear in the files.
/// The header of the first file (or `expected`, when given) is the reference
/// every file must match.
///
/// # Errors
///
/// Returns `Format` naming the first file whose header differs.
pub fn collate<P: AsRef<Path>>(dir: P, expected: Option<&[String]>) -> PipelineResult<DataFrame> {
    let dir = dir.as_ref();
    let files = list_csv_files(dir)?;
    debug!("Collating {} files from {}", files.len(), dir.display());

    let mut reference: Option<Vec<String>> = expected.map(|e| e.to_vec());
    let mut combined: Option<DataFrame> = None;

    for path in &files {
        let df = read_csv_as_text(path)?;
        let found = header_of(&df);
        match &reference {
            Some(expected) if *expected != found => {
                return Err(PipelineError::Format {
                    path: path.clone(),
                    expected: expected.clone(),
                    found,
                });
            }
            Some(_) => {}
            None => reference = Some(found),
        }

        match combined.as_mut() {
            Some(acc) => {
                acc.vstack_mut(&df)?;
            }
            None => combined = Some(df),
        }
    }

    match combined {
        Some(df) => Ok(df),
        None => {
            let columns: Vec<Column> = reference
                .unwrap_or_default()
                .iter()
                .map(|name| Series::new_empty(name.as_str().into(), &DataType::String).into())
                .collect();
            Ok(DataFrame::new(columns)?)
        }
    }
}

/// Writes the collated table to `path`: Parquet when the extension is
/// `.parquet`, CSV otherwise.
///
/// For Parquet the text columns are typed: `region_id` as integer and the
/// variable columns as floats.
pub fn write_combined(df: &DataFrame, path: &Path) -> PipelineResult<()> {
    debug!("Combined table shape: {:?}", df.shape());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let is_parquet = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("parquet"))
        .unwrap_or(false);

    let file = File::create(path)?;
    if is_parquet {
        let mut typed = typed_frame(df)?;
        ParquetWriter::new(file).finish(&mut typed)?;
    } else {
        let mut df = df.clone();
        let mut file = file;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    }

    debug!("Wrote combined table to {}", path.display());
    Ok(())
}

fn typed_frame(df: &DataFrame) -> PipelineResult<DataFrame> {
    let casts: Vec<Expr> = df
        .get_column_names()
        .iter()
        .filter_map(|name| {
            let name = name.as_str();
            if name == BASE_COLUMNS[0] {
                Some(col(name).cast(DataType::Int64))
            } else if BASE_COLUMNS.contains(&name) {
                None
            } else {
                Some(col(name).cast(DataType::Float64))
            }
        })
        .collect();

    if casts.is_empty() {
        return Ok(df.clone());
    }
    Ok(df.clone().lazy().with_columns(casts).collect()?)
}
