//! # Batch Pipeline
//!
//! Drives the per-region loop: load the grid and the catalog once, check that
//! both use geographic coordinates, work out which regions still need output,
//! then extract, aggregate and write each of them in catalog order.
//!
//! A failure in one region never stops the batch. It is logged and recorded
//! in the [`BatchReport`] and the loop moves on; the region has no output file
//! afterwards, even one left by an earlier run, and is picked up again by the
//! next resumed run.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};

use crate::aggregate::{ColumnNaming, ColumnOrder, RegionAggregator};
use crate::bbox::BoundingBoxExtractor;
use crate::error::{PipelineError, PipelineResult};
use crate::grid::GridStore;
use crate::input::{JobConfig, ResumePolicy};
use crate::output::{CsvSink, sanitize_file_stem};
use crate::regions::{Region, RegionCatalog, RegionFields};

/// Everything loaded before the region loop starts.
pub struct PipelineContext {
    pub config: JobConfig,
    pub store: GridStore,
    pub catalog: RegionCatalog,
    pub order: ColumnOrder,
    pub sink: CsvSink,
}

impl PipelineContext {
    /// Validates the configuration and loads both inputs.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `Load` when the grid or the
    /// shapefile cannot be read, and `Geometry` when the inputs are not in
    /// geographic coordinates.
    pub fn prepare(config: &JobConfig) -> PipelineResult<Self> {
        config.validate()?;

        info!("Loading grid from {}", config.grid_dir.display());
        let store = GridStore::load(&config.grid_dir, &config.grid_options())?;
        info!("Loaded {} variables", store.len());

        info!("Loading regions from {}", config.shapefile.display());
        let catalog = RegionCatalog::load(&config.shapefile, &config.fields).map_err(|e| match e {
            PipelineError::Shapefile(msg) | PipelineError::Load(msg) => {
                PipelineError::Load(format!("{}: {}", config.shapefile.display(), msg))
            }
            other => other,
        })?;
        info!("Loaded {} regions", catalog.len());

        Self::from_parts(config.clone(), store, catalog)
    }

    /// Builds a context from already-loaded inputs.
    pub fn from_parts(config: JobConfig, store: GridStore, catalog: RegionCatalog) -> PipelineResult<Self> {
        validate_crs(&store, &catalog)?;

        let store = match &config.country_bbox {
            Some(bbox) => {
                debug!("Restricting grid to country box {}", bbox);
                store.subset_bbox(bbox)?
            }
            None => store,
        };

        let order = ColumnNaming::new(&config.column_overrides).column_order(&store)?;
        let sink = CsvSink::new(&config.output_dir)?;

        Ok(PipelineContext {
            config,
            store,
            catalog,
            order,
            sink,
        })
    }

    /// Regions to process for `selection`, honoring the resume policy.
    pub fn plan(&self, selection: &RegionSelection) -> PipelineResult<BatchPlan<'_>> {
        pending_regions(
            &self.catalog,
            &self.sink,
            &self.config.fields,
            self.config.resume,
            selection,
        )
    }

    /// Extracts, aggregates and writes one region.
    pub fn process_region(&self, region: &Region) -> PipelineResult<(PathBuf, usize)> {
        let extractor = BoundingBoxExtractor;
        let aggregator = RegionAggregator::new(&self.order, &self.config.fields, &extractor);
        let table = aggregator.aggregate(region, &self.store)?;
        let path = self.sink.write(&table)?;
        Ok((path, table.len()))
    }

    /// Processes a planned region, refusing regions whose file name is
    /// already taken by another region of the catalog.
    fn process_planned(&self, region: &Region, plan: &BatchPlan<'_>) -> PipelineResult<(PathBuf, usize)> {
        if let Some(owner) = plan.conflicts.get(&region.id) {
            let area_code = region.attribute(&self.config.fields.area_code)?.to_string();
            return Err(PipelineError::OutputCollision {
                region_id: region.id,
                path: self.sink.path_for(&area_code),
                area_code,
                owner: *owner,
            });
        }
        self.process_region(region)
    }

    /// Removes output left by an earlier run for a region that just failed.
    fn discard_stale_output(&self, area_code: &str) {
        match self.sink.remove(area_code) {
            Ok(true) => debug!("Removed earlier output of area code {}", area_code),
            Ok(false) => {}
            Err(e) => warn!("Could not remove earlier output of area code {}: {}", area_code, e),
        }
    }

    /// Runs every region of `plan`, never stopping on a region failure.
    pub fn run_batch(&self, plan: &BatchPlan<'_>, show_progress: bool) -> BatchReport {
        let progress = if show_progress {
            let pb = ProgressBar::new(plan.regions.len() as u64);
            pb.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut outcomes = Vec::with_capacity(plan.regions.len());
        for region in &plan.regions {
            let area_code = region.attribute(&self.config.fields.area_code).ok().map(str::to_string);
            progress.set_message(area_code.clone().unwrap_or_else(|| region.id.to_string()));

            let label = region_label(region, &self.config.fields);

            let status = match self.process_planned(region, plan) {
                Ok((path, rows)) => {
                    progress.suspend(|| info!("{}: wrote {} rows to {}", label, rows, path.display()));
                    RegionStatus::Written { path, rows }
                }
                Err(e) => {
                    progress.suspend(|| {
                        if e.is_region_scoped() {
                            warn!("Skipping {}: {}", label, e);
                        } else {
                            error!("{} failed: {}", label, e);
                        }
                    });
                    // the file under a colliding name belongs to another region
                    let collided = matches!(e, PipelineError::OutputCollision { .. });
                    if let Some(code) = area_code.as_deref().filter(|_| !collided) {
                        self.discard_stale_output(code);
                    }
                    RegionStatus::Failed(e)
                }
            };

            outcomes.push(RegionOutcome {
                region_id: region.id,
                area_code,
                status,
            });
            progress.inc(1);
        }
        progress.finish_and_clear();

        BatchReport {
            outcomes,
            skipped_existing: plan.skipped_existing,
        }
    }
}

/// `region 10 (06075, San Francisco, California)`, with whichever identifying
/// attributes the region has.
fn region_label(region: &Region, fields: &RegionFields) -> String {
    let known: Vec<&str> = [&fields.area_code, &fields.name, &fields.parent_name]
        .into_iter()
        .filter_map(|field| region.attribute(field).ok())
        .collect();
    if known.is_empty() {
        format!("region {}", region.id)
    } else {
        format!("region {} ({})", region.id, known.join(", "))
    }
}

/// Rejects inputs that are not in geographic lat/lon coordinates.
///
/// Bounding boxes are taken directly from the polygon vertices and compared
/// with grid coordinates, so both must be plain latitude/longitude.
pub fn validate_crs(store: &GridStore, catalog: &RegionCatalog) -> PipelineResult<()> {
    if catalog.is_projected() {
        return Err(PipelineError::Geometry(format!(
            "Region polygons use the projected coordinate system '{}'; reproject them to latitude/longitude",
            catalog.crs_name().unwrap_or_else(|| "unknown".to_string())
        )));
    }
    if let Some(variable) = store.variables().find(|v| !v.is_geographic()) {
        return Err(PipelineError::Geometry(format!(
            "Variable '{}' uses the '{}' grid mapping; only latitude/longitude grids are supported",
            variable.key,
            variable.grid_mapping.as_deref().unwrap_or_default()
        )));
    }
    Ok(())
}

/// Which catalog regions a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegionSelection {
    #[default]
    All,
    /// Explicit identifiers; these are always processed
    Ids(Vec<i64>),
}

/// Regions a run will process, in catalog order.
#[derive(Debug)]
pub struct BatchPlan<'a> {
    pub regions: Vec<&'a Region>,
    pub skipped_existing: usize,
    /// Regions whose output file name is already claimed, mapped to the
    /// earlier region claiming it
    pub conflicts: HashMap<i64, i64>,
}

/// Finds regions whose area code maps to the same file name as an earlier
/// region of the catalog.
pub fn output_conflicts(catalog: &RegionCatalog, fields: &RegionFields) -> HashMap<i64, i64> {
    let mut owners: HashMap<String, i64> = HashMap::new();
    let mut conflicts = HashMap::new();
    for region in catalog.regions() {
        let Ok(code) = region.attribute(&fields.area_code) else {
            continue;
        };
        let owner = *owners.entry(sanitize_file_stem(code)).or_insert(region.id);
        if owner != region.id {
            conflicts.insert(region.id, owner);
        }
    }
    conflicts
}

/// Works out which regions still need output.
///
/// With [`ResumePolicy::SkipExisting`] a region is skipped when a CSV named
/// after its area code is already present. Regions without an area code are
/// always pending; they fail later with `MissingAttribute`. So are regions
/// whose file name collides with an earlier region's: they fail with
/// `OutputCollision` instead of being taken as done.
///
/// # Errors
///
/// Returns `NotFound` for an explicitly selected identifier missing from the
/// catalog.
pub fn pending_regions<'a>(
    catalog: &'a RegionCatalog,
    sink: &CsvSink,
    fields: &RegionFields,
    policy: ResumePolicy,
    selection: &RegionSelection,
) -> PipelineResult<BatchPlan<'a>> {
    let conflicts = output_conflicts(catalog, fields);

    if let RegionSelection::Ids(ids) = selection {
        let regions = ids.iter().map(|id| catalog.find(*id)).collect::<PipelineResult<Vec<_>>>()?;
        return Ok(BatchPlan {
            regions,
            skipped_existing: 0,
            conflicts,
        });
    }

    let written: HashSet<String> = match policy {
        ResumePolicy::SkipExisting => sink.written_stems()?,
        ResumePolicy::Regenerate => HashSet::new(),
    };

    let mut regions = Vec::new();
    let mut skipped_existing = 0;
    for region in catalog.regions() {
        let done = !conflicts.contains_key(&region.id)
            && region
                .attribute(&fields.area_code)
                .map(|code| written.contains(&sanitize_file_stem(code)))
                .unwrap_or(false);
        if done {
            debug!("Region {} already has output, skipping", region.id);
            skipped_existing += 1;
        } else {
            regions.push(region);
        }
    }

    Ok(BatchPlan {
        regions,
        skipped_existing,
        conflicts,
    })
}

/// Result of one region.
#[derive(Debug)]
pub enum RegionStatus {
    Written { path: PathBuf, rows: usize },
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct RegionOutcome {
    pub region_id: i64,
    pub area_code: Option<String>,
    pub status: RegionStatus,
}

/// Structured summary of a batch run.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<RegionOutcome>,
    /// Regions left alone because their output already existed
    pub skipped_existing: usize,
}

impl BatchReport {
    pub fn written(&self) -> impl Iterator<Item = &RegionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, RegionStatus::Written { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&RegionOutcome, &PipelineError)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            RegionStatus::Failed(e) => Some((o, e)),
            RegionStatus::Written { .. } => None,
        })
    }

    pub fn written_count(&self) -> usize {
        self.written().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn rows_written(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                RegionStatus::Written { rows, .. } => rows,
                RegionStatus::Failed(_) => 0,
            })
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::MultiPolygon;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn region(id: i64, code: Option<&str>) -> Region {
        let mut attributes = BTreeMap::new();
        if let Some(code) = code {
            attributes.insert("GEOID".to_string(), code.to_string());
        }
        Region::new(id, MultiPolygon(vec![]), attributes)
    }

    fn catalog() -> RegionCatalog {
        RegionCatalog::from_regions(vec![
            region(0, Some("06075")),
            region(1, Some("06001")),
            region(2, None),
            region(3, Some("06/13")),
        ])
    }

    #[test]
    fn test_pending_skips_existing_files() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("06075.csv"), "x\n").unwrap();
        std::fs::write(dir.path().join("06_13.csv"), "x\n").unwrap();
        std::fs::write(dir.path().join("06001.csv.partial"), "x\n").unwrap();

        let catalog = catalog();
        let fields = RegionFields::default();
        let plan = pending_regions(&catalog, &sink, &fields, ResumePolicy::SkipExisting, &RegionSelection::All)
            .unwrap();
        let ids: Vec<i64> = plan.regions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(plan.skipped_existing, 2);

        let plan = pending_regions(&catalog, &sink, &fields, ResumePolicy::Regenerate, &RegionSelection::All)
            .unwrap();
        assert_eq!(plan.regions.len(), 4);
        assert_eq!(plan.skipped_existing, 0);
    }

    #[test]
    fn test_explicit_selection() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("06075.csv"), "x\n").unwrap();

        let catalog = catalog();
        let fields = RegionFields::default();
        let plan = pending_regions(
            &catalog,
            &sink,
            &fields,
            ResumePolicy::SkipExisting,
            &RegionSelection::Ids(vec![3, 0]),
        )
        .unwrap();
        let ids: Vec<i64> = plan.regions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 0]);

        let err = pending_regions(
            &catalog,
            &sink,
            &fields,
            ResumePolicy::SkipExisting,
            &RegionSelection::Ids(vec![42]),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(42)));
    }

    #[test]
    fn test_colliding_file_names_are_flagged() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let catalog = RegionCatalog::from_regions(vec![
            region(0, Some("GB/1")),
            region(1, Some("GB 1")),
            region(2, Some("GB_2")),
        ]);
        let fields = RegionFields::default();
        let conflicts = output_conflicts(&catalog, &fields);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts.get(&1), Some(&0));

        // the first region's file does not mark the second one as done
        std::fs::write(dir.path().join("GB_1.csv"), "x\n").unwrap();
        let plan = pending_regions(&catalog, &sink, &fields, ResumePolicy::SkipExisting, &RegionSelection::All)
            .unwrap();
        let ids: Vec<i64> = plan.regions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(plan.skipped_existing, 1);
        assert_eq!(plan.conflicts.get(&1), Some(&0));
    }

    #[test]
    fn test_region_label() {
        let fields = RegionFields::default();
        let mut attributes = BTreeMap::new();
        attributes.insert("GEOID".to_string(), "06075".to_string());
        attributes.insert("NAME".to_string(), "San Francisco".to_string());
        let named = Region::new(10, MultiPolygon(vec![]), attributes);
        assert_eq!(region_label(&named, &fields), "region 10 (06075, San Francisco)");
        assert_eq!(region_label(&region(4, None), &fields), "region 4");
    }

    #[test]
    fn test_batch_report_counts() {
        let report = BatchReport {
            outcomes: vec![
                RegionOutcome {
                    region_id: 0,
                    area_code: Some("A".to_string()),
                    status: RegionStatus::Written {
                        path: PathBuf::from("A.csv"),
                        rows: 90,
                    },
                },
                RegionOutcome {
                    region_id: 1,
                    area_code: None,
                    status: RegionStatus::Failed(PipelineError::MissingAttribute {
                        region_id: 1,
                        field: "GEOID".to_string(),
                    }),
                },
            ],
            skipped_existing: 3,
        };
        assert_eq!(report.written_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.rows_written(), 90);
        assert!(!report.is_clean());
        assert_eq!(report.failed().next().map(|(o, _)| o.region_id), Some(1));
    }

    #[test]
    fn test_validate_crs_accepts_unprojected_inputs() {
        assert!(validate_crs(&GridStore::default(), &catalog()).is_ok());
    }
}
