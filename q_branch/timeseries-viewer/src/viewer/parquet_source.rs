//! Lazy parquet source with time-range pushdown.
//!
//! Opening a dataset only reads footers: the schema, and per row group the
//! min/max of the time column. Range reads then:
//! - skip row groups whose time statistics fall outside the window
//! - project just the time and value columns
//! - filter remaining rows with a predicate on the time column
//!
//! Large files are split into row group chunks read in parallel.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use arrow::array::{Array, BooleanArray};
use arrow::error::ArrowError;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::statistics::StatisticsConverter;
use parquet::arrow::arrow_reader::{
    ArrowPredicateFn, ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
    RowFilter,
};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::data::{TimeseriesPoint, Window};
use super::error::{Result, ViewerError};
use super::source::{
    SeriesSource, check_time_type, is_value_type, push_points, sort_by_time, time_ticks,
    value_floats,
};

/// Files with more row groups than this are read in parallel chunks.
const PARALLEL_ROW_GROUP_THRESHOLD: usize = 4;

const READ_BATCH_SIZE: usize = 65536;

/// Time bounds of one row group, `None` when statistics are missing.
#[derive(Debug, Clone, Copy)]
struct RowGroupSpan {
    min: Option<i64>,
    max: Option<i64>,
    rows: i64,
}

impl RowGroupSpan {
    fn overlaps(&self, window: Window) -> bool {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => lo < window.end && hi >= window.start,
            _ => true,
        }
    }
}

struct ParquetFile {
    path: PathBuf,
    metadata: ArrowReaderMetadata,
    spans: Vec<RowGroupSpan>,
}

impl ParquetFile {
    fn open(path: &Path, time_column: &str) -> Result<Self> {
        let file = File::open(path)?;
        let metadata = ArrowReaderMetadata::load(&file, ArrowReaderOptions::default())?;

        let schema = metadata.schema().clone();
        let time_field = schema
            .field_with_name(time_column)
            .map_err(|_| ViewerError::MissingColumn(time_column.to_string()))?;
        check_time_type(time_column, time_field.data_type())?;

        let parquet_meta = metadata.metadata();
        let converter =
            StatisticsConverter::try_new(time_column, &schema, parquet_meta.file_metadata().schema_descr())?;
        let mins = converter.row_group_mins(parquet_meta.row_groups().iter())?;
        let maxs = converter.row_group_maxes(parquet_meta.row_groups().iter())?;
        let mins = time_ticks(time_column, &mins)?;
        let maxs = time_ticks(time_column, &maxs)?;

        let spans = parquet_meta
            .row_groups()
            .iter()
            .enumerate()
            .map(|(i, rg)| RowGroupSpan {
                min: (!mins.is_null(i)).then(|| mins.value(i)),
                max: (!maxs.is_null(i)).then(|| maxs.value(i)),
                rows: rg.num_rows(),
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            spans,
        })
    }

    fn has_column(&self, name: &str) -> bool {
        self.metadata.schema().index_of(name).is_ok()
    }

    /// Extent of `name` from statistics alone. `None` when the statistics
    /// cannot decide it: missing bounds, or nulls in the value column.
    fn stats_extent(&self, name: &str) -> Result<Option<Option<(i64, i64)>>> {
        let schema = self.metadata.schema();
        let parquet_meta = self.metadata.metadata();
        let converter =
            StatisticsConverter::try_new(name, schema, parquet_meta.file_metadata().schema_descr())?;
        let null_counts = converter.row_group_null_counts(parquet_meta.row_groups().iter())?;

        let mut extent: Option<(i64, i64)> = None;
        for (i, span) in self.spans.iter().enumerate() {
            if span.rows == 0 {
                continue;
            }
            if null_counts.is_null(i) || null_counts.value(i) != 0 {
                return Ok(None);
            }
            let (Some(lo), Some(hi)) = (span.min, span.max) else {
                return Ok(None);
            };
            extent = Some(match extent {
                Some((a, b)) => (a.min(lo), b.max(hi)),
                None => (lo, hi),
            });
        }
        Ok(Some(extent))
    }

    fn selected_row_groups(&self, window: Window) -> Vec<usize> {
        self.spans
            .iter()
            .enumerate()
            .filter(|(_, span)| span.rows > 0 && span.overlaps(window))
            .map(|(i, _)| i)
            .collect()
    }

    /// Read `name` from `row_groups`, keeping rows inside `window`.
    fn read_row_groups(
        &self,
        time_column: &str,
        name: &str,
        window: Window,
        row_groups: Vec<usize>,
    ) -> Result<Vec<TimeseriesPoint>> {
        let file = File::open(&self.path)?;
        let builder =
            ParquetRecordBatchReaderBuilder::new_with_metadata(file, self.metadata.clone());

        let schema = builder.schema().clone();
        let parquet_schema = builder.parquet_schema();
        let time_idx = schema.index_of(time_column)?;
        let value_idx = schema.index_of(name)?;

        let projection = ProjectionMask::roots(parquet_schema, vec![time_idx, value_idx]);
        let predicate_mask = ProjectionMask::roots(parquet_schema, vec![time_idx]);

        let column = time_column.to_string();
        let predicate = ArrowPredicateFn::new(predicate_mask, move |batch| {
            let ticks = time_ticks(&column, batch.column(0))
                .map_err(|e| ArrowError::ComputeError(e.to_string()))?;
            let keep: BooleanArray = ticks
                .iter()
                .map(|t| t.map(|t| window.contains(t)))
                .collect();
            Ok(keep)
        });

        let reader = builder
            .with_projection(projection)
            .with_batch_size(READ_BATCH_SIZE)
            .with_row_groups(row_groups)
            .with_row_filter(RowFilter::new(vec![Box::new(predicate)]))
            .build()?;

        let mut points = Vec::new();
        for batch in reader {
            let batch = batch?;
            let times = batch
                .column_by_name(time_column)
                .ok_or_else(|| ViewerError::MissingColumn(time_column.to_string()))?;
            let values = batch
                .column_by_name(name)
                .ok_or_else(|| ViewerError::SeriesNotFound(name.to_string()))?;
            let times = time_ticks(time_column, times)?;
            let values = value_floats(name, values)?;
            push_points(&mut points, &times, &values);
        }
        Ok(points)
    }
}

/// Parquet-backed [`SeriesSource`] over one or more files sharing a schema.
pub struct ParquetSource {
    files: Vec<ParquetFile>,
    time_column: String,
    series: Vec<String>,
    /// Lazily computed extents per series.
    extents: RwLock<FxHashMap<String, Option<(i64, i64)>>>,
}

impl ParquetSource {
    pub fn open(path: &Path, time_column: &str) -> Result<Self> {
        Self::open_many(&[path], time_column)
    }

    /// Open several files as one dataset. Series come from the first file's
    /// schema; files missing a series contribute no samples to it.
    pub fn open_many<P: AsRef<Path>>(paths: &[P], time_column: &str) -> Result<Self> {
        let start = std::time::Instant::now();
        let files = paths
            .iter()
            .map(|p| ParquetFile::open(p.as_ref(), time_column))
            .collect::<Result<Vec<_>>>()?;

        let series = files
            .first()
            .map(|f| {
                f.metadata
                    .schema()
                    .fields()
                    .iter()
                    .filter(|field| field.name() != time_column && is_value_type(field.data_type()))
                    .map(|field| field.name().clone())
                    .collect()
            })
            .unwrap_or_default();

        let source = Self {
            files,
            time_column: time_column.to_string(),
            series,
            extents: RwLock::new(FxHashMap::default()),
        };
        info!(
            files = source.files.len(),
            row_groups = source.row_group_count(),
            series = source.series.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened parquet dataset"
        );
        Ok(source)
    }

    pub fn row_group_count(&self) -> usize {
        self.files.iter().map(|f| f.spans.len()).sum()
    }

    /// Row groups a read of `window` would touch, across all files.
    pub fn selected_row_group_count(&self, window: Window) -> usize {
        self.files
            .iter()
            .map(|f| f.selected_row_groups(window).len())
            .sum()
    }

    fn check_series(&self, name: &str) -> Result<()> {
        if self.series.iter().any(|s| s == name) {
            Ok(())
        } else {
            Err(ViewerError::SeriesNotFound(name.to_string()))
        }
    }

    fn compute_extent(&self, name: &str) -> Result<Option<(i64, i64)>> {
        let mut extent: Option<(i64, i64)> = None;
        for file in self.files.iter().filter(|f| f.has_column(name)) {
            let file_extent = match file.stats_extent(name)? {
                Some(e) => e,
                None => {
                    debug!(path = %file.path.display(), series = name, "Statistics incomplete, scanning for extent");
                    let points = file.read_row_groups(
                        &self.time_column,
                        name,
                        Window::new(i64::MIN, i64::MAX),
                        (0..file.spans.len()).collect(),
                    )?;
                    let lo = points.iter().map(|p| p.time).min();
                    let hi = points.iter().map(|p| p.time).max();
                    lo.zip(hi)
                }
            };
            if let Some((lo, hi)) = file_extent {
                extent = Some(match extent {
                    Some((a, b)) => (a.min(lo), b.max(hi)),
                    None => (lo, hi),
                });
            }
        }
        Ok(extent)
    }
}

impl SeriesSource for ParquetSource {
    fn schema(&self) -> Vec<String> {
        self.series.clone()
    }

    fn read_range(&self, name: &str, window: Window) -> Result<Vec<TimeseriesPoint>> {
        self.check_series(name)?;
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let start = std::time::Instant::now();

        // (file, row group chunk) work items, in file order
        let mut work: Vec<(usize, Vec<usize>)> = Vec::new();
        for (file_idx, file) in self.files.iter().enumerate() {
            if !file.has_column(name) {
                continue;
            }
            let selected = file.selected_row_groups(window);
            if selected.is_empty() {
                continue;
            }
            if selected.len() <= PARALLEL_ROW_GROUP_THRESHOLD {
                work.push((file_idx, selected));
                continue;
            }
            let num_threads = rayon::current_num_threads().min(selected.len());
            let chunk_size = selected.len().div_ceil(num_threads);
            for chunk in selected.chunks(chunk_size) {
                work.push((file_idx, chunk.to_vec()));
            }
        }
        let row_groups: usize = work.iter().map(|(_, rgs)| rgs.len()).sum();

        // BTreeMap keeps chunk order so equal timestamps stay in file order
        let chunks: BTreeMap<usize, Vec<TimeseriesPoint>> = work
            .into_par_iter()
            .enumerate()
            .map(|(i, (file_idx, rgs))| {
                self.files[file_idx]
                    .read_row_groups(&self.time_column, name, window, rgs)
                    .map(|points| (i, points))
            })
            .collect::<Result<_>>()?;

        let mut points: Vec<TimeseriesPoint> = chunks.into_values().flatten().collect();
        sort_by_time(&mut points);

        debug!(
            series = name,
            start = window.start,
            end = window.end,
            row_groups,
            rows = points.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Range read"
        );
        Ok(points)
    }

    fn extent(&self, name: &str) -> Result<Option<(i64, i64)>> {
        self.check_series(name)?;
        if let Ok(cache) = self.extents.read()
            && let Some(extent) = cache.get(name)
        {
            return Ok(*extent);
        }
        let extent = self.compute_extent(name)?;
        if let Ok(mut cache) = self.extents.write() {
            cache.insert(name.to_string(), extent);
        }
        Ok(extent)
    }
}
