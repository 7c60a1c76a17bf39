//! Dataset source contract and its in-memory implementation.
//!
//! A source exposes named value series that share one time column. The
//! engine only ever talks to [`SeriesSource`], so the storage behind it is
//! interchangeable:
//!
//! - [`MemorySource`] - sorted in-memory columns, binary-searched per read.
//!   CSV files load fully into one (full-read-then-filter fallback).
//! - [`ParquetSource`](super::parquet_source::ParquetSource) - lazy reads with
//!   row-group pruning and row-filter predicate pushdown.

use std::fs::File;
use std::io::Seek;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, RecordBatch};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use tracing::info;

use super::data::{TimeseriesPoint, Window};
use super::error::{Result, ViewerError};
use super::parquet_source::ParquetSource;

/// Default name of the shared time column.
pub const DEFAULT_TIME_COLUMN: &str = "time";

/// Rows sampled when inferring a CSV schema.
const CSV_INFER_ROWS: usize = 10_000;

const CSV_BATCH_SIZE: usize = 65536;

/// Read access to the named series of one dataset.
///
/// Implementations must be safe to share across sessions: series data is
/// immutable from the engine's point of view.
pub trait SeriesSource: Send + Sync {
    /// Names of the value series, in dataset order. The time column is
    /// not included.
    fn schema(&self) -> Vec<String>;

    /// Time ordered samples of `name` whose time falls in `window`.
    fn read_range(&self, name: &str, window: Window) -> Result<Vec<TimeseriesPoint>>;

    /// Inclusive `(min_t, max_t)` of `name`, `None` when it has no samples.
    fn extent(&self, name: &str) -> Result<Option<(i64, i64)>>;

    fn contains(&self, name: &str) -> bool {
        self.schema().iter().any(|s| s == name)
    }
}

/// In-memory source of sorted series.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    series: Vec<(String, Arc<Vec<TimeseriesPoint>>)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a series. Points are stably sorted by time.
    pub fn insert(&mut self, name: impl Into<String>, mut points: Vec<TimeseriesPoint>) {
        let name = name.into();
        sort_by_time(&mut points);
        let points = Arc::new(points);
        match self.series.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = points,
            None => self.series.push((name, points)),
        }
    }

    pub fn with_series(mut self, name: impl Into<String>, points: Vec<TimeseriesPoint>) -> Self {
        self.insert(name, points);
        self
    }

    /// Build from record batches sharing `schema`. Every numeric column other
    /// than `time_column` becomes a series; null values are skipped.
    pub fn from_batches<I>(schema: SchemaRef, batches: I, time_column: &str) -> Result<Self>
    where
        I: IntoIterator<Item = std::result::Result<RecordBatch, ArrowError>>,
    {
        let time_idx = schema
            .index_of(time_column)
            .map_err(|_| ViewerError::MissingColumn(time_column.to_string()))?;
        check_time_type(time_column, schema.field(time_idx).data_type())?;

        let value_cols: Vec<(usize, String)> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, f)| *i != time_idx && is_value_type(f.data_type()))
            .map(|(i, f)| (i, f.name().clone()))
            .collect();

        let mut columns: Vec<Vec<TimeseriesPoint>> = vec![Vec::new(); value_cols.len()];
        for batch in batches {
            let batch = batch?;
            let times = time_ticks(time_column, batch.column(time_idx))?;
            for ((idx, name), out) in value_cols.iter().zip(columns.iter_mut()) {
                let values = value_floats(name, batch.column(*idx))?;
                push_points(out, &times, &values);
            }
        }

        let mut source = Self::new();
        for ((_, name), points) in value_cols.into_iter().zip(columns) {
            source.insert(name, points);
        }
        Ok(source)
    }

    /// Load a CSV file with a header row. The whole file is read; range
    /// reads then filter in memory.
    pub fn from_csv(path: &Path, time_column: &str) -> Result<Self> {
        let start = std::time::Instant::now();
        let mut file = File::open(path)?;

        let format = arrow::csv::reader::Format::default().with_header(true);
        let (schema, _) = format.infer_schema(&mut file, Some(CSV_INFER_ROWS))?;
        file.rewind()?;

        let schema = Arc::new(schema);
        let reader = arrow::csv::ReaderBuilder::new(schema.clone())
            .with_format(format)
            .with_batch_size(CSV_BATCH_SIZE)
            .build(file)?;

        let source = Self::from_batches(schema, reader, time_column)?;
        info!(
            path = %path.display(),
            series = source.series.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded CSV dataset"
        );
        Ok(source)
    }

    fn get(&self, name: &str) -> Result<&Arc<Vec<TimeseriesPoint>>> {
        self.series
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, points)| points)
            .ok_or_else(|| ViewerError::SeriesNotFound(name.to_string()))
    }
}

impl SeriesSource for MemorySource {
    fn schema(&self) -> Vec<String> {
        self.series.iter().map(|(n, _)| n.clone()).collect()
    }

    fn read_range(&self, name: &str, window: Window) -> Result<Vec<TimeseriesPoint>> {
        let points = self.get(name)?;
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let lo = points.partition_point(|p| p.time < window.start);
        let hi = points.partition_point(|p| p.time < window.end);
        Ok(points[lo..hi].to_vec())
    }

    fn extent(&self, name: &str) -> Result<Option<(i64, i64)>> {
        let points = self.get(name)?;
        Ok(points.first().zip(points.last()).map(|(a, b)| (a.time, b.time)))
    }
}

/// Open a dataset file by extension (`.parquet` or `.csv`).
pub fn open_dataset(path: &Path, time_column: &str) -> Result<Arc<dyn SeriesSource>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => Ok(Arc::new(ParquetSource::open(path, time_column)?)),
        Some("csv") => Ok(Arc::new(MemorySource::from_csv(path, time_column)?)),
        _ => Err(ViewerError::UnsupportedFormat(path.display().to_string())),
    }
}

// --- Arrow helpers shared with the parquet source ---

pub(crate) fn is_value_type(data_type: &DataType) -> bool {
    data_type.is_numeric()
}

pub(crate) fn check_time_type(column: &str, data_type: &DataType) -> Result<()> {
    match data_type {
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => Ok(()),
        dt if dt.is_integer() => Ok(()),
        other => Err(ViewerError::UnsupportedColumn {
            column: column.to_string(),
            data_type: other.to_string(),
        }),
    }
}

/// Convert a time column to ticks: epoch milliseconds for temporal types,
/// the raw value for integer types.
pub(crate) fn time_ticks(column: &str, array: &ArrayRef) -> Result<Int64Array> {
    check_time_type(column, array.data_type())?;
    let raw = cast(array, &DataType::Int64)?;
    let raw = raw.as_primitive::<Int64Type>();
    let ticks = match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => {
            raw.unary::<_, Int64Type>(|v| v.saturating_mul(1000))
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            raw.unary::<_, Int64Type>(|v| v.div_euclid(1000))
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            raw.unary::<_, Int64Type>(|v| v.div_euclid(1_000_000))
        }
        DataType::Date32 => raw.unary::<_, Int64Type>(|v| v.saturating_mul(86_400_000)),
        _ => raw.clone(),
    };
    Ok(ticks)
}

/// Cast a numeric value column to f64.
pub(crate) fn value_floats(column: &str, array: &ArrayRef) -> Result<Float64Array> {
    if !is_value_type(array.data_type()) {
        return Err(ViewerError::UnsupportedColumn {
            column: column.to_string(),
            data_type: array.data_type().to_string(),
        });
    }
    let values = cast(array, &DataType::Float64)?;
    Ok(values.as_primitive::<Float64Type>().clone())
}

/// Append non-null rows of parallel time/value arrays.
pub(crate) fn push_points(out: &mut Vec<TimeseriesPoint>, times: &Int64Array, values: &Float64Array) {
    out.reserve(times.len());
    for i in 0..times.len() {
        if times.is_null(i) || values.is_null(i) {
            continue;
        }
        out.push(TimeseriesPoint::new(times.value(i), values.value(i)));
    }
}

/// Stable sort by time, skipped when already ordered.
pub(crate) fn sort_by_time(points: &mut [TimeseriesPoint]) {
    if !points.is_sorted_by_key(|p| p.time) {
        points.sort_by_key(|p| p.time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Builder, Int8Array, StringArray, TimestampNanosecondArray};
    use arrow::datatypes::{Field, Schema};
    use std::io::Write;
    use tempfile::TempDir;

    fn ramp(n: i64) -> Vec<TimeseriesPoint> {
        (0..n).map(|i| TimeseriesPoint::new(i * 10, i as f64)).collect()
    }

    #[test]
    fn test_read_range_is_half_open() {
        let source = MemorySource::new().with_series("ramp", ramp(100));
        let points = source.read_range("ramp", Window::new(100, 200)).unwrap();
        assert_eq!(points.first().map(|p| p.time), Some(100));
        assert_eq!(points.last().map(|p| p.time), Some(190));
        assert_eq!(points.len(), 10);
    }

    #[test]
    fn test_read_range_outside_and_empty() {
        let source = MemorySource::new().with_series("ramp", ramp(100));
        assert!(source.read_range("ramp", Window::new(5000, 6000)).unwrap().is_empty());
        assert!(source.read_range("ramp", Window::new(50, 50)).unwrap().is_empty());
        assert!(source.read_range("ramp", Window::new(60, 20)).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_series() {
        let source = MemorySource::new().with_series("ramp", ramp(10));
        assert!(matches!(
            source.read_range("nope", Window::new(0, 10)),
            Err(ViewerError::SeriesNotFound(_))
        ));
        assert!(matches!(source.extent("nope"), Err(ViewerError::SeriesNotFound(_))));
        assert!(!source.contains("nope"));
        assert!(source.contains("ramp"));
    }

    #[test]
    fn test_insert_sorts_and_extent() {
        let mut points = ramp(5);
        points.reverse();
        let source = MemorySource::new()
            .with_series("rev", points)
            .with_series("empty", vec![]);
        assert_eq!(source.extent("rev").unwrap(), Some((0, 40)));
        assert_eq!(source.extent("empty").unwrap(), None);
        assert_eq!(source.schema(), vec!["rev".to_string(), "empty".to_string()]);
    }

    #[test]
    fn test_from_batches_normalizes_time_and_skips_nulls() {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "time",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                false,
            ),
            Field::new("sin", DataType::Float64, true),
            Field::new("sin_square", DataType::Int8, false),
            Field::new("label", DataType::Utf8, false),
        ]));

        let mut sin = Float64Builder::new();
        sin.append_value(0.5);
        sin.append_null();
        sin.append_value(-0.5);

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampNanosecondArray::from(vec![
                    1_000_000_000i64,
                    2_000_000_000,
                    3_000_000_000,
                ])),
                Arc::new(sin.finish()),
                Arc::new(Int8Array::from(vec![1i8, 1, -1])),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
            ],
        )
        .unwrap();

        let source = MemorySource::from_batches(schema, vec![Ok(batch)], "time").unwrap();
        assert_eq!(source.schema(), vec!["sin".to_string(), "sin_square".to_string()]);

        let sin = source.read_range("sin", Window::new(0, 10_000)).unwrap();
        assert_eq!(
            sin,
            vec![TimeseriesPoint::new(1000, 0.5), TimeseriesPoint::new(3000, -0.5)]
        );
        assert_eq!(source.extent("sin_square").unwrap(), Some((1000, 3000)));
    }

    #[test]
    fn test_from_batches_missing_time_column() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Float64, false)]));
        let result = MemorySource::from_batches(schema, Vec::new(), "time");
        assert!(matches!(result, Err(ViewerError::MissingColumn(_))));
    }

    #[test]
    fn test_float_time_column_rejected() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("time", DataType::Float64, false),
            Field::new("v", DataType::Float64, false),
        ]));
        let result = MemorySource::from_batches(schema, Vec::new(), "time");
        assert!(matches!(result, Err(ViewerError::UnsupportedColumn { .. })));
    }

    #[test]
    fn test_from_csv_integer_time() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "time,sin,cos").unwrap();
        for i in 0..50 {
            writeln!(file, "{},{},{}", i, (i as f64).sin(), (i as f64).cos()).unwrap();
        }
        drop(file);

        let source = MemorySource::from_csv(&path, "time").unwrap();
        assert_eq!(source.schema(), vec!["sin".to_string(), "cos".to_string()]);
        assert_eq!(source.extent("cos").unwrap(), Some((0, 49)));
        assert_eq!(source.read_range("sin", Window::new(10, 20)).unwrap().len(), 10);
    }

    #[test]
    fn test_open_dataset_rejects_unknown_extension() {
        let result = open_dataset(Path::new("data/big.feather"), "time");
        assert!(matches!(result, Err(ViewerError::UnsupportedFormat(_))));
    }
}
