//! Synthetic dataset generator for the viewer.
//!
//! Writes one sample per second starting 2025-01-01 00:00:00 UTC with the
//! columns `sin`, `cos`, `noisy-sin`, `noisy-cos`, `sin_square` and
//! `cos_square`. The waves have a period of one day.
//!
//! Usage:
//!   cargo run --release --bin generate-bigdata
//!   cargo run --release --bin generate-bigdata -- --days 7 --csv
//!   cargo run --release --bin generate-bigdata -- --help

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Builder, Int8Builder, TimestampMillisecondBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate};
use clap::Parser;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::f64::consts::TAU;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

/// Samples per wave period.
const PERIOD: u64 = 86_400;

/// Width of the uniform noise added to the noisy columns.
const NOISE_WIDTH: f64 = 0.1;

/// Rows built per record batch.
const BATCH_ROWS: u64 = 86_400;

#[derive(Parser)]
#[command(name = "generate-bigdata")]
#[command(about = "Generate a large synthetic timeseries dataset")]
struct Args {
    /// Output directory
    #[arg(short, long, default_value = "data")]
    output_dir: PathBuf,

    /// Number of days to generate
    #[arg(short, long, default_value = "30")]
    days: u64,

    /// Rows per parquet row group
    #[arg(long, default_value = "86400")]
    row_group_rows: usize,

    /// Seed of the noise generator
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Also write big.csv next to the parquet file
    #[arg(long)]
    csv: bool,
}

/// SplitMix64 generator; the same seed yields the same dataset.
struct Noise(u64);

impl Noise {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[-width / 2, width / 2)`.
    fn sample(&mut self, width: f64) -> f64 {
        let unit = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        (unit - 0.5) * width
    }
}

fn square_wave(x: f64) -> i8 {
    if x > 0.0 { 1 } else { -1 }
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "time",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new("sin", DataType::Float64, false),
        Field::new("cos", DataType::Float64, false),
        Field::new("noisy-sin", DataType::Float64, false),
        Field::new("noisy-cos", DataType::Float64, false),
        Field::new("sin_square", DataType::Int8, false),
        Field::new("cos_square", DataType::Int8, false),
    ]))
}

fn build_batch(
    schema: &SchemaRef,
    base_time_ms: i64,
    first_row: u64,
    num_rows: u64,
    noise: &mut Noise,
) -> Result<RecordBatch> {
    let capacity = num_rows as usize;
    let mut time = TimestampMillisecondBuilder::with_capacity(capacity);
    let mut sin = Float64Builder::with_capacity(capacity);
    let mut cos = Float64Builder::with_capacity(capacity);
    let mut noisy_sin = Float64Builder::with_capacity(capacity);
    let mut noisy_cos = Float64Builder::with_capacity(capacity);
    let mut sin_square = Int8Builder::with_capacity(capacity);
    let mut cos_square = Int8Builder::with_capacity(capacity);

    for row in first_row..first_row + num_rows {
        let phase = row as f64 * TAU / PERIOD as f64;
        let (s, c) = phase.sin_cos();

        time.append_value(base_time_ms + row as i64 * 1000);
        sin.append_value(s);
        cos.append_value(c);
        noisy_sin.append_value(s + noise.sample(NOISE_WIDTH));
        noisy_cos.append_value(c + noise.sample(NOISE_WIDTH));
        sin_square.append_value(square_wave(s));
        cos_square.append_value(square_wave(c));
    }

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(time.finish()),
        Arc::new(sin.finish()),
        Arc::new(cos.finish()),
        Arc::new(noisy_sin.finish()),
        Arc::new(noisy_cos.finish()),
        Arc::new(sin_square.finish()),
        Arc::new(cos_square.finish()),
    ];
    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let start = NaiveDate::from_ymd_opt(2025, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .context("invalid start date")?
        .and_utc();
    let base_time_ms = start.timestamp_millis();
    let total_rows = args.days * PERIOD;
    let end = DateTime::from_timestamp_millis(base_time_ms + total_rows as i64 * 1000)
        .context("end time out of range")?;

    println!("Generating dataset:");
    println!("  Range: {} .. {}", start, end);
    println!("  Rows: {}", total_rows);
    println!("  Row group rows: {}", args.row_group_rows);
    println!("  Output: {}", args.output_dir.display());

    fs::create_dir_all(&args.output_dir)?;
    let parquet_path = args.output_dir.join("big.parquet");
    let csv_path = args.output_dir.join("big.csv");

    let schema = schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_max_row_group_size(args.row_group_rows.max(1))
        .build();
    let file = File::create(&parquet_path)
        .with_context(|| format!("Failed to create {}", parquet_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

    let mut csv_writer = if args.csv {
        let file = File::create(&csv_path)
            .with_context(|| format!("Failed to create {}", csv_path.display()))?;
        Some(arrow::csv::WriterBuilder::new().with_header(true).build(file))
    } else {
        None
    };

    let mut noise = Noise(args.seed);
    let mut written = 0u64;
    while written < total_rows {
        let this_batch = (total_rows - written).min(BATCH_ROWS);
        let batch = build_batch(&schema, base_time_ms, written, this_batch, &mut noise)?;
        writer.write(&batch)?;
        if let Some(csv) = csv_writer.as_mut() {
            csv.write(&batch)?;
        }
        written += this_batch;
        print!("\r  Written {}/{} rows", written, total_rows);
    }
    writer.close()?;
    println!("\n  Done!");

    println!("\nSummary:");
    let parquet_size = fs::metadata(&parquet_path)?.len();
    println!(
        "  {}: {:.1} MB",
        parquet_path.display(),
        parquet_size as f64 / 1_000_000.0
    );
    if csv_writer.is_some() {
        drop(csv_writer);
        let csv_size = fs::metadata(&csv_path)?.len();
        println!(
            "  {}: {:.1} MB",
            csv_path.display(),
            csv_size as f64 / 1_000_000.0
        );
    }

    Ok(())
}
