//! CLI binary for the timeseries viewer.
//!
//! Opens a dataset and serves the viewer API on a configurable port.
//!
//! # Usage
//!
//! ```bash
//! tsv-viewer data/big.parquet
//! tsv-viewer data/big.csv --port 8080 --budget 5000
//! tsv-viewer data/            # Directory input (globs for *.parquet)
//! tsv-viewer data/big.parquet --config viewer.yaml --strategy lttb
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use glob::glob;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use timeseries_viewer::viewer::{
    Engine, ParquetSource, SeriesSource, ServerConfig, Strategy, ViewerConfig, open_dataset,
    run_server,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tsv-viewer")]
#[command(about = "Interactive viewer for very large timeseries datasets")]
#[command(version)]
struct Args {
    /// Input parquet or CSV file, or a directory of parquet files
    input: PathBuf,

    /// YAML config file; flags below override its values
    #[arg(short, long, env = "TSV_CONFIG")]
    config: Option<PathBuf>,

    /// Port for web server
    #[arg(short, long, env = "TSV_PORT")]
    port: Option<u16>,

    /// Points per trace
    #[arg(short, long, env = "TSV_BUDGET")]
    budget: Option<usize>,

    /// Maximum number of subplots per figure
    #[arg(long)]
    max_subplots: Option<usize>,

    /// Seconds of inactivity before a session is evicted
    #[arg(long, env = "TSV_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Downsampling strategy
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Name of the time column
    #[arg(long)]
    time_column: Option<String>,

    /// Open a browser once the server is up
    #[arg(long)]
    open_browser: bool,
}

impl Args {
    fn viewer_config(&self) -> Result<ViewerConfig> {
        let mut config = match &self.config {
            Some(path) => ViewerConfig::from_yaml_file(path)?,
            None => ViewerConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(budget) = self.budget {
            config.budget = budget;
        }
        if let Some(max) = self.max_subplots {
            config.max_subplot_groups = max;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(column) = &self.time_column {
            config.time_column = column.clone();
        }
        Ok(config)
    }
}

/// Open a file by extension, or every parquet file under a directory as
/// one dataset.
fn open_input(input: &Path, time_column: &str) -> Result<Arc<dyn SeriesSource>> {
    if !input.is_dir() {
        return open_dataset(input, time_column)
            .with_context(|| format!("Failed to open {}", input.display()));
    }

    let pattern = format!("{}/**/*.parquet", input.display());
    info!(%pattern, "Searching for parquet files");
    let mut files = Vec::new();
    for entry in glob(&pattern)? {
        match entry {
            Ok(path) => files.push(path),
            Err(e) => warn!(error = %e, "glob error"),
        }
    }
    files.sort();
    anyhow::ensure!(!files.is_empty(), "No parquet files found in {}", input.display());

    info!(files = files.len(), "Found parquet files");
    let source = ParquetSource::open_many(&files, time_column)
        .with_context(|| format!("Failed to open parquet files in {}", input.display()))?;
    Ok(Arc::new(source))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.viewer_config()?;

    let source = open_input(&args.input, &config.time_column)?;
    info!(
        input = %args.input.display(),
        series = ?source.schema(),
        budget = config.budget,
        strategy = ?config.strategy,
        "Dataset ready"
    );

    let server_config = ServerConfig {
        port: config.port,
        open_browser: args.open_browser,
    };
    run_server(Engine::new(source, config), server_config).await?;

    Ok(())
}
