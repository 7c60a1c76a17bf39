//! Timeseries viewer library module.
//!
//! # Architecture
//!
//! - `data` - Core data types (TimeseriesPoint, Window, ReducedTrace, etc.)
//! - `downsample` - Envelope preserving reduction of ordered points
//! - `source` - Dataset source contract, in-memory and CSV backed sources
//! - `parquet_source` - Lazy parquet source with predicate pushdown
//! - `plot_state` - Per-session figure layout and rendered traces
//! - `controller` - Viewport state machine over typed events
//! - `session` - Session table with idle eviction
//! - `engine` - Async dispatch of events onto sessions
//! - `relayout` - Translation of browser relayout payloads into events
//! - `server` - HTTP server and API handlers
//! - `config` - Viewer configuration
//! - `error` - Error taxonomy

pub mod config;
pub mod controller;
pub mod data;
pub mod downsample;
pub mod engine;
pub mod error;
pub mod parquet_source;
pub mod plot_state;
pub mod relayout;
pub mod server;
pub mod session;
pub mod source;

pub use config::ViewerConfig;
pub use controller::{EventOutcome, ViewportController, ViewportEvent};
pub use downsample::{DownsampleConfig, Downsampler, Strategy};
pub use engine::Engine;
pub use error::ViewerError;
pub use parquet_source::ParquetSource;
pub use plot_state::{PlotConfig, PlotState};
pub use server::{ServerConfig, run_server};
pub use session::{SessionStore, SessionToken};
pub use source::{MemorySource, SeriesSource, open_dataset};
