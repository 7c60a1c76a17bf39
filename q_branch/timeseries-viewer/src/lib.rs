//! Interactive exploration of very large timeseries datasets.
//!
//! A browser never receives the raw data. Instead the server keeps a
//! full-resolution reference per session and answers every selection or
//! pan/zoom with a bounded-size approximation of the visible range.
//!
//! ## Architecture
//!
//! The viewer consists of five main components:
//!
//! 1. **Series sources** (`viewer::source`, `viewer::parquet_source`) - Range
//!    restricted reads of one named column, with predicate pushdown when the
//!    file format allows it.
//!
//! 2. **Downsampler** (`viewer::downsample`) - Reduces an ordered slice of
//!    points to a budget while keeping the visual envelope.
//!
//! 3. **Plot state** (`viewer::plot_state`) - Subplot layout, trace bindings
//!    and the last rendered window of every trace.
//!
//! 4. **Viewport controller** (`viewer::controller`) - Typed event state
//!    machine with sequence-number based staleness.
//!
//! 5. **Session store** (`viewer::session`) - One controller per session
//!    token, serialized per session and evicted when idle.
//!
//! ## Usage
//!
//! ```bash
//! generate-bigdata --output-dir data
//! tsv-viewer data/big.parquet --port 8050
//! ```

pub mod viewer;
