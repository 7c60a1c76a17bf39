//! Core data types for the timeseries viewer.
//!
//! These types are shared between the sources, the downsampler, the plot
//! state and the HTTP server.

use serde::{Deserialize, Serialize};

/// A single timeseries sample.
///
/// `time` is in ticks: epoch milliseconds for timestamp columns, the raw
/// value for integer time columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub time: i64,
    pub value: f64,
}

impl TimeseriesPoint {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Window covering an inclusive `(min_t, max_t)` extent.
    pub fn from_extent(min_t: i64, max_t: i64) -> Self {
        Self {
            start: min_t,
            end: max_t.saturating_add(1),
        }
    }

    /// Zero or negative width.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, time: i64) -> bool {
        self.start <= time && time < self.end
    }

    /// Smallest window covering both. Empty windows are ignored.
    pub fn union(self, other: Window) -> Window {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => Window {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            },
        }
    }

    /// Resolve a requested viewport against the full extent: a missing or
    /// zero-width request falls back to the full extent.
    pub fn resolve(requested: Option<Window>, full: Window) -> Window {
        match requested {
            Some(w) if !w.is_empty() => w,
            _ => full,
        }
    }
}

/// How a trace is drawn by the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    #[default]
    Markers,
    Lines,
    LinesMarkers,
}

/// Display style of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStyle {
    pub name: String,
    pub mode: TraceMode,
    pub visible: bool,
    pub show_legend: bool,
}

impl TraceStyle {
    /// Default style for a series: marker mode, shown in the legend.
    pub fn for_series(series: &str) -> Self {
        Self {
            name: series.to_string(),
            mode: TraceMode::Markers,
            visible: true,
            show_legend: true,
        }
    }
}

/// Identity of a trace: one series placed in one subplot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceKey {
    pub subplot: usize,
    pub series: String,
}

impl TraceKey {
    pub fn new(subplot: usize, series: impl Into<String>) -> Self {
        Self {
            subplot,
            series: series.into(),
        }
    }
}

/// A trace bound to a subplot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub key: TraceKey,
    pub group: usize,
    pub style: TraceStyle,
}

/// Output of downsampling: at most `budget` points covering a window.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReducedTrace {
    pub times: Vec<i64>,
    pub values: Vec<f64>,
    /// Number of samples in range before reduction.
    pub source_len: usize,
    /// `source_len / len`, 1 when nothing was dropped.
    pub ratio: f64,
}

impl ReducedTrace {
    pub fn empty() -> Self {
        Self {
            ratio: 1.0,
            ..Default::default()
        }
    }

    pub fn from_points(points: &[TimeseriesPoint], source_len: usize) -> Self {
        let ratio = if points.is_empty() {
            1.0
        } else {
            source_len as f64 / points.len() as f64
        };
        Self {
            times: points.iter().map(|p| p.time).collect(),
            values: points.iter().map(|p| p.value).collect(),
            source_len,
            ratio,
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = TimeseriesPoint> + '_ {
        self.times
            .iter()
            .zip(&self.values)
            .map(|(&time, &value)| TimeseriesPoint { time, value })
    }

    pub fn first(&self) -> Option<TimeseriesPoint> {
        self.points().next()
    }

    pub fn last(&self) -> Option<TimeseriesPoint> {
        let i = self.times.len().checked_sub(1)?;
        Some(TimeseriesPoint::new(self.times[i], self.values[i]))
    }
}

fn default_shared_time_axis() -> bool {
    true
}

/// Series assigned to subplot slots, as chosen by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// One entry per subplot slot. Empty slots are dropped.
    pub subplots: Vec<Vec<String>>,
    /// Stack all subplots on one time axis (a single subplot group).
    #[serde(default = "default_shared_time_axis")]
    pub shared_time_axis: bool,
}

impl Assignment {
    pub fn new(subplots: Vec<Vec<String>>) -> Self {
        Self {
            subplots,
            shared_time_axis: true,
        }
    }

    pub fn independent(subplots: Vec<Vec<String>>) -> Self {
        Self {
            subplots,
            shared_time_axis: false,
        }
    }

    /// Non-empty subplot slots, in order.
    pub fn populated(&self) -> impl Iterator<Item = &Vec<String>> {
        self.subplots.iter().filter(|s| !s.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.populated().next().is_none()
    }
}

/// Lifecycle of a figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    /// No plot.
    #[default]
    Idle,
    /// Every group shows its full extent.
    Rendered,
    /// At least one group shows a narrowed window.
    Zoomed,
}

/// A trace together with its current reduction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceView {
    pub subplot: usize,
    pub group: usize,
    pub series: String,
    pub style: TraceStyle,
    pub window: Window,
    pub data: ReducedTrace,
}

/// Visible window of a subplot group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupView {
    pub group: usize,
    pub window: Window,
    pub full_extent: Window,
}

/// Full figure description for the rendering surface.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Figure {
    pub state: ViewState,
    /// Number of stacked subplot rows.
    pub rows: usize,
    pub groups: Vec<GroupView>,
    pub traces: Vec<TraceView>,
}

/// Changes produced by one applied event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FigurePatch {
    pub seq: u64,
    pub state: ViewState,
    /// The whole figure was rebuilt (selection or clear).
    pub rebuilt: bool,
    pub rows: usize,
    pub groups: Vec<GroupView>,
    /// Traces whose reduction changed.
    pub traces: Vec<TraceView>,
}
