//! Envelope preserving downsampling of ordered timeseries.
//!
//! The first and last in-range points are always kept verbatim. The
//! interior `points[1..n-1]` is partitioned into equal-count buckets (the
//! last bucket absorbs the remainder) and each bucket contributes the points
//! that best preserve the visual envelope:
//!
//! - [`Strategy::MinMax`]: `(budget - 2) / 2` buckets, each emitting its
//!   minimum and maximum value in time order. Global extrema and isolated
//!   spikes always survive.
//! - [`Strategy::Lttb`]: `budget - 2` buckets, each emitting the point that
//!   forms the largest triangle with the previously emitted point and the
//!   mean of the next bucket (Steinarsson, "Downsampling Time Series for
//!   Visual Representation").
//! - [`Strategy::MinMaxLttb`]: MinMax preselection down to
//!   `minmax_ratio * budget` points, then LTTB down to `budget`.
//!
//! All strategies are linear in the input size and deterministic: ties are
//! broken by the lowest index and NaN values are never selected as extrema.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::data::{ReducedTrace, TimeseriesPoint};

/// Smallest budget honored; anything below is clamped.
pub const MIN_BUDGET: usize = 2;

/// Default number of points per trace.
pub const DEFAULT_BUDGET: usize = 10_000;

/// Below this many buckets MinMax runs sequentially.
const PARALLEL_BUCKET_THRESHOLD: usize = 4096;

/// Per-bucket point selection policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    MinMax,
    Lttb,
    MinMaxLttb,
}

/// Downsampler construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownsampleConfig {
    pub strategy: Strategy,
    /// Preselection factor of [`Strategy::MinMaxLttb`].
    pub minmax_ratio: usize,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::MinMax,
            minmax_ratio: 4,
        }
    }
}

/// Reduces ordered points to a bounded-size approximation.
#[derive(Debug, Clone, Default)]
pub struct Downsampler {
    config: DownsampleConfig,
}

impl Downsampler {
    pub fn new(config: DownsampleConfig) -> Self {
        Self { config }
    }

    pub fn with_strategy(strategy: Strategy) -> Self {
        Self::new(DownsampleConfig {
            strategy,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &DownsampleConfig {
        &self.config
    }

    /// Reduce `points` (time ordered) to at most `budget` points.
    ///
    /// Slices no longer than the budget are returned unchanged.
    pub fn reduce(&self, points: &[TimeseriesPoint], budget: usize) -> ReducedTrace {
        let n = points.len();
        let budget = budget.max(MIN_BUDGET);
        if n <= budget {
            return ReducedTrace::from_points(points, n);
        }

        let selected = self.select(points, budget);
        let reduced: Vec<TimeseriesPoint> = selected.iter().map(|&i| points[i]).collect();
        ReducedTrace::from_points(&reduced, n)
    }

    /// Indices of the points kept for `budget`, ascending.
    pub fn select(&self, points: &[TimeseriesPoint], budget: usize) -> Vec<usize> {
        let n = points.len();
        let budget = budget.max(MIN_BUDGET);
        if n <= budget {
            return (0..n).collect();
        }

        match self.config.strategy {
            Strategy::MinMax => minmax_indices(points, budget),
            Strategy::Lttb => lttb_indices(n, budget, |i| points[i]),
            Strategy::MinMaxLttb => {
                let preselect_budget = budget.saturating_mul(self.config.minmax_ratio.max(1));
                if n <= preselect_budget {
                    return lttb_indices(n, budget, |i| points[i]);
                }
                let preselected = minmax_indices(points, preselect_budget);
                if preselected.len() <= budget {
                    return preselected;
                }
                lttb_indices(preselected.len(), budget, |k| points[preselected[k]])
                    .into_iter()
                    .map(|k| preselected[k])
                    .collect()
            }
        }
    }
}

/// First/last plus the min and max of each interior bucket.
fn minmax_indices(points: &[TimeseriesPoint], budget: usize) -> Vec<usize> {
    let n = points.len();
    let n_buckets = (budget - 2) / 2;
    if n_buckets == 0 {
        return vec![0, n - 1];
    }

    let interior = n - 2;
    let bucket_len = interior / n_buckets;
    let bucket_range = |b: usize| {
        let start = 1 + b * bucket_len;
        let end = if b + 1 == n_buckets {
            n - 1
        } else {
            start + bucket_len
        };
        (start, end)
    };

    let pairs: Vec<(usize, usize)> = if n_buckets >= PARALLEL_BUCKET_THRESHOLD {
        (0..n_buckets)
            .into_par_iter()
            .map(|b| {
                let (start, end) = bucket_range(b);
                bucket_extrema(points, start, end)
            })
            .collect()
    } else {
        (0..n_buckets)
            .map(|b| {
                let (start, end) = bucket_range(b);
                bucket_extrema(points, start, end)
            })
            .collect()
    };

    let mut out = Vec::with_capacity(2 + 2 * n_buckets);
    out.push(0);
    for (lo, hi) in pairs {
        out.push(lo);
        if hi != lo {
            out.push(hi);
        }
    }
    out.push(n - 1);
    out
}

/// Indices of the min and max of `points[start..end]`, in ascending order.
fn bucket_extrema(points: &[TimeseriesPoint], start: usize, end: usize) -> (usize, usize) {
    let mut min: Option<(usize, f64)> = None;
    let mut max: Option<(usize, f64)> = None;

    for (i, p) in points[start..end].iter().enumerate() {
        let v = p.value;
        if v.is_nan() {
            continue;
        }
        if min.is_none_or(|(_, m)| v < m) {
            min = Some((start + i, v));
        }
        if max.is_none_or(|(_, m)| v > m) {
            max = Some((start + i, v));
        }
    }

    match (min, max) {
        (Some((a, _)), Some((b, _))) => (a.min(b), a.max(b)),
        _ => (start, start),
    }
}

/// Largest-Triangle-Three-Buckets over `len` points read through `at`.
fn lttb_indices<F>(len: usize, budget: usize, at: F) -> Vec<usize>
where
    F: Fn(usize) -> TimeseriesPoint,
{
    if len <= budget {
        return (0..len).collect();
    }
    if budget <= 2 {
        return vec![0, len - 1];
    }

    // Times relative to the first point keep f64 arithmetic exact for epoch ticks.
    let t0 = at(0).time;
    let x = |p: TimeseriesPoint| (p.time - t0) as f64;

    let n_buckets = budget - 2;
    let every = (len - 2) as f64 / n_buckets as f64;
    let mut out = Vec::with_capacity(budget);
    out.push(0);

    let mut a = 0usize;
    for i in 0..n_buckets {
        let start = (i as f64 * every) as usize + 1;
        // The last bucket always reaches the final interior point.
        let end = if i + 1 == n_buckets {
            len - 1
        } else {
            (((i + 1) as f64 * every) as usize + 1).clamp(start + 1, len - 1)
        };

        let next_start = end;
        let next_end = (((i + 2) as f64 * every) as usize + 1).min(len);
        let (avg_x, avg_y) = if next_end > next_start {
            let count = (next_end - next_start) as f64;
            let (sx, sy) = (next_start..next_end).fold((0.0, 0.0), |(sx, sy), j| {
                let p = at(j);
                (sx + x(p), sy + p.value)
            });
            (sx / count, sy / count)
        } else {
            let last = at(len - 1);
            (x(last), last.value)
        };

        let pa = at(a);
        let (ax, ay) = (x(pa), pa.value);
        let mut max_area = -1.0f64;
        let mut max_idx = start;
        for j in start..end {
            let p = at(j);
            let area = ((ax - avg_x) * (p.value - ay) - (ax - x(p)) * (avg_y - ay)).abs();
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        out.push(max_idx);
        a = max_idx;
    }

    out.push(len - 1);
    out
}
