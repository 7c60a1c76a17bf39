//! Browser relayout payloads to viewport changes.
//!
//! The plotting library reports pan/zoom as a flat object keyed by axis
//! attribute path:
//!
//! ```json
//! {"xaxis.range[0]": "2025-01-03 04:00:00", "xaxis.range[1]": "2025-01-04"}
//! {"xaxis2.range": [1735689600000, 1735776000000]}
//! {"xaxis.autorange": true}
//! ```
//!
//! `xaxis` is subplot row 1, `xaxisN` row N. Range ends are inclusive on the
//! wire and become half-open windows here.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::data::Window;

pub type Relayout = serde_json::Map<String, Value>;

/// Range change of one subplot's time axis. `range: None` is an autorange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisUpdate {
    /// 0-based subplot row.
    pub subplot: usize,
    pub range: Option<Window>,
}

#[derive(Default)]
struct PartialRange<'a> {
    start: Option<&'a Value>,
    end: Option<&'a Value>,
    autorange: bool,
}

/// Subplot row of an x axis name (`xaxis`, `xaxis2`, ...).
fn subplot_of_axis(axis: &str) -> Option<usize> {
    let suffix = axis.strip_prefix("xaxis")?;
    if suffix.is_empty() {
        return Some(0);
    }
    match suffix.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n - 1),
        _ => None,
    }
}

/// Parse a range bound to ticks: numbers are ticks, strings are numbers or
/// UTC dates.
pub fn parse_bound(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<f64>() {
                return Some(v);
            }
            parse_date_millis(s).map(|ms| ms as f64)
        }
        _ => None,
    }
}

/// Epoch milliseconds of `YYYY-MM-DD[ HH:MM[:SS[.fff]]]`, read as UTC.
pub fn parse_date_millis(s: &str) -> Option<i64> {
    let s = s.replacen('T', " ", 1);
    let s = s.trim_end_matches('Z');
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Window from inclusive bounds, in either order.
fn window_from_bounds(a: f64, b: f64) -> Option<Window> {
    if !a.is_finite() || !b.is_finite() {
        return None;
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Some(Window::new(lo.floor() as i64, (hi.floor() as i64).saturating_add(1)))
}

/// Extract x-axis range updates, ordered by subplot. Keys of other axes and
/// incomplete ranges are ignored.
pub fn parse(payload: &Relayout) -> Vec<AxisUpdate> {
    let mut partials: BTreeMap<usize, PartialRange<'_>> = BTreeMap::new();

    for (key, value) in payload {
        let Some((axis, attr)) = key.split_once('.') else {
            continue;
        };
        let Some(subplot) = subplot_of_axis(axis) else {
            continue;
        };
        let partial = partials.entry(subplot).or_default();
        match attr {
            "range[0]" => partial.start = Some(value),
            "range[1]" => partial.end = Some(value),
            "range" => {
                if let Some([start, end]) = value.as_array().map(Vec::as_slice) {
                    partial.start = Some(start);
                    partial.end = Some(end);
                }
            }
            "autorange" => partial.autorange = value.as_bool().unwrap_or(false),
            _ => {}
        }
    }

    partials
        .into_iter()
        .filter_map(|(subplot, partial)| {
            if partial.autorange {
                return Some(AxisUpdate {
                    subplot,
                    range: None,
                });
            }
            let start = parse_bound(partial.start?)?;
            let end = parse_bound(partial.end?)?;
            Some(AxisUpdate {
                subplot,
                range: Some(window_from_bounds(start, end)?),
            })
        })
        .collect()
}

/// One range per subplot group, in subplot order. Rows sharing a group are
/// linked on the client, so the first row's range stands for the group.
pub fn group_changes<F>(updates: &[AxisUpdate], group_of: F) -> Vec<(usize, Option<Window>)>
where
    F: Fn(usize) -> Option<usize>,
{
    let mut changes: Vec<(usize, Option<Window>)> = Vec::new();
    for update in updates {
        let Some(group) = group_of(update.subplot) else {
            continue;
        };
        if changes.iter().any(|(g, _)| *g == group) {
            continue;
        }
        changes.push((group, update.range));
    }
    changes
}
