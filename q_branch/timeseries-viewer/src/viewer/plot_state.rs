//! Server-held figure of one session.
//!
//! A [`PlotState`] owns the subplot layout, the trace bindings and, per
//! trace, the last reduction together with the window it covers. Both
//! mutations follow the same three steps:
//!
//! 1. plan: decide which traces to reduce over which window
//! 2. execute: read and reduce every planned trace, without touching `self`
//! 3. commit: swap the results in only when every trace succeeded
//!
//! A storage failure in step 2 therefore leaves the last good snapshot in
//! place.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::data::{
    Assignment, Figure, GroupView, ReducedTrace, Trace, TraceKey, TraceStyle, TraceView,
    ViewState, Window,
};
use super::downsample::{DEFAULT_BUDGET, Downsampler};
use super::error::{Result, ViewerError};
use super::source::SeriesSource;

/// Default number of subplots a selection may populate.
pub const DEFAULT_MAX_SUBPLOT_GROUPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotConfig {
    /// Points per trace.
    pub budget: usize,
    pub max_subplot_groups: usize,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            budget: DEFAULT_BUDGET,
            max_subplot_groups: DEFAULT_MAX_SUBPLOT_GROUPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct GroupState {
    window: Window,
    full_extent: Window,
}

#[derive(Debug, Clone, PartialEq)]
struct Rendered {
    window: Window,
    data: ReducedTrace,
}

/// One trace to reduce over one window.
struct ReductionJob {
    key: TraceKey,
    window: Window,
}

/// Reductions to run for one mutation.
struct ReductionPlan {
    jobs: Vec<ReductionJob>,
}

impl ReductionPlan {
    fn execute(
        self,
        source: &dyn SeriesSource,
        downsampler: &Downsampler,
        budget: usize,
    ) -> Result<Vec<(TraceKey, Rendered)>> {
        self.jobs
            .into_par_iter()
            .map(|job| {
                let points = source.read_range(&job.key.series, job.window)?;
                let data = downsampler.reduce(&points, budget);
                Ok((
                    job.key,
                    Rendered {
                        window: job.window,
                        data,
                    },
                ))
            })
            .collect()
    }
}

/// Layout and rendered traces of one session's figure.
#[derive(Debug, Clone, Default)]
pub struct PlotState {
    config: PlotConfig,
    /// Traces in subplot order, then selection order.
    traces: Vec<Trace>,
    rows: usize,
    /// Subplot index to subplot group.
    subplot_groups: Vec<usize>,
    groups: Vec<GroupState>,
    rendered: FxHashMap<TraceKey, Rendered>,
}

impl PlotState {
    pub fn new(config: PlotConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &PlotConfig {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn state(&self) -> ViewState {
        if self.traces.is_empty() {
            ViewState::Idle
        } else if self.groups.iter().any(|g| g.window != g.full_extent) {
            ViewState::Zoomed
        } else {
            ViewState::Rendered
        }
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Subplot group of a 0-based subplot row.
    pub fn group_of_subplot(&self, subplot: usize) -> Option<usize> {
        self.subplot_groups.get(subplot).copied()
    }

    pub fn group_window(&self, group: usize) -> Option<Window> {
        self.groups.get(group).map(|g| g.window)
    }

    pub fn full_extent(&self, group: usize) -> Option<Window> {
        self.groups.get(group).map(|g| g.full_extent)
    }

    /// Last reduction of a trace.
    pub fn trace_data(&self, key: &TraceKey) -> Option<&ReducedTrace> {
        self.rendered.get(key).map(|r| &r.data)
    }

    /// Replace the figure with a new assignment, every group at its full
    /// extent. An assignment without series clears the figure.
    pub fn apply_selection(
        &mut self,
        source: &dyn SeriesSource,
        downsampler: &Downsampler,
        assignment: &Assignment,
    ) -> Result<Figure> {
        let subplots: Vec<&Vec<String>> = assignment.populated().collect();
        if subplots.len() > self.config.max_subplot_groups {
            return Err(ViewerError::TooManySubplots {
                requested: subplots.len(),
                max: self.config.max_subplot_groups,
            });
        }

        let schema = source.schema();
        if let Some(missing) = subplots
            .iter()
            .flat_map(|names| names.iter())
            .find(|name| !schema.contains(*name))
        {
            return Err(ViewerError::SeriesNotFound(missing.clone()));
        }

        if subplots.is_empty() {
            self.clear();
            return Ok(self.snapshot());
        }

        let mut traces: Vec<Trace> = Vec::new();
        let mut subplot_groups = Vec::with_capacity(subplots.len());
        for (subplot, names) in subplots.iter().enumerate() {
            let group = if assignment.shared_time_axis { 0 } else { subplot };
            subplot_groups.push(group);
            for name in names.iter() {
                let key = TraceKey::new(subplot, name.as_str());
                if traces.iter().any(|t| t.key == key) {
                    continue;
                }
                traces.push(Trace {
                    key,
                    group,
                    style: TraceStyle::for_series(name),
                });
            }
        }

        let group_count = subplot_groups.iter().max().map_or(0, |g| g + 1);
        let mut groups = vec![Window::new(0, 0); group_count];
        for trace in &traces {
            if let Some((lo, hi)) = source.extent(&trace.key.series)? {
                let extent = Window::from_extent(lo, hi);
                groups[trace.group] = groups[trace.group].union(extent);
            }
        }
        let groups: Vec<GroupState> = groups
            .into_iter()
            .map(|full_extent| GroupState {
                window: full_extent,
                full_extent,
            })
            .collect();

        let plan = ReductionPlan {
            jobs: traces
                .iter()
                .map(|t| ReductionJob {
                    key: t.key.clone(),
                    window: groups[t.group].window,
                })
                .collect(),
        };
        let rendered = plan.execute(source, downsampler, self.config.budget)?;

        self.rows = subplots.len();
        self.subplot_groups = subplot_groups;
        self.groups = groups;
        self.traces = traces;
        self.rendered = rendered.into_iter().collect();

        info!(
            rows = self.rows,
            groups = self.groups.len(),
            traces = self.traces.len(),
            "Applied selection"
        );
        Ok(self.snapshot())
    }

    /// Move one subplot group to `range` (`None` or an empty range resets to
    /// the full extent) and re-reduce only that group's traces.
    ///
    /// Returns the views of the re-reduced traces.
    pub fn apply_viewport(
        &mut self,
        source: &dyn SeriesSource,
        downsampler: &Downsampler,
        group: usize,
        range: Option<Window>,
    ) -> Result<Vec<TraceView>> {
        self.apply_viewports(source, downsampler, &[(group, range)])
    }

    /// Move several subplot groups at once. Either every group moves or,
    /// on any failure, none does.
    ///
    /// A group listed twice keeps its first range.
    pub fn apply_viewports(
        &mut self,
        source: &dyn SeriesSource,
        downsampler: &Downsampler,
        changes: &[(usize, Option<Window>)],
    ) -> Result<Vec<TraceView>> {
        if self.traces.is_empty() {
            return Err(ViewerError::NoSelection);
        }

        let mut windows: Vec<(usize, Window)> = Vec::with_capacity(changes.len());
        for &(group, range) in changes {
            let state = self
                .groups
                .get(group)
                .copied()
                .ok_or(ViewerError::UnknownGroup(group))?;
            if windows.iter().all(|(g, _)| *g != group) {
                windows.push((group, Window::resolve(range, state.full_extent)));
            }
        }

        let plan = ReductionPlan {
            jobs: self
                .traces
                .iter()
                .filter_map(|t| {
                    let (_, window) = windows.iter().find(|(g, _)| *g == t.group)?;
                    Some(ReductionJob {
                        key: t.key.clone(),
                        window: *window,
                    })
                })
                .collect(),
        };
        let rendered = plan.execute(source, downsampler, self.config.budget)?;

        for &(group, window) in &windows {
            self.groups[group].window = window;
            debug!(
                group,
                start = window.start,
                end = window.end,
                "Applied viewport"
            );
        }
        let keys: Vec<TraceKey> = rendered.iter().map(|(k, _)| k.clone()).collect();
        self.rendered.extend(rendered);

        Ok(self
            .traces
            .iter()
            .filter(|t| keys.contains(&t.key))
            .filter_map(|t| self.view_of(t))
            .collect())
    }

    pub fn clear(&mut self) {
        self.traces.clear();
        self.rows = 0;
        self.subplot_groups.clear();
        self.groups.clear();
        self.rendered.clear();
    }

    /// Current figure for rendering.
    pub fn snapshot(&self) -> Figure {
        Figure {
            state: self.state(),
            rows: self.rows,
            groups: self.group_views(),
            traces: self.traces.iter().filter_map(|t| self.view_of(t)).collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn group_views(&self) -> Vec<GroupView> {
        self.groups
            .iter()
            .enumerate()
            .map(|(group, g)| GroupView {
                group,
                window: g.window,
                full_extent: g.full_extent,
            })
            .collect()
    }

    fn view_of(&self, trace: &Trace) -> Option<TraceView> {
        let rendered = self.rendered.get(&trace.key)?;
        Some(TraceView {
            subplot: trace.key.subplot,
            group: trace.group,
            series: trace.key.series.clone(),
            style: trace.style.clone(),
            window: rendered.window,
            data: rendered.data.clone(),
        })
    }
}
