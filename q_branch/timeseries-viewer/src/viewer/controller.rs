//! Viewport state machine.
//!
//! States: `Idle` (no plot), `Rendered` (every group at full extent),
//! `Zoomed` (some group narrowed). Events carry a client-issued sequence
//! number and are applied last-writer-wins:
//!
//! - a selection or clear is stale when `seq <= selection_seq`
//! - a viewport change is stale when `seq <= max(selection_seq, group_seq)`
//!
//! Stale events never touch the plot and are reported as
//! [`EventOutcome::Stale`].

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::data::{Assignment, Figure, FigurePatch, ViewState, Window};
use super::downsample::Downsampler;
use super::error::{Result, ViewerError};
use super::plot_state::{PlotConfig, PlotState};
use super::source::SeriesSource;

/// Events emitted by the rendering surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewportEvent {
    SelectSeries {
        seq: u64,
        assignment: Assignment,
    },
    ViewportChange {
        seq: u64,
        group: usize,
        /// `None` resets the group to its full extent.
        range: Option<Window>,
    },
    ClearSelection {
        seq: u64,
    },
}

impl ViewportEvent {
    pub fn seq(&self) -> u64 {
        match self {
            ViewportEvent::SelectSeries { seq, .. }
            | ViewportEvent::ViewportChange { seq, .. }
            | ViewportEvent::ClearSelection { seq } => *seq,
        }
    }

    /// Selections and clears rebuild the whole figure.
    pub fn is_rebuild(&self) -> bool {
        !matches!(self, ViewportEvent::ViewportChange { .. })
    }

    pub fn is_selection(&self) -> bool {
        matches!(self, ViewportEvent::SelectSeries { .. })
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied(FigurePatch),
    /// Superseded by a newer event; nothing changed.
    Stale { seq: u64 },
}

impl EventOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, EventOutcome::Stale { .. })
    }

    pub fn patch(&self) -> Option<&FigurePatch> {
        match self {
            EventOutcome::Applied(patch) => Some(patch),
            EventOutcome::Stale { .. } => None,
        }
    }
}

fn is_newer(seq: u64, last: Option<u64>) -> bool {
    last.is_none_or(|last| seq > last)
}

/// Applies events to one session's [`PlotState`].
pub struct ViewportController {
    source: Arc<dyn SeriesSource>,
    downsampler: Arc<Downsampler>,
    plot: PlotState,
    selection_seq: Option<u64>,
    group_seqs: FxHashMap<usize, u64>,
}

impl ViewportController {
    pub fn new(
        source: Arc<dyn SeriesSource>,
        downsampler: Arc<Downsampler>,
        config: PlotConfig,
    ) -> Self {
        Self {
            source,
            downsampler,
            plot: PlotState::new(config),
            selection_seq: None,
            group_seqs: FxHashMap::default(),
        }
    }

    pub fn state(&self) -> ViewState {
        self.plot.state()
    }

    pub fn plot(&self) -> &PlotState {
        &self.plot
    }

    pub fn figure(&self) -> Figure {
        self.plot.snapshot()
    }

    pub fn selection_seq(&self) -> Option<u64> {
        self.selection_seq
    }

    fn is_stale(&self, event: &ViewportEvent) -> bool {
        let seq = event.seq();
        match event {
            ViewportEvent::ViewportChange { group, .. } => {
                let last = self
                    .group_seqs
                    .get(group)
                    .copied()
                    .max(self.selection_seq);
                !is_newer(seq, last)
            }
            _ => !is_newer(seq, self.selection_seq),
        }
    }

    /// Apply one event. Errors leave the plot and the sequence numbers as
    /// they were.
    pub fn handle(&mut self, event: ViewportEvent) -> Result<EventOutcome> {
        let seq = event.seq();
        if self.is_stale(&event) {
            debug!(seq, "Dropping stale event");
            return Ok(EventOutcome::Stale { seq });
        }

        match event {
            ViewportEvent::SelectSeries { assignment, .. } => {
                let figure = self.plot.apply_selection(
                    self.source.as_ref(),
                    &self.downsampler,
                    &assignment,
                )?;
                self.selection_seq = Some(seq);
                self.group_seqs.clear();
                Ok(EventOutcome::Applied(FigurePatch {
                    seq,
                    state: figure.state,
                    rebuilt: true,
                    rows: figure.rows,
                    groups: figure.groups,
                    traces: figure.traces,
                }))
            }
            ViewportEvent::ViewportChange { group, range, .. } => {
                self.handle_viewports(seq, &[(group, range)])
            }
            ViewportEvent::ClearSelection { .. } => {
                self.plot.clear();
                self.selection_seq = Some(seq);
                self.group_seqs.clear();
                Ok(EventOutcome::Applied(FigurePatch {
                    seq,
                    state: ViewState::Idle,
                    rebuilt: true,
                    rows: 0,
                    groups: Vec::new(),
                    traces: Vec::new(),
                }))
            }
        }
    }

    /// Apply viewport changes of several groups carried by one event, as
    /// one commit. Groups that already saw `seq` or a newer event are left
    /// out; when that leaves nothing, the event is stale.
    pub fn handle_viewports(
        &mut self,
        seq: u64,
        changes: &[(usize, Option<Window>)],
    ) -> Result<EventOutcome> {
        self.require_selection()?;
        let fresh: Vec<(usize, Option<Window>)> = changes
            .iter()
            .copied()
            .filter(|(group, _)| {
                let last = self.group_seqs.get(group).copied().max(self.selection_seq);
                is_newer(seq, last)
            })
            .collect();
        if fresh.is_empty() {
            debug!(seq, "Dropping stale viewport change");
            return Ok(EventOutcome::Stale { seq });
        }

        let traces = self.plot.apply_viewports(
            self.source.as_ref(),
            &self.downsampler,
            &fresh,
        )?;
        for (group, _) in &fresh {
            self.group_seqs.insert(*group, seq);
        }
        Ok(EventOutcome::Applied(FigurePatch {
            seq,
            state: self.plot.state(),
            rebuilt: false,
            rows: self.plot.rows(),
            groups: self.plot.group_views(),
            traces,
        }))
    }

    /// Apply a batch of pending events in sequence order.
    ///
    /// When the batch holds a selection or clear, every event older than
    /// the newest of them is superseded and reported stale without being
    /// applied. Results are returned in sequence order.
    pub fn handle_batch(&mut self, mut events: Vec<ViewportEvent>) -> Vec<Result<EventOutcome>> {
        events.sort_by_key(ViewportEvent::seq);
        let newest_rebuild = events
            .iter()
            .filter(|e| e.is_rebuild())
            .map(ViewportEvent::seq)
            .max();

        events
            .into_iter()
            .map(|event| match newest_rebuild {
                Some(rebuild) if event.seq() < rebuild => {
                    debug!(seq = event.seq(), superseded_by = rebuild, "Coalescing event");
                    Ok(EventOutcome::Stale { seq: event.seq() })
                }
                _ => self.handle(event),
            })
            .collect()
    }

    /// Subplot group of a 0-based subplot row, for boundary adapters.
    pub fn group_of_subplot(&self, subplot: usize) -> Option<usize> {
        self.plot.group_of_subplot(subplot)
    }

    /// Reject viewport events while idle without consulting sequence numbers.
    pub fn require_selection(&self) -> Result<()> {
        if self.plot.is_empty() {
            Err(ViewerError::NoSelection)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::data::{TimeseriesPoint, TraceKey};
    use crate::viewer::source::MemorySource;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn controller() -> ViewportController {
        let points: Vec<TimeseriesPoint> = (0..20_000)
            .map(|i| TimeseriesPoint::new(i, (i as f64 / 300.0).sin()))
            .collect();
        let source = MemorySource::new()
            .with_series("sin", points.clone())
            .with_series("cos", points);
        ViewportController::new(
            Arc::new(source),
            Arc::new(Downsampler::default()),
            PlotConfig {
                budget: 500,
                max_subplot_groups: 4,
            },
        )
    }

    fn select(seq: u64, subplots: Vec<Vec<String>>) -> ViewportEvent {
        ViewportEvent::SelectSeries {
            seq,
            assignment: Assignment::independent(subplots),
        }
    }

    fn zoom(seq: u64, group: usize, start: i64, end: i64) -> ViewportEvent {
        ViewportEvent::ViewportChange {
            seq,
            group,
            range: Some(Window::new(start, end)),
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut c = controller();
        assert_eq!(c.state(), ViewState::Idle);

        c.handle(select(1, vec![names(&["sin"])])).unwrap();
        assert_eq!(c.state(), ViewState::Rendered);

        c.handle(zoom(2, 0, 100, 200)).unwrap();
        assert_eq!(c.state(), ViewState::Zoomed);

        c.handle(ViewportEvent::ViewportChange {
            seq: 3,
            group: 0,
            range: None,
        })
        .unwrap();
        assert_eq!(c.state(), ViewState::Rendered);

        c.handle(ViewportEvent::ClearSelection { seq: 4 }).unwrap();
        assert_eq!(c.state(), ViewState::Idle);
        assert_eq!(c.figure(), Figure::default());
    }

    #[test]
    fn test_out_of_order_viewports_keep_newest() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"])])).unwrap();

        assert!(!c.handle(zoom(2, 0, 0, 1000)).unwrap().is_stale());
        assert!(!c.handle(zoom(4, 0, 5000, 6000)).unwrap().is_stale());
        assert!(c.handle(zoom(3, 0, 100, 200)).unwrap().is_stale());

        assert_eq!(c.plot().group_window(0), Some(Window::new(5000, 6000)));
    }

    #[test]
    fn test_viewport_older_than_selection_is_stale() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"])])).unwrap();
        c.handle(select(5, vec![names(&["cos"])])).unwrap();

        let outcome = c.handle(zoom(3, 0, 0, 10)).unwrap();
        assert_eq!(outcome, EventOutcome::Stale { seq: 3 });
        assert_eq!(c.state(), ViewState::Rendered);
        assert_eq!(c.figure().traces[0].series, "cos");

        assert!(c.handle(select(4, vec![names(&["sin"])])).unwrap().is_stale());
    }

    #[test]
    fn test_group_sequences_are_independent() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"]), names(&["cos"])]))
            .unwrap();
        c.handle(zoom(5, 0, 0, 100)).unwrap();
        // older than group 0's last event but newest for group 1
        assert!(!c.handle(zoom(3, 1, 0, 100)).unwrap().is_stale());
        assert!(c.handle(zoom(4, 0, 0, 50)).unwrap().is_stale());
    }

    #[test]
    fn test_viewport_patch_is_scoped() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"]), names(&["cos"])]))
            .unwrap();
        let cos = c.plot().trace_data(&TraceKey::new(1, "cos")).cloned();

        let outcome = c.handle(zoom(2, 0, 1000, 3000)).unwrap();
        let patch = outcome.patch().unwrap();
        assert!(!patch.rebuilt);
        assert_eq!(patch.traces.len(), 1);
        assert_eq!(patch.traces[0].group, 0);
        assert_eq!(patch.state, ViewState::Zoomed);

        assert_eq!(c.plot().trace_data(&TraceKey::new(1, "cos")).cloned(), cos);
    }

    #[test]
    fn test_failed_selection_keeps_sequence() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"])])).unwrap();
        let err = c.handle(select(2, vec![names(&["nope"])])).unwrap_err();
        assert!(matches!(err, ViewerError::SeriesNotFound(_)));
        assert_eq!(c.selection_seq(), Some(1));
        // seq 2 was never applied, so a retry with it is accepted
        assert!(!c.handle(select(2, vec![names(&["cos"])])).unwrap().is_stale());
    }

    #[test]
    fn test_viewport_while_idle() {
        let mut c = controller();
        assert!(matches!(c.handle(zoom(1, 0, 0, 10)), Err(ViewerError::NoSelection)));
        assert!(c.require_selection().is_err());
    }

    /// Source whose reads of one series fail once armed.
    struct BrokenSeries {
        inner: MemorySource,
        broken: &'static str,
        armed: AtomicBool,
    }

    impl SeriesSource for BrokenSeries {
        fn schema(&self) -> Vec<String> {
            self.inner.schema()
        }

        fn read_range(&self, name: &str, window: Window) -> Result<Vec<TimeseriesPoint>> {
            if name == self.broken && self.armed.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("disk gone").into());
            }
            self.inner.read_range(name, window)
        }

        fn extent(&self, name: &str) -> Result<Option<(i64, i64)>> {
            self.inner.extent(name)
        }
    }

    #[test]
    fn test_multi_group_change_commits_together() {
        let points: Vec<TimeseriesPoint> = (0..20_000)
            .map(|i| TimeseriesPoint::new(i, (i as f64 / 300.0).sin()))
            .collect();
        let source = Arc::new(BrokenSeries {
            inner: MemorySource::new()
                .with_series("sin", points.clone())
                .with_series("cos", points),
            broken: "cos",
            armed: AtomicBool::new(false),
        });
        let mut c = ViewportController::new(
            source.clone(),
            Arc::new(Downsampler::default()),
            PlotConfig::default(),
        );
        c.handle(select(1, vec![names(&["sin"]), names(&["cos"])]))
            .unwrap();
        let before = c.figure();

        let changes = [(0, Some(Window::new(100, 200))), (1, Some(Window::new(100, 200)))];
        source.armed.store(true, Ordering::SeqCst);
        assert!(c.handle_viewports(2, &changes).unwrap_err().is_storage());
        assert_eq!(c.figure(), before);

        // nothing was committed, so the same seq is still accepted
        source.armed.store(false, Ordering::SeqCst);
        let outcome = c.handle_viewports(2, &changes).unwrap();
        let patch = outcome.patch().unwrap();
        assert_eq!(patch.traces.len(), 2);
        assert_eq!(patch.state, ViewState::Zoomed);
        assert!(c.handle_viewports(2, &changes).unwrap().is_stale());
    }

    #[test]
    fn test_multi_group_change_skips_stale_groups() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"]), names(&["cos"])]))
            .unwrap();
        c.handle(zoom(5, 0, 0, 100)).unwrap();

        let outcome = c
            .handle_viewports(3, &[(0, Some(Window::new(7, 9))), (1, Some(Window::new(10, 20)))])
            .unwrap();
        let patch = outcome.patch().unwrap();
        assert_eq!(patch.traces.len(), 1);
        assert_eq!(patch.traces[0].group, 1);
        assert_eq!(c.plot().group_window(0), Some(Window::new(0, 100)));
        assert_eq!(c.plot().group_window(1), Some(Window::new(10, 20)));
    }

    #[test]
    fn test_batch_drops_out_of_order_viewport() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"])])).unwrap();

        let results = c.handle_batch(vec![
            zoom(2, 0, 0, 1000),
            zoom(4, 0, 4000, 8000),
            zoom(3, 0, 100, 200),
        ]);
        let stale: Vec<bool> = results
            .into_iter()
            .map(|r| r.unwrap().is_stale())
            .collect();
        // sorted by seq: 2 and 3 apply, then 4
        assert_eq!(stale, vec![false, false, false]);
        assert_eq!(c.plot().group_window(0), Some(Window::new(4000, 8000)));
    }

    #[test]
    fn test_batch_selection_wins() {
        let mut c = controller();
        c.handle(select(1, vec![names(&["sin"])])).unwrap();

        let results = c.handle_batch(vec![
            zoom(2, 0, 0, 1000),
            select(3, vec![names(&["cos"])]),
        ]);
        assert!(results[0].as_ref().unwrap().is_stale());
        let patch = results[1].as_ref().unwrap().patch().unwrap().clone();
        assert!(patch.rebuilt);
        assert_eq!(patch.state, ViewState::Rendered);
        assert_eq!(c.figure().traces[0].series, "cos");
        assert_eq!(c.plot().group_window(0), Some(Window::new(0, 20_000)));
    }

    #[test]
    fn test_batch_keeps_viewport_newer_than_selection() {
        let mut c = controller();
        let results = c.handle_batch(vec![
            zoom(5, 0, 100, 300),
            select(4, vec![names(&["sin"])]),
        ]);
        assert!(results.iter().all(|r| !r.as_ref().unwrap().is_stale()));
        assert_eq!(c.state(), ViewState::Zoomed);
    }
}
