//! Async front of the viewer.
//!
//! Routes events to their session's controller. Reading ranges and
//! reducing them blocks, so every event runs on the blocking pool while the
//! session's lock is held; the lock is FIFO, which keeps responses of one
//! session in the order its events arrived.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::config::ViewerConfig;
use super::controller::{EventOutcome, ViewportController, ViewportEvent};
use super::data::Figure;
use super::downsample::Downsampler;
use super::error::{Result, ViewerError};
use super::relayout::{self, Relayout};
use super::session::{SessionStore, SessionToken, SharedController};
use super::source::SeriesSource;

/// Dataset plus the sessions browsing it.
pub struct Engine {
    source: Arc<dyn SeriesSource>,
    store: Arc<SessionStore>,
    config: ViewerConfig,
}

impl Engine {
    pub fn new(source: Arc<dyn SeriesSource>, config: ViewerConfig) -> Self {
        let store = Arc::new(SessionStore::new(
            source.clone(),
            Downsampler::new(config.downsample_config()),
            config.plot_config(),
        ));
        Self {
            source,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Series names of the dataset.
    pub fn schema(&self) -> Vec<String> {
        self.source.schema()
    }

    pub fn create_session(&self) -> SessionToken {
        self.store.create()
    }

    pub fn end_session(&self, token: SessionToken) -> bool {
        self.store.remove(token)
    }

    /// Start the periodic idle-session eviction.
    pub fn start_eviction(&self) -> JoinHandle<()> {
        self.store
            .spawn_eviction(self.config.eviction_interval(), self.config.idle_timeout())
    }

    /// Selections may (re)establish a session; every other event requires
    /// an existing one.
    fn controller_for(&self, token: SessionToken, selects: bool) -> Result<SharedController> {
        let controller = if selects {
            self.store.get_or_create(token)
        } else {
            self.store.get(token)?
        };
        self.store.touch(token);
        Ok(controller)
    }

    /// Run `f` on the session's controller on the blocking pool.
    async fn with_controller<T, F>(&self, controller: SharedController, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ViewportController) -> T + Send + 'static,
    {
        let mut guard = controller.lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard))
            .await
            .map_err(|e| ViewerError::Task(e.to_string()))
    }

    pub async fn dispatch(&self, token: SessionToken, event: ViewportEvent) -> Result<EventOutcome> {
        debug!(session = %token, seq = event.seq(), "Dispatching event");
        let controller = self.controller_for(token, event.is_selection())?;
        let outcome = self
            .with_controller(controller, move |c| c.handle(event))
            .await?;
        if let Err(e) = &outcome {
            warn!(session = %token, error = %e, "Event rejected");
        }
        outcome
    }

    /// Apply pending events of one session together; see
    /// [`ViewportController::handle_batch`].
    pub async fn dispatch_batch(
        &self,
        token: SessionToken,
        events: Vec<ViewportEvent>,
    ) -> Result<Vec<Result<EventOutcome>>> {
        let selects = events.iter().any(ViewportEvent::is_selection);
        let controller = self.controller_for(token, selects)?;
        self.with_controller(controller, move |c| c.handle_batch(events))
            .await
    }

    /// Translate a browser relayout payload and apply its viewport changes
    /// as one event. `None` when the payload moves no plotted time axis.
    pub async fn dispatch_relayout(
        &self,
        token: SessionToken,
        seq: u64,
        payload: Relayout,
    ) -> Result<Option<EventOutcome>> {
        let controller = self.controller_for(token, false)?;
        let outcome = self
            .with_controller(controller, move |c| -> Result<Option<EventOutcome>> {
                c.require_selection()?;
                let updates = relayout::parse(&payload);
                let changes =
                    relayout::group_changes(&updates, |subplot| c.group_of_subplot(subplot));
                if changes.is_empty() {
                    return Ok(None);
                }
                c.handle_viewports(seq, &changes).map(Some)
            })
            .await?;
        if let Err(e) = &outcome {
            warn!(session = %token, error = %e, "Relayout rejected");
        }
        outcome
    }

    /// Current figure of a session.
    pub async fn figure(&self, token: SessionToken) -> Result<Figure> {
        let controller = self.controller_for(token, false)?;
        let guard = controller.lock().await;
        Ok(guard.figure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::data::{Assignment, TimeseriesPoint, ViewState, Window};
    use crate::viewer::source::MemorySource;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn engine() -> Engine {
        let points: Vec<TimeseriesPoint> = (0..86_400)
            .map(|i| TimeseriesPoint::new(i, (std::f64::consts::TAU * i as f64 / 86_400.0).sin()))
            .collect();
        let source = MemorySource::new()
            .with_series("sin", points.clone())
            .with_series("cos", points);
        Engine::new(
            Arc::new(source),
            ViewerConfig {
                budget: 1000,
                ..Default::default()
            },
        )
    }

    fn select(seq: u64, series: &[&str]) -> ViewportEvent {
        ViewportEvent::SelectSeries {
            seq,
            assignment: Assignment::new(vec![series.iter().map(|s| s.to_string()).collect()]),
        }
    }

    #[tokio::test]
    async fn test_selection_creates_session() {
        let engine = engine();
        let token = SessionToken::new();
        let outcome = engine.dispatch(token, select(1, &["sin"])).await.unwrap();
        let patch = outcome.patch().unwrap();
        assert_eq!(patch.state, ViewState::Rendered);
        assert!(patch.traces[0].data.len() <= 1000);
        assert!(engine.store().contains(token));
    }

    #[tokio::test]
    async fn test_viewport_on_unknown_session_expired() {
        let engine = engine();
        let result = engine
            .dispatch(
                SessionToken::new(),
                ViewportEvent::ViewportChange {
                    seq: 1,
                    group: 0,
                    range: None,
                },
            )
            .await;
        assert!(matches!(result, Err(ViewerError::SessionExpired(_))));
        assert!(matches!(
            engine.figure(SessionToken::new()).await,
            Err(ViewerError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_viewports_settle_on_newest() {
        let engine = Arc::new(engine());
        let token = engine.create_session();
        engine.dispatch(token, select(1, &["sin"])).await.unwrap();

        let mut tasks = Vec::new();
        for seq in 2..10u64 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let start = seq as i64 * 1000;
                engine
                    .dispatch(
                        token,
                        ViewportEvent::ViewportChange {
                            seq,
                            group: 0,
                            range: Some(Window::new(start, start + 500)),
                        },
                    )
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let figure = engine.figure(token).await.unwrap();
        assert_eq!(figure.groups[0].window, Window::new(9000, 9500));
        assert_eq!(figure.state, ViewState::Zoomed);
    }

    #[tokio::test]
    async fn test_relayout_dispatch() {
        let engine = engine();
        let token = engine.create_session();
        engine.dispatch(token, select(1, &["sin", "cos"])).await.unwrap();

        let payload: Relayout = serde_json::from_str(
            r#"{"xaxis.range[0]": 100, "xaxis.range[1]": 199, "yaxis.range[0]": -1}"#,
        )
        .unwrap();
        let outcome = engine
            .dispatch_relayout(token, 2, payload)
            .await
            .unwrap()
            .unwrap();
        let patch = outcome.patch().unwrap();
        assert_eq!(patch.traces.len(), 2);
        assert_eq!(patch.groups[0].window, Window::new(100, 200));
    }

    #[tokio::test]
    async fn test_relayout_without_time_axis_is_noop() {
        let engine = engine();
        let token = engine.create_session();
        engine.dispatch(token, select(1, &["sin"])).await.unwrap();

        let payload: Relayout = serde_json::from_str(r#"{"yaxis.range": [0, 1]}"#).unwrap();
        let outcome = engine.dispatch_relayout(token, 2, payload).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_relayout_without_selection() {
        let engine = engine();
        let token = engine.create_session();
        let payload: Relayout = serde_json::from_str(r#"{"xaxis.autorange": true}"#).unwrap();
        let result = engine.dispatch_relayout(token, 1, payload).await;
        assert!(matches!(result, Err(ViewerError::NoSelection)));
    }

    /// Source whose reads of one series fail once armed.
    struct FlakySource {
        inner: MemorySource,
        broken: &'static str,
        armed: AtomicBool,
    }

    impl SeriesSource for FlakySource {
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

    #[tokio::test]
    async fn test_failed_relayout_moves_no_group() {
        let points: Vec<TimeseriesPoint> =
            (0..10_000).map(|i| TimeseriesPoint::new(i, i as f64)).collect();
        let source = Arc::new(FlakySource {
            inner: MemorySource::new()
                .with_series("sin", points.clone())
                .with_series("cos", points),
            broken: "cos",
            armed: AtomicBool::new(false),
        });
        let engine = Engine::new(source.clone(), ViewerConfig::default());
        let token = engine.create_session();
        engine
            .dispatch(
                token,
                ViewportEvent::SelectSeries {
                    seq: 1,
                    assignment: Assignment::independent(vec![
                        vec!["sin".to_string()],
                        vec!["cos".to_string()],
                    ]),
                },
            )
            .await
            .unwrap();
        let before = engine.figure(token).await.unwrap();

        let payload: Relayout =
            serde_json::from_str(r#"{"xaxis.range": [100, 199], "xaxis2.range": [100, 199]}"#)
                .unwrap();
        source.armed.store(true, Ordering::SeqCst);
        let err = engine
            .dispatch_relayout(token, 2, payload.clone())
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(engine.figure(token).await.unwrap(), before);

        // a retry with the same seq delivers both groups
        source.armed.store(false, Ordering::SeqCst);
        let outcome = engine
            .dispatch_relayout(token, 2, payload)
            .await
            .unwrap()
            .unwrap();
        let patch = outcome.patch().unwrap();
        assert_eq!(patch.traces.len(), 2);
        assert_eq!(patch.groups[0].window, Window::new(100, 200));
        assert_eq!(patch.groups[1].window, Window::new(100, 200));
    }

    #[tokio::test]
    async fn test_clear_on_unknown_session_expired() {
        let engine = engine();
        let token = SessionToken::new();
        let result = engine
            .dispatch(token, ViewportEvent::ClearSelection { seq: 1 })
            .await;
        assert!(matches!(result, Err(ViewerError::SessionExpired(_))));
        assert!(!engine.store().contains(token));
    }

    #[tokio::test]
    async fn test_batch_selection_supersedes_queued_viewport() {
        let engine = engine();
        let token = engine.create_session();
        engine.dispatch(token, select(1, &["sin"])).await.unwrap();

        let results = engine
            .dispatch_batch(
                token,
                vec![
                    select(3, &["cos"]),
                    ViewportEvent::ViewportChange {
                        seq: 2,
                        group: 0,
                        range: Some(Window::new(0, 100)),
                    },
                ],
            )
            .await
            .unwrap();
        assert!(results[0].as_ref().unwrap().is_stale());
        assert!(results[1].as_ref().unwrap().patch().unwrap().rebuilt);

        let figure = engine.figure(token).await.unwrap();
        assert_eq!(figure.state, ViewState::Rendered);
        assert_eq!(figure.traces[0].series, "cos");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_recovers_with_selection() {
        let engine = engine();
        let token = engine.create_session();
        engine.dispatch(token, select(1, &["sin"])).await.unwrap();

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(engine.store().evict_idle(engine.config().idle_timeout()), 1);

        assert!(matches!(
            engine.figure(token).await,
            Err(ViewerError::SessionExpired(_))
        ));
        let outcome = engine.dispatch(token, select(1, &["cos"])).await.unwrap();
        assert!(!outcome.is_stale());
    }
}
