use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::span::{Span, SpanNode, SpanTree};
use crate::config::TracePollerConfig;
use crate::errors::{FetchError, TraceError};
use crate::model::{SpanId, TaskId, TraceId};
use crate::transport::{TaskInfo, TraceApi};

const UPDATE_BUFFER_CAPACITY: usize = 64;

/// Whether a polling session is active.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollPhase {
    Idle,
    Polling,
}

/// Change notifications published after each tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceUpdate {
    /// Span count differs from the previous successful fetch.
    ///
    /// Only the count is compared: a span whose fields change while the
    /// count stays the same does not produce this update.
    CountChanged { previous: usize, current: usize },
    /// The selected span is absent from the latest span list.
    SelectionCleared { span_id: SpanId },
    /// The fetch failed and the span list was cleared.
    FetchFailed { error: FetchError },
}

/// Summary of one completed tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickReport {
    pub previous_count: usize,
    pub span_count: usize,
    pub count_changed: bool,
    pub selection_cleared: bool,
}

/// Span state published to readers after every tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanSnapshot {
    pub task_id: Option<TaskId>,
    pub trace_id: Option<TraceId>,
    pub spans: Vec<Span>,
    pub selected: Option<Span>,
    pub last_error: Option<FetchError>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl SpanSnapshot {
    fn empty_for(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn span(&self, id: &SpanId) -> Option<&Span> {
        self.spans.iter().find(|span| &span.id == id)
    }

    pub fn tree(&self) -> Vec<SpanNode> {
        SpanTree::build(&self.spans)
    }
}

struct PollerState {
    phase: PollPhase,
    /// Bumped by every start and stop; ticks from older generations are stale.
    generation: u64,
    task_id: Option<TaskId>,
    explicit_trace_id: Option<TraceId>,
    /// A fetch is in flight.
    locked: bool,
    last_fetch_at: Option<Instant>,
    last_count: usize,
    selected: Option<SpanId>,
    stop_tx: Option<watch::Sender<bool>>,
}

struct PollerInner {
    api: Arc<dyn TraceApi>,
    config: TracePollerConfig,
    state: Mutex<PollerState>,
    unlocked: Notify,
    snapshot_tx: watch::Sender<SpanSnapshot>,
    updates_tx: broadcast::Sender<TraceUpdate>,
}

enum Wait {
    Unlock,
    Spacing(Duration),
}

/// Clears the in-flight flag when the fetch finishes or its future is dropped.
struct FetchLock<'a> {
    inner: &'a PollerInner,
}

impl Drop for FetchLock<'_> {
    fn drop(&mut self) {
        self.inner.lock_state().locked = false;
        self.inner.unlocked.notify_waiters();
    }
}

impl PollerInner {
    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock_state();
        state.generation == generation && state.phase == PollPhase::Polling
    }

    fn stop_generation(&self, generation: u64) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation || state.phase != PollPhase::Polling {
            return false;
        }
        state.phase = PollPhase::Idle;
        state.generation += 1;
        if let Some(stop_tx) = state.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        info!(task_id = ?state.task_id, "trace polling stopped");
        drop(state);
        // Refreshers parked on the lock must observe the cancellation.
        self.unlocked.notify_waiters();
        true
    }

    async fn tick(&self, generation: u64, manual: bool) -> Result<TickReport, TraceError> {
        let (task_id, cached_trace_id, fetch_lock) = loop {
            let unlocked = self.unlocked.notified();
            tokio::pin!(unlocked);
            unlocked.as_mut().enable();

            let wait = {
                let mut state = self.lock_state();
                if state.generation != generation || state.phase != PollPhase::Polling {
                    return Err(TraceError::Cancelled);
                }
                let Some(task_id) = state.task_id.clone() else {
                    return Err(TraceError::NotStarted);
                };
                let remaining = state
                    .last_fetch_at
                    .map(|at| self.config.min_spacing.saturating_sub(at.elapsed()))
                    .filter(|remaining| !remaining.is_zero());
                if state.locked {
                    Wait::Unlock
                } else if let (false, Some(remaining)) = (manual, remaining) {
                    Wait::Spacing(remaining)
                } else {
                    state.locked = true;
                    state.last_fetch_at = Some(Instant::now());
                    break (
                        task_id,
                        state.explicit_trace_id.clone(),
                        FetchLock { inner: self },
                    );
                }
            };
            match wait {
                Wait::Unlock => unlocked.await,
                Wait::Spacing(remaining) => {
                    debug!(remaining_ms = remaining.as_millis() as u64, "trace tick deferred");
                    tokio::time::sleep(remaining).await;
                }
            }
        };

        let trace_id = match cached_trace_id {
            Some(trace_id) => trace_id,
            None => self.resolve_trace_id(&task_id, generation).await,
        };
        debug!(task_id = %task_id, trace_id = %trace_id, manual, "fetching spans");
        let result = self.api.fetch_spans(&task_id, &trace_id).await;
        let report = self.apply(generation, task_id, trace_id, result);
        drop(fetch_lock);
        report
    }

    async fn resolve_trace_id(&self, task_id: &TaskId, generation: u64) -> TraceId {
        match self.api.fetch_task(task_id).await {
            Ok(TaskInfo {
                trace_id: Some(trace_id),
                ..
            }) => {
                let mut state = self.lock_state();
                if state.generation == generation {
                    state.explicit_trace_id = Some(trace_id.clone());
                }
                trace_id
            }
            Ok(_) => TraceId::from(task_id),
            Err(err) => {
                debug!(task_id = %task_id, error = %err, "task lookup failed; tracing under task id");
                TraceId::from(task_id)
            }
        }
    }

    fn apply(
        &self,
        generation: u64,
        task_id: TaskId,
        trace_id: TraceId,
        result: Result<Vec<Span>, FetchError>,
    ) -> Result<TickReport, TraceError> {
        let mut state = self.lock_state();
        if state.generation != generation || state.phase != PollPhase::Polling {
            debug!(task_id = %task_id, "discarding span fetch from a stopped session");
            return Err(TraceError::Cancelled);
        }
        match result {
            Ok(spans) => {
                let previous = state.last_count;
                let current = spans.len();
                state.last_count = current;
                let selected = state
                    .selected
                    .as_ref()
                    .and_then(|id| spans.iter().find(|span| &span.id == id).cloned());
                let cleared = if selected.is_none() {
                    state.selected.take()
                } else {
                    None
                };
                self.snapshot_tx.send_replace(SpanSnapshot {
                    task_id: Some(task_id),
                    trace_id: Some(trace_id),
                    spans,
                    selected,
                    last_error: None,
                    fetched_at: Some(Utc::now()),
                });
                drop(state);

                let count_changed = previous != current;
                if count_changed {
                    debug!(previous, current, "span count changed");
                    let _ = self
                        .updates_tx
                        .send(TraceUpdate::CountChanged { previous, current });
                }
                let selection_cleared = cleared.is_some();
                if let Some(span_id) = cleared {
                    let _ = self.updates_tx.send(TraceUpdate::SelectionCleared { span_id });
                }
                Ok(TickReport {
                    previous_count: previous,
                    span_count: current,
                    count_changed,
                    selection_cleared,
                })
            }
            Err(error) => {
                let cleared = state.selected.take();
                self.snapshot_tx.send_replace(SpanSnapshot {
                    task_id: Some(task_id),
                    trace_id: Some(trace_id),
                    spans: Vec::new(),
                    selected: None,
                    last_error: Some(error.clone()),
                    fetched_at: Some(Utc::now()),
                });
                drop(state);

                let _ = self.updates_tx.send(TraceUpdate::FetchFailed {
                    error: error.clone(),
                });
                if let Some(span_id) = cleared {
                    let _ = self.updates_tx.send(TraceUpdate::SelectionCleared { span_id });
                }
                Err(TraceError::Fetch(error))
            }
        }
    }
}

async fn drive(inner: Arc<PollerInner>, generation: u64, mut stop_rx: watch::Receiver<bool>) {
    loop {
        match inner.tick(generation, false).await {
            Ok(report) => debug!(spans = report.span_count, "trace tick completed"),
            Err(TraceError::Fetch(err)) => {
                warn!(error = %err, "span fetch failed; polling continues");
            }
            Err(TraceError::Cancelled | TraceError::NotStarted) => break,
        }
        if !inner.is_current(generation) {
            break;
        }
        // Measured from completion so a slow fetch never causes back-to-back fetches.
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(inner.config.interval) => {}
        }
    }
    debug!(generation, "trace poll loop exited");
}

/// Periodically fetches the span list of one task and publishes it.
///
/// At most one fetch is ever in flight, and fetch starts are spaced by at
/// least `min_spacing` unless a manual refresh asks otherwise. Cloning yields
/// another handle to the same poller.
#[derive(Clone)]
pub struct TracePoller {
    inner: Arc<PollerInner>,
}

impl TracePoller {
    pub fn new(api: Arc<dyn TraceApi>, config: TracePollerConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(SpanSnapshot::default());
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER_CAPACITY);
        Self {
            inner: Arc::new(PollerInner {
                api,
                config,
                state: Mutex::new(PollerState {
                    phase: PollPhase::Idle,
                    generation: 0,
                    task_id: None,
                    explicit_trace_id: None,
                    locked: false,
                    last_fetch_at: None,
                    last_count: 0,
                    selected: None,
                    stop_tx: None,
                }),
                unlocked: Notify::new(),
                snapshot_tx,
                updates_tx,
            }),
        }
    }

    /// Starts polling `task_id`, replacing any active session. The first tick
    /// runs immediately. Must be called from within a tokio runtime.
    pub fn start(&self, task_id: TaskId) -> PollHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let generation = {
            let mut state = self.inner.lock_state();
            if let Some(previous) = state.stop_tx.take() {
                let _ = previous.send(true);
            }
            state.generation += 1;
            state.phase = PollPhase::Polling;
            state.stop_tx = Some(stop_tx);
            if state.task_id.as_ref() != Some(&task_id) {
                state.task_id = Some(task_id.clone());
                state.explicit_trace_id = None;
                state.last_count = 0;
                state.selected = None;
                self.inner
                    .snapshot_tx
                    .send_replace(SpanSnapshot::empty_for(task_id.clone()));
            }
            state.generation
        };
        self.inner.unlocked.notify_waiters();
        info!(task_id = %task_id, interval_ms = self.inner.config.interval.as_millis() as u64, "trace polling started");
        tokio::spawn(drive(self.inner.clone(), generation, stop_rx));
        PollHandle {
            inner: self.inner.clone(),
            generation,
        }
    }

    /// Stops the active session, if any. In-flight results are discarded.
    pub fn stop(&self) -> bool {
        let generation = self.inner.lock_state().generation;
        self.inner.stop_generation(generation)
    }

    /// Fetches now, ignoring the minimum spacing once. Waits for an in-flight
    /// fetch to finish instead of overlapping it.
    pub async fn refresh_now(&self) -> Result<TickReport, TraceError> {
        let generation = {
            let state = self.inner.lock_state();
            if state.phase != PollPhase::Polling {
                return Err(TraceError::NotStarted);
            }
            state.generation
        };
        self.inner.tick(generation, true).await
    }

    /// Selects a span by id from the current list, or clears the selection.
    /// Returns false when the id is not in the current list.
    pub fn select_span(&self, span_id: Option<SpanId>) -> bool {
        let mut state = self.inner.lock_state();
        let Some(span_id) = span_id else {
            state.selected = None;
            self.inner.snapshot_tx.send_modify(|s| s.selected = None);
            return true;
        };
        let found = self.inner.snapshot_tx.borrow().span(&span_id).cloned();
        match found {
            Some(span) => {
                state.selected = Some(span_id);
                self.inner.snapshot_tx.send_modify(|s| s.selected = Some(span));
                true
            }
            None => false,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.inner.lock_state().phase
    }

    pub fn snapshot(&self) -> SpanSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receiver of the span state, updated after every tick.
    pub fn subscribe(&self) -> watch::Receiver<SpanSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Receiver of change notifications.
    pub fn updates(&self) -> broadcast::Receiver<TraceUpdate> {
        self.inner.updates_tx.subscribe()
    }
}

/// Handle of one polling session.
pub struct PollHandle {
    inner: Arc<PollerInner>,
    generation: u64,
}

impl PollHandle {
    /// Stops this session. No-op if it was already stopped or replaced.
    pub fn stop(&self) -> bool {
        self.inner.stop_generation(self.generation)
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_current(self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::test_span;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTraceApi {
        batches: Mutex<VecDeque<Result<Vec<Span>, FetchError>>>,
        last: Mutex<Option<Result<Vec<Span>, FetchError>>>,
        delay: Duration,
        trace_id: Option<TraceId>,
        calls: AtomicUsize,
        started: Mutex<Vec<Instant>>,
        completed: Mutex<Vec<Instant>>,
        trace_ids: Mutex<Vec<TraceId>>,
    }

    impl FakeTraceApi {
        fn build(
            delay_ms: u64,
            batches: Vec<Result<Vec<Span>, FetchError>>,
            trace_id: Option<TraceId>,
        ) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                last: Mutex::new(None),
                delay: Duration::from_millis(delay_ms),
                trace_id,
                calls: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
                completed: Mutex::new(Vec::new()),
                trace_ids: Mutex::new(Vec::new()),
            })
        }

        fn new(delay_ms: u64, batches: Vec<Result<Vec<Span>, FetchError>>) -> Arc<Self> {
            Self::build(delay_ms, batches, None)
        }

        fn with_trace_id(trace_id: &str) -> Arc<Self> {
            Self::build(0, vec![Ok(Vec::new())], Some(TraceId::new(trace_id)))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn started(&self) -> Vec<Instant> {
            self.started.lock().expect("started lock").clone()
        }

        fn completed(&self) -> Vec<Instant> {
            self.completed.lock().expect("completed lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl TraceApi for FakeTraceApi {
        async fn fetch_task(&self, _task_id: &TaskId) -> Result<TaskInfo, FetchError> {
            Ok(TaskInfo {
                trace_id: self.trace_id.clone(),
                status: None,
            })
        }

        async fn fetch_spans(
            &self,
            _task_id: &TaskId,
            trace_id: &TraceId,
        ) -> Result<Vec<Span>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.trace_ids.lock().expect("trace ids lock").push(trace_id.clone());
            self.started.lock().expect("started lock").push(Instant::now());
            tokio::time::sleep(self.delay).await;
            let next = self.batches.lock().expect("batches lock").pop_front();
            let result = match next {
                Some(result) => {
                    *self.last.lock().expect("last lock") = Some(result.clone());
                    result
                }
                None => self
                    .last
                    .lock()
                    .expect("last lock")
                    .clone()
                    .unwrap_or_else(|| Ok(Vec::new())),
            };
            self.completed.lock().expect("completed lock").push(Instant::now());
            result
        }
    }

    fn spans(ids: &[&str]) -> Vec<Span> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| test_span(id, None, i as i64))
            .collect()
    }

    fn config(interval_ms: u64, min_spacing_ms: u64) -> TracePollerConfig {
        TracePollerConfig::default()
            .interval(Duration::from_millis(interval_ms))
            .min_spacing(Duration::from_millis(min_spacing_ms))
    }

    fn poller(api: &Arc<FakeTraceApi>, config: TracePollerConfig) -> TracePoller {
        let api: Arc<dyn TraceApi> = api.clone();
        TracePoller::new(api, config)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn next_tick_is_scheduled_from_completion() {
        let api = FakeTraceApi::new(500, vec![Ok(spans(&["a"]))]);
        let poller = poller(&api, config(2000, 2000));
        let handle = poller.start(TaskId::new("t1"));
        tokio::time::sleep(Duration::from_millis(9_100)).await;
        assert!(handle.stop());

        let completed = api.completed();
        assert!(completed.len() >= 3, "expected several ticks, got {}", completed.len());
        for pair in completed.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(2000));
        }
        let started = api.started();
        for (start, previous_completion) in started.iter().skip(1).zip(completed.iter()) {
            assert!(*start - *previous_completion >= Duration::from_millis(2000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_during_in_flight_tick_does_not_overlap() {
        let api = FakeTraceApi::new(500, vec![Ok(spans(&["a"])), Ok(spans(&["a", "b"]))]);
        let poller = poller(&api, config(2000, 1000));
        let _handle = poller.start(TaskId::new("t1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(api.calls(), 1);

        let refresher = poller.clone();
        let refresh = tokio::spawn(async move { refresher.refresh_now().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(api.calls(), 1, "refresh must wait for the in-flight fetch");

        let report = refresh.await.expect("join").expect("refresh");
        assert_eq!(api.calls(), 2);
        assert_eq!(report.span_count, 2);
        let started = api.started();
        let completed = api.completed();
        assert!(started[1] >= completed[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_tick_waits_out_spacing_after_manual_refresh() {
        let api = FakeTraceApi::new(0, vec![Ok(spans(&["a"]))]);
        let poller = poller(&api, config(2000, 2000));
        let origin = Instant::now();
        let _handle = poller.start(TaskId::new("t1"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        poller.refresh_now().await.expect("manual refresh bypasses spacing");
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let offsets: Vec<u128> = api
            .started()
            .iter()
            .map(|at| (*at - origin).as_millis())
            .collect();
        assert_eq!(offsets, vec![0, 1500, 3500]);
    }

    #[tokio::test(start_paused = true)]
    async fn count_change_is_reported_against_previous_fetch() {
        let api = FakeTraceApi::new(
            0,
            vec![
                Ok(spans(&["a", "b", "c"])),
                Ok(spans(&["a", "b", "c", "d", "e"])),
                Ok(spans(&["v", "w", "x", "y", "z"])),
            ],
        );
        let poller = poller(&api, config(60_000, 0));
        let mut updates = poller.updates();
        let _handle = poller.start(TaskId::new("t1"));
        settle().await;

        let second = poller.refresh_now().await.expect("second fetch");
        assert_eq!((second.previous_count, second.span_count), (3, 5));
        assert!(second.count_changed);
        let third = poller.refresh_now().await.expect("third fetch");
        assert!(!third.count_changed);

        assert_eq!(
            updates.try_recv().expect("first update"),
            TraceUpdate::CountChanged {
                previous: 0,
                current: 3
            }
        );
        assert_eq!(
            updates.try_recv().expect("second update"),
            TraceUpdate::CountChanged {
                previous: 3,
                current: 5
            }
        );
        assert!(updates.try_recv().is_err());
        assert_eq!(poller.snapshot().spans[0].id.as_str(), "v");
    }

    #[tokio::test(start_paused = true)]
    async fn selection_survives_refresh_only_while_span_exists() {
        let api = FakeTraceApi::new(
            0,
            vec![
                Ok(spans(&["s-1", "s-42"])),
                Ok(spans(&["s-42", "s-7"])),
                Ok(spans(&["s-1"])),
            ],
        );
        let poller = poller(&api, config(60_000, 0));
        let mut updates = poller.updates();
        let _handle = poller.start(TaskId::new("t1"));
        settle().await;

        assert!(!poller.select_span(Some(SpanId::new("s-404"))));
        assert!(poller.select_span(Some(SpanId::new("s-42"))));
        poller.refresh_now().await.expect("refresh");
        let selected = poller.snapshot().selected.map(|span| span.id);
        assert_eq!(selected, Some(SpanId::new("s-42")));

        let report = poller.refresh_now().await.expect("refresh");
        assert!(report.selection_cleared);
        assert_eq!(poller.snapshot().selected, None);

        let mut saw_cleared = false;
        while let Ok(update) = updates.try_recv() {
            if update
                == (TraceUpdate::SelectionCleared {
                    span_id: SpanId::new("s-42"),
                })
            {
                saw_cleared = true;
            }
        }
        assert!(saw_cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_clears_spans_and_polling_continues() {
        let api = FakeTraceApi::new(
            0,
            vec![
                Ok(spans(&["a", "b"])),
                Err(FetchError::Http {
                    status: 503,
                    message: "unavailable".into(),
                }),
                Ok(spans(&["a"])),
            ],
        );
        let poller = poller(&api, config(1000, 500));
        let mut updates = poller.updates();
        let handle = poller.start(TaskId::new("t1"));
        settle().await;
        assert_eq!(poller.snapshot().spans.len(), 2);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let snapshot = poller.snapshot();
        assert!(snapshot.spans.is_empty());
        assert!(matches!(snapshot.last_error, Some(FetchError::Http { status: 503, .. })));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let snapshot = poller.snapshot();
        assert_eq!(snapshot.spans.len(), 1);
        assert_eq!(snapshot.last_error, None);
        assert!(handle.is_active());

        let mut saw_failure = false;
        while let Ok(update) = updates.try_recv() {
            saw_failure |= matches!(update, TraceUpdate::FetchFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_in_flight_result() {
        let api = FakeTraceApi::new(500, vec![Ok(spans(&["a", "b"]))]);
        let poller = poller(&api, config(2000, 0));
        let handle = poller.start(TaskId::new("t1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.stop());
        assert!(!handle.stop());
        assert_eq!(poller.phase(), PollPhase::Idle);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(api.calls(), 1);
        assert!(poller.snapshot().spans.is_empty());
        assert_eq!(poller.refresh_now().await, Err(TraceError::NotStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_session() {
        let api = FakeTraceApi::new(0, vec![Ok(spans(&["a"]))]);
        let poller = poller(&api, config(1000, 0));
        let first = poller.start(TaskId::new("t1"));
        settle().await;
        let second = poller.start(TaskId::new("t2"));
        assert!(!first.is_active());
        assert!(second.is_active());
        assert!(!first.stop());
        settle().await;
        assert_eq!(poller.snapshot().task_id, Some(TaskId::new("t2")));
        assert!(second.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn trace_id_falls_back_to_task_id() {
        let api = FakeTraceApi::new(0, vec![Ok(Vec::new())]);
        let poller = poller(&api, config(60_000, 0));
        let _handle = poller.start(TaskId::new("task-5"));
        settle().await;
        assert_eq!(
            api.trace_ids.lock().expect("trace ids").clone(),
            vec![TraceId::new("task-5")]
        );
        assert_eq!(poller.snapshot().trace_id, Some(TraceId::new("task-5")));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_trace_id_is_used_when_known() {
        let api = FakeTraceApi::with_trace_id("tr-9");
        let poller = poller(&api, config(60_000, 0));
        let _handle = poller.start(TaskId::new("task-5"));
        settle().await;
        poller.refresh_now().await.expect("refresh");
        assert_eq!(
            api.trace_ids.lock().expect("trace ids").clone(),
            vec![TraceId::new("tr-9"), TraceId::new("tr-9")]
        );
    }
}
