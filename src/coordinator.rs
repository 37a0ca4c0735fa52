use crate::api::{ApiError, ProductionApi};
use crate::model::ProductionSnapshot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
}

#[derive(Debug, Clone)]
pub struct CoordinatorState {
    /// Latest successfully fetched snapshot; kept across failed polls.
    pub snapshot: Option<ProductionSnapshot>,
    pub last_error: Option<ApiError>,
    pub last_update_success: bool,
    pub phase: Phase,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        CoordinatorState {
            snapshot: None,
            last_error: None,
            last_update_success: false,
            phase: Phase::Idle,
        }
    }
}

/// Keeps the latest production snapshot fresh.
pub struct Coordinator {
    api: Arc<dyn ProductionApi>,
    interval: Duration,
    state: watch::Sender<CoordinatorState>,
    fetch_lock: Mutex<()>,
    refresh_now: Notify,
    closed: AtomicBool,
}

/// Handle of the polling task. Dropping it stops polling.
pub struct PollTask {
    handle: JoinHandle<()>,
}

impl PollTask {
    pub fn stop(self) {}
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/* Returns the phase to Idle however the fetch ends, including cancellation */
struct FetchingPhase<'a>(&'a watch::Sender<CoordinatorState>);

impl<'a> FetchingPhase<'a> {
    fn enter(state: &'a watch::Sender<CoordinatorState>) -> Self {
        state.send_modify(|s| s.phase = Phase::Fetching);
        FetchingPhase(state)
    }
}

impl Drop for FetchingPhase<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|s| {
            let fetching = s.phase == Phase::Fetching;
            s.phase = Phase::Idle;
            fetching
        });
    }
}

impl Coordinator {
    pub fn new(api: Arc<dyn ProductionApi>, interval: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(CoordinatorState::default());
        log::info!(
            "Coordinator initialized with {} second update interval",
            interval.as_secs()
        );

        Arc::new(Coordinator {
            api,
            interval,
            state,
            fetch_lock: Mutex::new(()),
            refresh_now: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> Option<ProductionSnapshot> {
        self.state.borrow().snapshot.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Fetch once and publish the outcome. Failures are recorded, never raised.
    pub async fn refresh(&self) {
        let _fetching = self.fetch_lock.lock().await;
        if self.is_shut_down() {
            return;
        }

        let _phase = FetchingPhase::enter(&self.state);
        log::debug!("Starting data update");
        let result = self.api.get_status().await;

        if self.is_shut_down() {
            log::debug!("Coordinator shut down during fetch, discarding result");
            return;
        }

        match &result {
            Ok(snapshot) => log::info!(
                "Data update successful - Production: {} W, Enabled: {}",
                snapshot.current_power_watts,
                snapshot.production_enabled
            ),
            Err(e) => log::error!("Error communicating with Envoy: {}", e),
        }

        self.state.send_modify(move |s| {
            s.phase = Phase::Idle;
            match result {
                Ok(snapshot) => {
                    s.snapshot = Some(snapshot);
                    s.last_error = None;
                    s.last_update_success = true;
                }
                Err(e) => {
                    s.last_error = Some(e);
                    s.last_update_success = false;
                }
            }
        });
    }

    /// Fetch now, out of cycle, and wait for the result to be published.
    pub async fn request_refresh(&self) {
        self.refresh().await
    }

    /// Ask the polling task to fetch as soon as possible without waiting for it.
    pub fn schedule_refresh(&self) {
        self.refresh_now.notify_one();
    }

    /// Spawn the periodic poll on `runtime`. The first poll is one interval from now.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> PollTask {
        let coordinator = Arc::clone(self);
        PollTask {
            handle: runtime.spawn(coordinator.run()),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.refresh_now.notified() => ticker.reset(),
            }

            if self.is_shut_down() {
                break;
            }
            self.refresh().await;
        }
    }

    /// Stop publishing. A fetch still in flight completes but its result is dropped.
    pub fn shutdown(&self) {
        log::debug!("Shutting down coordinator");
        self.closed.store(true, Ordering::SeqCst);
        self.refresh_now.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn snapshot(power: f64, enabled: bool) -> ProductionSnapshot {
        ProductionSnapshot::new(power, enabled, Utc::now())
    }

    /// Replays queued status results; an empty queue answers `Unreachable`.
    #[derive(Default)]
    pub(crate) struct ScriptedApi {
        pub statuses: std::sync::Mutex<VecDeque<Result<ProductionSnapshot, ApiError>>>,
        pub status_calls: AtomicUsize,
        pub gate: Option<Arc<Notify>>,
    }

    impl ScriptedApi {
        pub(crate) fn with(results: Vec<Result<ProductionSnapshot, ApiError>>) -> Self {
            ScriptedApi {
                statuses: std::sync::Mutex::new(results.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ProductionApi for ScriptedApi {
        async fn get_status(&self) -> Result<ProductionSnapshot, ApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Unreachable("no response".into())))
        }

        async fn set_production(&self, _enabled: bool) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn success_replaces_snapshot() {
        let api = Arc::new(ScriptedApi::with(vec![
            Ok(snapshot(4500.0, true)),
            Ok(snapshot(100.0, false)),
        ]));
        let coordinator = Coordinator::new(api, DEFAULT_SCAN_INTERVAL);

        coordinator.refresh().await;
        assert_eq!(4500, coordinator.snapshot().unwrap().current_power_watts);

        coordinator.refresh().await;
        let state = coordinator.state();
        let snapshot = state.snapshot.unwrap();
        assert_eq!(100, snapshot.current_power_watts);
        assert!(!snapshot.production_enabled);
        assert!(state.last_update_success);
        assert!(state.last_error.is_none());
        assert_eq!(Phase::Idle, state.phase);
    }

    #[tokio::test]
    async fn failure_keeps_previous_snapshot() {
        let api = Arc::new(ScriptedApi::with(vec![
            Ok(snapshot(4500.0, true)),
            Err(ApiError::Unreachable("request timed out".into())),
        ]));
        let coordinator = Coordinator::new(api, DEFAULT_SCAN_INTERVAL);

        coordinator.refresh().await;
        coordinator.refresh().await;

        let state = coordinator.state();
        assert_eq!(4500, state.snapshot.unwrap().current_power_watts);
        assert!(!state.last_update_success);
        assert!(matches!(state.last_error, Some(ApiError::Unreachable(_))));
    }

    #[tokio::test]
    async fn failure_without_history_has_no_snapshot() {
        let api = Arc::new(ScriptedApi::with(vec![Err(ApiError::Malformed("{}".into()))]));
        let coordinator = Coordinator::new(api, DEFAULT_SCAN_INTERVAL);

        coordinator.refresh().await;
        let state = coordinator.state();
        assert!(state.snapshot.is_none());
        assert!(matches!(state.last_error, Some(ApiError::Malformed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_every_interval() {
        let api = Arc::new(ScriptedApi::default());
        let coordinator = Coordinator::new(api.clone(), DEFAULT_SCAN_INTERVAL);
        let _task = coordinator.start(&Handle::current());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(0, api.status_calls.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(2, api.status_calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_refresh_runs_out_of_cycle() {
        let api = Arc::new(ScriptedApi::with(vec![Ok(snapshot(10.0, true))]));
        let coordinator = Coordinator::new(api.clone(), DEFAULT_SCAN_INTERVAL);
        let mut updates = coordinator.subscribe();
        let _task = coordinator.start(&Handle::current());

        coordinator.schedule_refresh();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(1, api.status_calls.load(Ordering::SeqCst));
        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().snapshot.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_task_no_longer_polls() {
        let api = Arc::new(ScriptedApi::default());
        let coordinator = Coordinator::new(api.clone(), DEFAULT_SCAN_INTERVAL);
        let task = coordinator.start(&Handle::current());
        task.stop();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(0, api.status_calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn result_after_shutdown_is_discarded() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(ScriptedApi {
            gate: Some(gate.clone()),
            ..ScriptedApi::with(vec![Ok(snapshot(4500.0, true))])
        });
        let coordinator = Coordinator::new(api.clone(), DEFAULT_SCAN_INTERVAL);

        let fetch = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        while api.status_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        coordinator.shutdown();
        gate.notify_one();
        fetch.await.unwrap();

        assert!(coordinator.snapshot().is_none());
        assert_eq!(Phase::Idle, coordinator.state().phase);
        coordinator.refresh().await;
        assert_eq!(1, api.status_calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_refresh_returns_to_idle() {
        let api = Arc::new(ScriptedApi {
            gate: Some(Arc::new(Notify::new())),
            ..ScriptedApi::with(vec![Ok(snapshot(4500.0, true))])
        });
        let coordinator = Coordinator::new(api.clone(), DEFAULT_SCAN_INTERVAL);

        let fetch = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        while api.status_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(Phase::Fetching, coordinator.state().phase);

        fetch.abort();
        let _ = fetch.await;

        let state = coordinator.state();
        assert_eq!(Phase::Idle, state.phase);
        assert!(state.snapshot.is_none());
    }
}
