//! Sync orchestration: push/poll failover plus the submitters

use super::polling::PollingManager;
use super::submitters::SubmitterManager;
use super::task::SyncTask;
use super::transport::{Collector, DataFetcher, PushConnector};
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::readiness::ReadinessManager;
use crate::settings::Settings;
use crate::storage::{InMemoryStorage, StreamingEventType, TelemetryCache};
use crate::streaming::{PushEvent, PushEventReceiver};
use crate::util::{lock, now_millis};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const SYNC_EVENT_CAPACITY: usize = 32;

/// Active data-fetch strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Stopped,
    Polling,
    Streaming,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Polling => "polling",
            Self::Streaming => "streaming",
        }
    }

    /// Value of the sync mode gauge
    pub fn gauge(self) -> i64 {
        match self {
            Self::Stopped => 0,
            Self::Polling => 1,
            Self::Streaming => 2,
        }
    }
}

/// Events emitted by the sync manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    ModeChanged(SyncMode),
    /// Streaming hit a non-retryable error and stays off for the session
    StreamingDisabled,
}

#[derive(Debug)]
struct ManagerState {
    mode: SyncMode,
    running: bool,
    generation: u64,
    streaming_disabled: bool,
    shutdown: Option<broadcast::Sender<()>>,
}

struct ManagerInner {
    settings: Settings,
    readiness: Arc<ReadinessManager>,
    telemetry: Option<Arc<TelemetryCache>>,
    polling: Arc<PollingManager>,
    push: Option<Arc<dyn PushConnector>>,
    submitters: SubmitterManager,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<SyncEvent>,
    metrics: SyncMetrics,
    logger: StructuredLogger,
}

/// Keeps the flag snapshot fresh and ships telemetry.
///
/// With a push connector it fetches once on start and lets push notifications
/// drive updates while streaming is healthy, falling back to periodic polling
/// whenever the push subsystem reports down.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(
        settings: Settings,
        storage: &InMemoryStorage,
        readiness: Arc<ReadinessManager>,
        fetcher: Arc<dyn DataFetcher>,
        collector: Arc<dyn Collector>,
        push: Option<Arc<dyn PushConnector>>,
    ) -> Self {
        let client_side = settings.core.key.is_some();
        let polling = Arc::new(PollingManager::new(
            fetcher,
            storage.splits.clone(),
            storage.segments.clone(),
            readiness.clone(),
            client_side,
            Duration::from_secs(settings.scheduler.features_refresh_rate),
            Duration::from_secs(settings.scheduler.segments_refresh_rate),
        ));
        if let Some(key) = &settings.core.key {
            polling.add(key, storage.my_segments.clone(), readiness.clone());
        }
        let submitters = SubmitterManager::new(&settings, storage, collector);
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        let instance = settings.core.key.clone().unwrap_or_else(|| "server".to_string());

        Self {
            inner: Arc::new(ManagerInner {
                readiness,
                telemetry: storage.telemetry.clone(),
                polling,
                push: push.filter(|_| settings.sync.streaming_enabled),
                submitters,
                state: Mutex::new(ManagerState {
                    mode: SyncMode::Stopped,
                    running: false,
                    generation: 0,
                    streaming_disabled: false,
                    shutdown: None,
                }),
                events,
                metrics: SyncMetrics::new(),
                logger: StructuredLogger::new(instance),
                settings,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn mode(&self) -> SyncMode {
        lock(&self.inner.state).mode
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }

    pub fn is_streaming_disabled(&self) -> bool {
        lock(&self.inner.state).streaming_disabled
    }

    pub fn polling(&self) -> &Arc<PollingManager> {
        &self.inner.polling
    }

    pub fn submitters(&self) -> &SubmitterManager {
        &self.inner.submitters
    }

    pub fn readiness(&self) -> &Arc<ReadinessManager> {
        &self.inner.readiness
    }

    /// Starts data sync and submitters; a no-op while running
    pub fn start(&self) {
        let inner = &self.inner;
        let (generation, streaming_disabled, shutdown_rx) = {
            let mut state = lock(&inner.state);
            if state.running {
                return;
            }
            state.running = true;
            state.generation += 1;
            let (tx, rx) = broadcast::channel(1);
            state.shutdown = Some(tx);
            (state.generation, state.streaming_disabled, rx)
        };

        let sync = &inner.settings.sync;
        let streaming = inner.push.is_some() && !streaming_disabled;
        inner
            .logger
            .log_startup(&inner.settings.sdk_version, streaming);

        inner
            .submitters
            .start(!inner.settings.is_consent_granted());

        if !sync.enabled {
            info!("Data sync disabled, only submitting telemetry");
            return;
        }

        if sync.single_sync {
            debug!("Single sync, fetching once");
            let polling = inner.polling.clone();
            tokio::spawn(async move { polling.sync_all().await });
            return;
        }

        match (&inner.push, streaming) {
            (Some(push), true) => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(self.clone().dispatch(generation, rx, shutdown_rx));

                let manager = self.clone();
                let push = push.clone();
                tokio::spawn(async move {
                    manager.inner.polling.sync_all().await;
                    if !manager.is_live(generation) {
                        debug!("Stopped during the initial fetch, push not requested");
                        return;
                    }
                    push.start(tx).await;
                    // stop() ran while the connection was being opened
                    if !manager.is_running() {
                        push.stop().await;
                    }
                });
                // Fetched by a single poll until push reports up
                self.set_mode(SyncMode::Polling);
            }
            _ => {
                inner.polling.start();
                self.set_mode(SyncMode::Polling);
            }
        }
    }

    /// Stops timers, the push connection and the submitters.
    ///
    /// In-flight fetches and posts complete; their results still land in
    /// the caches.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if !state.running {
                return;
            }
            state.running = false;
            state.generation += 1;
            if let Some(shutdown) = state.shutdown.take() {
                let _ = shutdown.send(());
            }
        }

        inner.polling.stop();
        if let Some(push) = &inner.push {
            push.stop().await;
        }
        inner.submitters.stop();
        self.set_mode(SyncMode::Stopped);
        inner.logger.log_shutdown("stopped");
    }

    /// Closes the push connection only; polling and submitters keep going
    pub async fn stop_streaming(&self) {
        if let Some(push) = &self.inner.push {
            push.stop().await;
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Flushes the submitters, honouring user consent
    pub async fn flush(&self) {
        self.inner
            .submitters
            .flush(!self.inner.settings.is_consent_granted())
            .await;
    }

    fn is_live(&self, generation: u64) -> bool {
        let state = lock(&self.inner.state);
        state.running && state.generation == generation
    }

    async fn dispatch(
        self,
        generation: u64,
        mut events: PushEventReceiver,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.is_live(generation) {
                        break;
                    }
                    self.on_push_event(event).await;
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Push event dispatcher finished");
    }

    async fn on_push_event(&self, event: PushEvent) {
        let inner = &self.inner;
        match event {
            PushEvent::SubsystemUp => {
                inner.metrics.inc_push_transition("up");
                inner.polling.stop();
                self.set_mode(SyncMode::Streaming);
                // Catch up on anything published while push was down
                inner.polling.sync_all().await;
            }
            PushEvent::SubsystemDown => {
                inner.metrics.inc_push_transition("down");
                if !inner.polling.is_running() {
                    inner.polling.start();
                }
                self.set_mode(SyncMode::Polling);
            }
            PushEvent::NonRetryableError => {
                inner.metrics.inc_push_transition("non_retryable");
                lock(&inner.state).streaming_disabled = true;
                inner.logger.log_streaming_disabled();
                if let Some(push) = &inner.push {
                    push.stop().await;
                }
                if !inner.polling.is_running() {
                    inner.polling.start();
                }
                self.set_mode(SyncMode::Polling);
                let _ = inner.events.send(SyncEvent::StreamingDisabled);
            }
        }
    }

    fn set_mode(&self, mode: SyncMode) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if state.mode == mode {
                return;
            }
            state.mode = mode;
        }

        inner.metrics.set_sync_mode(mode.gauge());
        inner.logger.log_sync_mode(mode.as_str());
        if let Some(telemetry) = &inner.telemetry {
            let code = match mode {
                SyncMode::Streaming => Some(0),
                SyncMode::Polling => Some(1),
                SyncMode::Stopped => None,
            };
            if let Some(code) = code {
                telemetry.record_streaming_event(StreamingEventType::SyncModeUpdate, code, now_millis());
            }
        }
        let _ = inner.events.send(SyncEvent::ModeChanged(mode));
    }

    /// Sync of another matching key, reusing this manager's flag sync
    pub fn shared(
        &self,
        key: &str,
        readiness: Arc<ReadinessManager>,
        storage: &InMemoryStorage,
    ) -> SharedSyncManager {
        let task = self
            .inner
            .polling
            .add(key, storage.my_segments.clone(), readiness);
        SharedSyncManager {
            key: key.to_string(),
            task,
            main: self.clone(),
        }
    }
}

/// Per-key segment sync attached to a [`SyncManager`]
pub struct SharedSyncManager {
    key: String,
    task: SyncTask,
    main: SyncManager,
}

impl SharedSyncManager {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Polls alongside the main manager, or fetches once while streaming
    pub async fn start(&self) {
        let main = &self.main.inner;
        if !main.settings.sync.enabled {
            return;
        }
        if main.polling.is_running() {
            self.task.start(None);
        } else {
            self.task.execute();
        }
        if let Some(push) = &main.push {
            push.add(&self.key).await;
        }
    }

    pub async fn stop(&self) {
        let main = &self.main.inner;
        if let Some(push) = &main.push {
            push.remove(&self.key).await;
        }
        if main.polling.remove(&self.key).is_none() {
            warn!(key = %self.key, "Shared sync was not registered");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Flushes through the main manager's submitters
    pub async fn flush(&self) {
        self.main.flush().await;
    }
}
