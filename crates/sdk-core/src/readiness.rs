//! Readiness gate
//!
//! Turns the low-level "flags arrived", "flags cache loaded" and "segments
//! arrived" signals into the SDK-level events [`ReadinessEvent::Ready`],
//! [`ReadinessEvent::ReadyFromCache`], [`ReadinessEvent::ReadyTimedOut`] and
//! [`ReadinessEvent::Update`].
//!
//! A main manager and its shared managers (one per extra matching key)
//! observe the same [`FlagsSignal`], but each owns its segments signal, its
//! ready/timeout bookkeeping and its event surface.

use crate::util::lock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What changed after the gate became ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Flags { killed: bool },
    Segments,
}

/// Events emitted on a readiness gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessEvent {
    Ready,
    ReadyFromCache,
    ReadyTimedOut,
    Update(UpdateKind),
}

/// Snapshot of a gate's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessState {
    pub splits_arrived: bool,
    pub splits_cache_loaded: bool,
    pub segments_arrived: bool,
    pub is_ready: bool,
    pub has_timed_out: bool,
    pub is_ready_from_cache: bool,
    pub is_destroyed: bool,
    pub ref_count: usize,
}

#[derive(Default)]
struct FlagsState {
    arrived: bool,
    cache_loaded: bool,
    ref_count: usize,
    subscribers: HashMap<u64, Weak<GateCore>>,
}

/// Flag-level signal shared by a main manager and all its shared managers
#[derive(Clone, Default)]
pub struct FlagsSignal {
    state: Arc<Mutex<FlagsState>>,
    next_id: Arc<AtomicU64>,
}

impl FlagsSignal {
    fn register(&self, gate: &Arc<GateCore>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        state.ref_count += 1;
        state.subscribers.insert(id, Arc::downgrade(gate));
        id
    }

    fn live_gates(&self) -> Vec<Arc<GateCore>> {
        lock(&self.state)
            .subscribers
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn arrived(&self) -> bool {
        lock(&self.state).arrived
    }

    fn cache_loaded(&self) -> bool {
        lock(&self.state).cache_loaded
    }

    /// Drops one reference; the last one releases every subscriber
    fn release(&self, id: u64) {
        let mut state = lock(&self.state);
        state.subscribers.remove(&id);
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 {
            state.subscribers.clear();
        }
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.state).ref_count
    }
}

#[derive(Default)]
struct GateState {
    segments_arrived: bool,
    is_ready: bool,
    has_timed_out: bool,
    is_ready_from_cache: bool,
    is_destroyed: bool,
    timeout: Option<JoinHandle<()>>,
}

struct GateCore {
    state: Mutex<GateState>,
    events: broadcast::Sender<ReadinessEvent>,
}

impl GateCore {
    fn emit(&self, event: ReadinessEvent) {
        // No subscriber is not an error
        let _ = self.events.send(event);
    }

    fn check_ready_or_update(&self, flags_arrived: bool, kind: UpdateKind) {
        let event = {
            let mut state = lock(&self.state);
            if state.is_destroyed {
                return;
            }
            if state.is_ready {
                Some(ReadinessEvent::Update(kind))
            } else if flags_arrived && state.segments_arrived {
                state.is_ready = true;
                if let Some(timer) = state.timeout.take() {
                    timer.abort();
                }
                Some(ReadinessEvent::Ready)
            } else {
                None
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn check_ready_from_cache(&self, cache_loaded: bool) {
        {
            let mut state = lock(&self.state);
            if state.is_destroyed || state.is_ready_from_cache || !cache_loaded {
                return;
            }
            state.is_ready_from_cache = true;
        }
        self.emit(ReadinessEvent::ReadyFromCache);
    }

    fn on_timeout(&self) {
        {
            let mut state = lock(&self.state);
            if state.is_ready || state.is_destroyed {
                return;
            }
            state.has_timed_out = true;
            state.timeout = None;
        }
        warn!("SDK did not become ready within the configured timeout");
        self.emit(ReadinessEvent::ReadyTimedOut);
    }
}

/// Readiness manager for one matching key
///
/// Timers and deferred notifications run on the ambient tokio runtime, so
/// managers must be created from within one.
pub struct ReadinessManager {
    flags: FlagsSignal,
    core: Arc<GateCore>,
    id: u64,
}

impl ReadinessManager {
    /// Main manager. A zero `ready_timeout` never times out.
    pub fn new(ready_timeout: Duration) -> Self {
        Self::with_flags(FlagsSignal::default(), ready_timeout)
    }

    fn with_flags(flags: FlagsSignal, ready_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let core = Arc::new(GateCore {
            state: Mutex::new(GateState::default()),
            events,
        });
        let id = flags.register(&core);

        if !ready_timeout.is_zero() {
            let weak = Arc::downgrade(&core);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(ready_timeout).await;
                if let Some(core) = weak.upgrade() {
                    core.on_timeout();
                }
            });
            lock(&core.state).timeout = Some(timer);
        }

        let manager = Self { flags, core, id };
        if manager.flags.cache_loaded() {
            manager.defer_ready_from_cache(manager.core.clone());
        }
        manager
    }

    /// Manager for another matching key, observing the same flag signal
    pub fn shared(&self, ready_timeout: Duration) -> Self {
        Self::with_flags(self.flags.clone(), ready_timeout)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReadinessEvent> {
        self.core.events.subscribe()
    }

    /// Flags were fetched (or a kill notification was applied).
    ///
    /// Kill notifications never count towards readiness, since they can be
    /// applied to a stale cache before the first fetch completes.
    pub fn on_splits_arrived(&self, is_kill: bool) {
        let arrived = {
            let mut state = lock(&self.flags.state);
            if !is_kill {
                state.arrived = true;
            }
            state.arrived
        };
        for gate in self.flags.live_gates() {
            gate.check_ready_or_update(arrived, UpdateKind::Flags { killed: is_kill });
        }
    }

    /// A persisted flag snapshot was loaded; `ReadyFromCache` follows on a
    /// later scheduling tick so listeners attached right after can see it
    pub fn on_splits_cache_loaded(&self) {
        let first = {
            let mut state = lock(&self.flags.state);
            let first = !state.cache_loaded;
            state.cache_loaded = true;
            first
        };
        if first {
            for gate in self.flags.live_gates() {
                self.defer_ready_from_cache(gate);
            }
        }
    }

    fn defer_ready_from_cache(&self, gate: Arc<GateCore>) {
        let flags = self.flags.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            gate.check_ready_from_cache(flags.cache_loaded());
        });
    }

    pub fn on_segments_arrived(&self) {
        lock(&self.core.state).segments_arrived = true;
        self.core
            .check_ready_or_update(self.flags.arrived(), UpdateKind::Segments);
    }

    /// Tears this manager down; repeated calls are no-ops.
    ///
    /// The shared flag signal loses its subscribers only once every manager
    /// observing it was destroyed.
    pub fn destroy(&self) {
        {
            let mut state = lock(&self.core.state);
            if state.is_destroyed {
                return;
            }
            state.is_destroyed = true;
            if let Some(timer) = state.timeout.take() {
                timer.abort();
            }
        }
        self.flags.release(self.id);
        debug!(remaining = self.flags.ref_count(), "Readiness manager destroyed");
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.core.state).is_ready
    }

    pub fn has_timed_out(&self) -> bool {
        lock(&self.core.state).has_timed_out
    }

    pub fn is_ready_from_cache(&self) -> bool {
        lock(&self.core.state).is_ready_from_cache
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.core.state).is_destroyed
    }

    /// Usable for evaluations: ready (from fetch or cache) and not destroyed
    pub fn is_operational(&self) -> bool {
        let state = lock(&self.core.state);
        (state.is_ready || state.is_ready_from_cache) && !state.is_destroyed
    }

    pub fn segments_arrived(&self) -> bool {
        lock(&self.core.state).segments_arrived
    }

    pub fn state(&self) -> ReadinessState {
        let (splits_arrived, splits_cache_loaded, ref_count) = {
            let flags = lock(&self.flags.state);
            (flags.arrived, flags.cache_loaded, flags.ref_count)
        };
        let gate = lock(&self.core.state);
        ReadinessState {
            splits_arrived,
            splits_cache_loaded,
            segments_arrived: gate.segments_arrived,
            is_ready: gate.is_ready,
            has_timed_out: gate.has_timed_out,
            is_ready_from_cache: gate.is_ready_from_cache,
            is_destroyed: gate.is_destroyed,
            ref_count,
        }
    }

    /// Resolves with `true` once ready, or `false` on timeout or destroy
    pub async fn when_ready(&self) -> bool {
        let mut events = self.subscribe();
        loop {
            {
                let state = lock(&self.core.state);
                if state.is_ready {
                    return true;
                }
                if state.has_timed_out || state.is_destroyed {
                    return false;
                }
            }
            match events.recv().await {
                Ok(ReadinessEvent::Ready) => return true,
                Ok(ReadinessEvent::ReadyTimedOut) => return false,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }
}

impl Drop for ReadinessManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Logs gate events until the channel closes
pub async fn log_readiness_events(mut events: broadcast::Receiver<ReadinessEvent>) {
    loop {
        match events.recv().await {
            Ok(ReadinessEvent::Ready) => info!("SDK is ready"),
            Ok(ReadinessEvent::ReadyFromCache) => info!("SDK is ready from cache"),
            Ok(ReadinessEvent::ReadyTimedOut) => warn!("SDK ready timed out"),
            Ok(ReadinessEvent::Update(kind)) => debug!(?kind, "SDK update"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Readiness event listener lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn drain(rx: &mut broadcast::Receiver<ReadinessEvent>) -> Vec<ReadinessEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn test_ready_requires_flags_and_segments() {
        let manager = ReadinessManager::new(Duration::ZERO);
        let mut rx = manager.subscribe();

        manager.on_splits_arrived(false);
        assert!(!manager.is_ready());
        assert!(drain(&mut rx).is_empty());

        manager.on_segments_arrived();
        assert!(manager.is_ready());
        assert_eq!(drain(&mut rx), vec![ReadinessEvent::Ready]);
    }

    #[tokio::test]
    async fn test_kill_does_not_count_as_arrival() {
        let manager = ReadinessManager::new(Duration::ZERO);
        let mut rx = manager.subscribe();

        manager.on_segments_arrived();
        manager.on_splits_arrived(true);
        assert!(!manager.is_ready());

        manager.on_splits_arrived(false);
        assert_eq!(drain(&mut rx), vec![ReadinessEvent::Ready]);
    }

    #[tokio::test]
    async fn test_ready_fires_once_then_updates() {
        let manager = ReadinessManager::new(Duration::ZERO);
        let mut rx = manager.subscribe();

        manager.on_splits_arrived(false);
        manager.on_segments_arrived();
        manager.on_splits_arrived(false);
        manager.on_splits_arrived(true);
        manager.on_segments_arrived();

        assert_eq!(
            drain(&mut rx),
            vec![
                ReadinessEvent::Ready,
                ReadinessEvent::Update(UpdateKind::Flags { killed: false }),
                ReadinessEvent::Update(UpdateKind::Flags { killed: true }),
                ReadinessEvent::Update(UpdateKind::Segments),
            ]
        );
    }

    #[tokio::test]
    async fn test_ready_from_cache_is_deferred_and_once() {
        let manager = ReadinessManager::new(Duration::ZERO);
        manager.on_splits_cache_loaded();
        manager.on_splits_cache_loaded();

        // Listener attached after the signal still observes the event
        let mut rx = manager.subscribe();
        assert!(!manager.is_ready_from_cache());

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(manager.is_ready_from_cache());
        assert!(manager.is_operational());
        assert_eq!(drain(&mut rx), vec![ReadinessEvent::ReadyFromCache]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_unless_ready() {
        let manager = ReadinessManager::new(Duration::from_millis(50));
        let mut rx = manager.subscribe();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(manager.has_timed_out());
        assert_eq!(drain(&mut rx), vec![ReadinessEvent::ReadyTimedOut]);

        // Becoming ready later is still possible
        manager.on_splits_arrived(false);
        manager.on_segments_arrived();
        assert!(manager.is_ready());
        assert!(manager.has_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_cancels_timeout() {
        let manager = ReadinessManager::new(Duration::from_millis(50));
        let mut rx = manager.subscribe();

        manager.on_splits_arrived(false);
        manager.on_segments_arrived();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!manager.has_timed_out());
        assert_eq!(drain(&mut rx), vec![ReadinessEvent::Ready]);
    }

    #[tokio::test]
    async fn test_shared_managers_share_flags_but_not_segments() {
        let main = ReadinessManager::new(Duration::ZERO);
        let shared = main.shared(Duration::ZERO);
        let mut main_rx = main.subscribe();
        let mut shared_rx = shared.subscribe();

        main.on_segments_arrived();
        main.on_splits_arrived(false);
        assert!(main.is_ready());
        assert!(!shared.is_ready());
        assert!(shared.state().splits_arrived);

        shared.on_segments_arrived();
        assert!(shared.is_ready());

        assert_eq!(drain(&mut main_rx), vec![ReadinessEvent::Ready]);
        assert_eq!(drain(&mut shared_rx), vec![ReadinessEvent::Ready]);

        // A flag update reaches every manager observing the signal
        main.on_splits_arrived(false);
        assert_eq!(drain(&mut main_rx).len(), 1);
        assert_eq!(drain(&mut shared_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_is_reference_counted() {
        let main = ReadinessManager::new(Duration::ZERO);
        let shared = main.shared(Duration::ZERO);
        assert_eq!(main.state().ref_count, 2);

        let mut main_rx = main.subscribe();
        shared.destroy();
        shared.destroy();
        assert!(shared.is_destroyed());
        assert_eq!(main.state().ref_count, 1);

        // The main manager keeps receiving flag signals
        main.on_segments_arrived();
        main.on_splits_arrived(false);
        assert_eq!(drain(&mut main_rx), vec![ReadinessEvent::Ready]);

        main.destroy();
        assert_eq!(main.state().ref_count, 0);
        assert!(!main.is_operational());
        assert!(main.flags.live_gates().is_empty());
    }

    #[tokio::test]
    async fn test_when_ready() {
        let manager = Arc::new(ReadinessManager::new(Duration::ZERO));
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.when_ready().await })
        };
        tokio::task::yield_now().await;

        manager.on_splits_arrived(false);
        manager.on_segments_arrived();
        assert!(waiter.await.unwrap());
    }
}
