//! Runtime usage counters and streaming history

use super::RecorderCache;
use crate::util::lock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Streaming events kept between two usage submissions
pub const MAX_STREAMING_EVENTS: usize = 20;

/// Named runtime counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeCounter {
    ImpressionsQueued,
    ImpressionsDeduped,
    ImpressionsDropped,
    EventsQueued,
    EventsDropped,
    AuthRejections,
    TokenRefreshes,
}

/// Streaming event kinds, with their wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingEventType {
    ConnectionEstablished,
    OccupancyPri,
    OccupancySec,
    StreamingStatus,
    SseConnectionError,
    TokenRefresh,
    AblyError,
    SyncModeUpdate,
}

impl StreamingEventType {
    pub fn code(self) -> u8 {
        match self {
            Self::ConnectionEstablished => 0,
            Self::OccupancyPri => 10,
            Self::OccupancySec => 20,
            Self::StreamingStatus => 30,
            Self::SseConnectionError => 40,
            Self::TokenRefresh => 50,
            Self::AblyError => 60,
            Self::SyncModeUpdate => 70,
        }
    }
}

/// One recorded streaming event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamingEvent {
    /// Event type code
    pub e: u8,
    /// Event data (e.g. sync mode or publisher count)
    pub d: i64,
    /// Epoch millis
    pub t: i64,
}

/// Usage telemetry sent to `/v1/metrics/usage`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsagePayload {
    #[serde(rename = "iQ")]
    pub impressions_queued: u64,
    #[serde(rename = "iDe")]
    pub impressions_deduped: u64,
    #[serde(rename = "iDr")]
    pub impressions_dropped: u64,
    #[serde(rename = "eQ")]
    pub events_queued: u64,
    #[serde(rename = "eD")]
    pub events_dropped: u64,
    #[serde(rename = "aR")]
    pub auth_rejections: u64,
    #[serde(rename = "tR")]
    pub token_refreshes: u64,
    #[serde(rename = "sE")]
    pub streaming_events: Vec<StreamingEvent>,
    /// Session length in millis
    #[serde(rename = "sL", skip_serializing_if = "Option::is_none")]
    pub session_length: Option<i64>,
}

#[derive(Debug, Default)]
struct TelemetryState {
    counters: HashMap<RuntimeCounter, u64>,
    streaming_events: Vec<StreamingEvent>,
    session_length: Option<i64>,
}

/// Usage telemetry recorder
#[derive(Debug, Default)]
pub struct TelemetryCache {
    state: Mutex<TelemetryState>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, counter: RuntimeCounter, amount: u64) {
        *lock(&self.state).counters.entry(counter).or_insert(0) += amount;
    }

    pub fn counter(&self, counter: RuntimeCounter) -> u64 {
        lock(&self.state).counters.get(&counter).copied().unwrap_or(0)
    }

    /// Keeps at most [`MAX_STREAMING_EVENTS`]; later events are dropped
    pub fn record_streaming_event(&self, kind: StreamingEventType, data: i64, timestamp: i64) {
        let mut state = lock(&self.state);
        if state.streaming_events.len() < MAX_STREAMING_EVENTS {
            state.streaming_events.push(StreamingEvent {
                e: kind.code(),
                d: data,
                t: timestamp,
            });
        }
    }

    pub fn record_session_length(&self, millis: i64) {
        lock(&self.state).session_length = Some(millis);
    }

    fn payload(state: &TelemetryState) -> UsagePayload {
        let get = |c| state.counters.get(&c).copied().unwrap_or(0);
        UsagePayload {
            impressions_queued: get(RuntimeCounter::ImpressionsQueued),
            impressions_deduped: get(RuntimeCounter::ImpressionsDeduped),
            impressions_dropped: get(RuntimeCounter::ImpressionsDropped),
            events_queued: get(RuntimeCounter::EventsQueued),
            events_dropped: get(RuntimeCounter::EventsDropped),
            auth_rejections: get(RuntimeCounter::AuthRejections),
            token_refreshes: get(RuntimeCounter::TokenRefreshes),
            streaming_events: state.streaming_events.clone(),
            session_length: state.session_length,
        }
    }
}

impl RecorderCache for TelemetryCache {
    type Batch = UsagePayload;

    fn is_empty(&self) -> bool {
        let state = lock(&self.state);
        state.counters.values().all(|v| *v == 0)
            && state.streaming_events.is_empty()
            && state.session_length.is_none()
    }

    fn state(&self) -> Self::Batch {
        Self::payload(&lock(&self.state))
    }

    fn clear(&self) {
        *lock(&self.state) = TelemetryState::default();
    }

    fn pop(&self) -> Self::Batch {
        let mut state = lock(&self.state);
        let payload = Self::payload(&state);
        state.counters.clear();
        state.streaming_events.clear();
        payload
    }
}
