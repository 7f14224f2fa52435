//! Local storage: flag and segment snapshots plus telemetry recorder caches
//!
//! Every recorder cache is a producer/consumer buffer. Producers call
//! `track`; the submitter owning the cache drains it with [`RecorderCache::pop`],
//! which takes the whole content and clears it under one lock so no record
//! is ever seen by two batches.

mod events;
mod impression_counts;
mod impressions;
pub mod pluggable;
mod segments;
mod splits;
mod telemetry;
mod unique_keys;

pub use events::{EventsCache, MAX_QUEUE_BYTE_SIZE};
pub use impression_counts::{truncate_time_frame, ImpressionCountsCache};
pub use impressions::ImpressionsCache;
pub use segments::{MySegmentsCache, SegmentsCache};
pub use splits::SplitsCache;
pub use telemetry::{
    RuntimeCounter, StreamingEvent, StreamingEventType, TelemetryCache, UsagePayload,
    MAX_STREAMING_EVENTS,
};
pub use unique_keys::UniqueKeysCache;

use crate::settings::{ImpressionsMode, Settings};
use std::sync::Arc;
use tokio::sync::Notify;

/// Consumer side of a telemetry cache
pub trait RecorderCache: Send + Sync + 'static {
    /// Snapshot handed to a submitter
    type Batch: Send + 'static;

    fn is_empty(&self) -> bool;

    /// Copy of the current content, leaving the cache untouched
    fn state(&self) -> Self::Batch;

    fn clear(&self);

    /// Takes the current content and clears the cache atomically
    fn pop(&self) -> Self::Batch;

    /// Signal notified the moment the cache reaches its size threshold
    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Parameters of the in-memory storage factory
#[derive(Debug, Clone)]
pub struct StorageParams {
    pub impressions_queue_size: usize,
    pub events_queue_size: usize,
    pub impression_counts_queue_size: usize,
    pub unique_keys_cache_size: usize,
    pub impressions_mode: ImpressionsMode,
    /// Unique keys are grouped by key instead of by feature
    pub client_side: bool,
    pub localhost_mode: bool,
}

impl From<&Settings> for StorageParams {
    fn from(settings: &Settings) -> Self {
        Self {
            impressions_queue_size: settings.scheduler.impressions_queue_size,
            events_queue_size: settings.scheduler.events_queue_size,
            impression_counts_queue_size: settings.scheduler.impression_counts_queue_size,
            unique_keys_cache_size: settings.scheduler.unique_keys_cache_size,
            impressions_mode: settings.sync.impressions_mode,
            client_side: settings.core.key.is_some(),
            localhost_mode: settings.sync.localhost_mode,
        }
    }
}

/// In-memory storage shared by the sync core and the evaluation path
#[derive(Clone)]
pub struct InMemoryStorage {
    pub splits: Arc<SplitsCache>,
    /// Server-side segment memberships
    pub segments: Arc<SegmentsCache>,
    /// Segments the storage's matching key belongs to
    pub my_segments: Arc<MySegmentsCache>,
    pub impressions: Arc<ImpressionsCache>,
    pub impression_counts: Option<Arc<ImpressionCountsCache>>,
    pub events: Arc<EventsCache>,
    pub telemetry: Option<Arc<TelemetryCache>>,
    pub unique_keys: Option<Arc<UniqueKeysCache>>,
}

impl InMemoryStorage {
    pub fn new(params: &StorageParams) -> Self {
        let impression_counts = (params.impressions_mode != ImpressionsMode::Debug).then(|| {
            Arc::new(ImpressionCountsCache::new(
                params.impression_counts_queue_size,
            ))
        });
        let unique_keys = (params.impressions_mode == ImpressionsMode::None).then(|| {
            Arc::new(UniqueKeysCache::new(
                params.unique_keys_cache_size,
                params.client_side,
            ))
        });
        let telemetry = (!params.localhost_mode).then(|| Arc::new(TelemetryCache::new()));

        Self {
            splits: Arc::new(SplitsCache::new()),
            segments: Arc::new(SegmentsCache::new()),
            my_segments: Arc::new(MySegmentsCache::new()),
            impressions: Arc::new(ImpressionsCache::new(params.impressions_queue_size)),
            impression_counts,
            events: Arc::new(EventsCache::new(params.events_queue_size)),
            telemetry,
            unique_keys,
        }
    }

    /// Storage view for another matching key.
    ///
    /// Everything is shared with `self` except the key's segment memberships.
    pub fn shared(&self) -> Self {
        Self {
            my_segments: Arc::new(MySegmentsCache::new()),
            ..self.clone()
        }
    }

    /// Empties every cache
    pub fn destroy(&self) {
        self.splits.clear();
        self.segments.clear();
        self.my_segments.clear();
        self.impressions.clear();
        if let Some(counts) = &self.impression_counts {
            counts.clear();
        }
        self.events.clear();
        if let Some(unique_keys) = &self.unique_keys {
            unique_keys.clear();
        }
    }

    /// Teardown of a shared view; only the key's own memberships go away
    pub fn destroy_shared(&self) {
        self.my_segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlagRecord;

    fn params(mode: ImpressionsMode) -> StorageParams {
        let mut settings = Settings::default();
        settings.sync.impressions_mode = mode;
        StorageParams::from(&settings)
    }

    #[test]
    fn test_caches_follow_impressions_mode() {
        let debug = InMemoryStorage::new(&params(ImpressionsMode::Debug));
        assert!(debug.impression_counts.is_none());
        assert!(debug.unique_keys.is_none());

        let optimized = InMemoryStorage::new(&params(ImpressionsMode::Optimized));
        assert!(optimized.impression_counts.is_some());
        assert!(optimized.unique_keys.is_none());

        let none = InMemoryStorage::new(&params(ImpressionsMode::None));
        assert!(none.impression_counts.is_some());
        assert!(none.unique_keys.is_some());
        assert!(none.telemetry.is_some());
    }

    #[test]
    fn test_localhost_mode_has_no_telemetry() {
        let mut p = params(ImpressionsMode::Optimized);
        p.localhost_mode = true;
        assert!(InMemoryStorage::new(&p).telemetry.is_none());
    }

    #[test]
    fn test_shared_reuses_all_but_segments() {
        let storage = InMemoryStorage::new(&params(ImpressionsMode::Optimized));
        let shared = storage.shared();

        storage.splits.add_split(FlagRecord::new("f1"));
        assert!(shared.splits.get_split("f1").is_some());

        storage.my_segments.reset_segments(&["beta".to_string()]);
        assert!(storage.my_segments.is_in_segment("beta"));
        assert!(!shared.my_segments.is_in_segment("beta"));

        shared.destroy_shared();
        assert!(storage.splits.get_split("f1").is_some());
    }

    #[test]
    fn test_destroy_clears_caches() {
        let storage = InMemoryStorage::new(&params(ImpressionsMode::Optimized));
        storage.splits.add_split(FlagRecord::new("f1"));
        storage.splits.set_change_number(10);
        storage.destroy();
        assert!(storage.splits.get_split("f1").is_none());
        assert_eq!(storage.splits.get_change_number(), -1);
    }
}
