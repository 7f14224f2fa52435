//! Flag synchronization and telemetry submission
//!
//! This module provides:
//! - Non-reentrant periodic tasks
//! - Flag and segment updaters driven by a polling manager
//! - Submitters draining the telemetry caches
//! - The sync manager switching between streaming and polling

mod manager;
mod offline;
mod polling;
mod submitters;
mod task;
mod transport;


pub use manager::{SharedSyncManager, SyncEvent, SyncManager, SyncMode};
pub use offline::{LocalFlag, LocalhostFetcher};
pub use polling::{MySegmentsUpdater, PollingManager, SegmentChangesUpdater, SplitChangesUpdater};
pub use submitters::{
    events_payload, impression_counts_payload, impressions_payload, BatchSource, Payload,
    Submitter, SubmitterManager,
};
pub use task::{SyncTask, TaskJob};
pub use transport::{Collector, DataFetcher, Endpoint, PushConnector, SegmentChanges, SplitChanges};
