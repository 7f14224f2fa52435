//! Synchronization core of a feature-flag SDK
//!
//! This crate provides:
//! - Flag, segment and telemetry caches with a pluggable storage contract
//! - The readiness gate and the streaming health detector
//! - Push/poll sync orchestration and periodic telemetry submitters
//! - Health tracking, metrics and structured logging

pub mod error;
pub mod health;
pub mod keys;
pub mod listener;
pub mod models;
pub mod observability;
pub mod readiness;
pub mod settings;
pub mod storage;
pub mod streaming;
pub mod sync;
pub mod trackers;
mod util;

pub use error::{KeyError, StorageError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, SyncMetrics};
pub use readiness::{ReadinessEvent, ReadinessManager};
pub use settings::Settings;
pub use storage::InMemoryStorage;
pub use sync::{SyncEvent, SyncManager, SyncMode};
pub use util::now_millis;
