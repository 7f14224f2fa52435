//! Push (streaming) subsystem health
//!
//! Occupancy and control notifications received on the control channels are
//! folded into a single up/down signal by the [`NotificationKeeper`], which
//! reports transitions as [`PushEvent`]s to the sync orchestrator.

mod notification_keeper;
mod notifications;

pub use notification_keeper::NotificationKeeper;
pub use notifications::{ControlType, Notification};

use tokio::sync::mpsc;

/// Push subsystem transitions consumed by the sync orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    /// Streaming is healthy; push is the data source
    SubsystemUp,
    /// Streaming is unhealthy; fall back to polling
    SubsystemDown,
    /// Streaming is disabled for the rest of the session
    NonRetryableError,
}

pub type PushEventSender = mpsc::UnboundedSender<PushEvent>;
pub type PushEventReceiver = mpsc::UnboundedReceiver<PushEvent>;
