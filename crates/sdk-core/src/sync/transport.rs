//! Contracts of the network collaborators
//!
//! The core never talks HTTP or SSE itself; the binary (or tests) plug in
//! implementations of these traits.

use crate::streaming::PushEventSender;
use async_trait::async_trait;
use serde::Deserialize;

/// Flag changes since a given change number
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SplitChanges {
    /// Raw flag definitions; each is parsed on its own so a malformed one
    /// never aborts the whole update
    #[serde(default)]
    pub splits: Vec<serde_json::Value>,
    pub since: i64,
    pub till: i64,
}

/// Segment changes since a given change number (server side)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}

/// Source of flag and segment data
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch_split_changes(&self, since: i64) -> anyhow::Result<SplitChanges>;

    /// Names of the segments `key` belongs to
    async fn fetch_my_segments(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn fetch_segment_changes(&self, name: &str, since: i64) -> anyhow::Result<SegmentChanges>;
}

/// Collector endpoints accepting telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Impressions,
    Events,
    ImpressionCounts,
    UniqueKeysCs,
    UniqueKeysSs,
    Usage,
}

impl Endpoint {
    /// Path of the regular POST endpoint
    pub fn path(self) -> &'static str {
        match self {
            Self::Impressions => "/testImpressions/bulk",
            Self::Events => "/events/bulk",
            Self::ImpressionCounts => "/testImpressions/count",
            Self::UniqueKeysCs => "/keys/cs",
            Self::UniqueKeysSs => "/keys/ss",
            Self::Usage => "/v1/metrics/usage",
        }
    }

    /// Path of the best-effort beacon endpoint
    pub fn beacon_path(self) -> &'static str {
        match self {
            Self::Impressions => "/testImpressions/beacon",
            Self::Events => "/events/beacon",
            Self::ImpressionCounts => "/testImpressions/count/beacon",
            Self::UniqueKeysCs => "/keys/cs/beacon",
            Self::UniqueKeysSs => "/keys/ss/beacon",
            Self::Usage => "/v1/metrics/usage/beacon",
        }
    }

    /// Telemetry kind label used in logs and metrics
    pub fn kind(self) -> &'static str {
        match self {
            Self::Impressions => "impressions",
            Self::Events => "events",
            Self::ImpressionCounts => "impression_counts",
            Self::UniqueKeysCs | Self::UniqueKeysSs => "unique_keys",
            Self::Usage => "usage",
        }
    }
}

/// Sink of telemetry batches
#[async_trait]
pub trait Collector: Send + Sync {
    /// Posts a JSON body to `endpoint`
    async fn post(&self, endpoint: Endpoint, body: String) -> anyhow::Result<()>;

    /// Queues a fire-and-forget send; `false` when no such transport exists
    fn send_beacon(&self, _endpoint: Endpoint, _body: &str) -> bool {
        false
    }
}

/// Streaming connection manager
///
/// Implementations own the SSE transport and a
/// [`crate::streaming::NotificationKeeper`], reporting health transitions on
/// the sender given to [`PushConnector::start`].
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn start(&self, events: PushEventSender);
    async fn stop(&self);

    /// Subscribes an extra matching key's updates
    async fn add(&self, key: &str);
    async fn remove(&self, key: &str);
}
