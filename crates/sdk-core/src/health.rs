//! Health and readiness reporting for the sync agent
//!
//! Components report Healthy/Degraded/Unhealthy; readiness additionally
//! requires the SDK readiness gate to have fired. Two consumer loops keep the
//! registry in line with the readiness and sync event surfaces.

use crate::observability::{StructuredLogger, SyncMetrics};
use crate::readiness::ReadinessEvent;
use crate::sync::{SyncEvent, SyncMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but on a fallback path
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components; healthy when there are none
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SYNC: &str = "sync";
    pub const STREAMING: &str = "streaming";
    pub const SUBMITTERS: &str = "submitters";
    pub const STORAGE: &str = "storage";
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Registers a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Flag snapshot not ready yet".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }

    /// Follows a readiness gate until its channel closes
    pub async fn track_readiness(
        self,
        mut events: broadcast::Receiver<ReadinessEvent>,
        logger: StructuredLogger,
    ) {
        let metrics = SyncMetrics::new();
        loop {
            match events.recv().await {
                Ok(ReadinessEvent::Ready) => {
                    self.set_ready(true).await;
                    self.set_healthy(components::SYNC).await;
                    metrics.set_sdk_ready(true);
                    logger.log_ready(None);
                }
                Ok(ReadinessEvent::ReadyTimedOut) => {
                    self.set_degraded(components::SYNC, "Not ready before the timeout")
                        .await;
                    logger.log_ready_timed_out(None);
                }
                Ok(event) => debug!(?event, "Readiness event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Readiness events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Follows the sync manager's events until its channel closes
    pub async fn track_sync(self, mut events: broadcast::Receiver<SyncEvent>) {
        loop {
            match events.recv().await {
                Ok(SyncEvent::ModeChanged(SyncMode::Streaming)) => {
                    self.set_healthy(components::STREAMING).await;
                }
                Ok(SyncEvent::ModeChanged(SyncMode::Polling)) => {
                    self.set_degraded(components::STREAMING, "Polling for updates")
                        .await;
                }
                Ok(SyncEvent::ModeChanged(SyncMode::Stopped)) => {
                    self.set_unhealthy(components::SYNC, "Sync stopped").await;
                }
                Ok(SyncEvent::StreamingDisabled) => {
                    self.set_degraded(components::STREAMING, "Streaming disabled for the session")
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Sync events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_health_registry_statuses() {
        let registry = HealthRegistry::new();
        registry.register(components::SYNC).await;
        registry.register(components::SUBMITTERS).await;

        registry.set_degraded(components::SYNC, "Polling").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::SUBMITTERS, "Collector unreachable").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.register(components::STORAGE).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::STORAGE, "Failed").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_track_readiness_marks_ready() {
        let registry = HealthRegistry::new();
        let (tx, rx) = broadcast::channel(8);
        let task = tokio::spawn(
            registry
                .clone()
                .track_readiness(rx, StructuredLogger::new("test")),
        );

        tx.send(ReadinessEvent::ReadyTimedOut).unwrap();
        tx.send(ReadinessEvent::Ready).unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(registry.readiness().await.ready);
        let health = registry.health().await;
        assert_eq!(health.components[components::SYNC].status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_track_sync_follows_mode() {
        let registry = HealthRegistry::new();
        let (tx, rx) = broadcast::channel(8);
        let task = tokio::spawn(registry.clone().track_sync(rx));

        tx.send(SyncEvent::ModeChanged(SyncMode::Streaming)).unwrap();
        tx.send(SyncEvent::StreamingDisabled).unwrap();
        drop(tx);
        task.await.unwrap();

        let health = registry.health().await;
        assert_eq!(
            health.components[components::STREAMING].status,
            ComponentStatus::Degraded
        );
    }
}
