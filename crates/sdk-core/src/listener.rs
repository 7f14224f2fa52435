//! Best-effort flush on application shutdown or backgrounding

use crate::settings::{ImpressionsMode, Settings};
use crate::sync::{Collector, Endpoint, Payload, SyncManager};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Visibility of the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Drains every telemetry cache once, through the beacon transport when the
/// collector has one and through a fire-and-forget post otherwise.
///
/// Failures are swallowed: there is nobody left to report them to.
pub struct UnloadFlusher {
    sync: SyncManager,
    collector: Arc<dyn Collector>,
}

impl UnloadFlusher {
    pub fn new(sync: SyncManager, collector: Arc<dyn Collector>) -> Self {
        Self { sync, collector }
    }

    pub fn flush_data(&self) {
        let settings = self.sync.settings();
        let only_usage = !settings.is_consent_granted();

        for source in self.sync.submitters().sources(only_usage) {
            if let Some(payload) = source.take() {
                debug!(kind = source.kind(), records = payload.records, "Flushing on unload");
                self.send(settings, payload);
            }
        }
    }

    /// Flushes only when the application went to the background
    pub fn flush_data_if_hidden(&self, visibility: Visibility) {
        if visibility == Visibility::Hidden {
            self.flush_data();
        }
    }

    /// Closes the streaming connection
    pub async fn stop_sync(&self) {
        self.sync.stop_streaming().await;
    }

    fn send(&self, settings: &Settings, payload: Payload) {
        let beacon = beacon_body(settings, &payload);
        if self.collector.send_beacon(payload.endpoint, &beacon) {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            debug!(endpoint = ?payload.endpoint, "No runtime to post on, batch dropped");
            return;
        };
        let collector = self.collector.clone();
        let body = payload.body.to_string();
        runtime.spawn(async move {
            let _ = collector.post(payload.endpoint, body).await;
        });
    }
}

/// `{entries, token, sdkVersion}`, plus the impressions mode for impressions
pub fn beacon_body(settings: &Settings, payload: &Payload) -> String {
    let mut body = json!({
        "entries": payload.body,
        "token": settings.core.authorization_key,
        "sdkVersion": settings.sdk_version,
    });
    if payload.endpoint == Endpoint::Impressions {
        let mode = match settings.sync.impressions_mode {
            ImpressionsMode::Optimized => "OPTIMIZED",
            _ => "DEBUG",
        };
        body["sim"] = json!(mode);
    }
    body.to_string()
}
