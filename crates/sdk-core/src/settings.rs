//! Runtime settings for synchronization and telemetry submission
//!
//! Every field has a default so a partial configuration source (file or
//! environment) deserializes into a complete tree.

use serde::Deserialize;
use std::time::Duration;

/// How impressions are recorded before submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpressionsMode {
    /// Every impression is submitted
    Debug,
    /// Impressions are deduplicated and counted
    #[default]
    Optimized,
    /// Only impression counts and unique keys are submitted
    None,
}

/// End-user consent for telemetry submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserConsent {
    Granted,
    Declined,
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub authorization_key: String,
    /// Matching key of the main client; absent for server-side usage
    pub key: Option<String>,
    pub labels_enabled: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            authorization_key: String::new(),
            key: None,
            labels_enabled: true,
        }
    }
}

/// Refresh rates (seconds) and queue sizes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub features_refresh_rate: u64,
    pub segments_refresh_rate: u64,
    pub impressions_refresh_rate: u64,
    pub impressions_queue_size: usize,
    pub events_push_rate: u64,
    pub events_queue_size: usize,
    pub impression_counts_refresh_rate: u64,
    pub impression_counts_queue_size: usize,
    pub unique_keys_refresh_rate: u64,
    pub unique_keys_cache_size: usize,
    pub telemetry_refresh_rate: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            features_refresh_rate: 60,
            segments_refresh_rate: 60,
            impressions_refresh_rate: 300,
            impressions_queue_size: 30_000,
            events_push_rate: 60,
            events_queue_size: 500,
            impression_counts_refresh_rate: 1800,
            impression_counts_queue_size: 30_000,
            unique_keys_refresh_rate: 900,
            unique_keys_cache_size: 30_000,
            telemetry_refresh_rate: 3600,
        }
    }
}

/// Startup timings (seconds)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Zero disables the ready timeout
    pub ready_timeout: f64,
    /// Delay of the first events submission; zero submits on start
    pub events_first_push_window: f64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            ready_timeout: 10.0,
            events_first_push_window: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// When off, only telemetry is submitted and no data is fetched
    pub enabled: bool,
    pub impressions_mode: ImpressionsMode,
    pub streaming_enabled: bool,
    /// Fetch once per start instead of polling periodically
    pub single_sync: bool,
    pub localhost_mode: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            impressions_mode: ImpressionsMode::Optimized,
            streaming_enabled: true,
            single_sync: false,
            localhost_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UrlSettings {
    pub sdk: String,
    pub events: String,
    pub telemetry: String,
}

impl Default for UrlSettings {
    fn default() -> Self {
        Self {
            sdk: "https://sdk.split.io/api".to_string(),
            events: "https://events.split.io/api".to_string(),
            telemetry: "https://telemetry.split.io/api".to_string(),
        }
    }
}

/// Complete settings tree
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub core: CoreSettings,
    pub scheduler: SchedulerSettings,
    pub startup: StartupSettings,
    pub sync: SyncSettings,
    pub urls: UrlSettings,
    pub user_consent: Option<UserConsent>,
    pub sdk_version: String,
}

impl Settings {
    /// Submission is allowed unless consent was explicitly withheld
    pub fn is_consent_granted(&self) -> bool {
        matches!(self.user_consent, None | Some(UserConsent::Granted))
    }

    pub fn ready_timeout(&self) -> Duration {
        secs_f64(self.startup.ready_timeout)
    }

    pub fn events_first_push_window(&self) -> Duration {
        secs_f64(self.startup.events_first_push_window)
    }
}

/// Non-negative, finite seconds to a duration; anything else is zero
pub fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.sync.impressions_mode, ImpressionsMode::Optimized);
        assert!(settings.sync.streaming_enabled);
        assert_eq!(settings.scheduler.events_queue_size, 500);
        assert_eq!(settings.ready_timeout(), Duration::from_secs(10));
        assert!(settings.is_consent_granted());
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{
            "core": {"authorization_key": "sdk-key", "key": "emma"},
            "sync": {"impressions_mode": "NONE", "single_sync": true},
            "user_consent": "DECLINED"
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.core.authorization_key, "sdk-key");
        assert_eq!(settings.core.key.as_deref(), Some("emma"));
        assert_eq!(settings.sync.impressions_mode, ImpressionsMode::None);
        assert!(settings.sync.single_sync);
        assert!(settings.sync.streaming_enabled);
        assert!(!settings.is_consent_granted());
    }

    #[test]
    fn test_secs_f64_rejects_invalid() {
        assert_eq!(secs_f64(-1.0), Duration::ZERO);
        assert_eq!(secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(secs_f64(0.5), Duration::from_millis(500));
    }
}
