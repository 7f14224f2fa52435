//! Streaming control-channel message schema

use serde::{Deserialize, Serialize};

/// Control notification types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    #[serde(rename = "STREAMING_PAUSED", alias = "PAUSED")]
    Paused,
    #[serde(rename = "STREAMING_RESUMED", alias = "RESUMED")]
    Resumed,
    #[serde(rename = "STREAMING_DISABLED", alias = "DISABLED")]
    Disabled,
}

/// Message received on a control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Notification {
    Occupancy {
        channel: String,
        timestamp: i64,
        publishers: u32,
    },
    Control {
        channel: String,
        timestamp: i64,
        #[serde(rename = "type")]
        control_type: ControlType,
    },
}

impl Notification {
    pub fn channel(&self) -> &str {
        match self {
            Self::Occupancy { channel, .. } | Self::Control { channel, .. } => channel,
        }
    }
}
