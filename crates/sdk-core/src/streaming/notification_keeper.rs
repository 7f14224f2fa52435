use super::{ControlType, Notification, PushEvent, PushEventSender};
use crate::storage::{StreamingEventType, TelemetryCache};
use crate::util::now_millis;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTROL_CHANNEL_SUFFIXES: [&str; 2] = ["control_pri", "control_sec"];

#[derive(Debug, Clone)]
struct ChannelState {
    suffix: &'static str,
    /// Starts as present so an all-zero first reading still reports "up"
    has_publishers: bool,
    occupancy_time: i64,
    control_time: i64,
}

/// Derives streaming health from occupancy and control notifications.
///
/// Staleness is tracked per channel: a notification whose timestamp is not
/// newer than the last accepted one of the same kind on the same channel is
/// ignored.
pub struct NotificationKeeper {
    channels: Vec<ChannelState>,
    has_publishers: bool,
    has_resumed: bool,
    events: PushEventSender,
    telemetry: Option<Arc<TelemetryCache>>,
}

impl NotificationKeeper {
    pub fn new(events: PushEventSender) -> Self {
        Self {
            channels: CONTROL_CHANNEL_SUFFIXES
                .into_iter()
                .map(|suffix| ChannelState {
                    suffix,
                    has_publishers: true,
                    occupancy_time: -1,
                    control_time: -1,
                })
                .collect(),
            has_publishers: true,
            has_resumed: true,
            events,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Option<Arc<TelemetryCache>>) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn emit(&self, event: PushEvent) {
        debug!(?event, "Push subsystem transition");
        if self.events.send(event).is_err() {
            warn!(?event, "Push event dropped, orchestrator is gone");
        }
    }

    fn channel_index(&self, channel: &str) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| channel.ends_with(c.suffix))
    }

    /// Connection (re)established
    pub fn handle_open(&self) {
        self.emit(PushEvent::SubsystemUp);
    }

    pub fn is_streaming_up(&self) -> bool {
        self.has_resumed && self.has_publishers
    }

    pub fn handle_notification(&mut self, notification: &Notification) {
        match notification {
            Notification::Occupancy {
                channel,
                timestamp,
                publishers,
            } => self.handle_occupancy(*publishers, channel, *timestamp),
            Notification::Control {
                channel,
                timestamp,
                control_type,
            } => self.handle_control(*control_type, channel, *timestamp),
        }
    }

    pub fn handle_occupancy(&mut self, publishers: u32, channel: &str, timestamp: i64) {
        let Some(index) = self.channel_index(channel) else {
            debug!(channel = %channel, "Occupancy on unknown channel ignored");
            return;
        };
        let state = &mut self.channels[index];
        if timestamp <= state.occupancy_time {
            debug!(channel = %channel, timestamp, "Stale occupancy ignored");
            return;
        }
        state.occupancy_time = timestamp;
        state.has_publishers = publishers != 0;

        if let Some(telemetry) = &self.telemetry {
            let kind = if index == 0 {
                StreamingEventType::OccupancyPri
            } else {
                StreamingEventType::OccupancySec
            };
            telemetry.record_streaming_event(kind, i64::from(publishers), now_millis());
        }

        let new_has_publishers = self.channels.iter().any(|c| c.has_publishers);
        // While paused, streaming is already down and cannot come up
        if self.has_resumed {
            if !new_has_publishers && self.has_publishers {
                self.emit(PushEvent::SubsystemDown);
            } else if new_has_publishers && !self.has_publishers {
                self.emit(PushEvent::SubsystemUp);
            }
        }
        self.has_publishers = new_has_publishers;
    }

    pub fn handle_control(&mut self, control_type: ControlType, channel: &str, timestamp: i64) {
        let Some(index) = self.channel_index(channel) else {
            debug!(channel = %channel, "Control on unknown channel ignored");
            return;
        };
        let state = &mut self.channels[index];
        if timestamp <= state.control_time {
            debug!(channel = %channel, timestamp, "Stale control ignored");
            return;
        }
        state.control_time = timestamp;

        if let Some(telemetry) = &self.telemetry {
            let status = match control_type {
                ControlType::Disabled => 0,
                ControlType::Resumed => 1,
                ControlType::Paused => 2,
            };
            telemetry.record_streaming_event(
                StreamingEventType::StreamingStatus,
                status,
                now_millis(),
            );
        }

        match control_type {
            ControlType::Disabled => {
                info!("Streaming disabled by control notification");
                self.emit(PushEvent::NonRetryableError);
            }
            // Without publishers streaming is already down and cannot come up
            ControlType::Paused if self.has_publishers && self.has_resumed => {
                self.emit(PushEvent::SubsystemDown)
            }
            ControlType::Resumed if self.has_publishers && !self.has_resumed => {
                self.emit(PushEvent::SubsystemUp)
            }
            _ => {}
        }
        self.has_resumed = control_type == ControlType::Resumed;
    }
}
