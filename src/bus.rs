// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Message bus plumbing.
//!
//! Egress: status snapshots and alarm events fan out over a broadcast
//! channel to whoever subscribed (control-socket clients, tests).
//! Ingress: [`ReadingBatch`] is the per-controller reading message; the
//! history store consumes it directly, no broker required.

use crate::cooling::CoolingStatus;
use crate::error::{CoolingError, Result};
use crate::fan::FanStatus;
use crate::history::SensorStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default broadcast buffer depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Alarms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Raised,
    Cleared,
}

/// An alarm raise or clear, as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    /// Component or device the alarm is about.
    pub source: String,
    pub severity: AlarmSeverity,
    pub message: String,
    pub state: AlarmState,
    /// ISO-8601 / RFC 3339, UTC.
    pub timestamp: String,
}

impl AlarmEvent {
    pub fn raised(
        source: impl Into<String>,
        severity: AlarmSeverity,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            severity,
            message: message.into(),
            state: AlarmState::Raised,
            timestamp: iso8601(at),
        }
    }

    pub fn cleared(
        source: impl Into<String>,
        severity: AlarmSeverity,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: AlarmState::Cleared,
            ..Self::raised(source, severity, message, at)
        }
    }
}

pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Egress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum BusEvent {
    #[serde(rename = "cooling_status")]
    CoolingStatus(CoolingStatus),
    #[serde(rename = "fan_status")]
    FanStatus(FanStatus),
    #[serde(rename = "alarm")]
    Alarm(AlarmEvent),
}

/// Cloneable publishing handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Fails when nobody is listening;
    /// callers log the failure and keep the state change that caused it.
    pub fn publish(&self, event: BusEvent) -> Result<usize> {
        self.tx
            .send(event)
            .map_err(|_| CoolingError::Transport("no subscribers on event bus".to_string()))
    }

    /// Publish and log instead of returning the transport failure.
    pub fn emit(&self, event: BusEvent) {
        if let Err(e) = self.publish(event) {
            log::debug!("Dropped bus event: {e}");
        }
    }

    pub fn alarm(&self, event: AlarmEvent) {
        match event.state {
            AlarmState::Raised => log::warn!(
                "ALARM [{:?}] {}: {}",
                event.severity,
                event.source,
                event.message
            ),
            AlarmState::Cleared => {
                log::info!("Alarm cleared {}: {}", event.source, event.message)
            }
        }
        self.emit(BusEvent::Alarm(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// One sensor tuple inside a [`ReadingBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    #[serde(alias = "SensorID")]
    pub sensor_id: u32,
    #[serde(alias = "Value")]
    pub temperature: f64,
    #[serde(alias = "Status")]
    pub status: SensorStatus,
}

/// Reading batch emitted by one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingBatch {
    #[serde(alias = "MCU")]
    pub controller: String,
    #[serde(default = "Utc::now", alias = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "SensorData")]
    pub readings: Vec<SensorSample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_transport_failure() {
        let bus = EventBus::new(4);
        let event = AlarmEvent::raised("FanBank", AlarmSeverity::High, "loud", Utc::now());
        assert!(matches!(
            bus.publish(BusEvent::Alarm(event)),
            Err(CoolingError::Transport(_))
        ));
    }

    #[test]
    fn test_subscriber_receives_alarm() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.alarm(AlarmEvent::raised("Fan1", AlarmSeverity::High, "bad", Utc::now()));
        match rx.try_recv() {
            Ok(BusEvent::Alarm(a)) => {
                assert_eq!(a.source, "Fan1");
                assert_eq!(a.state, AlarmState::Raised);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_legacy_batch_field_names() {
        let json = r#"{"MCU":"MCU1","Timestamp":"2026-01-02T03:04:05Z",
            "SensorData":[{"SensorID":1,"Value":42.5,"Status":"Good"},
                          {"SensorID":2,"Value":7.0,"Status":"Noisy"}]}"#;
        let batch: ReadingBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.controller, "MCU1");
        assert_eq!(batch.readings.len(), 2);
        assert_eq!(batch.readings[1].status, SensorStatus::Noisy);
    }

    #[test]
    fn test_alarm_timestamp_is_iso8601() {
        let at = DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = AlarmEvent::cleared("FanBank", AlarmSeverity::High, "quiet", at);
        assert_eq!(event.timestamp, "2026-05-01T12:00:00.000Z");
        assert_eq!(event.state, AlarmState::Cleared);
    }
}
