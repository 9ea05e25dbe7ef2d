// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Client-daemon protocol over Unix domain sockets.
//!
//! Messages are newline-delimited JSON. The client sends a [`Request`]
//! and the daemon replies with a [`Response`]. After `subscribe` the
//! connection only carries `event` responses.

use crate::bank::{DeviceResult, NoiseReport};
use crate::bus::{BusEvent, ReadingBatch};
use crate::cooling::{CoolingStatus, Thresholds};
use crate::error::CoolingError;
use crate::fan::FanStatus;
use crate::history::TemperatureReading;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Requests (client -> daemon)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Status of one fan, or of every fan when `name` is omitted.
    #[serde(rename = "get_fan_status")]
    GetFanStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Set a duty cycle on one fan, or on every fan when `name` is omitted.
    #[serde(rename = "set_duty_cycle")]
    SetDutyCycle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        duty_cycle: u8,
    },

    /// Set a raw PWM count on one fan.
    #[serde(rename = "set_pwm")]
    SetPwm { name: String, pwm: u32 },

    #[serde(rename = "make_fan_bad")]
    MakeFanBad { name: String },

    #[serde(rename = "make_fan_good")]
    MakeFanGood { name: String },

    #[serde(rename = "get_noise")]
    GetNoise { name: String },

    #[serde(rename = "get_thresholds")]
    GetThresholds,

    #[serde(rename = "set_thresholds")]
    SetThresholds {
        temp_low: f64,
        temp_high: f64,
        fan_speed_min: u8,
        fan_speed_max: u8,
    },

    /// Most recent readings first; `max_count` 0 returns the whole series.
    #[serde(rename = "get_temperature_history")]
    GetTemperatureHistory {
        controller: String,
        sensor_id: u32,
        #[serde(default)]
        max_count: usize,
    },

    #[serde(rename = "get_cooling_status")]
    GetCoolingStatus,

    /// Inject a reading batch as if it came off the bus.
    #[serde(rename = "publish_readings")]
    PublishReadings { batch: ReadingBatch },

    /// Make a simulated sensor report Bad, or restore it.
    #[serde(rename = "set_sensor_fault")]
    SetSensorFault {
        controller: String,
        sensor_id: u32,
        faulty: bool,
    },

    /// Add noise to a simulated sensor, or stop.
    #[serde(rename = "set_sensor_noise")]
    SetSensorNoise {
        controller: String,
        sensor_id: u32,
        noisy: bool,
    },

    /// A faulty simulated controller stops publishing readings.
    #[serde(rename = "set_controller_fault")]
    SetControllerFault { controller: String, faulty: bool },

    /// Replace the temperature ramp of one simulated sensor.
    #[serde(rename = "set_simulation_params")]
    SetSimulationParams {
        controller: String,
        sensor_id: u32,
        start_temp: f64,
        end_temp: f64,
        step: f64,
    },

    /// Stream every bus event on this connection until it closes.
    #[serde(rename = "subscribe")]
    Subscribe,
}

// ---------------------------------------------------------------------------
// Responses (daemon -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "fans")]
    Fans { fans: Vec<FanStatus> },

    /// Per-fan outcome of a fleet-wide duty cycle change.
    #[serde(rename = "fan_results")]
    FanResults { results: Vec<DeviceResult> },

    #[serde(rename = "noise")]
    Noise { report: NoiseReport },

    #[serde(rename = "thresholds")]
    Thresholds { thresholds: Thresholds },

    #[serde(rename = "history")]
    History {
        controller: String,
        sensor_id: u32,
        readings: Vec<TemperatureReading>,
    },

    #[serde(rename = "cooling_status")]
    CoolingStatus { status: CoolingStatus },

    /// Operation succeeded.
    #[serde(rename = "ok")]
    Ok { message: String },

    /// Operation failed. `kind` is machine-readable.
    #[serde(rename = "error")]
    Error { kind: String, message: String },

    /// One bus event, pushed to subscribed connections.
    #[serde(rename = "event")]
    Event { event: BusEvent },
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Ok {
            message: message.into(),
        }
    }

    /// A request that could not be parsed.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Response::Error {
            kind: "invalid_request".to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<CoolingError> for Response {
    fn from(err: CoolingError) -> Self {
        Response::Error {
            kind: err.kind_tag().to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Encode a message as a newline-delimited JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(msg)?;
    s.push('\n');
    Ok(s)
}

/// Decode a message from a JSON string (newline-trimmed).
pub fn decode<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EntityKind;

    #[test]
    fn test_encode_is_newline_terminated() {
        let line = encode(&Request::GetThresholds).unwrap();
        assert_eq!(line, "{\"type\":\"get_thresholds\"}\n");
    }

    #[test]
    fn test_optional_name_may_be_omitted() {
        let req: Request = decode(r#"{"type":"set_duty_cycle","duty_cycle":40}"#).unwrap();
        assert_eq!(
            req,
            Request::SetDutyCycle {
                name: None,
                duty_cycle: 40
            }
        );
        let req: Request = decode("{\"type\":\"get_fan_status\"}\n").unwrap();
        assert_eq!(req, Request::GetFanStatus { name: None });
    }

    #[test]
    fn test_history_max_count_defaults_to_all() {
        let req: Request =
            decode(r#"{"type":"get_temperature_history","controller":"MCU1","sensor_id":2}"#)
                .unwrap();
        assert!(matches!(
            req,
            Request::GetTemperatureHistory { max_count: 0, .. }
        ));
    }

    #[test]
    fn test_sensor_fault_request_decodes() {
        let req: Request = decode(
            r#"{"type":"set_sensor_fault","controller":"MCU2","sensor_id":3,"faulty":true}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            Request::SetSensorFault {
                controller: "MCU2".to_string(),
                sensor_id: 3,
                faulty: true
            }
        );
        let missing: Result<Request, _> =
            decode(r#"{"type":"set_controller_fault","controller":"MCU2"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_out_of_range_duty_cycle_fails_decode() {
        assert!(decode::<Request>(r#"{"type":"set_duty_cycle","duty_cycle":300}"#).is_err());
    }

    #[test]
    fn test_error_response_from_cooling_error() {
        let resp = Response::from(CoolingError::not_found(EntityKind::Fan, "Fan9"));
        let json = encode(&resp).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"kind\":\"not_found\""));
        assert!(resp.is_error());
    }

    #[test]
    fn test_publish_readings_accepts_legacy_batch() {
        let req: Request = decode(
            r#"{"type":"publish_readings","batch":{"MCU":"MCU1",
                "SensorData":[{"SensorID":1,"Value":30.0,"Status":"Good"}]}}"#,
        )
        .unwrap();
        match req {
            Request::PublishReadings { batch } => {
                assert_eq!(batch.controller, "MCU1");
                assert_eq!(batch.readings[0].temperature, 30.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
