// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error taxonomy shared by every caller-facing operation.
//!
//! Unreliable sensor data is deliberately absent here: it is reported as
//! the `Unreliable` arm of a controller aggregate, never as an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Controller,
    Sensor,
    Fan,
    Model,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Controller => "controller",
            EntityKind::Sensor => "sensor",
            EntityKind::Fan => "fan",
            EntityKind::Model => "fan model",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoolingError {
    /// Unknown controller, sensor, fan or model.
    #[error("unknown {kind}: {name}")]
    NotFound { kind: EntityKind, name: String },

    /// Value outside its valid range; the operation was not applied.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The device is marked Bad and refuses writes.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// A status or alarm message could not be delivered.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl CoolingError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        CoolingError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Short machine-readable tag used on the control socket.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            CoolingError::NotFound { .. } => "not_found",
            CoolingError::InvalidInput(_) => "invalid_input",
            CoolingError::DeviceFault(_) => "device_fault",
            CoolingError::Transport(_) => "transport",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoolingError>;
