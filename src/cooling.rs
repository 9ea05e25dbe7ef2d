// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Closed-loop cooling controller.
//!
//! Each tick snapshots the temperature history, rejects controllers whose
//! sensors disagree, interpolates a fan speed from the hottest remaining
//! controller, and forwards it to the fan bank unless the change is inside
//! the hysteresis deadband.

use crate::bank::{DeviceResult, FanBank};
use crate::bus::{AlarmEvent, AlarmSeverity, BusEvent, EventBus};
use crate::clock::Clock;
use crate::config::CoolingConfig;
use crate::error::{CoolingError, Result};
use crate::history::{ControllerAggregate, TemperatureHistoryStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time;

/// Speed change (percentage points) that must be exceeded to apply a tick.
pub const SPEED_DEADBAND: u8 = 10;

/// Temperature change (degrees C) that must be exceeded to apply a tick.
pub const TEMPERATURE_DEADBAND: f64 = 5.0;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub temp_low: f64,
    pub temp_high: f64,
    pub fan_speed_min: u8,
    pub fan_speed_max: u8,
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        if !self.temp_low.is_finite() || !self.temp_high.is_finite() {
            return Err(CoolingError::InvalidInput(
                "temperature thresholds must be finite".to_string(),
            ));
        }
        if self.temp_low >= self.temp_high {
            return Err(CoolingError::InvalidInput(format!(
                "temp_low ({}) must be below temp_high ({})",
                self.temp_low, self.temp_high
            )));
        }
        if self.fan_speed_min > self.fan_speed_max || self.fan_speed_max > 100 {
            return Err(CoolingError::InvalidInput(format!(
                "fan speed range {}-{} must satisfy 0 <= min <= max <= 100",
                self.fan_speed_min, self.fan_speed_max
            )));
        }
        Ok(())
    }

    /// Target duty cycle for a representative temperature. No data means
    /// minimum speed.
    pub fn speed_for(&self, temperature: Option<f64>) -> u8 {
        let Some(t) = temperature else {
            return self.fan_speed_min;
        };
        if t <= self.temp_low {
            return self.fan_speed_min;
        }
        if t >= self.temp_high {
            return self.fan_speed_max;
        }
        let ratio = (t - self.temp_low) / (self.temp_high - self.temp_low);
        let span = f64::from(self.fan_speed_max - self.fan_speed_min);
        self.fan_speed_min + (ratio * span) as u8
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temp_low: 25.0,
            temp_high: 75.0,
            fan_speed_min: 20,
            fan_speed_max: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Descriptive only; every tick computes the same deterministic way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoolingMode {
    Auto,
    Manual,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoolingStatus {
    /// Fleet-wide input temperature; `None` when no controller qualified.
    pub average_temperature: Option<f64>,
    pub current_fan_speed: u8,
    pub cooling_mode: CoolingMode,
}

impl Default for CoolingStatus {
    fn default() -> Self {
        Self {
            average_temperature: None,
            current_fan_speed: 0,
            cooling_mode: CoolingMode::Manual,
        }
    }
}

/// Deadband check between the applied status and a freshly computed one.
pub fn should_apply(old: &CoolingStatus, new: &CoolingStatus) -> bool {
    let speed_delta = old.current_fan_speed.abs_diff(new.current_fan_speed);
    let temp_changed = match (old.average_temperature, new.average_temperature) {
        (Some(a), Some(b)) => (a - b).abs() > TEMPERATURE_DEADBAND,
        (None, None) => false,
        _ => true,
    };
    speed_delta > SPEED_DEADBAND || temp_changed
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Status replaced and forwarded to the fan bank.
    Applied {
        status: CoolingStatus,
        results: Vec<DeviceResult>,
    },
    /// Inside the deadband; nothing changed.
    Suppressed { candidate: CoolingStatus },
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct ControllerState {
    thresholds: Thresholds,
    status: CoolingStatus,
    applied_once: bool,
    /// Controllers with an outstanding high-variance alarm.
    flagged: BTreeSet<String>,
}

pub struct CoolingController {
    state: Mutex<ControllerState>,
    std_dev_threshold: f64,
    update_interval: std::time::Duration,
    store: Arc<TemperatureHistoryStore>,
    bank: Arc<FanBank>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl CoolingController {
    pub fn new(
        settings: &CoolingConfig,
        store: Arc<TemperatureHistoryStore>,
        bank: Arc<FanBank>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let thresholds = settings.thresholds();
        thresholds.validate()?;
        log::info!(
            "Thresholds {:.1}C - {:.1}C, fan speed {}% - {}%, std dev limit {:.1}C",
            thresholds.temp_low,
            thresholds.temp_high,
            thresholds.fan_speed_min,
            thresholds.fan_speed_max,
            settings.std_dev_threshold
        );
        Ok(Self {
            state: Mutex::new(ControllerState {
                thresholds,
                status: CoolingStatus::default(),
                applied_once: false,
                flagged: BTreeSet::new(),
            }),
            std_dev_threshold: settings.std_dev_threshold,
            update_interval: std::time::Duration::from_millis(settings.update_interval_ms),
            store,
            bank,
            bus,
            clock,
        })
    }

    pub fn thresholds(&self) -> Thresholds {
        self.lock().thresholds
    }

    /// Replace all four thresholds at once. Takes effect on the next tick.
    pub fn set_thresholds(&self, thresholds: Thresholds) -> Result<()> {
        thresholds.validate()?;
        self.lock().thresholds = thresholds;
        log::info!(
            "Temperature thresholds set to {:.1}C - {:.1}C, fan speed {}% - {}%",
            thresholds.temp_low,
            thresholds.temp_high,
            thresholds.fan_speed_min,
            thresholds.fan_speed_max
        );
        Ok(())
    }

    pub fn status(&self) -> CoolingStatus {
        self.lock().status.clone()
    }

    /// One control iteration.
    pub fn tick(&self) -> TickOutcome {
        let thresholds = self.thresholds();

        self.store.prune();
        let fleet = self.store.aggregate(self.std_dev_threshold);
        self.report_variance(&fleet.controllers);

        let max_temperature = fleet.max_temperature();
        let candidate = CoolingStatus {
            average_temperature: max_temperature,
            current_fan_speed: thresholds.speed_for(max_temperature),
            cooling_mode: CoolingMode::Manual,
        };
        log::debug!(
            "Calculated fan speed {}% for {:?}C",
            candidate.current_fan_speed,
            candidate.average_temperature
        );

        {
            let mut state = self.lock();
            if state.applied_once && !should_apply(&state.status, &candidate) {
                log::debug!("Change within deadband, no update");
                return TickOutcome::Suppressed { candidate };
            }
            state.status = candidate.clone();
            state.applied_once = true;
        }

        let results = self.bank.set_speed_all(candidate.current_fan_speed);
        let failed = results.iter().filter(|r| !r.ok).count();
        if failed > 0 {
            log::error!(
                "Fan speed {}% rejected by {failed} of {} fan(s)",
                candidate.current_fan_speed,
                results.len()
            );
        } else {
            log::info!("Updated fan speed to {}%", candidate.current_fan_speed);
        }

        self.bus.emit(BusEvent::CoolingStatus(candidate.clone()));
        TickOutcome::Applied {
            status: candidate,
            results,
        }
    }

    /// Run the control loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::info!("Cooling loop started");
        let mut interval = time::interval(self.update_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Cooling loop stopped");
    }

    /// Raise a high-variance alarm for every unreliable controller, and
    /// clear it for flagged controllers that are reliable again or have
    /// dropped out of the history.
    fn report_variance(&self, controllers: &BTreeMap<String, ControllerAggregate>) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            for (name, agg) in controllers {
                match agg {
                    ControllerAggregate::Unreliable { mean, std_dev } => {
                        state.flagged.insert(name.clone());
                        events.push(AlarmEvent::raised(
                            name.as_str(),
                            AlarmSeverity::High,
                            format!(
                                "MCU {name} has high standard deviation: {std_dev:.2}C, mean: {mean:.2}C, hence skipping"
                            ),
                            now,
                        ));
                    }
                    ControllerAggregate::Reliable { mean, std_dev } => {
                        if state.flagged.remove(name) {
                            events.push(AlarmEvent::cleared(
                                name.as_str(),
                                AlarmSeverity::High,
                                format!(
                                    "MCU {name} readings consistent again: std dev {std_dev:.2}C, mean {mean:.2}C"
                                ),
                                now,
                            ));
                        }
                    }
                    ControllerAggregate::Insufficient { good_sensors } => {
                        log::debug!("MCU {name} has {good_sensors} good sensor(s), skipping");
                    }
                }
            }
            let gone: Vec<String> = state
                .flagged
                .iter()
                .filter(|name| !controllers.contains_key(name.as_str()))
                .cloned()
                .collect();
            for name in gone {
                state.flagged.remove(&name);
                events.push(AlarmEvent::cleared(
                    name.as_str(),
                    AlarmSeverity::High,
                    format!("MCU {name} no longer reporting"),
                    now,
                ));
            }
        }
        for event in events {
            self.bus.alarm(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
