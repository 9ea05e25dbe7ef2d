// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Synthetic temperature source.
//!
//! Each simulated sensor ramps between its start and end temperature and
//! bounces at the ends. Bad sensors report a fixed 5.0 C; noisy sensors add
//! uniform noise and are clamped to 10-100 C. A faulty controller publishes
//! nothing. Batches are fed straight into the history store.
//!
//! Faults and ramp parameters can be changed while the simulator runs, so
//! clients can exercise the outlier rejection end to end.

use crate::bus::{AlarmEvent, AlarmSeverity, EventBus, ReadingBatch, SensorSample};
use crate::clock::Clock;
use crate::config::SimulatorConfig;
use crate::error::{CoolingError, EntityKind, Result};
use crate::history::{SensorStatus, TemperatureHistoryStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time;

/// Temperature reported by a faulted sensor.
pub const BAD_SENSOR_TEMPERATURE: f64 = 5.0;

const NOISY_MIN: f64 = 10.0;
const NOISY_MAX: f64 = 100.0;

/// Ramp bounds and step of one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub start_temp: f64,
    pub end_temp: f64,
    pub step: f64,
}

impl Ramp {
    pub fn validate(&self) -> Result<()> {
        let finite = self.start_temp.is_finite() && self.end_temp.is_finite();
        if !finite || !self.step.is_finite() {
            return Err(CoolingError::InvalidInput(
                "ramp temperatures and step must be finite".to_string(),
            ));
        }
        if self.step <= 0.0 || self.start_temp > self.end_temp {
            return Err(CoolingError::InvalidInput(format!(
                "ramp {:.1}C - {:.1}C step {} needs start <= end and a positive step",
                self.start_temp, self.end_temp, self.step
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SimulatedSensor {
    id: u32,
    bad: bool,
    noisy: bool,
    ramp: Ramp,
    temperature: f64,
    rising: bool,
}

impl SimulatedSensor {
    fn read(&mut self, noise_amplitude: f64, rng: &mut StdRng) -> SensorSample {
        if self.bad {
            return SensorSample {
                sensor_id: self.id,
                temperature: BAD_SENSOR_TEMPERATURE,
                status: SensorStatus::Bad,
            };
        }

        if self.rising {
            self.temperature += self.ramp.step;
        } else {
            self.temperature -= self.ramp.step;
        }
        if self.temperature < self.ramp.start_temp {
            self.rising = true;
            self.temperature = self.ramp.start_temp;
        } else if self.temperature > self.ramp.end_temp {
            self.rising = false;
            self.temperature = self.ramp.end_temp;
        }

        if !self.noisy {
            return SensorSample {
                sensor_id: self.id,
                temperature: self.temperature,
                status: SensorStatus::Good,
            };
        }
        let amplitude = noise_amplitude.abs();
        let noise = if amplitude > 0.0 && amplitude.is_finite() {
            rng.gen_range(-amplitude..amplitude)
        } else {
            0.0
        };
        SensorSample {
            sensor_id: self.id,
            temperature: (self.temperature + noise).clamp(NOISY_MIN, NOISY_MAX),
            status: SensorStatus::Noisy,
        }
    }
}

#[derive(Debug)]
struct SimulatedController {
    name: String,
    faulty: bool,
    sensors: Vec<SimulatedSensor>,
}

struct SimulatorState {
    controllers: Vec<SimulatedController>,
    rng: StdRng,
}

pub struct Simulator {
    interval: std::time::Duration,
    noise_amplitude: f64,
    state: Mutex<SimulatorState>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl Simulator {
    pub fn new(settings: &SimulatorConfig, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(settings, StdRng::from_entropy(), bus, clock)
    }

    /// Deterministic noise, for tests.
    pub fn with_seed(
        settings: &SimulatorConfig,
        seed: u64,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed), bus, clock)
    }

    fn with_rng(
        settings: &SimulatorConfig,
        rng: StdRng,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ramp = Ramp {
            start_temp: settings.start_temp,
            end_temp: settings.end_temp,
            step: settings.step,
        };
        let controllers = settings
            .controllers
            .iter()
            .map(|c| SimulatedController {
                name: c.name.clone(),
                faulty: false,
                sensors: (1..=c.sensors)
                    .map(|id| SimulatedSensor {
                        id,
                        bad: c.bad_sensors.contains(&id),
                        noisy: c.noisy_sensors.contains(&id),
                        ramp,
                        temperature: ramp.start_temp,
                        rising: true,
                    })
                    .collect(),
            })
            .collect();
        Self {
            interval: std::time::Duration::from_millis(settings.interval_ms),
            noise_amplitude: settings.noise_amplitude,
            state: Mutex::new(SimulatorState { controllers, rng }),
            bus,
            clock,
        }
    }

    /// Read every sensor once; one batch per healthy controller.
    pub fn sample(&self) -> Vec<ReadingBatch> {
        let timestamp = self.clock.now();
        let mut state = self.lock();
        let SimulatorState { controllers, rng } = &mut *state;
        controllers
            .iter_mut()
            .filter(|c| !c.faulty)
            .map(|c| ReadingBatch {
                controller: c.name.clone(),
                timestamp,
                readings: c
                    .sensors
                    .iter_mut()
                    .map(|s| s.read(self.noise_amplitude, rng))
                    .collect(),
            })
            .collect()
    }

    /// Make a sensor report a fixed low reading with status Bad, or restore it.
    pub fn set_sensor_fault(&self, controller: &str, sensor_id: u32, faulty: bool) -> Result<()> {
        let changed = self.with_sensor(controller, sensor_id, |sensor| {
            std::mem::replace(&mut sensor.bad, faulty) != faulty
        })?;
        if changed {
            let message = if faulty {
                format!("MCU {controller} Sensor {sensor_id} marked as bad")
            } else {
                format!("MCU {controller} Sensor {sensor_id} back to good")
            };
            log::info!("{message}");
            self.report(controller, AlarmSeverity::Medium, message, faulty);
        }
        Ok(())
    }

    /// Add uniform noise to a sensor's readings, or stop doing so.
    pub fn set_sensor_noise(&self, controller: &str, sensor_id: u32, noisy: bool) -> Result<()> {
        let changed = self.with_sensor(controller, sensor_id, |sensor| {
            std::mem::replace(&mut sensor.noisy, noisy) != noisy
        })?;
        if changed {
            let message = if noisy {
                format!("MCU {controller} Sensor {sensor_id} set to noisy mode")
            } else {
                format!("MCU {controller} Sensor {sensor_id} set to normal mode")
            };
            log::info!("{message}");
            self.report(controller, AlarmSeverity::Low, message, noisy);
        }
        Ok(())
    }

    /// A faulty controller stops publishing until restored.
    pub fn set_controller_fault(&self, controller: &str, faulty: bool) -> Result<()> {
        let changed = {
            let mut state = self.lock();
            let target = find_controller(&mut state.controllers, controller)?;
            std::mem::replace(&mut target.faulty, faulty) != faulty
        };
        if changed {
            if faulty {
                log::error!("MCU {controller} set to faulty state");
                self.report(
                    controller,
                    AlarmSeverity::High,
                    format!("MCU {controller} set to faulty state"),
                    true,
                );
            } else {
                log::info!("MCU {controller} set to normal state");
                self.report(
                    controller,
                    AlarmSeverity::High,
                    format!("MCU {controller} is back to normal"),
                    false,
                );
            }
        }
        Ok(())
    }

    /// Replace one sensor's ramp. The current temperature is pulled inside
    /// the new bounds on the next read.
    pub fn set_ramp(&self, controller: &str, sensor_id: u32, ramp: Ramp) -> Result<()> {
        ramp.validate()?;
        self.with_sensor(controller, sensor_id, |sensor| sensor.ramp = ramp)?;
        log::info!(
            "MCU {controller} Sensor {sensor_id} ramp set to {:.1}C - {:.1}C, step {}",
            ramp.start_temp,
            ramp.end_temp,
            ramp.step
        );
        Ok(())
    }

    /// Feed the store at the configured interval until shutdown.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<TemperatureHistoryStore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!(
            "Simulating {} controller(s) every {:?}",
            self.lock().controllers.len(),
            self.interval
        );
        let mut interval = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for batch in self.sample() {
                        store.ingest_batch(&batch);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Simulator stopped");
    }

    fn with_sensor<T>(
        &self,
        controller: &str,
        sensor_id: u32,
        f: impl FnOnce(&mut SimulatedSensor) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let target = find_controller(&mut state.controllers, controller)?;
        let sensor = target
            .sensors
            .iter_mut()
            .find(|s| s.id == sensor_id)
            .ok_or_else(|| {
                CoolingError::not_found(EntityKind::Sensor, format!("{controller}/{sensor_id}"))
            })?;
        Ok(f(sensor))
    }

    fn report(&self, controller: &str, severity: AlarmSeverity, message: String, raised: bool) {
        let now = self.clock.now();
        let event = if raised {
            AlarmEvent::raised(controller, severity, message, now)
        } else {
            AlarmEvent::cleared(controller, severity, message, now)
        };
        self.bus.alarm(event);
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_controller<'a>(
    controllers: &'a mut [SimulatedController],
    name: &str,
) -> Result<&'a mut SimulatedController> {
    controllers
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| CoolingError::not_found(EntityKind::Controller, name))
}
