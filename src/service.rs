// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The assembled appliance and its request dispatcher.
//!
//! [`CoolingService`] wires the history store, fan bank, cooling
//! controller and optional sensor simulator to one event bus, and maps
//! protocol requests onto them.

use crate::bank::FanBank;
use crate::bus::{BusEvent, EventBus};
use crate::clock::Clock;
use crate::config::Config;
use crate::cooling::{CoolingController, Thresholds};
use crate::error::{CoolingError, Result};
use crate::history::TemperatureHistoryStore;
use crate::model::ModelCatalog;
use crate::protocol::{Request, Response};
use crate::simulator::{Ramp, Simulator};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub struct CoolingService {
    pub store: Arc<TemperatureHistoryStore>,
    pub bank: Arc<FanBank>,
    pub controller: Arc<CoolingController>,
    /// Present when the configuration enables the simulator.
    pub simulator: Option<Arc<Simulator>>,
    pub bus: EventBus,
}

impl CoolingService {
    /// Validate `config` and build every component from it.
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new(config.daemon.event_capacity);
        let models = ModelCatalog::new(config.fan_models.iter().cloned());
        let store = Arc::new(TemperatureHistoryStore::new(
            config.cooling.retention(),
            clock.clone(),
        ));
        let bank = Arc::new(FanBank::new(
            &models,
            &config.fan_controllers,
            &config.fan_bank,
            bus.clone(),
            clock.clone(),
        )?);
        let controller = Arc::new(CoolingController::new(
            &config.cooling,
            store.clone(),
            bank.clone(),
            bus.clone(),
            clock.clone(),
        )?);
        let simulator = config
            .simulator
            .enabled
            .then(|| Arc::new(Simulator::new(&config.simulator, bus.clone(), clock)));
        Ok(Self {
            store,
            bank,
            controller,
            simulator,
            bus,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Spawn the cooling loop, the noise loop, one poll task per fan and
    /// the simulator when there is one.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            tokio::spawn(self.controller.clone().run(shutdown.clone())),
            tokio::spawn(self.bank.clone().run(shutdown.clone())),
        ];
        tasks.extend(self.bank.spawn_device_polls(shutdown));
        match &self.simulator {
            Some(simulator) => tasks.push(tokio::spawn(
                simulator.clone().run(self.store.clone(), shutdown.clone()),
            )),
            None => log::info!("Simulator disabled, waiting for published readings"),
        }
        tasks
    }

    fn require_simulator(&self) -> Result<&Simulator> {
        self.simulator
            .as_deref()
            .ok_or_else(|| CoolingError::InvalidInput("simulator is disabled".to_string()))
    }

    /// Execute one request. `subscribe` is only acknowledged here; the
    /// connection that sent it is responsible for streaming events.
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Request failed: {e}");
                Response::from(e)
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::GetFanStatus { name: Some(name) } => Response::Fans {
                fans: vec![self.bank.status(&name)?],
            },
            Request::GetFanStatus { name: None } => Response::Fans {
                fans: self.bank.status_all(),
            },

            Request::SetDutyCycle { duty_cycle, .. } if duty_cycle > 100 => {
                return Err(CoolingError::InvalidInput(format!(
                    "duty cycle {duty_cycle} is outside 0-100"
                )));
            }
            Request::SetDutyCycle {
                name: Some(name),
                duty_cycle,
            } => {
                self.bank.set_speed(&name, duty_cycle)?;
                Response::ok(format!("Set {name} to {duty_cycle}%"))
            }
            Request::SetDutyCycle {
                name: None,
                duty_cycle,
            } => Response::FanResults {
                results: self.bank.set_speed_all(duty_cycle),
            },

            Request::SetPwm { name, pwm } => {
                self.bank.set_pwm(&name, pwm)?;
                Response::ok(format!("Set {name} to PWM {pwm}"))
            }

            Request::MakeFanBad { name } => {
                self.bank.make_bad(&name)?;
                Response::ok(format!("{name} marked as bad"))
            }
            Request::MakeFanGood { name } => {
                self.bank.make_good(&name)?;
                Response::ok(format!("{name} marked as good"))
            }

            Request::GetNoise { name } => Response::Noise {
                report: self.bank.noise(&name)?,
            },

            Request::GetThresholds => Response::Thresholds {
                thresholds: self.controller.thresholds(),
            },
            Request::SetThresholds {
                temp_low,
                temp_high,
                fan_speed_min,
                fan_speed_max,
            } => {
                let thresholds = Thresholds {
                    temp_low,
                    temp_high,
                    fan_speed_min,
                    fan_speed_max,
                };
                self.controller.set_thresholds(thresholds)?;
                Response::Thresholds { thresholds }
            }

            Request::GetTemperatureHistory {
                controller,
                sensor_id,
                max_count,
            } => {
                let readings = self.store.history(&controller, sensor_id, max_count)?;
                Response::History {
                    controller,
                    sensor_id,
                    readings,
                }
            }

            Request::GetCoolingStatus => Response::CoolingStatus {
                status: self.controller.status(),
            },

            Request::PublishReadings { batch } => {
                let count = self.store.ingest_batch(&batch);
                Response::ok(format!("Ingested {count} reading(s) from {}", batch.controller))
            }

            Request::SetSensorFault {
                controller,
                sensor_id,
                faulty,
            } => {
                self.require_simulator()?
                    .set_sensor_fault(&controller, sensor_id, faulty)?;
                let state = if faulty { "faulty" } else { "normal" };
                Response::ok(format!("{controller} sensor {sensor_id} is {state}"))
            }
            Request::SetSensorNoise {
                controller,
                sensor_id,
                noisy,
            } => {
                self.require_simulator()?
                    .set_sensor_noise(&controller, sensor_id, noisy)?;
                let state = if noisy { "noisy" } else { "normal" };
                Response::ok(format!("{controller} sensor {sensor_id} is {state}"))
            }
            Request::SetControllerFault { controller, faulty } => {
                self.require_simulator()?.set_controller_fault(&controller, faulty)?;
                let state = if faulty { "faulty" } else { "normal" };
                Response::ok(format!("{controller} is {state}"))
            }
            Request::SetSimulationParams {
                controller,
                sensor_id,
                start_temp,
                end_temp,
                step,
            } => {
                let ramp = Ramp {
                    start_temp,
                    end_temp,
                    step,
                };
                self.require_simulator()?.set_ramp(&controller, sensor_id, ramp)?;
                Response::ok(format!(
                    "{controller} sensor {sensor_id} ramps {start_temp:.1}C - {end_temp:.1}C"
                ))
            }

            Request::Subscribe => Response::ok("Subscribed"),
        };
        Ok(response)
    }
}
