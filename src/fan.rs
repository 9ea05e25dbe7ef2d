// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Simulated fan device.
//!
//! Each device owns its duty-cycle/PWM pair and a simulated controller
//! register. The pair is only ever updated together, after a successful
//! register write, so it always matches the model's linear mapping.

use crate::bus::{AlarmEvent, AlarmSeverity, BusEvent, EventBus};
use crate::clock::Clock;
use crate::error::{CoolingError, Result};
use crate::model::{FanModel, NoiseCategory};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanHealth {
    Good,
    Bad,
}

/// Status snapshot of one fan, as published and returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanStatus {
    pub name: String,
    pub model: String,
    pub status: FanHealth,
    pub duty_cycle: u8,
    pub pwm_count: u32,
    pub noise_db: u32,
    pub noise_category: NoiseCategory,
    pub interface: String,
    pub i2c_address: u8,
    pub pwm_register: u8,
    pub pwm_min: u32,
    pub pwm_max: u32,
    pub duty_cycle_min: u8,
    pub duty_cycle_max: u8,
}

#[derive(Debug)]
struct FanState {
    health: FanHealth,
    duty_cycle: u8,
    pwm_count: u32,
    /// Last value written to the simulated PWM register.
    register: u32,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct FanDevice {
    name: String,
    model: Arc<FanModel>,
    i2c_address: u8,
    state: Mutex<FanState>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl FanDevice {
    /// A new device starts Good, at the bottom of its model's range.
    pub fn new(
        name: String,
        model: Arc<FanModel>,
        i2c_address: u8,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = FanState {
            health: FanHealth::Good,
            duty_cycle: model.duty_cycle_min,
            pwm_count: model.pwm_min,
            register: model.pwm_min,
        };
        Self {
            name,
            model,
            i2c_address,
            state: Mutex::new(state),
            bus,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &FanModel {
        &self.model
    }

    pub fn health(&self) -> FanHealth {
        self.lock().health
    }

    pub fn duty_cycle(&self) -> u8 {
        self.lock().duty_cycle
    }

    pub fn pwm_count(&self) -> u32 {
        self.lock().pwm_count
    }

    /// Current noise, derived from the duty cycle.
    pub fn noise_db(&self) -> u32 {
        self.model.noise_at(self.duty_cycle())
    }

    /// Set speed as a duty cycle. Values inside 0-100 are clamped to the
    /// model's duty range; the clamped value is what gets stored.
    pub fn set_speed(&self, duty_cycle: u8) -> Result<()> {
        if duty_cycle > 100 {
            return Err(CoolingError::InvalidInput(format!(
                "duty cycle {duty_cycle} is outside 0-100"
            )));
        }
        let duty = self.model.clamp_duty_cycle(duty_cycle);
        let pwm = self.model.duty_cycle_to_pwm(duty);
        self.apply(duty, pwm)
    }

    /// Set speed as a raw PWM count, clamped to the model's PWM range.
    pub fn set_pwm(&self, pwm_count: u32) -> Result<()> {
        let pwm = self.model.clamp_pwm(pwm_count);
        let duty = self.model.pwm_to_duty_cycle(pwm);
        self.apply(duty, pwm)
    }

    /// Inject a fault. Already-Bad devices are left as they are.
    pub fn make_bad(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.health == FanHealth::Bad {
                log::debug!("{}: already in bad state", self.name);
                return Ok(());
            }
            state.health = FanHealth::Bad;
        }
        log::warn!("{}: marked as bad", self.name);
        self.bus.alarm(AlarmEvent::raised(
            self.name.as_str(),
            AlarmSeverity::High,
            "Fan marked as bad",
            self.clock.now(),
        ));
        self.publish_status();
        Ok(())
    }

    /// Clear an injected fault. Already-Good devices are left as they are.
    pub fn make_good(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.health == FanHealth::Good {
                log::debug!("{}: already in good state", self.name);
                return Ok(());
            }
            state.health = FanHealth::Good;
        }
        log::info!("{}: marked as good", self.name);
        self.bus.alarm(AlarmEvent::cleared(
            self.name.as_str(),
            AlarmSeverity::High,
            "Fan back to good state",
            self.clock.now(),
        ));
        self.publish_status();
        Ok(())
    }

    /// One self-poll: read the register back and resync the pair if the
    /// hardware drifted from what was last written. Returns true on drift.
    pub fn poll(&self) -> bool {
        let changed = {
            let mut state = self.lock();
            let pwm = self.model.clamp_pwm(read_register(&state));
            if pwm == state.pwm_count {
                false
            } else {
                log::debug!(
                    "{}: register reads {pwm}, expected {}",
                    self.name,
                    state.pwm_count
                );
                state.pwm_count = pwm;
                state.duty_cycle = self.model.pwm_to_duty_cycle(pwm);
                true
            }
        };
        if changed {
            self.publish_status();
        }
        changed
    }

    pub fn status(&self) -> FanStatus {
        let (health, duty_cycle, pwm_count) = {
            let state = self.lock();
            (state.health, state.duty_cycle, state.pwm_count)
        };
        let noise_db = self.model.noise_at(duty_cycle);
        FanStatus {
            name: self.name.clone(),
            model: self.model.name.clone(),
            status: health,
            duty_cycle,
            pwm_count,
            noise_db,
            noise_category: NoiseCategory::from_db(noise_db),
            interface: self.model.interface.clone(),
            i2c_address: self.i2c_address,
            pwm_register: self.model.pwm_register,
            pwm_min: self.model.pwm_min,
            pwm_max: self.model.pwm_max,
            duty_cycle_min: self.model.duty_cycle_min,
            duty_cycle_max: self.model.duty_cycle_max,
        }
    }

    fn apply(&self, duty_cycle: u8, pwm_count: u32) -> Result<()> {
        {
            let mut state = self.lock();
            if state.health == FanHealth::Bad {
                log::warn!("{}: cannot set speed, fan is in bad state", self.name);
                return Err(CoolingError::DeviceFault(format!(
                    "fan {} is in bad state",
                    self.name
                )));
            }
            write_register(&mut state, pwm_count)?;
            state.pwm_count = pwm_count;
            state.duty_cycle = duty_cycle;
        }
        log::debug!(
            "{}: wrote PWM {pwm_count} to register {:#04x} at {:#04x} ({duty_cycle}%)",
            self.name,
            self.model.pwm_register,
            self.i2c_address
        );
        self.publish_status();
        Ok(())
    }

    fn publish_status(&self) {
        self.bus.emit(BusEvent::FanStatus(self.status()));
    }

    fn lock(&self) -> MutexGuard<'_, FanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poll a device's register at a fixed interval until shutdown.
pub async fn run_poll(
    device: Arc<FanDevice>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("{}: monitoring started", device.name());
    let mut interval = time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                device.poll();
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("{}: monitoring stopped", device.name());
}

// ---------------------------------------------------------------------------
// Simulated register access
// ---------------------------------------------------------------------------

fn write_register(state: &mut FanState, value: u32) -> Result<()> {
    if state.health == FanHealth::Bad {
        return Err(CoolingError::DeviceFault(
            "register write rejected by faulted controller".to_string(),
        ));
    }
    state.register = value;
    Ok(())
}

fn read_register(state: &FanState) -> u32 {
    state.register
}
