// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The bank of fans driven by the cooling loop.
//!
//! Owns every [`FanDevice`], resolves names to devices, broadcasts speed
//! changes best-effort, and watches the fleet for sustained loud noise.

use crate::bus::{AlarmEvent, AlarmSeverity, EventBus};
use crate::clock::Clock;
use crate::config::{FanBankConfig, FanControllerConfig};
use crate::error::{CoolingError, EntityKind, Result};
use crate::fan::{FanDevice, FanStatus};
use crate::model::{ModelCatalog, NoiseCategory};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time;

/// Alarm source name used by the bank itself.
pub const BANK_ALARM_SOURCE: &str = "FanBank";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one device inside a fleet-wide operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResult {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceResult {
    fn from_result(name: &str, result: Result<()>) -> Self {
        Self {
            name: name.to_string(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseReport {
    pub name: String,
    pub noise_db: u32,
    pub category: NoiseCategory,
}

// ---------------------------------------------------------------------------
// Sustained-noise tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoudWindow {
    Quiet,
    Loud { since: DateTime<Utc> },
    /// Alarm fired; stays latched until the fleet goes quiet.
    Alarmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseTransition {
    Raise,
    Clear,
}

impl LoudWindow {
    fn observe(
        &mut self,
        loud: bool,
        now: DateTime<Utc>,
        limit: Duration,
    ) -> Option<NoiseTransition> {
        match (*self, loud) {
            (LoudWindow::Quiet, true) => {
                *self = LoudWindow::Loud { since: now };
                None
            }
            (LoudWindow::Loud { since }, true) if now - since > limit => {
                *self = LoudWindow::Alarmed;
                Some(NoiseTransition::Raise)
            }
            (LoudWindow::Loud { .. }, false) => {
                *self = LoudWindow::Quiet;
                None
            }
            (LoudWindow::Alarmed, false) => {
                *self = LoudWindow::Quiet;
                Some(NoiseTransition::Clear)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

pub struct FanBank {
    /// Fixed at construction; devices guard their own state.
    devices: BTreeMap<String, Arc<FanDevice>>,
    loud: Mutex<LoudWindow>,
    too_loud_after: Duration,
    poll_interval: std::time::Duration,
    device_poll_interval: std::time::Duration,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl FanBank {
    /// Build one device per controller entry. Entries past
    /// `max_fan_controllers` are ignored; an unknown model is an error.
    pub fn new(
        models: &ModelCatalog,
        controllers: &[FanControllerConfig],
        settings: &FanBankConfig,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if controllers.len() > settings.max_fan_controllers {
            log::error!(
                "Max fan controllers exceeded: {} > {}, using the first {}",
                controllers.len(),
                settings.max_fan_controllers,
                settings.max_fan_controllers
            );
        }

        let mut devices = BTreeMap::new();
        for controller in controllers.iter().take(settings.max_fan_controllers) {
            let model = models.get(&controller.model)?;
            model.validate().map_err(CoolingError::InvalidInput)?;
            let device = FanDevice::new(
                controller.name.clone(),
                model,
                controller.i2c_address,
                bus.clone(),
                clock.clone(),
            );
            log::debug!(
                "Created fan {} (model {})",
                controller.name,
                controller.model
            );
            devices.insert(controller.name.clone(), Arc::new(device));
        }
        log::info!("Fan bank ready with {} fan(s)", devices.len());

        Ok(Self {
            devices,
            loud: Mutex::new(LoudWindow::Quiet),
            too_loud_after: Duration::minutes(i64::from(settings.too_loud_minutes)),
            poll_interval: std::time::Duration::from_millis(settings.poll_interval_ms),
            device_poll_interval: std::time::Duration::from_millis(
                settings.device_poll_interval_ms,
            ),
            bus,
            clock,
        })
    }

    pub fn device(&self, name: &str) -> Result<&Arc<FanDevice>> {
        self.devices.get(name).ok_or_else(|| {
            log::warn!("Attempted to access non-existent fan: {name}");
            CoolingError::not_found(EntityKind::Fan, name)
        })
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<FanDevice>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn status(&self, name: &str) -> Result<FanStatus> {
        Ok(self.device(name)?.status())
    }

    pub fn status_all(&self) -> Vec<FanStatus> {
        self.devices.values().map(|d| d.status()).collect()
    }

    pub fn set_speed(&self, name: &str, duty_cycle: u8) -> Result<()> {
        self.device(name)?.set_speed(duty_cycle)
    }

    /// Apply a duty cycle to every fan. Each fan is attempted regardless of
    /// earlier failures; the per-fan outcomes are returned.
    pub fn set_speed_all(&self, duty_cycle: u8) -> Vec<DeviceResult> {
        log::debug!("Setting all fans to {duty_cycle}%");
        self.devices
            .iter()
            .map(|(name, device)| {
                let result = device.set_speed(duty_cycle);
                if let Err(e) = &result {
                    log::error!("Failed to set fan speed for {name}: {e}");
                }
                DeviceResult::from_result(name, result)
            })
            .collect()
    }

    pub fn set_pwm(&self, name: &str, pwm_count: u32) -> Result<()> {
        self.device(name)?.set_pwm(pwm_count)
    }

    pub fn make_bad(&self, name: &str) -> Result<()> {
        log::info!("Making fan bad: {name}");
        self.device(name)?.make_bad()
    }

    pub fn make_good(&self, name: &str) -> Result<()> {
        log::info!("Making fan good: {name}");
        self.device(name)?.make_good()
    }

    pub fn noise(&self, name: &str) -> Result<NoiseReport> {
        let noise_db = self.device(name)?.noise_db();
        Ok(NoiseReport {
            name: name.to_string(),
            noise_db,
            category: NoiseCategory::from_db(noise_db),
        })
    }

    /// Whether any fan is currently louder than the moderate band.
    pub fn is_loud(&self) -> bool {
        self.devices
            .values()
            .any(|d| d.noise_db() > NoiseCategory::MODERATE_MAX_DB)
    }

    /// One sustained-noise evaluation.
    pub fn tick(&self) -> Option<NoiseTransition> {
        let loud = self.is_loud();
        let now = self.clock.now();
        let transition = self
            .loud
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(loud, now, self.too_loud_after);

        match transition {
            Some(NoiseTransition::Raise) => {
                let minutes = self.too_loud_after.num_minutes();
                self.bus.alarm(AlarmEvent::raised(
                    BANK_ALARM_SOURCE,
                    AlarmSeverity::High,
                    format!("Fans are too loud for more than {minutes} minute(s)"),
                    now,
                ));
            }
            Some(NoiseTransition::Clear) => {
                self.bus.alarm(AlarmEvent::cleared(
                    BANK_ALARM_SOURCE,
                    AlarmSeverity::High,
                    "Fan noise back within the moderate band",
                    now,
                ));
            }
            None => {}
        }
        transition
    }

    /// Run the noise tick until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::info!("Fan bank loop started");
        let mut interval = time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Fan bank loop stopped");
    }

    /// Spawn one self-poll task per device.
    pub fn spawn_device_polls(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.devices
            .values()
            .map(|device| {
                tokio::spawn(crate::fan::run_poll(
                    device.clone(),
                    self.device_poll_interval,
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{AlarmState, BusEvent};
    use crate::clock::ManualClock;
    use crate::model::{default_axial_model, default_blower_model};

    fn controllers() -> Vec<FanControllerConfig> {
        vec![
            FanControllerConfig {
                name: "Fan1".to_string(),
                model: "Blower-A".to_string(),
                i2c_address: 0x2c,
            },
            FanControllerConfig {
                name: "Fan2".to_string(),
                model: "Axial-B".to_string(),
                i2c_address: 0x2d,
            },
        ]
    }

    fn bank() -> (FanBank, EventBus, Arc<ManualClock>) {
        let models = ModelCatalog::new([default_blower_model(), default_axial_model()]);
        let bus = EventBus::new(256);
        let clock = Arc::new(ManualClock::default());
        let settings = FanBankConfig {
            too_loud_minutes: 5,
            ..FanBankConfig::default()
        };
        let bank = FanBank::new(&models, &controllers(), &settings, bus.clone(), clock.clone())
            .unwrap();
        (bank, bus, clock)
    }

    fn alarms(rx: &mut tokio::sync::broadcast::Receiver<BusEvent>) -> Vec<AlarmEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::Alarm(a) = event {
                out.push(a);
            }
        }
        out
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let models = ModelCatalog::new([default_blower_model()]);
        let result = FanBank::new(
            &models,
            &controllers(),
            &FanBankConfig::default(),
            EventBus::default(),
            Arc::new(ManualClock::default()),
        );
        assert!(matches!(
            result,
            Err(CoolingError::NotFound { kind: EntityKind::Model, .. })
        ));
    }

    #[test]
    fn test_invalid_model_is_rejected() {
        let mut inverted = default_blower_model();
        inverted.duty_cycle_min = 80;
        inverted.duty_cycle_max = 20;
        let models = ModelCatalog::new([inverted, default_axial_model()]);
        let result = FanBank::new(
            &models,
            &controllers(),
            &FanBankConfig::default(),
            EventBus::default(),
            Arc::new(ManualClock::default()),
        );
        assert!(matches!(result, Err(CoolingError::InvalidInput(_))));
    }

    #[test]
    fn test_controllers_beyond_limit_are_ignored() {
        let models = ModelCatalog::new([default_blower_model(), default_axial_model()]);
        let settings = FanBankConfig {
            max_fan_controllers: 1,
            ..FanBankConfig::default()
        };
        let bank = FanBank::new(
            &models,
            &controllers(),
            &settings,
            EventBus::default(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        assert_eq!(bank.len(), 1);
    }

    #[test]
    fn test_set_speed_all_is_best_effort() {
        let (bank, _, _) = bank();
        bank.make_bad("Fan1").unwrap();
        let results = bank.set_speed_all(60);
        assert_eq!(results.len(), 2);
        assert!(!results[0].ok);
        assert!(results[0].error.is_some());
        assert!(results[1].ok);
        assert_eq!(bank.status("Fan2").unwrap().duty_cycle, 60);
    }

    #[test]
    fn test_unknown_fan_is_not_found() {
        let (bank, _, _) = bank();
        assert!(matches!(
            bank.set_speed("Fan9", 50),
            Err(CoolingError::NotFound { kind: EntityKind::Fan, .. })
        ));
        assert!(bank.noise("Fan9").is_err());
    }

    #[test]
    fn test_noise_report() {
        let (bank, _, _) = bank();
        bank.set_speed("Fan1", 80).unwrap();
        let report = bank.noise("Fan1").unwrap();
        assert_eq!(report.noise_db, 58);
        assert_eq!(report.category, NoiseCategory::Loud);
    }

    #[test]
    fn test_sustained_noise_raises_exactly_once() {
        let (bank, bus, clock) = bank();
        let mut rx = bus.subscribe();
        bank.set_speed_all(100);

        assert_eq!(bank.tick(), None);
        clock.advance(Duration::minutes(5));
        assert_eq!(bank.tick(), None);
        clock.advance(Duration::seconds(1));
        assert_eq!(bank.tick(), Some(NoiseTransition::Raise));
        for _ in 0..10 {
            clock.advance(Duration::minutes(5));
            assert_eq!(bank.tick(), None);
        }

        let raised: Vec<_> = alarms(&mut rx)
            .into_iter()
            .filter(|a| a.state == AlarmState::Raised)
            .collect();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].source, BANK_ALARM_SOURCE);
    }

    #[test]
    fn test_quiet_before_deadline_cancels_window() {
        let (bank, bus, clock) = bank();
        let mut rx = bus.subscribe();
        bank.set_speed_all(100);
        bank.tick();
        clock.advance(Duration::minutes(4));
        bank.tick();
        bank.set_speed_all(20);
        bank.tick();
        bank.set_speed_all(100);
        clock.advance(Duration::minutes(2));
        bank.tick();
        clock.advance(Duration::minutes(4));
        assert_eq!(bank.tick(), None);
        assert!(alarms(&mut rx).is_empty());
    }

    #[test]
    fn test_alarm_clears_when_fleet_goes_quiet() {
        let (bank, bus, clock) = bank();
        let mut rx = bus.subscribe();
        bank.set_speed_all(100);
        bank.tick();
        clock.advance(Duration::minutes(6));
        assert_eq!(bank.tick(), Some(NoiseTransition::Raise));
        bank.set_speed_all(0);
        assert_eq!(bank.tick(), Some(NoiseTransition::Clear));
        let states: Vec<_> = alarms(&mut rx).into_iter().map(|a| a.state).collect();
        assert_eq!(states, vec![AlarmState::Raised, AlarmState::Cleared]);
    }
}
