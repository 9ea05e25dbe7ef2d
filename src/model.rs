// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan model definitions and unit conversion.
//!
//! A model maps a duty cycle (0-100 %) linearly onto its device-native PWM
//! range and carries a stepwise noise profile (duty cycle -> dB).

use crate::error::{CoolingError, EntityKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One step of a noise profile: at or above `duty_cycle`, the fan emits at
/// least `noise_db`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NoiseStep {
    pub duty_cycle: u8,
    pub noise_db: u32,
}

/// Static description of a fan model. Read-only after startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanModel {
    pub name: String,
    pub pwm_min: u32,
    pub pwm_max: u32,
    pub duty_cycle_min: u8,
    pub duty_cycle_max: u8,
    /// Bus the controller sits on, e.g. "I2C".
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Register the PWM count is written to.
    #[serde(default)]
    pub pwm_register: u8,
    /// Steps sorted by ascending duty cycle.
    #[serde(default)]
    pub noise_profile: Vec<NoiseStep>,
}

impl FanModel {
    /// Create a model. Noise steps are sorted by duty cycle automatically.
    pub fn new(
        name: String,
        pwm_range: (u32, u32),
        duty_cycle_range: (u8, u8),
        mut noise_profile: Vec<NoiseStep>,
    ) -> Self {
        noise_profile.sort_by_key(|s| s.duty_cycle);
        Self {
            name,
            pwm_min: pwm_range.0,
            pwm_max: pwm_range.1,
            duty_cycle_min: duty_cycle_range.0,
            duty_cycle_max: duty_cycle_range.1,
            interface: default_interface(),
            pwm_register: 0,
            noise_profile,
        }
    }

    /// Clamp to the duty range, then map linearly onto the PWM range.
    pub fn duty_cycle_to_pwm(&self, duty_cycle: u8) -> u32 {
        let duty = self.clamp_duty_cycle(duty_cycle);
        let span = f64::from(self.duty_cycle_max.saturating_sub(self.duty_cycle_min));
        if span == 0.0 {
            return self.pwm_min;
        }
        let ratio = f64::from(duty.saturating_sub(self.duty_cycle_min)) / span;
        self.pwm_min + (ratio * f64::from(self.pwm_max.saturating_sub(self.pwm_min))) as u32
    }

    /// Inverse of [`FanModel::duty_cycle_to_pwm`]: clamp, then interpolate.
    pub fn pwm_to_duty_cycle(&self, pwm: u32) -> u8 {
        let pwm = self.clamp_pwm(pwm);
        let span = f64::from(self.pwm_max.saturating_sub(self.pwm_min));
        if span == 0.0 {
            return self.duty_cycle_min;
        }
        let ratio = f64::from(pwm.saturating_sub(self.pwm_min)) / span;
        self.duty_cycle_min
            + (ratio * f64::from(self.duty_cycle_max.saturating_sub(self.duty_cycle_min))) as u8
    }

    /// Inverted ranges (rejected by [`FanModel::validate`]) resolve to the
    /// upper bound instead of panicking.
    pub fn clamp_duty_cycle(&self, duty_cycle: u8) -> u8 {
        duty_cycle.max(self.duty_cycle_min).min(self.duty_cycle_max)
    }

    pub fn clamp_pwm(&self, pwm: u32) -> u32 {
        pwm.max(self.pwm_min).min(self.pwm_max)
    }

    /// Noise at a duty cycle: the step with the highest threshold not above
    /// `duty_cycle`, or 0 dB when the fan is below every step.
    pub fn noise_at(&self, duty_cycle: u8) -> u32 {
        self.noise_profile
            .iter()
            .filter(|s| s.duty_cycle <= duty_cycle)
            .max_by_key(|s| s.duty_cycle)
            .map(|s| s.noise_db)
            .unwrap_or(0)
    }

    /// Validate ranges and noise profile ordering.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pwm_min >= self.pwm_max {
            return Err(format!(
                "Model '{}': pwm_min ({}) must be below pwm_max ({})",
                self.name, self.pwm_min, self.pwm_max
            ));
        }
        if self.duty_cycle_min >= self.duty_cycle_max || self.duty_cycle_max > 100 {
            return Err(format!(
                "Model '{}': duty cycle range {}-{} is not a valid percentage range",
                self.name, self.duty_cycle_min, self.duty_cycle_max
            ));
        }
        for (i, step) in self.noise_profile.iter().enumerate() {
            if i > 0 && step.duty_cycle <= self.noise_profile[i - 1].duty_cycle {
                return Err(format!(
                    "Model '{}': noise steps must have strictly increasing duty cycles (step {i})",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// Acoustic bands, loudest last. Reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoiseCategory {
    Quiet,
    Moderate,
    Loud,
    VeryLoud,
    ExtremelyLoud,
    PainfullyLoud,
    Dangerous,
}

impl NoiseCategory {
    /// Upper bound (inclusive) of the moderate band; anything louder counts
    /// toward the sustained-noise alarm.
    pub const MODERATE_MAX_DB: u32 = 50;

    pub fn from_db(db: u32) -> Self {
        match db {
            0..=40 => NoiseCategory::Quiet,
            41..=50 => NoiseCategory::Moderate,
            51..=60 => NoiseCategory::Loud,
            61..=70 => NoiseCategory::VeryLoud,
            71..=80 => NoiseCategory::ExtremelyLoud,
            81..=90 => NoiseCategory::PainfullyLoud,
            _ => NoiseCategory::Dangerous,
        }
    }
}

/// Models by name, shared read-only by every device.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, Arc<FanModel>>,
}

impl ModelCatalog {
    pub fn new(models: impl IntoIterator<Item = FanModel>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|m| (m.name.clone(), Arc::new(m)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<FanModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| CoolingError::not_found(EntityKind::Model, name))
    }

    pub fn duty_cycle_to_pwm(&self, model: &str, duty_cycle: u8) -> Result<u32> {
        Ok(self.get(model)?.duty_cycle_to_pwm(duty_cycle))
    }

    pub fn pwm_to_duty_cycle(&self, model: &str, pwm: u32) -> Result<u8> {
        Ok(self.get(model)?.pwm_to_duty_cycle(pwm))
    }

    pub fn noise_at(&self, model: &str, duty_cycle: u8) -> Result<u32> {
        Ok(self.get(model)?.noise_at(duty_cycle))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// An 8-bit PWM blower, quiet at low speed and loud near the top.
pub fn default_blower_model() -> FanModel {
    let mut model = FanModel::new(
        "Blower-A".to_string(),
        (0, 255),
        (0, 100),
        vec![
            NoiseStep { duty_cycle: 0, noise_db: 25 },
            NoiseStep { duty_cycle: 40, noise_db: 38 },
            NoiseStep { duty_cycle: 60, noise_db: 48 },
            NoiseStep { duty_cycle: 80, noise_db: 58 },
            NoiseStep { duty_cycle: 100, noise_db: 67 },
        ],
    );
    model.pwm_register = 0x10;
    model
}

/// A 10-bit axial fan with a stall floor at 20 % duty.
pub fn default_axial_model() -> FanModel {
    let mut model = FanModel::new(
        "Axial-B".to_string(),
        (100, 1023),
        (20, 100),
        vec![
            NoiseStep { duty_cycle: 20, noise_db: 30 },
            NoiseStep { duty_cycle: 50, noise_db: 42 },
            NoiseStep { duty_cycle: 75, noise_db: 55 },
            NoiseStep { duty_cycle: 90, noise_db: 62 },
        ],
    );
    model.pwm_register = 0x22;
    model
}

fn default_interface() -> String {
    "I2C".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duty_to_pwm_endpoints() {
        let model = default_blower_model();
        assert_eq!(model.duty_cycle_to_pwm(0), 0);
        assert_eq!(model.duty_cycle_to_pwm(100), 255);
        assert_eq!(model.duty_cycle_to_pwm(50), 127);
    }

    #[test]
    fn test_duty_to_pwm_clamps() {
        let model = default_axial_model();
        assert_eq!(model.duty_cycle_to_pwm(5), model.pwm_min);
        assert_eq!(model.duty_cycle_to_pwm(100), model.pwm_max);

        let narrow = FanModel::new("narrow".to_string(), (10, 90), (30, 70), Vec::new());
        assert_eq!(narrow.duty_cycle_to_pwm(10), 10);
        assert_eq!(narrow.duty_cycle_to_pwm(95), 90);
    }

    #[test]
    fn test_pwm_to_duty_clamps() {
        let model = default_axial_model();
        assert_eq!(model.pwm_to_duty_cycle(0), 20);
        assert_eq!(model.pwm_to_duty_cycle(5000), 100);
    }

    #[test]
    fn test_round_trip_within_one_unit() {
        for model in [default_blower_model(), default_axial_model()] {
            for duty in model.duty_cycle_min..=model.duty_cycle_max {
                let back = model.pwm_to_duty_cycle(model.duty_cycle_to_pwm(duty));
                assert!(
                    (i32::from(back) - i32::from(duty)).abs() <= 1,
                    "{}: {duty} -> {back}",
                    model.name
                );
            }
        }
    }

    #[test]
    fn test_noise_highest_matching_step_wins() {
        let model = default_blower_model();
        assert_eq!(model.noise_at(0), 25);
        assert_eq!(model.noise_at(59), 38);
        assert_eq!(model.noise_at(60), 48);
        assert_eq!(model.noise_at(99), 58);
        assert_eq!(model.noise_at(100), 67);
    }

    #[test]
    fn test_noise_below_every_step_is_silent() {
        let model = default_axial_model();
        assert_eq!(model.noise_at(10), 0);
    }

    #[test]
    fn test_noise_categories() {
        assert_eq!(NoiseCategory::from_db(0), NoiseCategory::Quiet);
        assert_eq!(NoiseCategory::from_db(40), NoiseCategory::Quiet);
        assert_eq!(NoiseCategory::from_db(50), NoiseCategory::Moderate);
        assert_eq!(NoiseCategory::from_db(51), NoiseCategory::Loud);
        assert_eq!(NoiseCategory::from_db(70), NoiseCategory::VeryLoud);
        assert_eq!(NoiseCategory::from_db(80), NoiseCategory::ExtremelyLoud);
        assert_eq!(NoiseCategory::from_db(90), NoiseCategory::PainfullyLoud);
        assert_eq!(NoiseCategory::from_db(91), NoiseCategory::Dangerous);
    }

    #[test]
    fn test_catalog_unknown_model() {
        let catalog = ModelCatalog::new([default_blower_model()]);
        assert!(matches!(
            catalog.duty_cycle_to_pwm("Nope", 50),
            Err(CoolingError::NotFound { kind: EntityKind::Model, .. })
        ));
        assert_eq!(catalog.duty_cycle_to_pwm("Blower-A", 100), Ok(255));
    }

    #[test]
    fn test_validation_rejects_inverted_ranges() {
        let model = FanModel::new("bad".to_string(), (200, 100), (0, 100), Vec::new());
        assert!(model.validate().is_err());
        let model = FanModel::new("bad".to_string(), (0, 255), (0, 120), Vec::new());
        assert!(model.validate().is_err());
        assert!(default_axial_model().validate().is_ok());
    }

    #[test]
    fn test_inverted_ranges_do_not_panic() {
        let model = FanModel::new("bad".to_string(), (200, 100), (80, 20), Vec::new());
        assert_eq!(model.clamp_duty_cycle(50), 20);
        assert_eq!(model.duty_cycle_to_pwm(50), 200);
        assert_eq!(model.pwm_to_duty_cycle(150), 80);
    }
}
