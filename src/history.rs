// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Per-sensor temperature history with a retention window, plus the
//! per-controller aggregation the cooling loop feeds on.
//!
//! All series sit behind one store-wide lock. Every critical section is a
//! pure in-memory mutation or copy; nothing blocks while the lock is held.

use crate::bus::ReadingBatch;
use crate::clock::Clock;
use crate::error::{CoolingError, EntityKind, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default retention window in minutes.
pub const DEFAULT_RETENTION_MINUTES: u64 = 10;

/// Default population standard deviation above which a controller's
/// readings are considered unreliable, in degrees Celsius.
pub const DEFAULT_STD_DEV_THRESHOLD: f64 = 5.0;

/// Minimum number of Good sensors a controller needs to be aggregated.
pub const MIN_QUALIFYING_SENSORS: usize = 2;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    Good,
    Bad,
    Noisy,
}

/// A single reading. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub controller: String,
    pub sensor_id: u32,
    pub temperature: f64,
    pub status: SensorStatus,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of aggregating one controller's latest readings.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAggregate {
    /// Mean of the Good sensors; this controller's representative temperature.
    Reliable { mean: f64, std_dev: f64 },
    /// Spread too wide (or not finite); excluded from this tick.
    Unreliable { mean: f64, std_dev: f64 },
    /// Fewer than two Good sensors.
    Insufficient { good_sensors: usize },
}

/// Aggregates for every controller, taken from one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetAggregate {
    pub controllers: BTreeMap<String, ControllerAggregate>,
}

impl FleetAggregate {
    /// Worst-case temperature: the maximum representative temperature over
    /// all reliable controllers, or `None` when no controller qualifies.
    pub fn max_temperature(&self) -> Option<f64> {
        self.controllers
            .values()
            .filter_map(|agg| match agg {
                ControllerAggregate::Reliable { mean, .. } => Some(*mean),
                _ => None,
            })
            .reduce(f64::max)
    }

    pub fn unreliable(&self) -> impl Iterator<Item = (&str, f64, f64)> {
        self.controllers.iter().filter_map(|(name, agg)| match agg {
            ControllerAggregate::Unreliable { mean, std_dev } => {
                Some((name.as_str(), *mean, *std_dev))
            }
            _ => None,
        })
    }
}

/// Mean and population standard deviation.
pub fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Classify one controller's Good temperatures.
pub fn aggregate_controller(temperatures: &[f64], std_dev_threshold: f64) -> ControllerAggregate {
    if temperatures.len() < MIN_QUALIFYING_SENSORS {
        return ControllerAggregate::Insufficient {
            good_sensors: temperatures.len(),
        };
    }
    let (mean, std_dev) = mean_and_std_dev(temperatures);
    if !std_dev.is_finite() || !mean.is_finite() || std_dev > std_dev_threshold {
        ControllerAggregate::Unreliable { mean, std_dev }
    } else {
        ControllerAggregate::Reliable { mean, std_dev }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type Series = VecDeque<TemperatureReading>;

pub struct TemperatureHistoryStore {
    series: Mutex<BTreeMap<String, BTreeMap<u32, Series>>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl TemperatureHistoryStore {
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            series: Mutex::new(BTreeMap::new()),
            retention,
            clock,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Append a reading stamped with the current time and drop readings of
    /// the same series that fell out of the retention window.
    pub fn ingest(&self, controller: &str, sensor_id: u32, temperature: f64, status: SensorStatus) {
        let now = self.clock.now();
        let cutoff = now - self.retention;
        let reading = TemperatureReading {
            controller: controller.to_string(),
            sensor_id,
            temperature,
            status,
            timestamp: now,
        };

        let mut all = self.lock();
        let series = all
            .entry(controller.to_string())
            .or_default()
            .entry(sensor_id)
            .or_default();
        series.push_back(reading);
        // Never empties: the reading just pushed is inside the window.
        prune_series(series, cutoff);
    }

    /// Forward every tuple of a bus batch to [`TemperatureHistoryStore::ingest`].
    pub fn ingest_batch(&self, batch: &ReadingBatch) -> usize {
        for sample in &batch.readings {
            self.ingest(
                &batch.controller,
                sample.sensor_id,
                sample.temperature,
                sample.status,
            );
        }
        log::debug!(
            "Ingested {} reading(s) from {}",
            batch.readings.len(),
            batch.controller
        );
        batch.readings.len()
    }

    /// Drop expired readings from every series, then forget series and
    /// controllers left empty. Returns how many readings went.
    pub fn prune(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut removed = 0;
        let mut all = self.lock();
        all.retain(|controller, sensors| {
            sensors.retain(|_, series| {
                removed += prune_series(series, cutoff);
                !series.is_empty()
            });
            if sensors.is_empty() {
                log::debug!("Controller {controller} expired from history");
            }
            !sensors.is_empty()
        });
        removed
    }

    /// Up to `max_count` readings, most recent first. `max_count == 0`
    /// returns the whole retained series.
    pub fn history(
        &self,
        controller: &str,
        sensor_id: u32,
        max_count: usize,
    ) -> Result<Vec<TemperatureReading>> {
        let all = self.lock();
        let series = find_series(&all, controller, sensor_id)?;
        let limit = if max_count == 0 { series.len() } else { max_count };
        Ok(series.iter().rev().take(limit).cloned().collect())
    }

    /// Most recent reading of one series.
    pub fn latest(&self, controller: &str, sensor_id: u32) -> Option<TemperatureReading> {
        let all = self.lock();
        find_series(&all, controller, sensor_id)
            .ok()
            .and_then(|series| series.back().cloned())
    }

    /// Known controllers and their sensor ids.
    pub fn controllers(&self) -> BTreeMap<String, Vec<u32>> {
        self.lock()
            .iter()
            .map(|(name, sensors)| (name.clone(), sensors.keys().copied().collect()))
            .collect()
    }

    /// Snapshot the latest Good temperature of every sensor, then aggregate
    /// per controller. Readings that arrive after the snapshot wait for the
    /// next call.
    pub fn aggregate(&self, std_dev_threshold: f64) -> FleetAggregate {
        let snapshot: Vec<(String, Vec<f64>)> = {
            let all = self.lock();
            all.iter()
                .map(|(controller, sensors)| {
                    let temps = sensors
                        .iter()
                        .filter_map(|(sensor_id, series)| {
                            let latest = series.back()?;
                            if latest.status != SensorStatus::Good {
                                log::debug!(
                                    "{controller} sensor {sensor_id} is {:?}, skipping",
                                    latest.status
                                );
                                return None;
                            }
                            Some(latest.temperature)
                        })
                        .collect();
                    (controller.clone(), temps)
                })
                .collect()
        };

        let controllers = snapshot
            .into_iter()
            .map(|(controller, temps)| {
                let agg = aggregate_controller(&temps, std_dev_threshold);
                log::debug!("{controller}: {temps:?} -> {agg:?}");
                (controller, agg)
            })
            .collect();
        FleetAggregate { controllers }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, BTreeMap<u32, Series>>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prune_series(series: &mut Series, cutoff: DateTime<Utc>) -> usize {
    let mut removed = 0;
    while series.front().is_some_and(|r| r.timestamp < cutoff) {
        series.pop_front();
        removed += 1;
    }
    removed
}

fn find_series<'a>(
    all: &'a BTreeMap<String, BTreeMap<u32, Series>>,
    controller: &str,
    sensor_id: u32,
) -> Result<&'a Series> {
    all.get(controller)
        .ok_or_else(|| CoolingError::not_found(EntityKind::Controller, controller))?
        .get(&sensor_id)
        .ok_or_else(|| {
            CoolingError::not_found(EntityKind::Sensor, format!("{controller}/{sensor_id}"))
        })
}
