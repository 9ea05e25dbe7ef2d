// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Simulated thermal-management appliance.
//!
//! Temperature readings from several controllers are kept in a bounded
//! history, aggregated with outlier rejection, and turned into a fan speed
//! that is pushed to a bank of simulated fans. The fans support fault
//! injection and raise an alarm when the fleet stays loud too long.

pub mod bank;
pub mod bus;
pub mod clock;
pub mod config;
pub mod cooling;
pub mod error;
pub mod fan;
pub mod history;
pub mod model;
pub mod protocol;
pub mod service;
pub mod simulator;
