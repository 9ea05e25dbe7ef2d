// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! End-to-end tests driving the assembled service through the protocol.

use chrono::Duration;
use std::sync::Arc;
use thermal_cooling_sim::bank::NoiseTransition;
use thermal_cooling_sim::bus::{AlarmState, BusEvent};
use thermal_cooling_sim::clock::{ManualClock, SystemClock};
use thermal_cooling_sim::config::Config;
use thermal_cooling_sim::fan::FanHealth;
use thermal_cooling_sim::history::{ControllerAggregate, SensorStatus, DEFAULT_STD_DEV_THRESHOLD};
use thermal_cooling_sim::protocol::{self, Request, Response};
use thermal_cooling_sim::service::CoolingService;
use tokio::sync::watch;

fn service() -> (CoolingService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let svc = CoolingService::new(&Config::default(), clock.clone()).unwrap();
    (svc, clock)
}

/// Round-trip a request through the wire encoding, as the daemon does.
fn call(svc: &CoolingService, json: &str) -> Response {
    let request: Request = protocol::decode(json).unwrap();
    let response = svc.handle(request);
    let line = protocol::encode(&response).unwrap();
    protocol::decode(&line).unwrap()
}

fn publish(svc: &CoolingService, controller: &str, temps: &[f64]) {
    let readings: Vec<String> = temps
        .iter()
        .enumerate()
        .map(|(i, t)| {
            format!(
                r#"{{"sensor_id":{},"temperature":{t:.1},"status":"Good"}}"#,
                i + 1
            )
        })
        .collect();
    let json = format!(
        r#"{{"type":"publish_readings","batch":{{"controller":"{controller}","readings":[{}]}}}}"#,
        readings.join(",")
    );
    assert!(matches!(call(svc, &json), Response::Ok { .. }));
}

#[test]
fn test_readings_drive_fan_speed() {
    let (svc, _) = service();
    publish(&svc, "MCU1", &[49.0, 51.0]);
    publish(&svc, "MCU2", &[30.0, 31.0]);
    svc.controller.tick();

    match call(&svc, r#"{"type":"get_cooling_status"}"#) {
        Response::CoolingStatus { status } => {
            assert_eq!(status.average_temperature, Some(50.0));
            assert_eq!(status.current_fan_speed, 60);
        }
        other => panic!("unexpected {other:?}"),
    }
    match call(&svc, r#"{"type":"get_fan_status"}"#) {
        Response::Fans { fans } => {
            assert_eq!(fans.len(), 4);
            assert!(fans.iter().all(|f| f.duty_cycle == 60));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_history_is_newest_first() {
    let (svc, clock) = service();
    for t in [30.0, 31.0, 32.0] {
        publish(&svc, "MCU1", &[t, t]);
        clock.advance(Duration::seconds(1));
    }
    match call(
        &svc,
        r#"{"type":"get_temperature_history","controller":"MCU1","sensor_id":1,"max_count":2}"#,
    ) {
        Response::History { readings, .. } => {
            let temps: Vec<f64> = readings.iter().map(|r| r.temperature).collect();
            assert_eq!(temps, vec![32.0, 31.0]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_fault_injection_is_best_effort_for_fleet() {
    let (svc, _) = service();
    assert!(matches!(
        call(&svc, r#"{"type":"make_fan_bad","name":"Fan2"}"#),
        Response::Ok { .. }
    ));

    match call(&svc, r#"{"type":"set_duty_cycle","duty_cycle":70}"#) {
        Response::FanResults { results } => {
            let failed: Vec<_> = results
                .iter()
                .filter(|r| !r.ok)
                .map(|r| r.name.as_str())
                .collect();
            assert_eq!(failed, vec!["Fan2"]);
        }
        other => panic!("unexpected {other:?}"),
    }

    match call(&svc, r#"{"type":"set_duty_cycle","name":"Fan2","duty_cycle":70}"#) {
        Response::Error { kind, .. } => assert_eq!(kind, "device_fault"),
        other => panic!("unexpected {other:?}"),
    }

    call(&svc, r#"{"type":"make_fan_good","name":"Fan2"}"#);
    let fan = svc.bank.status("Fan2").unwrap();
    assert_eq!(fan.status, FanHealth::Good);
    assert!(matches!(
        call(&svc, r#"{"type":"set_duty_cycle","name":"Fan2","duty_cycle":70}"#),
        Response::Ok { .. }
    ));
}

#[test]
fn test_noise_and_pwm_requests() {
    let (svc, _) = service();
    call(&svc, r#"{"type":"set_pwm","name":"Fan1","pwm":255}"#);
    match call(&svc, r#"{"type":"get_noise","name":"Fan1"}"#) {
        Response::Noise { report } => assert_eq!(report.noise_db, 67),
        other => panic!("unexpected {other:?}"),
    }
    match call(&svc, r#"{"type":"get_noise","name":"Nope"}"#) {
        Response::Error { kind, .. } => assert_eq!(kind, "not_found"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_sustained_noise_alarm_reaches_subscribers() {
    let (svc, clock) = service();
    let mut events = svc.subscribe();
    call(&svc, r#"{"type":"set_duty_cycle","duty_cycle":100}"#);

    assert_eq!(svc.bank.tick(), None);
    clock.advance(Duration::minutes(6));
    assert_eq!(svc.bank.tick(), Some(NoiseTransition::Raise));

    let mut raised = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BusEvent::Alarm(alarm) = event {
            raised.push(alarm);
        }
    }
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].state, AlarmState::Raised);
}

/// One simulator step, ingested the way the background loop does it.
fn simulate(svc: &CoolingService) {
    let simulator = svc.simulator.as_ref().unwrap();
    for batch in simulator.sample() {
        svc.store.ingest_batch(&batch);
    }
}

#[test]
fn test_injected_sensor_fault_leaves_aggregation() {
    let (svc, _) = service();
    let ramp = r#"{"type":"set_simulation_params","controller":"MCU1","sensor_id":2,
        "start_temp":80.0,"end_temp":90.0,"step":1.0}"#;
    assert!(matches!(call(&svc, ramp), Response::Ok { .. }));
    simulate(&svc);
    let fleet = svc.store.aggregate(DEFAULT_STD_DEV_THRESHOLD);
    assert!(matches!(
        fleet.controllers["MCU1"],
        ControllerAggregate::Unreliable { .. }
    ));

    let fault = r#"{"type":"set_sensor_fault","controller":"MCU1","sensor_id":2,"faulty":true}"#;
    assert!(matches!(call(&svc, fault), Response::Ok { .. }));
    simulate(&svc);
    assert_eq!(svc.store.latest("MCU1", 2).unwrap().status, SensorStatus::Bad);
    let fleet = svc.store.aggregate(DEFAULT_STD_DEV_THRESHOLD);
    assert_eq!(
        fleet.controllers["MCU1"],
        ControllerAggregate::Reliable {
            mean: 26.0,
            std_dev: 0.0
        }
    );
}

#[test]
fn test_faulty_controller_expires_from_history() {
    let (svc, clock) = service();
    simulate(&svc);
    let fault = r#"{"type":"set_controller_fault","controller":"MCU2","faulty":true}"#;
    assert!(matches!(call(&svc, fault), Response::Ok { .. }));

    clock.advance(Duration::minutes(11));
    simulate(&svc);
    svc.controller.tick();
    let controllers = svc.store.controllers();
    assert!(controllers.contains_key("MCU1"));
    assert!(!controllers.contains_key("MCU2"));

    let unknown = r#"{"type":"set_controller_fault","controller":"MCU7","faulty":true}"#;
    match call(&svc, unknown) {
        Response::Error { kind, .. } => assert_eq!(kind, "not_found"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_invalid_request_line() {
    let decoded = protocol::decode::<Request>("{\"type\":\"launch_rockets\"}\n");
    assert!(decoded.is_err());
}

#[tokio::test]
async fn test_background_loops_apply_and_stop() {
    let mut config = Config::default();
    config.cooling.update_interval_ms = 10;
    config.fan_bank.poll_interval_ms = 10;
    config.fan_bank.device_poll_interval_ms = 10;
    config.simulator.enabled = false;
    let svc = CoolingService::new(&config, Arc::new(SystemClock)).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = svc.spawn(&shutdown_rx);

    publish(&svc, "MCU1", &[74.0, 76.0]);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(svc.controller.status().current_fan_speed, 100);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
