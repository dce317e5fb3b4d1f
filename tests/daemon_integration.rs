//! End-to-end runs of the supervisor with real controller threads and a manual clock.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use greenhouse_control::acquisition::input::InputConfig;
use greenhouse_control::actuation::actions::DaemonControl;
use greenhouse_control::actuation::output::OutputConfig;
use greenhouse_control::actuation::pid_controller::{
    OutputBinding, PidConfig, PidDirection, PidField, PidOutputType, SetpointTracking,
};
use greenhouse_control::config::MeasurementRef;
use greenhouse_control::runtime::clock::ManualClock;
use greenhouse_control::storage::measurement::{DeviceMeasurement, MeasurementType};
use greenhouse_control::storage::store::SeriesKey;
use greenhouse_control::{ConfigStore, Supervisor, SystemConfig};

fn measurement(unique_id: &str, device_id: &str, channel: u32, name: &str, unit: &str) -> DeviceMeasurement {
    DeviceMeasurement {
        unique_id: unique_id.into(),
        device_id: device_id.into(),
        channel,
        measurement: name.into(),
        unit: unit.into(),
        conversion_id: None,
        measurement_type: MeasurementType::Normal,
        is_enabled: true,
        rescale: None,
    }
}

fn heater_loop(lock_dir: &std::path::Path) -> SystemConfig {
    let mut cfg = SystemConfig::default();
    cfg.settings.lock_dir = lock_dir.to_path_buf();
    cfg.settings.sample_rate_controller_input = 0.01;
    cfg.settings.sample_rate_controller_pid = 0.01;
    cfg.settings.sample_rate_controller_output = 0.01;
    cfg.settings.attempt_execute_times = 1;
    cfg.settings.housekeeping_interval = 3600.0;

    cfg.measurements.push(measurement("m_temp", "in1", 0, "temperature", "C"));
    let mut options = toml::Table::new();
    options.insert("values".into(), toml::Value::Array(vec![toml::Value::Float(18.0)]));
    cfg.inputs.push(InputConfig {
        unique_id: "in1".into(),
        name: "bench sensor".into(),
        device: "constant".into(),
        is_activated: true,
        period: 5.0,
        start_offset: 0.0,
        pre_output_id: None,
        pre_output_channel: 0,
        pre_output_duration: 0.0,
        pre_output_during_measure: false,
        options,
    });
    cfg.outputs.push(OutputConfig {
        unique_id: "heater".into(),
        name: "Heater".into(),
        output_type: "simulated_pwm".into(),
        channels: 1,
        options: toml::Table::new(),
    });
    cfg.pids.push(PidConfig {
        unique_id: "p1".into(),
        name: "heat".into(),
        is_activated: true,
        is_held: false,
        is_paused: false,
        period: 5.0,
        start_offset: 0.0,
        max_measure_age: 60.0,
        measurement: MeasurementRef::new("in1", "m_temp"),
        direction: PidDirection::Raise,
        setpoint: 23.0,
        band: 0.0,
        kp: 2.0,
        ki: 0.0,
        kd: 0.0,
        integrator_min: -100.0,
        integrator_max: 100.0,
        raise_output: Some(OutputBinding {
            output_id: "heater".into(),
            channel: 0,
            output_type: PidOutputType::Pwm,
            min_duration: 0.0,
            max_duration: 0.0,
            min_off_duration: 0.0,
            always_min: false,
        }),
        lower_output: None,
        setpoint_tracking: SetpointTracking::None,
        method_start_time: None,
        method_end_time: None,
        store_lower_as_negative: false,
        send_lower_as_negative: false,
    });
    cfg
}

/// Advances the clock a second at a time, giving the loops real time to tick, until `check`.
fn run_until(clock: &ManualClock, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        clock.advance(1.0);
        thread::sleep(Duration::from_millis(30));
        if check() {
            return true;
        }
    }
    false
}

#[test]
fn sample_config_parses() {
    let cfg = SystemConfig::from_toml(include_str!("../config/greenhouse.toml")).unwrap();
    assert_eq!(cfg.inputs.len(), 1);
    assert_eq!(cfg.maths.len(), 1);
    assert_eq!(cfg.pids.len(), 1);
    assert_eq!(cfg.methods.len(), 2);
    assert_eq!(cfg.conditionals[0].conditions.len(), 2);
    assert_eq!(cfg.triggers.len(), 2);
    assert!(!cfg.triggers[0].is_activated);
    assert_eq!(cfg.actions.len(), 3);
}

#[test]
fn heater_pid_follows_input() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_noon());
    let sup = Supervisor::new(ConfigStore::new(heater_loop(dir.path())), clock.clone()).unwrap();
    sup.start().unwrap();

    let temp = SeriesKey::new("in1", "C").channel(0).measurement("temperature");
    let outputs = sup.output_controller();
    assert!(run_until(&clock, || outputs.duty_cycle("heater", 0).unwrap_or(0.0) > 0.0));
    assert_eq!(sup.store().read_last(&temp, None).unwrap().map(|(_, v)| v), Some(18.0));

    assert_eq!(sup.pid_get("p1", PidField::Setpoint).unwrap(), Some(23.0));
    sup.pid_set("p1", PidField::Setpoint, 25.0).unwrap();
    assert_eq!(sup.config().pid("p1").unwrap().setpoint, 25.0);

    sup.pid_pause("p1").unwrap();
    assert_eq!(outputs.duty_cycle("heater", 0), Some(0.0));
    assert!(sup.config().pid("p1").unwrap().is_paused);
    sup.pid_resume("p1").unwrap();
    assert!(run_until(&clock, || outputs.duty_cycle("heater", 0).unwrap_or(0.0) > 0.0));

    sup.shutdown();
    assert_eq!(outputs.duty_cycle("heater", 0), Some(0.0));
}

#[test]
fn activation_changes_reach_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greenhouse.toml");
    let cfg = heater_loop(&dir.path().join("locks"));
    std::fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();

    let sup = Supervisor::new(ConfigStore::load(&path).unwrap(), Arc::new(ManualClock::at_noon())).unwrap();
    sup.start().unwrap();
    assert!(sup.controller_is_active("p1"));
    sup.controller_deactivate("p1").unwrap();
    assert!(!sup.controller_is_active("p1"));
    sup.shutdown();

    let reloaded = ConfigStore::load(&path).unwrap();
    assert!(!reloaded.pid("p1").unwrap().is_activated);
    assert!(reloaded.input("in1").unwrap().is_activated);
}
