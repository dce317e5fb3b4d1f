//! input.rs
//! Input controller: polls one device on a period, optionally gated by a pre-output.
//!
//! Per tick:
//! 1. When `now` passes the next measurement time, flag a measurement (only if the
//!    previous one finished before that boundary) and push the schedule past `now`.
//! 2. With a pre-output, take the shared lock and switch the output on, either for a
//!    fixed duration before measuring or for the whole measurement.
//! 3. Once the pre-output timer elapses (or immediately without one), measure, convert
//!    and store, then release the lock.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::acquisition::driver::{
    ChannelTable, InputDriver, ListenerSink, build_driver, readings_to_batch,
};
use crate::actuation::output::{OutputOnKind, SharedOutputs};
use crate::config::{ConfigStore, ControllerKind, DaemonSettings};
use crate::error::{ControlError, Result};
use crate::runtime::clock::SharedClock;
use crate::runtime::controller::{Controller, LoopControl};
use crate::runtime::lock_manager::{LockGuard, LockManager};
use crate::storage::store::{SharedStore, write_measurements};
use crate::utils::metrics::{SharedMetrics, lock};

fn default_true() -> bool {
    true
}

/// Consecutive "no data" results before one is logged.
const NO_DATA_LOG_EVERY: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    /// Driver registry name.
    pub device: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    pub period: f64,
    #[serde(default)]
    pub start_offset: f64,
    #[serde(default)]
    pub pre_output_id: Option<String>,
    #[serde(default)]
    pub pre_output_channel: u32,
    #[serde(default)]
    pub pre_output_duration: f64,
    #[serde(default)]
    pub pre_output_during_measure: bool,
    #[serde(default)]
    pub options: toml::Table,
}

/// Output toggled around an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct PreOutputBinding {
    pub output_id: String,
    pub output_channel: u32,
    pub duration: f64,
    pub during_measure: bool,
    pub lock_name: String,
}

impl PreOutputBinding {
    /// Only bound when an output is named and the duration is positive.
    pub fn from_config(config: &InputConfig) -> Option<Self> {
        let output_id = config.pre_output_id.as_ref().filter(|id| !id.is_empty())?;
        if config.pre_output_duration <= 0.0 {
            return None;
        }
        Some(Self {
            output_id: output_id.clone(),
            output_channel: config.pre_output_channel,
            duration: config.pre_output_duration,
            during_measure: config.pre_output_during_measure,
            lock_name: format!("input_pre_output_{}_{}", output_id, config.pre_output_channel),
        })
    }
}

pub struct InputController {
    id: String,
    label: String,
    config: ConfigStore,
    store: SharedStore,
    clock: SharedClock,
    outputs: SharedOutputs,
    locks: LockManager,
    metrics: Option<SharedMetrics>,

    settings: DaemonSettings,
    period: f64,
    driver: Option<Box<dyn InputDriver>>,
    channels: ChannelTable,
    pre_output: Option<PreOutputBinding>,

    schedule_started: bool,
    next_measurement: f64,
    last_measurement: f64,
    get_new_measurement: bool,
    pre_output_activated: bool,
    pre_output_timer: f64,
    pre_output_lock: Option<LockGuard>,
    no_data_count: u32,
}

impl InputController {
    pub fn new(
        id: &str,
        config: ConfigStore,
        store: SharedStore,
        clock: SharedClock,
        outputs: SharedOutputs,
        locks: LockManager,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            id: id.to_string(),
            label: format!("Input {}", id),
            settings: config.settings(),
            config,
            store,
            clock,
            outputs,
            locks,
            metrics,
            period: 0.0,
            driver: None,
            channels: Arc::new(Vec::new()),
            pre_output: None,
            schedule_started: false,
            next_measurement: 0.0,
            last_measurement: 0.0,
            get_new_measurement: false,
            pre_output_activated: false,
            pre_output_timer: 0.0,
            pre_output_lock: None,
            no_data_count: 0,
        }
    }

    pub fn next_measurement_time(&self) -> f64 {
        self.next_measurement
    }

    /// Pulls the next measurement forward to now.
    pub fn force_measurement(&mut self) {
        self.next_measurement = self.clock.epoch();
        info!("[{}] Measurement forced", self.label);
    }

    fn update_measure(&mut self) -> Result<usize> {
        let Some(driver) = self.driver.as_mut() else {
            return Err(ControlError::Driver("no driver loaded".into()));
        };
        let result = driver.next_measurement();
        let use_same_timestamp = driver.measurements_use_same_timestamp();
        self.last_measurement = self.clock.epoch();

        let readings = match result {
            Ok(readings) => {
                self.no_data_count = 0;
                readings
            }
            Err(ControlError::NoData) => {
                self.no_data_count += 1;
                if self.no_data_count >= NO_DATA_LOG_EVERY {
                    self.no_data_count = 0;
                    error!(
                        "[{}] No data {} times in a row. Check that the device is connected and detected",
                        self.label, NO_DATA_LOG_EVERY
                    );
                }
                return Ok(0);
            }
            Err(e) => {
                error!("[{}] Measurement failed: {}", self.label, e);
                return Ok(0);
            }
        };

        let batch = readings_to_batch(&self.label, &self.channels, &readings);
        let written = write_measurements(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.id,
            batch,
            use_same_timestamp,
        )?;
        if let Some(metrics) = &self.metrics {
            lock(metrics).record_samples(written);
        }
        debug!("[{}] Stored {} measurement(s)", self.label, written);
        Ok(written)
    }

    fn activate_pre_output(&mut self, binding: &PreOutputBinding, now: f64) -> Result<bool> {
        let timeout = self.settings.pre_output_lock_timeout;
        let Some(guard) = self.locks.acquire(&binding.lock_name, timeout)? else {
            error!(
                "[{}] Could not acquire pre-output lock '{}' within {}s",
                self.label, binding.lock_name, timeout
            );
            if self.locks.break_if_stale(&binding.lock_name, timeout)? {
                warn!("[{}] Broke stale lock for future locking", self.label);
            }
            return Ok(false);
        };
        self.pre_output_lock = Some(guard);
        self.pre_output_timer = now + binding.duration;
        self.pre_output_activated = true;

        let reply = if binding.during_measure {
            // on now, off after the measurement
            self.outputs.output_on(
                &binding.output_id,
                binding.output_channel,
                OutputOnKind::None,
                0.0,
                0.0,
                false,
            )
        } else {
            // on for the duration, measure once it has turned off
            self.outputs.output_on(
                &binding.output_id,
                binding.output_channel,
                OutputOnKind::Sec,
                binding.duration,
                0.0,
                false,
            )
        };
        if !reply.is_ok() {
            warn!("[{}] Pre-output {} not activated: {}", self.label, binding.output_id, reply.message);
        }
        Ok(true)
    }

    fn release_pre_output_lock(&mut self) {
        if let Some(guard) = self.pre_output_lock.take() {
            if let Err(e) = guard.release() {
                error!("[{}] Can't release pre-output lock: {}", self.label, e);
            }
        }
    }

    /// Switches off an activated pre-output and gives up its lock. The pending measurement
    /// stays flagged.
    fn abandon_pre_output(&mut self) {
        if let Some(binding) = self.pre_output.clone() {
            if self.pre_output_activated {
                self.outputs.output_off(&binding.output_id, binding.output_channel, false);
                self.pre_output_activated = false;
            }
        }
        self.release_pre_output_lock();
    }

    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            driver.stop();
        }
        self.driver = None;
    }
}

impl Controller for InputController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Input
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.settings = self.config.settings();
        let input = self.config.input(&self.id)?;
        if input.period <= 0.0 {
            return Err(ControlError::Config(format!("input {} period must be positive", self.id)));
        }
        self.period = input.period;

        let binding = PreOutputBinding::from_config(&input);
        if binding != self.pre_output {
            self.abandon_pre_output();
        }

        self.stop_driver();
        let mut driver = build_driver(&input.device, &input.options)?;

        let conversions = self.config.conversions();
        let channels: Vec<_> = self
            .config
            .device_measurements(&self.id)
            .into_iter()
            .map(|dm| {
                let conversion = conversions.for_measurement(&dm).cloned();
                (dm, conversion)
            })
            .collect();
        self.channels = Arc::new(channels);
        self.pre_output = binding;

        if driver.is_listener() {
            let sink = ListenerSink::new(
                self.id.clone(),
                self.channels.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.metrics.clone(),
                driver.measurements_use_same_timestamp(),
            );
            driver.start_listener(sink)?;
        }
        self.driver = Some(driver);

        // a refresh keeps the running schedule
        if !self.schedule_started {
            self.next_measurement = self.clock.epoch() + input.start_offset;
            self.last_measurement = 0.0;
            self.schedule_started = true;
        }
        info!(
            "[{}] Initialized '{}' ({}), period {}s, {} channel(s)",
            self.label,
            input.name,
            input.device,
            self.period,
            self.channels.len()
        );
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        let Some(driver) = self.driver.as_ref() else {
            return Ok(LoopControl::Continue);
        };
        if driver.is_listener() {
            return Ok(LoopControl::Continue);
        }

        let now = self.clock.epoch();
        if now > self.next_measurement && !self.get_new_measurement {
            // skip the flag if the previous acquisition ran past this boundary
            if self.last_measurement < self.next_measurement {
                self.get_new_measurement = true;
            }
            while self.next_measurement < now {
                self.next_measurement += self.period;
            }
        }

        if self.get_new_measurement && !self.pre_output_activated {
            if let Some(binding) = self.pre_output.clone() {
                if !self.activate_pre_output(&binding, now)? {
                    return Ok(LoopControl::Continue);
                }
            }
        }

        if self.get_new_measurement {
            match self.pre_output.clone() {
                Some(binding) if self.pre_output_activated && now > self.pre_output_timer => {
                    let measured = self.update_measure();
                    if binding.during_measure {
                        let reply = self.outputs.output_off(&binding.output_id, binding.output_channel, false);
                        if !reply.is_ok() {
                            warn!("[{}] Pre-output {} not turned off: {}", self.label, binding.output_id, reply.message);
                        }
                    }
                    self.pre_output_activated = false;
                    self.get_new_measurement = false;
                    self.release_pre_output_lock();
                    measured?;
                }
                Some(_) => {}
                None => {
                    self.get_new_measurement = false;
                    self.update_measure()?;
                }
            }
        }
        Ok(LoopControl::Continue)
    }

    fn sample_rate(&self) -> f64 {
        self.settings.sample_rate_controller_input
    }

    fn pre_stop(&mut self) {
        self.stop_driver();
    }

    fn run_finally(&mut self) {
        self.stop_driver();
        self.abandon_pre_output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::output::{OutputConfig, OutputControl, OutputController, OutputState};
    use crate::config::SystemConfig;
    use crate::runtime::clock::{Clock, ManualClock};
    use crate::storage::measurement::DeviceMeasurement;
    use crate::storage::store::{InMemoryStore, MeasurementStore, SeriesKey};

    struct Rig {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        outputs: Arc<OutputController>,
        locks: LockManager,
        input: InputController,
        _dir: tempfile::TempDir,
    }

    fn rig(options: &str, pre_output: Option<(f64, bool)>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SystemConfig::default();
        cfg.settings.lock_dir = dir.path().to_path_buf();
        cfg.settings.pre_output_lock_timeout = 0.1;
        cfg.outputs.push(OutputConfig {
            unique_id: "lamp".into(),
            name: String::new(),
            output_type: "simulated_switch".into(),
            channels: 1,
            options: toml::Table::new(),
        });
        cfg.measurements.push(DeviceMeasurement {
            unique_id: "m0".into(),
            device_id: "in1".into(),
            channel: 0,
            measurement: "temperature".into(),
            unit: "C".into(),
            conversion_id: None,
            measurement_type: Default::default(),
            is_enabled: true,
            rescale: None,
        });
        cfg.inputs.push(InputConfig {
            unique_id: "in1".into(),
            name: "Bench".into(),
            device: "sequence".into(),
            is_activated: true,
            period: 10.0,
            start_offset: 0.0,
            pre_output_id: pre_output.map(|_| "lamp".to_string()),
            pre_output_channel: 0,
            pre_output_duration: pre_output.map_or(0.0, |(d, _)| d),
            pre_output_during_measure: pre_output.is_some_and(|(_, during)| during),
            options: options.parse().unwrap(),
        });

        let clock = Arc::new(ManualClock::at_noon());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let config = ConfigStore::new(cfg);
        let outputs = Arc::new(
            OutputController::new(&config.outputs(), clock.clone(), store.clone(), None).unwrap(),
        );
        let locks = LockManager::new(dir.path()).unwrap();
        let mut input = InputController::new(
            "in1",
            config,
            store.clone(),
            clock.clone(),
            outputs.clone(),
            locks.clone(),
            None,
        );
        input.initialize_variables().unwrap();
        Rig { clock, store, outputs, locks, input, _dir: dir }
    }

    fn stored(rig: &Rig) -> Vec<f64> {
        rig.store
            .read_list(&SeriesKey::new("in1", "C").channel(0), crate::storage::store::Window::PastSeconds(1e6))
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    #[test]
    fn measures_once_per_period() {
        let mut rig = rig("values = [1.0, 2.0, 3.0]", None);
        rig.input.tick().unwrap();
        assert!(stored(&rig).is_empty());
        rig.clock.advance(0.5);
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![1.0]);
        for _ in 0..4 {
            rig.clock.advance(1.0);
            rig.input.tick().unwrap();
        }
        assert_eq!(stored(&rig), vec![1.0]);
        rig.clock.advance(10.0);
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![1.0, 2.0]);
    }

    #[test]
    fn schedule_never_lags_wall_clock() {
        let mut rig = rig("values = [1.0, 2.0, 3.0]", None);
        let start = rig.clock.epoch();
        rig.clock.advance(95.0);
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![1.0]);
        assert!(rig.input.next_measurement_time() > rig.clock.epoch());
        assert!((rig.input.next_measurement_time() - (start + 100.0)).abs() < 1e-6);
    }

    #[test]
    fn refresh_keeps_schedule() {
        let mut rig = rig("values = [1.0]", None);
        rig.clock.advance(1.0);
        rig.input.tick().unwrap();
        let next = rig.input.next_measurement_time();
        rig.input.initialize_variables().unwrap();
        assert_eq!(rig.input.next_measurement_time(), next);
    }

    #[test]
    fn force_measurement_pulls_schedule_forward() {
        let mut rig = rig("values = [1.0, 2.0]", None);
        rig.clock.advance(1.0);
        rig.input.tick().unwrap();
        rig.clock.advance(1.0);
        rig.input.force_measurement();
        rig.clock.advance(0.1);
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![1.0, 2.0]);
    }

    #[test]
    fn pre_output_runs_before_measuring() {
        let mut rig = rig("values = [7.0]", Some((5.0, false)));
        rig.clock.advance(0.5);
        rig.input.tick().unwrap();
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::On);
        assert!(rig.locks.is_locked("input_pre_output_lamp_0"));
        assert!(stored(&rig).is_empty());

        rig.clock.advance(5.5);
        rig.outputs.check_timers();
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![7.0]);
        assert!(!rig.locks.is_locked("input_pre_output_lamp_0"));
    }

    #[test]
    fn pre_output_during_measure_turns_off_after() {
        let mut rig = rig("values = [7.0]", Some((2.0, true)));
        rig.clock.advance(0.5);
        rig.input.tick().unwrap();
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::On);
        rig.clock.advance(2.5);
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![7.0]);
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::Off);
    }

    #[test]
    fn busy_lock_skips_cycle() {
        let mut rig = rig("values = [7.0]", Some((1.0, false)));
        let held = rig.locks.acquire("input_pre_output_lamp_0", 0.0).unwrap().unwrap();
        rig.clock.advance(0.5);
        rig.input.tick().unwrap();
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::Off);
        assert!(stored(&rig).is_empty());
        drop(held);
        rig.input.tick().unwrap();
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::On);
    }

    #[test]
    fn removing_pre_output_on_refresh_releases_its_lock() {
        let mut rig = rig("values = [7.0]", Some((5.0, false)));
        rig.clock.advance(0.5);
        rig.input.tick().unwrap();
        assert!(rig.locks.is_locked("input_pre_output_lamp_0"));

        rig.input
            .config
            .update(|doc| {
                doc.inputs[0].pre_output_id = None;
                Ok(())
            })
            .unwrap();
        rig.input.initialize_variables().unwrap();
        assert!(!rig.locks.is_locked("input_pre_output_lamp_0"));
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::Off);

        // the flagged measurement still happens, now without a pre-output
        rig.input.tick().unwrap();
        assert_eq!(stored(&rig), vec![7.0]);
    }

    #[test]
    fn unchanged_pre_output_survives_refresh() {
        let mut rig = rig("values = [7.0]", Some((5.0, false)));
        rig.clock.advance(0.5);
        rig.input.tick().unwrap();
        rig.input.initialize_variables().unwrap();
        assert!(rig.locks.is_locked("input_pre_output_lamp_0"));
        assert_eq!(rig.outputs.output_state("lamp", 0), OutputState::On);
    }

    #[test]
    fn no_data_is_not_an_error() {
        let mut rig = rig("values = []", None);
        for _ in 0..5 {
            rig.clock.advance(10.0);
            assert!(rig.input.tick().is_ok());
        }
        assert!(stored(&rig).is_empty());
    }

    #[test]
    fn unknown_device_fails_initialization() {
        let rig = rig("values = [1.0]", None);
        rig.input.config.update(|doc| {
            doc.inputs[0].device = "mystery".into();
            doc.inputs[0].options = toml::Table::new();
            Ok(())
        })
        .unwrap();
        let mut input = rig.input;
        assert!(input.initialize_variables().unwrap_err().is_fatal());
    }

    #[test]
    fn pre_output_binding_requires_duration() {
        let mut cfg = rig("values = [1.0]", Some((1.0, false))).input.config.input("in1").unwrap();
        assert!(PreOutputBinding::from_config(&cfg).is_some());
        cfg.pre_output_duration = 0.0;
        assert!(PreOutputBinding::from_config(&cfg).is_none());
    }
}
