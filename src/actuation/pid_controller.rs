//! pid_controller.rs
//! PID controller: regulates one measurement by driving a raise and/or a lower output.
//!
//! Every period the controller reads the process value, updates the setpoint (static,
//! from a method, or from another measurement), runs the control law, stores its terms and
//! translates the control variable into output commands. Setters arrive through the
//! controller handle and run on the loop thread between periods.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::actuation::method::MethodConfig;
use crate::actuation::output::{OutputOnKind, OutputState, SharedOutputs};
use crate::actuation::pid::PidLaw;
use crate::config::{ConfigStore, ControllerKind, DaemonSettings, MeasurementRef};
use crate::error::{ControlError, Result};
use crate::runtime::clock::SharedClock;
use crate::runtime::controller::{Controller, LoopControl, RetryPolicy};
use crate::storage::measurement::ChannelValue;
use crate::storage::source::read_source_last;
use crate::storage::store::{SharedStore, write_measurements};
use crate::utils::metrics::{SharedMetrics, lock};

fn default_true() -> bool {
    true
}

fn default_max_measure_age() -> f64 {
    120.0
}

fn default_integrator_min() -> f64 {
    -100.0
}

fn default_integrator_max() -> f64 {
    100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidDirection {
    Raise,
    Lower,
    Both,
}

impl PidDirection {
    pub fn raises(self) -> bool {
        matches!(self, PidDirection::Raise | PidDirection::Both)
    }

    pub fn lowers(self) -> bool {
        matches!(self, PidDirection::Lower | PidDirection::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidOutputType {
    /// Duty cycle in percent; min/max durations are percent bounds.
    Pwm,
    /// On for a number of seconds.
    OnOff,
    Value,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBinding {
    pub output_id: String,
    #[serde(default)]
    pub channel: u32,
    pub output_type: PidOutputType,
    /// 0 disables the bound.
    #[serde(default)]
    pub min_duration: f64,
    /// 0 disables the bound.
    #[serde(default)]
    pub max_duration: f64,
    #[serde(default)]
    pub min_off_duration: f64,
    /// PWM only: hold `min_duration` instead of 0% when idle.
    #[serde(default)]
    pub always_min: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetpointTracking {
    #[default]
    None,
    Method {
        method_id: String,
    },
    InputMath {
        source: MeasurementRef,
        #[serde(default = "default_max_measure_age")]
        max_age: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    #[serde(default)]
    pub is_held: bool,
    #[serde(default)]
    pub is_paused: bool,
    pub period: f64,
    #[serde(default)]
    pub start_offset: f64,
    #[serde(default = "default_max_measure_age")]
    pub max_measure_age: f64,
    pub measurement: MeasurementRef,
    pub direction: PidDirection,
    pub setpoint: f64,
    #[serde(default)]
    pub band: f64,
    #[serde(default)]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    #[serde(default = "default_integrator_min")]
    pub integrator_min: f64,
    #[serde(default = "default_integrator_max")]
    pub integrator_max: f64,
    #[serde(default)]
    pub raise_output: Option<OutputBinding>,
    #[serde(default)]
    pub lower_output: Option<OutputBinding>,
    #[serde(default)]
    pub setpoint_tracking: SetpointTracking,
    #[serde(default)]
    pub method_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub method_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub store_lower_as_negative: bool,
    #[serde(default)]
    pub send_lower_as_negative: bool,
}

/// Fixed store channels of a PID's own series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidChannel {
    Setpoint = 0,
    BandMin = 1,
    BandMax = 2,
    P = 3,
    I = 4,
    D = 5,
    DurationTime = 6,
    DutyCycle = 7,
    Volume = 8,
    Value = 9,
}

impl PidChannel {
    pub fn measurement(self) -> (&'static str, &'static str) {
        match self {
            PidChannel::Setpoint => ("setpoint", "none"),
            PidChannel::BandMin => ("setpoint_band_min", "none"),
            PidChannel::BandMax => ("setpoint_band_max", "none"),
            PidChannel::P => ("pid_p_value", "pid_value"),
            PidChannel::I => ("pid_i_value", "pid_value"),
            PidChannel::D => ("pid_d_value", "pid_value"),
            PidChannel::DurationTime => ("duration_time", "s"),
            PidChannel::DutyCycle => ("duty_cycle", "percent"),
            PidChannel::Volume => ("volume", "ml"),
            PidChannel::Value => ("value", "none"),
        }
    }

    fn entry(self, value: f64) -> (u32, ChannelValue) {
        let (measurement, unit) = self.measurement();
        (
            self as u32,
            ChannelValue {
                measurement: measurement.to_string(),
                unit: unit.to_string(),
                value,
                timestamp: None,
            },
        )
    }
}

/// Fields readable through `pid_get` / writable through `pid_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidField {
    Setpoint,
    Kp,
    Ki,
    Kd,
    Integrator,
    Derivator,
    Band,
    Error,
    ControlVariable,
    PValue,
    IValue,
    DValue,
    Period,
    MaxMeasureAge,
}

impl FromStr for PidField {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "setpoint" => PidField::Setpoint,
            "kp" => PidField::Kp,
            "ki" => PidField::Ki,
            "kd" => PidField::Kd,
            "integrator" => PidField::Integrator,
            "derivator" => PidField::Derivator,
            "band" => PidField::Band,
            "error" => PidField::Error,
            "control_variable" => PidField::ControlVariable,
            "p_value" => PidField::PValue,
            "i_value" => PidField::IValue,
            "d_value" => PidField::DValue,
            "period" => PidField::Period,
            "max_measure_age" => PidField::MaxMeasureAge,
            other => return Err(ControlError::UnknownField(other.to_string())),
        })
    }
}

impl fmt::Display for PidField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `(update runs, manipulation runs)` for the activation, pause and hold flags.
pub fn pid_gates(activated: bool, paused: bool, held: bool, setpoint_known: bool) -> (bool, bool) {
    let update = activated && (!paused || !held);
    let manipulate = activated && setpoint_known && (!paused || held);
    (update, manipulate)
}

/// Fraction of `period` as a duty cycle, saturating at 100%.
pub fn control_var_to_duty_cycle(control_variable: f64, period: f64) -> f64 {
    if control_variable > period {
        100.0
    } else {
        control_variable / period * 100.0
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Clamps to `[min, max]`; a bound of 0 is disabled.
fn clamp_duration(value: f64, min: f64, max: f64) -> f64 {
    if max > 0.0 && value > max {
        max
    } else if min > 0.0 && value < min {
        min
    } else {
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Raise,
    Lower,
}

pub struct PidController {
    id: String,
    label: String,
    config: ConfigStore,
    store: SharedStore,
    clock: SharedClock,
    outputs: SharedOutputs,
    metrics: Option<SharedMetrics>,

    settings: DaemonSettings,
    pid: Option<PidConfig>,
    law: PidLaw,
    retry: RetryPolicy,
    is_activated: bool,
    is_held: bool,
    is_paused: bool,
    timer: f64,
    schedule_started: bool,
    last_measurement: Option<f64>,
    last_measurement_success: bool,
    method: Option<MethodConfig>,
    method_library: Vec<MethodConfig>,
    method_start: Option<DateTime<Utc>>,
}

impl PidController {
    pub fn new(
        id: &str,
        config: ConfigStore,
        store: SharedStore,
        clock: SharedClock,
        outputs: SharedOutputs,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            id: id.to_string(),
            label: format!("PID {}", id),
            settings: config.settings(),
            config,
            store,
            clock,
            outputs,
            metrics,
            pid: None,
            law: PidLaw::new(0.0, 0.0, 0.0, 1.0),
            retry: RetryPolicy::default(),
            is_activated: false,
            is_held: false,
            is_paused: false,
            timer: 0.0,
            schedule_started: false,
            last_measurement: None,
            last_measurement_success: false,
            method: None,
            method_library: Vec::new(),
            method_start: None,
        }
    }

    pub fn law(&self) -> &PidLaw {
        &self.law
    }

    pub fn is_held(&self) -> bool {
        self.is_held
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn last_measurement(&self) -> Option<f64> {
        self.last_measurement
    }

    fn period(&self) -> f64 {
        self.pid.as_ref().map_or(self.law.period, |p| p.period)
    }

    /// Loads the bound method and starts a run if it is time-bound and not already running.
    fn setup_method(&mut self, method_id: &str) -> Result<()> {
        let method = self.config.method(method_id)?;
        self.method_library = self.config.methods();
        let start = self.pid.as_ref().and_then(|p| p.method_start_time);
        if method.is_time_bound(&self.method_library) {
            match start {
                Some(start) => self.method_start = Some(start),
                None => {
                    let now = self.clock.now();
                    let end = method.end_time(now);
                    self.config.set_pid_method_times(&self.id, Some(now), end)?;
                    if let Some(pid) = self.pid.as_mut() {
                        pid.method_start_time = Some(now);
                        pid.method_end_time = end;
                    }
                    self.method_start = Some(now);
                    info!("[{}] Started method '{}'", self.label, method.name);
                }
            }
        } else {
            self.method_start = start;
        }
        self.method = Some(method);
        Ok(())
    }

    fn get_last_measurement_pid(&mut self) -> Result<()> {
        let Some(pid) = self.pid.as_ref() else {
            return Ok(());
        };
        match read_source_last(&self.config, self.store.as_ref(), &pid.measurement, pid.max_measure_age)? {
            Some(source) => {
                self.last_measurement = Some(source.value);
                self.last_measurement_success = true;
            }
            None => {
                self.last_measurement_success = false;
                error!(
                    "[{}] Could not find a measurement in the past {}s",
                    self.label, pid.max_measure_age
                );
            }
        }
        Ok(())
    }

    /// One control period.
    pub fn check_pid(&mut self) -> Result<LoopControl> {
        let (update, _) = pid_gates(self.is_activated, self.is_paused, self.is_held, true);
        if update {
            self.get_last_measurement_pid()?;
            if self.last_measurement_success {
                if self.method.is_some() {
                    let now = self.clock.now();
                    let outcome = match self.method.as_ref() {
                        Some(method) => method.evaluate(now, self.method_start, &self.method_library)?,
                        None => return Ok(LoopControl::Continue),
                    };
                    if outcome.ended {
                        info!("[{}] Method ended, deactivating", self.label);
                        self.end_method_run()?;
                        return Ok(LoopControl::Stop);
                    }
                    let fallback = self.pid.as_ref().map(|p| p.setpoint);
                    self.law.setpoint = outcome.setpoint.or(fallback);
                }
                if let Some(SetpointTracking::InputMath { source, max_age }) =
                    self.pid.as_ref().map(|p| p.setpoint_tracking.clone())
                {
                    self.law.setpoint = read_source_last(&self.config, self.store.as_ref(), &source, max_age)?
                        .map(|s| s.value);
                    if self.law.setpoint.is_none() {
                        warn!("[{}] Setpoint source has no value within {}s", self.label, max_age);
                    }
                }
                if let Some(measurement) = self.last_measurement {
                    let now = self.clock.epoch();
                    if self.law.update(measurement, now).is_some() {
                        self.write_pid_values()?;
                    }
                }
            }
        }

        let (_, manipulate) = pid_gates(
            self.is_activated,
            self.is_paused,
            self.is_held,
            self.law.setpoint.is_some(),
        );
        if manipulate {
            self.manipulate_output()?;
        }
        Ok(LoopControl::Continue)
    }

    fn end_method_run(&mut self) -> Result<()> {
        self.config.set_pid_method_times(&self.id, None, None)?;
        self.config.set_activated(&self.id, false)?;
        self.is_activated = false;
        self.method_start = None;
        Ok(())
    }

    fn write_batch(&self, batch: BTreeMap<u32, ChannelValue>) -> Result<()> {
        let written = write_measurements(self.store.as_ref(), self.clock.as_ref(), &self.id, batch, true)?;
        if let Some(metrics) = &self.metrics {
            lock(metrics).record_samples(written);
        }
        Ok(())
    }

    fn write_pid_values(&self) -> Result<()> {
        let mut batch = BTreeMap::new();
        if let Some(setpoint) = self.law.setpoint {
            batch.extend([PidChannel::Setpoint.entry(setpoint)]);
        }
        if let Some((low, high)) = self.law.band_bounds() {
            batch.extend([PidChannel::BandMin.entry(low), PidChannel::BandMax.entry(high)]);
        }
        batch.extend([
            PidChannel::P.entry(self.law.p_value),
            PidChannel::I.entry(self.law.i_value),
            PidChannel::D.entry(self.law.d_value),
        ]);
        self.write_batch(batch)
    }

    fn write_pid_output_value(&self, channel: PidChannel, value: f64) -> Result<()> {
        self.write_batch(BTreeMap::from([channel.entry(value)]))
    }

    fn binding(&self, side: Side) -> Option<OutputBinding> {
        let pid = self.pid.as_ref()?;
        match side {
            Side::Raise if pid.direction.raises() => pid.raise_output.clone(),
            Side::Lower if pid.direction.lowers() => pid.lower_output.clone(),
            _ => None,
        }
    }

    /// Translates the control variable into output commands.
    pub fn manipulate_output(&mut self) -> Result<()> {
        let raise = self.binding(Side::Raise);
        let lower = self.binding(Side::Lower);

        if !self.last_measurement_success {
            // process value unknown: never leave an actuator running
            for binding in raise.iter().chain(lower.iter()) {
                self.outputs.output_off(&binding.output_id, binding.channel, false);
            }
            return Ok(());
        }

        let cv = self.law.control_variable;
        if let Some(binding) = &raise {
            if cv > 0.0 {
                self.drive(Side::Raise, binding, lower.as_ref(), cv)?;
            } else {
                self.idle(Side::Raise, binding)?;
            }
        }
        if let Some(binding) = &lower {
            if cv < 0.0 {
                self.drive(Side::Lower, binding, raise.as_ref(), cv.abs())?;
            } else {
                self.idle(Side::Lower, binding)?;
            }
        }
        Ok(())
    }

    /// Signs for the amount sent to the output and the amount stored.
    fn signs(&self, side: Side) -> (f64, f64) {
        match (side, self.pid.as_ref()) {
            (Side::Lower, Some(pid)) => (
                if pid.send_lower_as_negative { -1.0 } else { 1.0 },
                if pid.store_lower_as_negative { -1.0 } else { 1.0 },
            ),
            _ => (1.0, 1.0),
        }
    }

    fn drive(&self, side: Side, binding: &OutputBinding, opposite: Option<&OutputBinding>, magnitude: f64) -> Result<()> {
        let (send_sign, store_sign) = self.signs(side);
        match binding.output_type {
            PidOutputType::Pwm => {
                let duty = round_to(control_var_to_duty_cycle(magnitude, self.period()), 1);
                let duty = clamp_duration(duty, binding.min_duration, binding.max_duration);
                debug!("[{}] {:?} duty cycle {}%", self.label, side, duty);
                self.outputs
                    .output_on(&binding.output_id, binding.channel, OutputOnKind::Pwm, duty * send_sign, 0.0, false);
                self.write_pid_output_value(PidChannel::DutyCycle, duty * store_sign)?;
            }
            PidOutputType::OnOff => {
                if let Some(other) = opposite {
                    if other.output_type != PidOutputType::Pwm
                        && self.outputs.output_state(&other.output_id, other.channel) == OutputState::On
                    {
                        self.outputs.output_off(&other.output_id, other.channel, false);
                    }
                }
                let mut seconds = round_to(magnitude, 2);
                if binding.max_duration > 0.0 && seconds > binding.max_duration {
                    seconds = binding.max_duration;
                }
                if seconds >= binding.min_duration {
                    debug!("[{}] {:?} output on for {}s", self.label, side, seconds);
                    self.outputs.output_on(
                        &binding.output_id,
                        binding.channel,
                        OutputOnKind::Sec,
                        seconds,
                        binding.min_off_duration,
                        false,
                    );
                    self.write_pid_output_value(PidChannel::DurationTime, seconds * store_sign)?;
                }
            }
            PidOutputType::Value | PidOutputType::Volume => {
                let mut amount = round_to(magnitude, 2);
                if binding.max_duration > 0.0 && amount > binding.max_duration {
                    amount = binding.max_duration;
                }
                if amount >= binding.min_duration {
                    let (kind, channel) = if binding.output_type == PidOutputType::Volume {
                        (OutputOnKind::Vol, PidChannel::Volume)
                    } else {
                        (OutputOnKind::Value, PidChannel::Value)
                    };
                    self.outputs.output_on(
                        &binding.output_id,
                        binding.channel,
                        kind,
                        amount * send_sign,
                        binding.min_off_duration,
                        false,
                    );
                    self.write_pid_output_value(channel, amount * store_sign)?;
                }
            }
        }
        Ok(())
    }

    /// No demand on this side: PWM goes to 0% (or its minimum), others are left alone.
    fn idle(&self, side: Side, binding: &OutputBinding) -> Result<()> {
        if binding.output_type != PidOutputType::Pwm {
            return Ok(());
        }
        let duty = if binding.always_min { binding.min_duration } else { 0.0 };
        let (send_sign, store_sign) = self.signs(side);
        self.outputs
            .output_on(&binding.output_id, binding.channel, OutputOnKind::Pwm, duty * send_sign, 0.0, false);
        self.write_pid_output_value(PidChannel::DutyCycle, duty * store_sign)
    }

    fn turn_off_outputs(&self) {
        for side in [Side::Raise, Side::Lower] {
            if let Some(binding) = self.binding(side) {
                self.outputs.output_off(&binding.output_id, binding.channel, false);
            }
        }
    }

    fn persist(&mut self, f: impl FnOnce(&mut PidConfig) + Clone) -> Result<()> {
        if let Some(pid) = self.pid.as_mut() {
            f.clone()(pid);
        }
        self.config.update_pid(&self.id, f)
    }

    pub fn get(&self, field: PidField) -> Option<f64> {
        let pid = self.pid.as_ref();
        match field {
            PidField::Setpoint => self.law.setpoint,
            PidField::Kp => Some(self.law.kp),
            PidField::Ki => Some(self.law.ki),
            PidField::Kd => Some(self.law.kd),
            PidField::Integrator => Some(self.law.integrator),
            PidField::Derivator => Some(self.law.derivator),
            PidField::Band => Some(self.law.band),
            PidField::Error => Some(self.law.error),
            PidField::ControlVariable => Some(self.law.control_variable),
            PidField::PValue => Some(self.law.p_value),
            PidField::IValue => Some(self.law.i_value),
            PidField::DValue => Some(self.law.d_value),
            PidField::Period => pid.map(|p| p.period),
            PidField::MaxMeasureAge => pid.map(|p| p.max_measure_age),
        }
    }

    pub fn set(&mut self, field: PidField, value: f64) -> Result<()> {
        match field {
            PidField::Setpoint => self.set_setpoint(value),
            PidField::Kp => {
                self.law.kp = value;
                self.persist(move |p| p.kp = value)
            }
            PidField::Ki => {
                self.law.ki = value;
                self.persist(move |p| p.ki = value)
            }
            PidField::Kd => {
                self.law.kd = value;
                self.persist(move |p| p.kd = value)
            }
            PidField::Band => {
                self.law.band = value.max(0.0);
                self.persist(move |p| p.band = value.max(0.0))
            }
            PidField::Integrator => {
                self.law.set_integrator(value);
                Ok(())
            }
            PidField::Derivator => {
                self.law.set_derivator(value);
                Ok(())
            }
            other => Err(ControlError::UnknownField(format!("{} is read-only", other))),
        }
    }

    pub fn set_setpoint(&mut self, value: f64) -> Result<()> {
        self.law.setpoint = Some(value);
        info!("[{}] Setpoint set to {}", self.label, value);
        self.persist(move |p| p.setpoint = value)
    }

    /// Empty id clears method tracking; any other id starts a fresh run of that method.
    pub fn set_method(&mut self, method_id: &str) -> Result<()> {
        if method_id.is_empty() {
            self.method = None;
            self.method_start = None;
            let setpoint = self.pid.as_ref().map(|p| p.setpoint);
            self.law.setpoint = setpoint;
            self.persist(|p| {
                p.setpoint_tracking = SetpointTracking::None;
                p.method_start_time = None;
                p.method_end_time = None;
            })?;
            info!("[{}] Method tracking cleared", self.label);
            return Ok(());
        }
        let id = method_id.to_string();
        self.persist(move |p| {
            p.setpoint_tracking = SetpointTracking::Method { method_id: id.clone() };
            p.method_start_time = None;
            p.method_end_time = None;
        })?;
        self.setup_method(method_id)
    }

    pub fn set_hold(&mut self) -> Result<()> {
        self.is_held = true;
        info!("[{}] Held", self.label);
        self.persist(|p| p.is_held = true)
    }

    pub fn set_pause(&mut self) -> Result<()> {
        self.is_paused = true;
        self.turn_off_outputs();
        info!("[{}] Paused", self.label);
        self.persist(|p| p.is_paused = true)
    }

    pub fn set_resume(&mut self) -> Result<()> {
        self.is_activated = true;
        self.is_held = false;
        self.is_paused = false;
        info!("[{}] Resumed", self.label);
        self.persist(|p| {
            p.is_activated = true;
            p.is_held = false;
            p.is_paused = false;
        })
    }
}

impl Controller for PidController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Pid
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.settings = self.config.settings();
        let pid = self.config.pid(&self.id)?;
        if pid.period <= 0.0 {
            return Err(ControlError::Config(format!("PID {} period must be positive", self.id)));
        }
        // validates the process measurement reference
        self.config.resolve(&pid.measurement)?;

        let previous = std::mem::replace(&mut self.law, PidLaw::new(pid.kp, pid.ki, pid.kd, pid.period));
        self.law.setpoint = Some(pid.setpoint);
        self.law.band = pid.band.max(0.0);
        self.law.integrator_min = pid.integrator_min;
        self.law.integrator_max = pid.integrator_max;
        if self.pid.is_some() {
            self.law.set_integrator(previous.integrator);
            self.law.set_derivator(previous.derivator);
        }

        self.is_activated = pid.is_activated;
        self.is_held = pid.is_held;
        self.is_paused = pid.is_paused;
        self.retry = RetryPolicy::new(self.settings.attempt_execute_times, self.settings.attempt_execute_delay);
        let tracking = pid.setpoint_tracking.clone();
        let start_offset = pid.start_offset;
        info!(
            "[{}] Initialized '{}': setpoint {}, Kp {}, Ki {}, Kd {}, period {}s",
            self.label, pid.name, pid.setpoint, pid.kp, pid.ki, pid.kd, pid.period
        );
        self.pid = Some(pid);

        self.method = None;
        if let SetpointTracking::Method { method_id } = tracking {
            self.setup_method(&method_id)?;
        }
        if !self.schedule_started {
            self.timer = self.clock.epoch() + start_offset;
            self.schedule_started = true;
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        if !self.is_activated || self.pid.is_none() {
            return Ok(LoopControl::Continue);
        }
        let now = self.clock.epoch();
        if self.timer >= now {
            return Ok(LoopControl::Continue);
        }
        let period = self.period();
        while self.timer < now {
            self.timer += period;
        }
        let retry = self.retry;
        let label = format!("[{}] Check", self.label);
        retry.attempt_execute(&label, || self.check_pid())
    }

    fn sample_rate(&self) -> f64 {
        self.settings.sample_rate_controller_pid
    }

    fn run_finally(&mut self) {
        self.turn_off_outputs();
        info!("[{}] Stopped, outputs off", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::runtime::clock::ManualClock;
    use crate::storage::store::{InMemoryStore, MeasurementStore, SeriesKey};
    use crate::test_support::{OutputCall, RecordingOutputs, clock_and_store, dm, put};
    use std::sync::Arc;

    struct Rig {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        outputs: Arc<RecordingOutputs>,
        config: ConfigStore,
        pid: PidController,
    }

    fn binding(id: &str, output_type: PidOutputType, min: f64, max: f64) -> OutputBinding {
        OutputBinding {
            output_id: id.into(),
            channel: 0,
            output_type,
            min_duration: min,
            max_duration: max,
            min_off_duration: 0.0,
            always_min: false,
        }
    }

    fn base_config() -> PidConfig {
        PidConfig {
            unique_id: "p1".into(),
            name: "heat".into(),
            is_activated: true,
            is_held: false,
            is_paused: false,
            period: 100.0,
            start_offset: 0.0,
            max_measure_age: 60.0,
            measurement: MeasurementRef::new("s1", "t"),
            direction: PidDirection::Both,
            setpoint: 600.0,
            band: 0.0,
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            integrator_min: -1000.0,
            integrator_max: 1000.0,
            raise_output: Some(binding("heater", PidOutputType::OnOff, 0.0, 80.0)),
            lower_output: Some(binding("cooler", PidOutputType::OnOff, 0.0, 80.0)),
            setpoint_tracking: SetpointTracking::None,
            method_start_time: None,
            method_end_time: None,
            store_lower_as_negative: false,
            send_lower_as_negative: false,
        }
    }

    fn rig(pid: PidConfig) -> Rig {
        rig_with_methods(pid, Vec::new())
    }

    fn rig_with_methods(pid: PidConfig, methods: Vec<MethodConfig>) -> Rig {
        let mut cfg = SystemConfig::default();
        cfg.methods = methods;
        cfg.settings.attempt_execute_delay = 0.0;
        cfg.measurements.push(dm("t", "s1", 0, "temperature", "C"));
        cfg.measurements.push(dm("sp", "s2", 0, "temperature", "C"));
        cfg.pids.push(pid);
        let config = ConfigStore::new(cfg);
        let (clock, store) = clock_and_store();
        let outputs = Arc::new(RecordingOutputs::default());
        let mut pid = PidController::new("p1", config.clone(), store.clone(), clock.clone(), outputs.clone(), None);
        pid.initialize_variables().unwrap();
        Rig { clock, store, outputs, config, pid }
    }

    fn measure(rig: &Rig, value: f64) {
        put(&rig.store, &rig.clock, &dm("t", "s1", 0, "temperature", "C"), value);
    }

    fn ons(calls: &[OutputCall], id: &str) -> Vec<f64> {
        calls
            .iter()
            .filter_map(|c| match c {
                OutputCall::On { output_id, amount, .. } if output_id == id => Some(*amount),
                _ => None,
            })
            .collect()
    }

    fn offs(calls: &[OutputCall], id: &str) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, OutputCall::Off { output_id, .. } if output_id == id))
            .count()
    }

    #[test]
    fn gates_for_paused_and_held() {
        // (paused, held) -> (update, manipulate)
        let table = [
            ((false, false), (true, true)),
            ((false, true), (true, true)),
            ((true, false), (true, false)),
            ((true, true), (false, true)),
        ];
        for ((paused, held), expected) in table {
            assert_eq!(pid_gates(true, paused, held, true), expected, "paused={} held={}", paused, held);
            assert_eq!(pid_gates(false, paused, held, true), (false, false));
        }
        assert_eq!(pid_gates(true, false, false, false), (true, false));
    }

    #[test]
    fn gates_drive_check_pid() {
        for (paused, held) in [(false, false), (false, true), (true, false), (true, true)] {
            let mut r = rig(base_config());
            measure(&r, 100.0);
            r.pid.is_paused = paused;
            r.pid.is_held = held;
            // seed a command for the held+paused case, which does not update
            r.pid.law.control_variable = 10.0;
            r.pid.last_measurement_success = true;
            r.pid.check_pid().unwrap();
            let (update, manipulate) = pid_gates(true, paused, held, true);
            let updated = r.pid.law.control_variable == 500.0;
            assert_eq!(updated, update, "paused={} held={}", paused, held);
            assert_eq!(!ons(&r.outputs.take(), "heater").is_empty(), manipulate, "paused={} held={}", paused, held);
        }
    }

    #[test]
    fn on_off_duration_is_clamped_to_max() {
        let mut r = rig(base_config());
        measure(&r, 100.0);
        r.pid.check_pid().unwrap();
        assert_eq!(r.pid.law().control_variable, 500.0);
        assert_eq!(ons(&r.outputs.take(), "heater"), vec![80.0]);
    }

    #[test]
    fn sub_minimum_durations_are_dropped() {
        let mut cfg = base_config();
        cfg.setpoint = 102.0;
        cfg.raise_output = Some(binding("heater", PidOutputType::OnOff, 5.0, 80.0));
        let mut r = rig(cfg);
        measure(&r, 100.0);
        r.pid.check_pid().unwrap();
        assert!(ons(&r.outputs.take(), "heater").is_empty());
    }

    #[test]
    fn pwm_step_never_exceeds_max_and_lower_stays_off() {
        let mut cfg = base_config();
        cfg.setpoint = 30.0;
        cfg.kp = 20.0;
        cfg.ki = 1.0;
        cfg.band = 1.0;
        cfg.raise_output = Some(binding("heater", PidOutputType::Pwm, 0.0, 70.0));
        cfg.lower_output = Some(binding("cooler", PidOutputType::Pwm, 0.0, 70.0));
        let mut r = rig(cfg);
        for _ in 0..10 {
            measure(&r, 20.0);
            r.pid.check_pid().unwrap();
            r.clock.advance(100.0);
        }
        let calls = r.outputs.take();
        let raise = ons(&calls, "heater");
        assert_eq!(raise.len(), 10);
        assert!(raise.iter().all(|d| *d <= 70.0));
        assert!(ons(&calls, "cooler").iter().all(|d| *d == 0.0));
        assert_eq!(offs(&calls, "cooler"), 0);
    }

    #[test]
    fn duty_cycle_conversion() {
        assert_eq!(control_var_to_duty_cycle(150.0, 100.0), 100.0);
        assert_eq!(control_var_to_duty_cycle(25.0, 100.0), 25.0);
    }

    #[test]
    fn always_min_pwm_holds_minimum() {
        let mut cfg = base_config();
        cfg.setpoint = 100.0;
        let mut raise = binding("heater", PidOutputType::Pwm, 15.0, 90.0);
        raise.always_min = true;
        cfg.raise_output = Some(raise);
        let mut r = rig(cfg);
        measure(&r, 110.0);
        r.pid.check_pid().unwrap();
        assert_eq!(ons(&r.outputs.take(), "heater"), vec![15.0]);
    }

    #[test]
    fn fail_safe_turns_both_outputs_off() {
        let mut r = rig(base_config());
        for _ in 0..3 {
            r.pid.check_pid().unwrap();
            r.clock.advance(100.0);
        }
        let calls = r.outputs.take();
        assert!(offs(&calls, "heater") >= 1);
        assert!(offs(&calls, "cooler") >= 1);
        assert!(calls.iter().all(|c| matches!(c, OutputCall::Off { .. })));
    }

    #[test]
    fn raising_switches_off_running_lower_output() {
        let mut r = rig(base_config());
        r.outputs.set_state("cooler", 0, OutputState::On);
        measure(&r, 100.0);
        r.pid.check_pid().unwrap();
        assert_eq!(offs(&r.outputs.take(), "cooler"), 1);
    }

    #[test]
    fn lower_sign_flags_are_independent() {
        let mut cfg = base_config();
        cfg.setpoint = 10.0;
        cfg.lower_output = Some(binding("cooler", PidOutputType::Pwm, 0.0, 0.0));
        cfg.store_lower_as_negative = true;
        let mut r = rig(cfg);
        measure(&r, 60.0);
        r.pid.check_pid().unwrap();
        assert_eq!(ons(&r.outputs.take(), "cooler"), vec![50.0]);
        let key = SeriesKey::new("p1", "percent").channel(PidChannel::DutyCycle as u32);
        assert_eq!(r.store.read_last(&key, None).unwrap().map(|(_, v)| v), Some(-50.0));
    }

    #[test]
    fn pid_terms_are_stored_on_fixed_channels() {
        let mut cfg = base_config();
        cfg.band = 2.0;
        let mut r = rig(cfg);
        measure(&r, 100.0);
        r.pid.check_pid().unwrap();
        let read = |channel: PidChannel| {
            let (measurement, unit) = channel.measurement();
            let key = SeriesKey::new("p1", unit).channel(channel as u32).measurement(measurement);
            r.store.read_last(&key, None).unwrap().map(|(_, v)| v)
        };
        assert_eq!(read(PidChannel::Setpoint), Some(600.0));
        assert_eq!(read(PidChannel::BandMin), Some(598.0));
        assert_eq!(read(PidChannel::BandMax), Some(602.0));
        assert_eq!(read(PidChannel::P), Some(500.0));
    }

    #[test]
    fn input_math_setpoint_missing_disables_manipulation() {
        let mut cfg = base_config();
        cfg.setpoint_tracking = SetpointTracking::InputMath {
            source: MeasurementRef::new("s2", "sp"),
            max_age: 60.0,
        };
        let mut r = rig(cfg);
        measure(&r, 100.0);
        r.pid.check_pid().unwrap();
        assert_eq!(r.pid.law().setpoint, None);
        assert!(r.outputs.take().is_empty());

        put(&r.store, &r.clock, &dm("sp", "s2", 0, "temperature", "C"), 150.0);
        r.pid.check_pid().unwrap();
        assert_eq!(r.pid.law().setpoint, Some(150.0));
        assert_eq!(ons(&r.outputs.take(), "heater"), vec![50.0]);
    }

    #[test]
    fn method_setpoint_and_end_deactivates() {
        use crate::actuation::method::{DurationSegment, MethodKind};
        let mut cfg = base_config();
        cfg.setpoint_tracking = SetpointTracking::Method { method_id: "ramp".into() };
        let ramp = MethodConfig {
            unique_id: "ramp".into(),
            name: "ramp".into(),
            kind: MethodKind::Duration {
                segments: vec![DurationSegment { duration_sec: 200.0, setpoint_start: 100.0, setpoint_end: Some(300.0) }],
                repeat: false,
                repeat_duration: None,
            },
        };
        let mut r = rig_with_methods(cfg, vec![ramp]);
        assert!(r.config.pid("p1").unwrap().method_start_time.is_some());

        r.clock.advance(100.0);
        measure(&r, 100.0);
        r.pid.check_pid().unwrap();
        assert_eq!(r.pid.law().setpoint, Some(200.0));

        r.clock.advance(150.0);
        measure(&r, 100.0);
        assert_eq!(r.pid.check_pid().unwrap(), LoopControl::Stop);
        let stored = r.config.pid("p1").unwrap();
        assert!(!stored.is_activated);
        assert!(stored.method_start_time.is_none());
    }

    #[test]
    fn setters_persist() {
        let mut r = rig(base_config());
        r.pid.set(PidField::Kp, 2.5).unwrap();
        r.pid.set_setpoint(21.0).unwrap();
        r.pid.set_hold().unwrap();
        let stored = r.config.pid("p1").unwrap();
        assert_eq!(stored.kp, 2.5);
        assert_eq!(stored.setpoint, 21.0);
        assert!(stored.is_held);
        assert_eq!(r.pid.get(PidField::Kp), Some(2.5));
        assert!(r.pid.set(PidField::Error, 1.0).is_err());
        assert!("bogus".parse::<PidField>().is_err());

        r.pid.set_pause().unwrap();
        assert_eq!(offs(&r.outputs.take(), "heater"), 1);
        r.pid.set_resume().unwrap();
        let stored = r.config.pid("p1").unwrap();
        assert!(!stored.is_held && !stored.is_paused);
    }

    #[test]
    fn refresh_keeps_integrator() {
        let mut cfg = base_config();
        cfg.ki = 1.0;
        let mut r = rig(cfg);
        measure(&r, 590.0);
        r.pid.check_pid().unwrap();
        let integrator = r.pid.law().integrator;
        assert!(integrator > 0.0);
        r.pid.initialize_variables().unwrap();
        assert_eq!(r.pid.law().integrator, integrator);
    }

    #[test]
    fn tick_runs_once_per_period_and_stop_turns_outputs_off() {
        let mut r = rig(base_config());
        measure(&r, 100.0);
        r.clock.advance(1.0);
        r.pid.tick().unwrap();
        r.clock.advance(1.0);
        r.pid.tick().unwrap();
        assert_eq!(ons(&r.outputs.take(), "heater").len(), 1);
        r.pid.run_finally();
        let calls = r.outputs.take();
        assert_eq!(offs(&calls, "heater"), 1);
        assert_eq!(offs(&calls, "cooler"), 1);
    }
}
