//! output.rs
//! Output controller: the single actuation sink.
//!
//! Owns every output driver and the per-channel bookkeeping the control loops rely on:
//! when a channel went on, when a timed (`sec`) activation ends, when it last went off
//! (for min-off refusal) and the current PWM duty. Other controllers only see the
//! [`OutputControl`] contract.

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::acquisition::options::{DecodedOptions, OptionSpec, decode};
use crate::config::ControllerKind;
use crate::error::{ControlError, Result};
use crate::runtime::clock::{SharedClock, duration_to_secs, secs_to_duration};
use crate::runtime::controller::{Controller, LoopControl};
use crate::storage::store::{MeasurementSample, SharedStore};
use crate::utils::metrics::{SharedMetrics, lock};

fn default_channels() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    pub output_type: String,
    #[serde(default = "default_channels")]
    pub channels: u32,
    #[serde(default)]
    pub options: toml::Table,
}

/// How `output_on` interprets `amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOnKind {
    /// On for `amount` seconds (indefinitely when `amount <= 0`).
    Sec,
    /// Duty cycle in percent; 0 is "PWM off", distinct from `output_off`.
    Pwm,
    Value,
    Vol,
    /// On indefinitely.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    On,
    Off,
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputState::On => "on",
            OutputState::Off => "off",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputReply {
    /// 0 on success.
    pub code: i32,
    pub message: String,
}

impl OutputReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { code: 0, message: message.into() }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self { code: 1, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { code: 2, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

pub trait OutputControl: Send + Sync {
    fn output_on(
        &self,
        output_id: &str,
        channel: u32,
        kind: OutputOnKind,
        amount: f64,
        min_off: f64,
        trigger_conditionals: bool,
    ) -> OutputReply;

    fn output_off(&self, output_id: &str, channel: u32, trigger_conditionals: bool) -> OutputReply;

    fn output_state(&self, output_id: &str, channel: u32) -> OutputState;

    fn output_seconds_currently_on(&self, output_id: &str, channel: u32) -> f64;

    /// Edge events for commands sent with `trigger_conditionals`.
    fn subscribe_events(&self) -> Option<Receiver<OutputEvent>> {
        None
    }
}

pub type SharedOutputs = Arc<dyn OutputControl>;

/// Published for `trigger_conditionals` commands.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub output_id: String,
    pub channel: u32,
    pub state: OutputState,
    pub kind: OutputOnKind,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
}

pub trait OutputDriver: Send {
    fn setup(&mut self) -> Result<()>;

    fn switch(&mut self, state: SwitchState, kind: OutputOnKind, amount: f64, channel: u32) -> Result<()>;

    fn is_on(&self, channel: u32) -> bool;

    fn stop(&mut self) {}
}

type BuildFn = fn(&DecodedOptions, u32) -> Result<Box<dyn OutputDriver>>;

pub struct OutputDriverInfo {
    pub name: &'static str,
    pub options: &'static [OptionSpec],
    pub accepts: &'static [OutputOnKind],
    build: BuildFn,
}

pub static OUTPUT_DRIVERS: &[OutputDriverInfo] = &[
    OutputDriverInfo {
        name: "simulated_switch",
        options: &[OptionSpec::boolean("startup_on", false)],
        accepts: &[OutputOnKind::Sec, OutputOnKind::None],
        build: SimulatedSwitch::build,
    },
    OutputDriverInfo {
        name: "simulated_pwm",
        options: &[OptionSpec::float("frequency", 100.0)],
        accepts: &[OutputOnKind::Pwm],
        build: SimulatedPwm::build,
    },
    OutputDriverInfo {
        name: "simulated_value",
        options: &[OptionSpec::float("max_amount", 0.0)],
        accepts: &[OutputOnKind::Value, OutputOnKind::Vol],
        build: SimulatedValue::build,
    },
];

fn driver_info(name: &str) -> Option<&'static OutputDriverInfo> {
    OUTPUT_DRIVERS.iter().find(|d| d.name == name)
}

pub struct SimulatedSwitch {
    on: Vec<bool>,
}

impl SimulatedSwitch {
    fn build(opts: &DecodedOptions, channels: u32) -> Result<Box<dyn OutputDriver>> {
        Ok(Box::new(Self { on: vec![opts.boolean("startup_on")?; channels as usize] }))
    }
}

impl OutputDriver for SimulatedSwitch {
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn switch(&mut self, state: SwitchState, _kind: OutputOnKind, _amount: f64, channel: u32) -> Result<()> {
        let slot = self
            .on
            .get_mut(channel as usize)
            .ok_or_else(|| ControlError::Output(format!("no channel {}", channel)))?;
        *slot = state == SwitchState::On;
        Ok(())
    }

    fn is_on(&self, channel: u32) -> bool {
        self.on.get(channel as usize).copied().unwrap_or(false)
    }

    fn stop(&mut self) {
        self.on.iter_mut().for_each(|s| *s = false);
    }
}

pub struct SimulatedPwm {
    duty: Vec<f64>,
    frequency: f64,
}

impl SimulatedPwm {
    fn build(opts: &DecodedOptions, channels: u32) -> Result<Box<dyn OutputDriver>> {
        Ok(Box::new(Self {
            duty: vec![0.0; channels as usize],
            frequency: opts.float("frequency")?,
        }))
    }
}

impl OutputDriver for SimulatedPwm {
    fn setup(&mut self) -> Result<()> {
        if self.frequency <= 0.0 {
            return Err(ControlError::Config("PWM frequency must be positive".into()));
        }
        Ok(())
    }

    fn switch(&mut self, state: SwitchState, _kind: OutputOnKind, amount: f64, channel: u32) -> Result<()> {
        let slot = self
            .duty
            .get_mut(channel as usize)
            .ok_or_else(|| ControlError::Output(format!("no channel {}", channel)))?;
        *slot = match state {
            SwitchState::On => amount.clamp(0.0, 100.0),
            SwitchState::Off => 0.0,
        };
        Ok(())
    }

    fn is_on(&self, channel: u32) -> bool {
        self.duty.get(channel as usize).is_some_and(|d| *d > 0.0)
    }

    fn stop(&mut self) {
        self.duty.iter_mut().for_each(|d| *d = 0.0);
    }
}

/// Pumps and setpoint-style actuators: each command is a one-shot amount.
pub struct SimulatedValue {
    last: Vec<f64>,
    max_amount: f64,
}

impl SimulatedValue {
    fn build(opts: &DecodedOptions, channels: u32) -> Result<Box<dyn OutputDriver>> {
        Ok(Box::new(Self {
            last: vec![0.0; channels as usize],
            max_amount: opts.float("max_amount")?,
        }))
    }
}

impl OutputDriver for SimulatedValue {
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn switch(&mut self, state: SwitchState, _kind: OutputOnKind, amount: f64, channel: u32) -> Result<()> {
        if state == SwitchState::On && self.max_amount > 0.0 && amount > self.max_amount {
            return Err(ControlError::Output(format!(
                "amount {} exceeds maximum {}",
                amount, self.max_amount
            )));
        }
        let slot = self
            .last
            .get_mut(channel as usize)
            .ok_or_else(|| ControlError::Output(format!("no channel {}", channel)))?;
        *slot = if state == SwitchState::On { amount } else { 0.0 };
        Ok(())
    }

    fn is_on(&self, _channel: u32) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone)]
struct ChannelState {
    on_since: Option<DateTime<Utc>>,
    off_at: Option<DateTime<Utc>>,
    last_off: Option<DateTime<Utc>>,
    duty: f64,
    last_amount: f64,
}

struct OutputEntry {
    config: OutputConfig,
    accepts: &'static [OutputOnKind],
    driver: Box<dyn OutputDriver>,
    channels: Vec<ChannelState>,
}

pub struct OutputController {
    outputs: Mutex<HashMap<String, OutputEntry>>,
    subscribers: Mutex<Vec<Sender<OutputEvent>>>,
    clock: SharedClock,
    store: SharedStore,
    metrics: Option<SharedMetrics>,
}

impl OutputController {
    /// Builds and sets up every configured output. An unknown driver is fatal.
    pub fn new(
        configs: &[OutputConfig],
        clock: SharedClock,
        store: SharedStore,
        metrics: Option<SharedMetrics>,
    ) -> Result<Self> {
        let mut outputs = HashMap::new();
        for config in configs {
            let info = driver_info(&config.output_type)
                .ok_or_else(|| ControlError::UnknownDevice(config.output_type.clone()))?;
            let options = decode(info.options, &config.options)?;
            let mut driver = (info.build)(&options, config.channels)?;
            driver.setup()?;
            info!(
                "[Output] {} ({}) ready with {} channel(s)",
                config.unique_id, config.output_type, config.channels
            );
            outputs.insert(
                config.unique_id.clone(),
                OutputEntry {
                    config: config.clone(),
                    accepts: info.accepts,
                    driver,
                    channels: vec![ChannelState::default(); config.channels as usize],
                },
            );
        }
        Ok(Self {
            outputs: Mutex::new(outputs),
            subscribers: Mutex::new(Vec::new()),
            clock,
            store,
            metrics,
        })
    }

    pub fn subscribe(&self) -> Receiver<OutputEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn output_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.outputs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn duty_cycle(&self, output_id: &str, channel: u32) -> Option<f64> {
        self.outputs
            .lock()
            .get(output_id)
            .and_then(|e| e.channels.get(channel as usize))
            .map(|c| c.duty)
    }

    pub fn last_amount(&self, output_id: &str, channel: u32) -> Option<f64> {
        self.outputs
            .lock()
            .get(output_id)
            .and_then(|e| e.channels.get(channel as usize))
            .map(|c| c.last_amount)
    }

    fn publish(&self, event: OutputEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn record(&self, accepted: bool) {
        if let Some(metrics) = &self.metrics {
            lock(metrics).record_output_command(accepted);
        }
    }

    fn write_sample(&self, output_id: &str, channel: u32, measurement: &str, unit: &str, value: f64) {
        let sample = MeasurementSample {
            timestamp: self.clock.now(),
            device_id: output_id.to_string(),
            unit: unit.to_string(),
            measurement: measurement.to_string(),
            channel: Some(channel),
            value,
        };
        if let Err(e) = self.store.write(sample) {
            warn!("[Output] {} CH{}: failed to store {}: {}", output_id, channel, measurement, e);
        }
    }

    /// Turns off every channel whose timed activation has expired. Returns how many.
    pub fn check_timers(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<(String, u32)> = {
            let outputs = self.outputs.lock();
            outputs
                .iter()
                .flat_map(|(id, entry)| {
                    entry.channels.iter().enumerate().filter_map(move |(ch, state)| {
                        state.off_at.filter(|at| *at <= now).map(|_| (id.clone(), ch as u32))
                    })
                })
                .collect()
        };
        for (id, channel) in &expired {
            debug!("[Output] {} CH{} duration elapsed", id, channel);
            self.output_off(id, *channel, true);
        }
        expired.len()
    }

    /// Turns everything off and stops the drivers.
    pub fn shutdown(&self) {
        for id in self.output_ids() {
            let channels = self
                .outputs
                .lock()
                .get(&id)
                .map_or(0, |e| e.config.channels);
            for ch in 0..channels {
                if self.output_state(&id, ch) == OutputState::On {
                    self.output_off(&id, ch, false);
                }
            }
        }
        for entry in self.outputs.lock().values_mut() {
            entry.driver.stop();
        }
        info!("[Output] All outputs stopped");
    }
}

impl OutputControl for OutputController {
    fn output_on(
        &self,
        output_id: &str,
        channel: u32,
        kind: OutputOnKind,
        amount: f64,
        min_off: f64,
        trigger_conditionals: bool,
    ) -> OutputReply {
        let now = self.clock.now();
        let reply = {
            let mut outputs = self.outputs.lock();
            let Some(entry) = outputs.get_mut(output_id) else {
                drop(outputs);
                self.record(false);
                return OutputReply::failed(format!("output {} not found", output_id));
            };
            if !entry.accepts.contains(&kind) {
                drop(outputs);
                self.record(false);
                return OutputReply::failed(format!(
                    "output {} does not accept {:?} commands",
                    output_id, kind
                ));
            }
            let Some(state) = entry.channels.get(channel as usize).cloned() else {
                drop(outputs);
                self.record(false);
                return OutputReply::failed(format!("output {} has no channel {}", output_id, channel));
            };

            if min_off > 0.0 {
                if let Some(last_off) = state.last_off {
                    let off_for = duration_to_secs(now - last_off);
                    if state.on_since.is_none() && off_for < min_off {
                        drop(outputs);
                        self.record(false);
                        return OutputReply::refused(format!(
                            "output {} CH{} off for {:.1}s, less than min off {:.1}s",
                            output_id, channel, off_for, min_off
                        ));
                    }
                }
            }

            let switch_state = if kind == OutputOnKind::Pwm && amount <= 0.0 {
                SwitchState::Off
            } else {
                SwitchState::On
            };
            if let Err(e) = entry.driver.switch(switch_state, kind, amount, channel) {
                drop(outputs);
                error!("[Output] {} CH{} switch failed: {}", output_id, channel, e);
                self.record(false);
                return OutputReply::failed(e.to_string());
            }

            let slot = &mut entry.channels[channel as usize];
            match kind {
                OutputOnKind::Sec | OutputOnKind::None => {
                    if slot.on_since.is_none() {
                        slot.on_since = Some(now);
                    }
                    slot.off_at = (kind == OutputOnKind::Sec && amount > 0.0)
                        .then(|| now + secs_to_duration(amount));
                    slot.last_amount = amount;
                }
                OutputOnKind::Pwm => {
                    let duty = amount.clamp(0.0, 100.0);
                    if duty > 0.0 && slot.on_since.is_none() {
                        slot.on_since = Some(now);
                    } else if duty <= 0.0 && slot.on_since.take().is_some() {
                        slot.last_off = Some(now);
                    }
                    slot.duty = duty;
                    slot.last_amount = duty;
                }
                OutputOnKind::Value | OutputOnKind::Vol => {
                    slot.last_amount = amount;
                }
            }
            OutputReply::ok(format!("{} CH{} {:?} {}", output_id, channel, kind, amount))
        };

        match kind {
            OutputOnKind::Pwm => self.write_sample(output_id, channel, "duty_cycle", "percent", amount.clamp(0.0, 100.0)),
            OutputOnKind::Vol => self.write_sample(output_id, channel, "volume", "ml", amount),
            OutputOnKind::Value => self.write_sample(output_id, channel, "value", "none", amount),
            OutputOnKind::Sec | OutputOnKind::None => {}
        }
        self.record(true);
        debug!("[Output] {}", reply.message);

        if trigger_conditionals {
            self.publish(OutputEvent {
                output_id: output_id.to_string(),
                channel,
                state: if kind == OutputOnKind::Pwm && amount <= 0.0 { OutputState::Off } else { OutputState::On },
                kind,
                amount,
                timestamp: now,
            });
        }
        reply
    }

    fn output_off(&self, output_id: &str, channel: u32, trigger_conditionals: bool) -> OutputReply {
        let now = self.clock.now();
        let on_for = {
            let mut outputs = self.outputs.lock();
            let Some(entry) = outputs.get_mut(output_id) else {
                return OutputReply::failed(format!("output {} not found", output_id));
            };
            if channel as usize >= entry.channels.len() {
                return OutputReply::failed(format!("output {} has no channel {}", output_id, channel));
            }
            if let Err(e) = entry.driver.switch(SwitchState::Off, OutputOnKind::None, 0.0, channel) {
                error!("[Output] {} CH{} switch off failed: {}", output_id, channel, e);
                return OutputReply::failed(e.to_string());
            }
            let slot = &mut entry.channels[channel as usize];
            let on_for = slot.on_since.take().map(|since| duration_to_secs(now - since));
            if on_for.is_some() {
                slot.last_off = Some(now);
            }
            slot.off_at = None;
            slot.duty = 0.0;
            on_for
        };

        if let Some(secs) = on_for {
            self.write_sample(output_id, channel, "duration_time", "s", secs);
            debug!("[Output] {} CH{} off after {:.1}s", output_id, channel, secs);
        }
        if trigger_conditionals {
            self.publish(OutputEvent {
                output_id: output_id.to_string(),
                channel,
                state: OutputState::Off,
                kind: OutputOnKind::None,
                amount: 0.0,
                timestamp: now,
            });
        }
        OutputReply::ok(format!("{} CH{} off", output_id, channel))
    }

    fn output_state(&self, output_id: &str, channel: u32) -> OutputState {
        let outputs = self.outputs.lock();
        match outputs.get(output_id) {
            Some(entry) if entry.driver.is_on(channel) => OutputState::On,
            _ => OutputState::Off,
        }
    }

    fn output_seconds_currently_on(&self, output_id: &str, channel: u32) -> f64 {
        let now = self.clock.now();
        self.outputs
            .lock()
            .get(output_id)
            .and_then(|e| e.channels.get(channel as usize))
            .and_then(|c| c.on_since)
            .map_or(0.0, |since| duration_to_secs(now - since))
    }

    fn subscribe_events(&self) -> Option<Receiver<OutputEvent>> {
        Some(self.subscribe())
    }
}

/// Turns `sec` activations off when their time is up.
pub struct OutputTimerLoop {
    outputs: Arc<OutputController>,
    sample_rate: f64,
}

impl OutputTimerLoop {
    pub const ID: &'static str = "output_timers";

    pub fn new(outputs: Arc<OutputController>, sample_rate: f64) -> Self {
        Self { outputs, sample_rate }
    }
}

impl Controller for OutputTimerLoop {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Output
    }

    fn unique_id(&self) -> &str {
        Self::ID
    }

    fn initialize_variables(&mut self) -> Result<()> {
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        self.outputs.check_timers();
        Ok(LoopControl::Continue)
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn run_finally(&mut self) {
        self.outputs.shutdown();
    }
}
