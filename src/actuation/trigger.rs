//! Trigger controller: fires its function actions on timers, daily schedules and output
//! edges, or drives an output's duty cycle from a method.

use chrono::{DateTime, Days, NaiveTime, Utc};
use crossbeam::channel::Receiver;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::actuation::actions::{DaemonLink, run_all_actions, upgrade};
use crate::actuation::method::MethodConfig;
use crate::actuation::output::{OutputEvent, OutputOnKind, OutputState, SharedOutputs};
use crate::config::{ConfigStore, ControllerKind, DaemonSettings};
use crate::error::{ControlError, Result};
use crate::runtime::clock::SharedClock;
use crate::runtime::controller::{Controller, LoopControl};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    On,
    Off,
    Both,
}

impl Edge {
    pub fn matches(self, state: OutputState) -> bool {
        matches!(
            (self, state),
            (Edge::Both, _) | (Edge::On, OutputState::On) | (Edge::Off, OutputState::Off)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum TriggerKind {
    TimerDuration {
        period: f64,
        #[serde(default)]
        start_offset: f64,
    },
    TimerDailyTime {
        time: NaiveTime,
    },
    TimerDailySpan {
        start: NaiveTime,
        end: NaiveTime,
        period: f64,
    },
    OutputEdge {
        output_id: String,
        #[serde(default)]
        channel: u32,
        edge: Edge,
    },
    RunPwmMethod {
        method_id: String,
        output_id: String,
        #[serde(default)]
        channel: u32,
        period: f64,
    },
}

/// Inside `[start, end)`; a window with `end < start` wraps midnight.
pub fn in_daily_span(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

/// First occurrence of `time` strictly after `now`.
pub fn next_daily(now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

pub struct TriggerController {
    id: String,
    label: String,
    config: ConfigStore,
    clock: SharedClock,
    outputs: SharedOutputs,
    daemon: DaemonLink,

    settings: DaemonSettings,
    kind: Option<TriggerKind>,
    timer: f64,
    next_daily: Option<DateTime<Utc>>,
    events: Option<Receiver<OutputEvent>>,
    method_start: Option<DateTime<Utc>>,
    schedule_started: bool,
}

impl TriggerController {
    pub fn new(id: &str, config: ConfigStore, clock: SharedClock, outputs: SharedOutputs, daemon: DaemonLink) -> Self {
        Self {
            id: id.to_string(),
            label: format!("Trigger {}", id),
            settings: config.settings(),
            config,
            clock,
            outputs,
            daemon,
            kind: None,
            timer: 0.0,
            next_daily: None,
            events: None,
            method_start: None,
            schedule_started: false,
        }
    }

    /// Runs every action attached to this trigger; returns how many succeeded.
    pub fn fire(&self) -> Result<usize> {
        let daemon = upgrade(&self.daemon)?;
        let count = run_all_actions(&self.config, &self.id, daemon.as_ref(), &self.label);
        info!("[{}] Fired, {} action(s) run", self.label, count);
        Ok(count)
    }

    /// Steps the interval timer; true when a period boundary was crossed.
    fn period_elapsed(&mut self, period: f64) -> bool {
        let now = self.clock.epoch();
        if self.timer >= now {
            return false;
        }
        while self.timer < now {
            self.timer += period;
        }
        true
    }

    fn run_pwm_method(&mut self, method_id: &str, output_id: &str, channel: u32) -> Result<LoopControl> {
        let now = self.clock.now();
        let method = self.config.method(method_id)?;
        let library: Vec<MethodConfig> = self.config.methods();
        let outcome = method.evaluate(now, self.method_start, &library)?;
        if outcome.ended {
            info!("[{}] Method {} ended, deactivating", self.label, method_id);
            self.outputs.output_off(output_id, channel, false);
            self.config.set_activated(&self.id, false)?;
            return Ok(LoopControl::Stop);
        }
        let Some(setpoint) = outcome.setpoint else {
            debug!("[{}] Method {} has no setpoint now", self.label, method_id);
            return Ok(LoopControl::Continue);
        };
        let duty = setpoint.clamp(0.0, 100.0);
        let reply = self.outputs.output_on(output_id, channel, OutputOnKind::Pwm, duty, 0.0, false);
        if !reply.is_ok() {
            warn!("[{}] {} CH{} refused duty {:.1}: {}", self.label, output_id, channel, duty, reply.message);
        }
        Ok(LoopControl::Continue)
    }
}

impl Controller for TriggerController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Trigger
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.settings = self.config.settings();
        let trigger = self.config.trigger(&self.id)?;
        let now = self.clock.now();
        let epoch = self.clock.epoch();

        match &trigger.kind {
            TriggerKind::TimerDuration { period, .. }
            | TriggerKind::TimerDailySpan { period, .. }
            | TriggerKind::RunPwmMethod { period, .. }
                if *period <= 0.0 =>
            {
                return Err(ControlError::Config(format!("trigger {} period must be positive", self.id)));
            }
            TriggerKind::TimerDuration { start_offset, .. } => {
                if !self.schedule_started {
                    self.timer = epoch + start_offset;
                }
            }
            TriggerKind::TimerDailySpan { .. } => {
                if !self.schedule_started {
                    self.timer = epoch;
                }
            }
            TriggerKind::TimerDailyTime { time } => {
                self.next_daily = Some(next_daily(now, *time));
            }
            TriggerKind::OutputEdge { output_id, .. } => {
                if self.events.is_none() {
                    self.events = self.outputs.subscribe_events();
                }
                if self.events.is_none() {
                    warn!("[{}] Output controller publishes no events for {}", self.label, output_id);
                }
            }
            TriggerKind::RunPwmMethod { method_id, .. } => {
                self.config.method(method_id)?;
                if !self.schedule_started {
                    self.timer = epoch;
                    self.method_start = Some(now);
                }
            }
        }
        self.schedule_started = true;
        info!("[{}] Initialized '{}' ({:?})", self.label, trigger.name, trigger.kind);
        self.kind = Some(trigger.kind);
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        let Some(kind) = self.kind.clone() else {
            return Ok(LoopControl::Continue);
        };
        match kind {
            TriggerKind::TimerDuration { period, .. } => {
                if self.period_elapsed(period) {
                    self.fire()?;
                }
            }
            TriggerKind::TimerDailyTime { time } => {
                let now = self.clock.now();
                if self.next_daily.is_some_and(|next| now >= next) {
                    self.next_daily = Some(next_daily(now, time));
                    self.fire()?;
                }
            }
            TriggerKind::TimerDailySpan { start, end, period } => {
                if self.period_elapsed(period) && in_daily_span(self.clock.now().time(), start, end) {
                    self.fire()?;
                }
            }
            TriggerKind::OutputEdge { output_id, channel, edge } => {
                let matched = self.events.as_ref().map_or(0, |rx| {
                    rx.try_iter()
                        .filter(|e| e.output_id == output_id && e.channel == channel && edge.matches(e.state))
                        .count()
                });
                for _ in 0..matched {
                    self.fire()?;
                }
            }
            TriggerKind::RunPwmMethod { method_id, output_id, channel, period } => {
                if self.period_elapsed(period) {
                    return self.run_pwm_method(&method_id, &output_id, channel);
                }
            }
        }
        Ok(LoopControl::Continue)
    }

    fn sample_rate(&self) -> f64 {
        self.settings.sample_rate_controller_trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::actions::tests::FakeDaemon;
    use crate::actuation::actions::{ActionConfig, ActionKind, DaemonControl};
    use crate::actuation::method::{DurationSegment, MethodKind};
    use crate::actuation::output::{OutputConfig, OutputControl, OutputController};
    use crate::config::SystemConfig;
    use crate::runtime::clock::ManualClock;
    use crate::test_support::{OutputCall, RecordingOutputs, clock_and_store};
    use std::sync::{Arc, Weak};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn config_with(kind: TriggerKind) -> SystemConfig {
        let mut cfg = SystemConfig::default();
        cfg.triggers.push(TriggerConfig {
            unique_id: "t1".into(),
            name: "test".into(),
            is_activated: true,
            kind,
        });
        cfg.actions.push(ActionConfig {
            unique_id: "a1".into(),
            function_id: "t1".into(),
            kind: ActionKind::ForceMeasurement { input_id: "in1".into() },
        });
        cfg
    }

    fn trigger(cfg: SystemConfig, clock: Arc<ManualClock>, outputs: SharedOutputs, daemon: &Arc<FakeDaemon>) -> TriggerController {
        let link: Weak<dyn DaemonControl> = Arc::downgrade(daemon) as Weak<dyn DaemonControl>;
        let mut trigger = TriggerController::new("t1", ConfigStore::new(cfg), clock, outputs, link);
        trigger.initialize_variables().unwrap();
        trigger
    }

    fn fired(daemon: &FakeDaemon) -> usize {
        std::mem::take(&mut *daemon.calls.lock()).len()
    }

    #[test]
    fn timer_duration_fires_each_period() {
        let (clock, _) = clock_and_store();
        let daemon = Arc::new(FakeDaemon::default());
        let cfg = config_with(TriggerKind::TimerDuration { period: 60.0, start_offset: 10.0 });
        let mut trig = trigger(cfg, clock.clone(), Arc::new(RecordingOutputs::default()), &daemon);

        clock.advance(5.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);
        clock.advance(6.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 1);
        clock.advance(30.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);
        clock.advance(40.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 1);
    }

    #[test]
    fn daily_time_fires_once_per_day() {
        let (clock, _) = clock_and_store();
        let daemon = Arc::new(FakeDaemon::default());
        let cfg = config_with(TriggerKind::TimerDailyTime { time: t(12, 30) });
        let mut trig = trigger(cfg, clock.clone(), Arc::new(RecordingOutputs::default()), &daemon);

        clock.advance(600.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);
        clock.advance(1260.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 1);
        clock.advance(60.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);
        clock.advance(86_400.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 1);
    }

    #[test]
    fn daily_span_only_inside_window() {
        let (clock, _) = clock_and_store();
        let daemon = Arc::new(FakeDaemon::default());
        let cfg = config_with(TriggerKind::TimerDailySpan { start: t(11, 0), end: t(13, 0), period: 600.0 });
        let mut trig = trigger(cfg, clock.clone(), Arc::new(RecordingOutputs::default()), &daemon);

        clock.advance(1.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 1);
        clock.advance(7200.0);
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);
    }

    #[test]
    fn span_wraps_midnight() {
        assert!(in_daily_span(t(23, 0), t(22, 0), t(6, 0)));
        assert!(in_daily_span(t(5, 59), t(22, 0), t(6, 0)));
        assert!(!in_daily_span(t(6, 0), t(22, 0), t(6, 0)));
        assert!(!in_daily_span(t(12, 0), t(22, 0), t(6, 0)));
    }

    #[test]
    fn output_edge_follows_published_events() {
        let (clock, store) = clock_and_store();
        let configs = vec![OutputConfig {
            unique_id: "fan".into(),
            name: "Fan".into(),
            output_type: "simulated_switch".into(),
            channels: 1,
            options: toml::Table::new(),
        }];
        let outputs = Arc::new(OutputController::new(&configs, clock.clone(), store, None).unwrap());
        let daemon = Arc::new(FakeDaemon::default());
        let cfg = config_with(TriggerKind::OutputEdge { output_id: "fan".into(), channel: 0, edge: Edge::On });
        let mut trig = trigger(cfg, clock.clone(), outputs.clone(), &daemon);

        assert!(outputs.output_on("fan", 0, OutputOnKind::None, 0.0, 0.0, true).is_ok());
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 1);

        assert!(outputs.output_off("fan", 0, true).is_ok());
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);

        // commands without trigger_conditionals publish nothing
        assert!(outputs.output_on("fan", 0, OutputOnKind::None, 0.0, 0.0, false).is_ok());
        trig.tick().unwrap();
        assert_eq!(fired(&daemon), 0);
    }

    #[test]
    fn pwm_method_drives_duty_then_deactivates() {
        let (clock, _) = clock_and_store();
        let daemon = Arc::new(FakeDaemon::default());
        let mut cfg = config_with(TriggerKind::RunPwmMethod {
            method_id: "ramp".into(),
            output_id: "lamp".into(),
            channel: 0,
            period: 30.0,
        });
        cfg.methods.push(MethodConfig {
            unique_id: "ramp".into(),
            name: String::new(),
            kind: MethodKind::Duration {
                segments: vec![
                    DurationSegment { duration_sec: 60.0, setpoint_start: 0.0, setpoint_end: Some(60.0) },
                    DurationSegment { duration_sec: 60.0, setpoint_start: 150.0, setpoint_end: None },
                ],
                repeat: false,
                repeat_duration: None,
            },
        });
        let outputs = Arc::new(RecordingOutputs::default());
        let link: Weak<dyn DaemonControl> = Arc::downgrade(&daemon) as Weak<dyn DaemonControl>;
        let config = ConfigStore::new(cfg);
        let mut trig = TriggerController::new("t1", config.clone(), clock.clone(), outputs.clone(), link);
        trig.initialize_variables().unwrap();

        clock.advance(30.0);
        assert_eq!(trig.tick().unwrap(), LoopControl::Continue);
        let calls = outputs.take();
        assert!(matches!(&calls[0], OutputCall::On { kind: OutputOnKind::Pwm, amount, .. } if (*amount - 30.0).abs() < 1e-9));

        clock.advance(60.0);
        trig.tick().unwrap();
        let calls = outputs.take();
        assert!(matches!(&calls[0], OutputCall::On { amount, .. } if *amount == 100.0));

        clock.advance(60.0);
        assert_eq!(trig.tick().unwrap(), LoopControl::Stop);
        assert!(matches!(outputs.take()[0], OutputCall::Off { .. }));
        assert!(!config.trigger("t1").unwrap().is_activated);
    }

    #[test]
    fn trigger_kind_from_toml() {
        let parsed: TriggerConfig = toml::from_str(
            r#"
            unique_id = "lights"
            trigger_type = "timer_daily_span"
            start = "06:00:00"
            end = "20:00:00"
            period = 300.0
            "#,
        )
        .unwrap();
        assert!(parsed.is_activated);
        assert_eq!(parsed.kind, TriggerKind::TimerDailySpan { start: t(6, 0), end: t(20, 0), period: 300.0 });
    }

    #[test]
    fn zero_period_rejected() {
        let (clock, _) = clock_and_store();
        let daemon = Arc::new(FakeDaemon::default());
        let link: Weak<dyn DaemonControl> = Arc::downgrade(&daemon) as Weak<dyn DaemonControl>;
        let cfg = config_with(TriggerKind::TimerDuration { period: 0.0, start_offset: 0.0 });
        let mut trig = TriggerController::new("t1", ConfigStore::new(cfg), clock, Arc::new(RecordingOutputs::default()), link);
        assert!(trig.initialize_variables().unwrap_err().is_fatal());
    }
}
