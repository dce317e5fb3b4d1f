//! Function actions run by conditionals and triggers.
//!
//! Actions never touch controller state directly; everything goes through
//! [`DaemonControl`], the supervisor's command surface.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use crate::actuation::output::{OutputOnKind, OutputReply, OutputState, SharedOutputs};
use crate::actuation::pid_controller::PidField;
use crate::config::ConfigStore;
use crate::error::{ControlError, Result};

/// Commands the daemon accepts from actions, scripts and the console.
pub trait DaemonControl: Send + Sync {
    fn controller_activate(&self, id: &str) -> Result<()>;

    fn controller_deactivate(&self, id: &str) -> Result<()>;

    fn controller_is_active(&self, id: &str) -> bool;

    /// Pause, reload configuration, resume.
    fn refresh_settings(&self, id: &str) -> Result<()>;

    fn pid_hold(&self, id: &str) -> Result<()>;

    fn pid_pause(&self, id: &str) -> Result<()>;

    fn pid_resume(&self, id: &str) -> Result<()>;

    fn pid_mod(&self, id: &str) -> Result<()> {
        self.refresh_settings(id)
    }

    fn pid_get(&self, id: &str, field: PidField) -> Result<Option<f64>>;

    fn pid_set(&self, id: &str, field: PidField, value: f64) -> Result<()>;

    fn pid_set_method(&self, id: &str, method_id: &str) -> Result<()>;

    fn input_force_measurement(&self, id: &str) -> Result<()>;

    fn outputs(&self) -> SharedOutputs;

    fn output_on(&self, output_id: &str, channel: u32, kind: OutputOnKind, amount: f64) -> OutputReply {
        self.outputs().output_on(output_id, channel, kind, amount, 0.0, true)
    }

    fn output_off(&self, output_id: &str, channel: u32) -> OutputReply {
        self.outputs().output_off(output_id, channel, true)
    }

    fn output_state(&self, output_id: &str, channel: u32) -> OutputState {
        self.outputs().output_state(output_id, channel)
    }
}

/// Back-reference from controllers to the daemon; weak so the daemon can be dropped.
pub type DaemonLink = Weak<dyn DaemonControl>;

pub fn upgrade(link: &DaemonLink) -> Result<Arc<dyn DaemonControl>> {
    link.upgrade()
        .ok_or_else(|| ControlError::ControllerNotRunning("daemon".into()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub unique_id: String,
    /// Conditional or trigger that owns the action.
    pub function_id: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionKind {
    OutputOn {
        output_id: String,
        #[serde(default)]
        channel: u32,
        /// Seconds; on indefinitely when 0.
        #[serde(default)]
        duration: f64,
    },
    OutputOff {
        output_id: String,
        #[serde(default)]
        channel: u32,
    },
    OutputPwm {
        output_id: String,
        #[serde(default)]
        channel: u32,
        duty_cycle: f64,
    },
    OutputValue {
        output_id: String,
        #[serde(default)]
        channel: u32,
        value: f64,
    },
    OutputVolume {
        output_id: String,
        #[serde(default)]
        channel: u32,
        volume: f64,
    },
    PidPause {
        pid_id: String,
    },
    PidHold {
        pid_id: String,
    },
    PidResume {
        pid_id: String,
    },
    PidSetpoint {
        pid_id: String,
        setpoint: f64,
    },
    PidMethod {
        pid_id: String,
        method_id: String,
    },
    Activate {
        controller_id: String,
    },
    Deactivate {
        controller_id: String,
    },
    ForceMeasurement {
        input_id: String,
    },
    Log {
        message: String,
    },
    Pause {
        seconds: f64,
    },
}

/// Actions owned by `function_id`, in document order.
pub fn actions_for(config: &ConfigStore, function_id: &str) -> Vec<ActionConfig> {
    config.read(|doc| {
        doc.actions
            .iter()
            .filter(|a| a.function_id == function_id)
            .cloned()
            .collect()
    })
}

fn output_reply(reply: OutputReply) -> Result<String> {
    if reply.is_ok() {
        Ok(reply.message)
    } else {
        Err(ControlError::Output(reply.message))
    }
}

/// Runs one action; returns a short description of what was done.
pub fn run_action(action: &ActionConfig, daemon: &dyn DaemonControl, label: &str) -> Result<String> {
    let message = match &action.kind {
        ActionKind::OutputOn { output_id, channel, duration } => {
            let kind = if *duration > 0.0 { OutputOnKind::Sec } else { OutputOnKind::None };
            output_reply(daemon.output_on(output_id, *channel, kind, *duration))?
        }
        ActionKind::OutputOff { output_id, channel } => output_reply(daemon.output_off(output_id, *channel))?,
        ActionKind::OutputPwm { output_id, channel, duty_cycle } => {
            output_reply(daemon.output_on(output_id, *channel, OutputOnKind::Pwm, *duty_cycle))?
        }
        ActionKind::OutputValue { output_id, channel, value } => {
            output_reply(daemon.output_on(output_id, *channel, OutputOnKind::Value, *value))?
        }
        ActionKind::OutputVolume { output_id, channel, volume } => {
            output_reply(daemon.output_on(output_id, *channel, OutputOnKind::Vol, *volume))?
        }
        ActionKind::PidPause { pid_id } => {
            daemon.pid_pause(pid_id)?;
            format!("paused PID {}", pid_id)
        }
        ActionKind::PidHold { pid_id } => {
            daemon.pid_hold(pid_id)?;
            format!("held PID {}", pid_id)
        }
        ActionKind::PidResume { pid_id } => {
            daemon.pid_resume(pid_id)?;
            format!("resumed PID {}", pid_id)
        }
        ActionKind::PidSetpoint { pid_id, setpoint } => {
            daemon.pid_set(pid_id, PidField::Setpoint, *setpoint)?;
            format!("PID {} setpoint {}", pid_id, setpoint)
        }
        ActionKind::PidMethod { pid_id, method_id } => {
            daemon.pid_set_method(pid_id, method_id)?;
            format!("PID {} method '{}'", pid_id, method_id)
        }
        ActionKind::Activate { controller_id } => {
            daemon.controller_activate(controller_id)?;
            format!("activated {}", controller_id)
        }
        ActionKind::Deactivate { controller_id } => {
            daemon.controller_deactivate(controller_id)?;
            format!("deactivated {}", controller_id)
        }
        ActionKind::ForceMeasurement { input_id } => {
            daemon.input_force_measurement(input_id)?;
            format!("forced measurement on {}", input_id)
        }
        ActionKind::Log { message } => {
            info!("[{}] {}", label, message);
            message.clone()
        }
        ActionKind::Pause { seconds } => {
            thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            format!("paused {}s", seconds)
        }
    };
    info!("[{}] Action {}: {}", label, action.unique_id, message);
    Ok(message)
}

/// Runs every action owned by `function_id`; a failing action does not stop the rest.
pub fn run_all_actions(config: &ConfigStore, function_id: &str, daemon: &dyn DaemonControl, label: &str) -> usize {
    let mut succeeded = 0;
    for action in actions_for(config, function_id) {
        match run_action(&action, daemon, label) {
            Ok(_) => succeeded += 1,
            Err(e) => warn!("[{}] Action {} failed: {}", label, action.unique_id, e),
        }
    }
    succeeded
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::test_support::{OutputCall, RecordingOutputs};
    use parking_lot::Mutex;

    /// Records daemon calls; output commands go to a [`RecordingOutputs`].
    #[derive(Default)]
    pub(crate) struct FakeDaemon {
        pub calls: Mutex<Vec<String>>,
        pub outputs: Arc<RecordingOutputs>,
    }

    impl FakeDaemon {
        fn push(&self, call: String) -> Result<()> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    impl DaemonControl for FakeDaemon {
        fn controller_activate(&self, id: &str) -> Result<()> {
            self.push(format!("activate {}", id))
        }

        fn controller_deactivate(&self, id: &str) -> Result<()> {
            self.push(format!("deactivate {}", id))
        }

        fn controller_is_active(&self, id: &str) -> bool {
            id == "running"
        }

        fn refresh_settings(&self, id: &str) -> Result<()> {
            self.push(format!("refresh {}", id))
        }

        fn pid_hold(&self, id: &str) -> Result<()> {
            self.push(format!("hold {}", id))
        }

        fn pid_pause(&self, id: &str) -> Result<()> {
            self.push(format!("pause {}", id))
        }

        fn pid_resume(&self, id: &str) -> Result<()> {
            self.push(format!("resume {}", id))
        }

        fn pid_get(&self, _id: &str, _field: PidField) -> Result<Option<f64>> {
            Ok(None)
        }

        fn pid_set(&self, id: &str, field: PidField, value: f64) -> Result<()> {
            self.push(format!("set {} {} {}", id, field, value))
        }

        fn pid_set_method(&self, id: &str, method_id: &str) -> Result<()> {
            self.push(format!("method {} {}", id, method_id))
        }

        fn input_force_measurement(&self, id: &str) -> Result<()> {
            if id == "missing" {
                return Err(ControlError::ControllerNotFound(id.into()));
            }
            self.push(format!("force {}", id))
        }

        fn outputs(&self) -> SharedOutputs {
            self.outputs.clone()
        }
    }

    fn action(id: &str, owner: &str, kind: ActionKind) -> ActionConfig {
        ActionConfig { unique_id: id.into(), function_id: owner.into(), kind }
    }

    #[test]
    fn output_actions_pick_kind() {
        let daemon = FakeDaemon::default();
        let on = action("a1", "c1", ActionKind::OutputOn { output_id: "fan".into(), channel: 0, duration: 30.0 });
        run_action(&on, &daemon, "test").unwrap();
        let pwm = action("a2", "c1", ActionKind::OutputPwm { output_id: "lamp".into(), channel: 1, duty_cycle: 40.0 });
        run_action(&pwm, &daemon, "test").unwrap();
        let calls = daemon.outputs.take();
        assert!(matches!(&calls[0], OutputCall::On { kind: OutputOnKind::Sec, amount, .. } if *amount == 30.0));
        assert!(matches!(&calls[1], OutputCall::On { kind: OutputOnKind::Pwm, channel: 1, .. }));
    }

    #[test]
    fn run_all_continues_past_failures() {
        let mut cfg = SystemConfig::default();
        cfg.actions = vec![
            action("a1", "c1", ActionKind::ForceMeasurement { input_id: "missing".into() }),
            action("a2", "c1", ActionKind::PidSetpoint { pid_id: "p1".into(), setpoint: 21.5 }),
            action("a3", "other", ActionKind::PidHold { pid_id: "p1".into() }),
        ];
        let config = ConfigStore::new(cfg);
        let daemon = FakeDaemon::default();
        assert_eq!(run_all_actions(&config, "c1", &daemon, "test"), 1);
        assert_eq!(*daemon.calls.lock(), vec!["set p1 Setpoint 21.5".to_string()]);
    }

    #[test]
    fn action_kind_from_toml() {
        let parsed: ActionConfig = toml::from_str(
            r#"
            unique_id = "a1"
            function_id = "cond1"
            action_type = "pid_method"
            pid_id = "p1"
            method_id = "ramp"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.kind, ActionKind::PidMethod { pid_id: "p1".into(), method_id: "ramp".into() });
    }
}
