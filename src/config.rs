//! Configuration management.
//!
//! One TOML document holds the daemon settings and every controller record. The running
//! daemon shares it through [`ConfigStore`]: controllers load their record in
//! `initialize_variables` and write back only the operational fields they own.

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::actuation::actions::ActionConfig;
use crate::actuation::conditional::ConditionalConfig;
use crate::actuation::method::MethodConfig;
use crate::actuation::output::OutputConfig;
use crate::actuation::pid_controller::PidConfig;
use crate::actuation::trigger::TriggerConfig;
use crate::acquisition::input::InputConfig;
use crate::error::{ControlError, Result};
use crate::math::math_controller::MathConfig;
use crate::storage::measurement::{
    ConversionTable, Conversion, DeviceMeasurement, MeasurementInfo, return_measurement_info,
};
use crate::storage::store::SeriesKey;

fn default_sample_rate() -> f64 {
    0.25
}
fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("greenhouse-locks")
}
fn default_lock_timeout() -> f64 {
    30.0
}
fn default_attempt_times() -> u32 {
    3
}
fn default_attempt_delay() -> f64 {
    10.0
}
fn default_pause_timeout() -> f64 {
    5.0
}
fn default_housekeeping() -> f64 {
    60.0
}
fn default_retention() -> usize {
    crate::storage::store::DEFAULT_RETENTION_PER_DEVICE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_sample_rate")]
    pub sample_rate_controller_input: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_controller_math: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_controller_pid: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_controller_conditional: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_controller_trigger: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_controller_output: f64,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_lock_timeout")]
    pub pre_output_lock_timeout: f64,
    #[serde(default = "default_attempt_times")]
    pub attempt_execute_times: u32,
    #[serde(default = "default_attempt_delay")]
    pub attempt_execute_delay: f64,
    #[serde(default = "default_pause_timeout")]
    pub pause_ack_timeout: f64,
    #[serde(default = "default_housekeeping")]
    pub housekeeping_interval: f64,
    #[serde(default)]
    pub sample_export_csv: Option<PathBuf>,
    #[serde(default)]
    pub summary_export_csv: Option<PathBuf>,
    #[serde(default = "default_retention")]
    pub retention_per_device: usize,
    #[serde(default)]
    pub realtime_priority: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            sample_rate_controller_input: default_sample_rate(),
            sample_rate_controller_math: default_sample_rate(),
            sample_rate_controller_pid: default_sample_rate(),
            sample_rate_controller_conditional: default_sample_rate(),
            sample_rate_controller_trigger: default_sample_rate(),
            sample_rate_controller_output: default_sample_rate(),
            lock_dir: default_lock_dir(),
            pre_output_lock_timeout: default_lock_timeout(),
            attempt_execute_times: default_attempt_times(),
            attempt_execute_delay: default_attempt_delay(),
            pause_ack_timeout: default_pause_timeout(),
            housekeeping_interval: default_housekeeping(),
            sample_export_csv: None,
            summary_export_csv: None,
            retention_per_device: default_retention(),
            realtime_priority: false,
        }
    }
}

impl DaemonSettings {
    pub fn sample_rate(&self, kind: ControllerKind) -> f64 {
        match kind {
            ControllerKind::Input => self.sample_rate_controller_input,
            ControllerKind::Math => self.sample_rate_controller_math,
            ControllerKind::Pid => self.sample_rate_controller_pid,
            ControllerKind::Conditional => self.sample_rate_controller_conditional,
            ControllerKind::Trigger => self.sample_rate_controller_trigger,
            ControllerKind::Output => self.sample_rate_controller_output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Input,
    Math,
    Pid,
    Conditional,
    Trigger,
    Output,
}

impl ControllerKind {
    /// Activation order at daemon start; shutdown walks it backwards.
    pub const START_ORDER: [ControllerKind; 5] = [
        ControllerKind::Input,
        ControllerKind::Math,
        ControllerKind::Pid,
        ControllerKind::Trigger,
        ControllerKind::Conditional,
    ];
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerKind::Input => "Input",
            ControllerKind::Math => "Math",
            ControllerKind::Pid => "PID",
            ControllerKind::Conditional => "Conditional",
            ControllerKind::Trigger => "Trigger",
            ControllerKind::Output => "Output",
        };
        f.write_str(name)
    }
}

/// Points at one channel of one controller: `measurement_id` is a [`DeviceMeasurement`] id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementRef {
    pub device_id: String,
    pub measurement_id: String,
}

impl MeasurementRef {
    pub fn new(device_id: impl Into<String>, measurement_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            measurement_id: measurement_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub settings: DaemonSettings,
    #[serde(default)]
    pub conversions: Vec<Conversion>,
    #[serde(default)]
    pub measurements: Vec<DeviceMeasurement>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub maths: Vec<MathConfig>,
    #[serde(default)]
    pub pids: Vec<PidConfig>,
    #[serde(default)]
    pub methods: Vec<MethodConfig>,
    #[serde(default)]
    pub conditionals: Vec<ConditionalConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

impl SystemConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn kind_of(&self, id: &str) -> Option<ControllerKind> {
        if self.inputs.iter().any(|c| c.unique_id == id) {
            Some(ControllerKind::Input)
        } else if self.maths.iter().any(|c| c.unique_id == id) {
            Some(ControllerKind::Math)
        } else if self.pids.iter().any(|c| c.unique_id == id) {
            Some(ControllerKind::Pid)
        } else if self.conditionals.iter().any(|c| c.unique_id == id) {
            Some(ControllerKind::Conditional)
        } else if self.triggers.iter().any(|c| c.unique_id == id) {
            Some(ControllerKind::Trigger)
        } else {
            None
        }
    }

    /// Ids of activated controllers of one kind, in document order.
    pub fn activated(&self, kind: ControllerKind) -> Vec<String> {
        match kind {
            ControllerKind::Input => ids_where(&self.inputs, |c| (&c.unique_id, c.is_activated)),
            ControllerKind::Math => ids_where(&self.maths, |c| (&c.unique_id, c.is_activated)),
            ControllerKind::Pid => ids_where(&self.pids, |c| (&c.unique_id, c.is_activated)),
            ControllerKind::Conditional => {
                ids_where(&self.conditionals, |c| (&c.unique_id, c.is_activated))
            }
            ControllerKind::Trigger => ids_where(&self.triggers, |c| (&c.unique_id, c.is_activated)),
            ControllerKind::Output => Vec::new(),
        }
    }
}

fn ids_where<T>(items: &[T], f: impl Fn(&T) -> (&String, bool)) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| {
            let (id, active) = f(item);
            active.then(|| id.clone())
        })
        .collect()
}

/// Shared, persistable view of the configuration document.
#[derive(Clone)]
pub struct ConfigStore {
    doc: Arc<RwLock<SystemConfig>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// In-memory store; `save()` is a no-op.
    pub fn new(config: SystemConfig) -> Self {
        Self {
            doc: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = SystemConfig::from_toml(&text)?;
        info!(
            "[Config] Loaded {:?}: {} inputs, {} maths, {} pids, {} conditionals, {} triggers",
            path,
            config.inputs.len(),
            config.maths.len(),
            config.pids.len(),
            config.conditionals.len(),
            config.triggers.len()
        );
        Ok(Self {
            doc: Arc::new(RwLock::new(config)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot(&self) -> SystemConfig {
        self.doc.read().clone()
    }

    pub fn settings(&self) -> DaemonSettings {
        self.doc.read().settings.clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&SystemConfig) -> R) -> R {
        f(&self.doc.read())
    }

    /// Applies `f` to the document, then persists it.
    pub fn update<R>(&self, f: impl FnOnce(&mut SystemConfig) -> Result<R>) -> Result<R> {
        let result = {
            let mut doc = self.doc.write();
            f(&mut doc)?
        };
        if let Err(e) = self.save() {
            warn!("[Config] Failed to persist configuration: {}", e);
        }
        Ok(result)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = toml::to_string_pretty(&*self.doc.read())?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn conversions(&self) -> ConversionTable {
        ConversionTable::new(&self.doc.read().conversions)
    }

    /// Channels of one device, ordered by channel index.
    pub fn device_measurements(&self, device_id: &str) -> Vec<DeviceMeasurement> {
        let mut list: Vec<DeviceMeasurement> = self
            .doc
            .read()
            .measurements
            .iter()
            .filter(|m| m.device_id == device_id)
            .cloned()
            .collect();
        list.sort_by_key(|m| m.channel);
        list
    }

    pub fn measurement(&self, measurement_id: &str) -> Result<DeviceMeasurement> {
        self.doc
            .read()
            .measurements
            .iter()
            .find(|m| m.unique_id == measurement_id)
            .cloned()
            .ok_or_else(|| ControlError::Config(format!("unknown measurement '{}'", measurement_id)))
    }

    /// Where values for `source` are stored: resolved channel, unit and measurement name.
    pub fn resolve(&self, source: &MeasurementRef) -> Result<(MeasurementInfo, SeriesKey)> {
        let dm = self.measurement(&source.measurement_id)?;
        if dm.device_id != source.device_id {
            return Err(ControlError::Config(format!(
                "measurement '{}' does not belong to device '{}'",
                source.measurement_id, source.device_id
            )));
        }
        let table = self.conversions();
        let info = return_measurement_info(&dm, table.for_measurement(&dm));
        let key = SeriesKey::new(&source.device_id, &info.unit)
            .channel(info.channel)
            .measurement(&info.measurement);
        Ok((info, key))
    }

    pub fn kind_of(&self, id: &str) -> Option<ControllerKind> {
        self.doc.read().kind_of(id)
    }

    pub fn set_activated(&self, id: &str, active: bool) -> Result<()> {
        self.update(|doc| {
            if let Some(c) = doc.inputs.iter_mut().find(|c| c.unique_id == id) {
                c.is_activated = active;
            } else if let Some(c) = doc.maths.iter_mut().find(|c| c.unique_id == id) {
                c.is_activated = active;
            } else if let Some(c) = doc.pids.iter_mut().find(|c| c.unique_id == id) {
                c.is_activated = active;
            } else if let Some(c) = doc.conditionals.iter_mut().find(|c| c.unique_id == id) {
                c.is_activated = active;
            } else if let Some(c) = doc.triggers.iter_mut().find(|c| c.unique_id == id) {
                c.is_activated = active;
            } else {
                return Err(ControlError::ControllerNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    pub fn input(&self, id: &str) -> Result<InputConfig> {
        find_record(&self.doc.read().inputs, id, |c| &c.unique_id)
    }

    pub fn math(&self, id: &str) -> Result<MathConfig> {
        find_record(&self.doc.read().maths, id, |c| &c.unique_id)
    }

    pub fn pid(&self, id: &str) -> Result<PidConfig> {
        find_record(&self.doc.read().pids, id, |c| &c.unique_id)
    }

    pub fn method(&self, id: &str) -> Result<MethodConfig> {
        find_record(&self.doc.read().methods, id, |c| &c.unique_id)
    }

    pub fn methods(&self) -> Vec<MethodConfig> {
        self.doc.read().methods.clone()
    }

    pub fn conditional(&self, id: &str) -> Result<ConditionalConfig> {
        find_record(&self.doc.read().conditionals, id, |c| &c.unique_id)
    }

    pub fn trigger(&self, id: &str) -> Result<TriggerConfig> {
        find_record(&self.doc.read().triggers, id, |c| &c.unique_id)
    }

    pub fn action(&self, id: &str) -> Result<ActionConfig> {
        find_record(&self.doc.read().actions, id, |c| &c.unique_id)
    }

    pub fn outputs(&self) -> Vec<OutputConfig> {
        self.doc.read().outputs.clone()
    }

    /// Mutates one PID record in place and persists the document.
    pub fn update_pid(&self, id: &str, f: impl FnOnce(&mut PidConfig)) -> Result<()> {
        self.update(|doc| match doc.pids.iter_mut().find(|c| c.unique_id == id) {
            Some(pid) => {
                f(pid);
                Ok(())
            }
            None => Err(ControlError::ControllerNotFound(id.to_string())),
        })
    }

    pub fn set_pid_method_times(
        &self,
        id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update_pid(id, |pid| {
            pid.method_start_time = start;
            pid.method_end_time = end;
        })
    }
}

fn find_record<T: Clone>(items: &[T], id: &str, key: impl Fn(&T) -> &String) -> Result<T> {
    items
        .iter()
        .find(|item| key(item) == id)
        .cloned()
        .ok_or_else(|| ControlError::ControllerNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
[settings]
sample_rate_controller_pid = 0.5

[[measurements]]
unique_id = "m_temp"
device_id = "in1"
channel = 0
measurement = "temperature"
unit = "C"
conversion_id = "c_to_f"

[[measurements]]
unique_id = "m_hum"
device_id = "in1"
channel = 1
measurement = "humidity"
unit = "percent"

[[conversions]]
unique_id = "c_to_f"
convert_unit_from = "C"
convert_unit_to = "F"
equation = "x*(9/5)+32"
"#;

    #[test]
    fn settings_default_when_absent() {
        let config = SystemConfig::from_toml(DOC).unwrap();
        assert_eq!(config.settings.sample_rate(ControllerKind::Pid), 0.5);
        assert_eq!(config.settings.sample_rate(ControllerKind::Input), 0.25);
        assert_eq!(config.settings.pre_output_lock_timeout, 30.0);
        assert_eq!(config.settings.attempt_execute_times, 3);
    }

    #[test]
    fn resolve_uses_conversion_unit() {
        let store = ConfigStore::new(SystemConfig::from_toml(DOC).unwrap());
        let (info, key) = store.resolve(&MeasurementRef::new("in1", "m_temp")).unwrap();
        assert_eq!(info.unit, "F");
        assert_eq!(key.channel, Some(0));
        assert!(store.resolve(&MeasurementRef::new("other", "m_temp")).is_err());
    }

    #[test]
    fn device_measurements_ordered_by_channel() {
        let store = ConfigStore::new(SystemConfig::from_toml(DOC).unwrap());
        let list = store.device_measurements("in1");
        assert_eq!(list.iter().map(|m| m.channel).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn save_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greenhouse.toml");
        std::fs::write(&path, DOC).unwrap();
        let store = ConfigStore::load(&path).unwrap();
        store.update(|doc| {
            doc.settings.housekeeping_interval = 5.0;
            Ok(())
        })
        .unwrap();
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.settings().housekeeping_interval, 5.0);
        assert_eq!(reloaded.device_measurements("in1").len(), 2);
    }
}
