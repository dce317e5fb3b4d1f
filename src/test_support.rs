//! Fixtures shared by unit tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::actuation::output::{OutputControl, OutputOnKind, OutputReply, OutputState};
use crate::runtime::clock::{Clock, ManualClock};
use crate::storage::measurement::{DeviceMeasurement, MeasurementType};
use crate::storage::store::{InMemoryStore, MeasurementSample, MeasurementStore};

pub fn dm(unique_id: &str, device_id: &str, channel: u32, measurement: &str, unit: &str) -> DeviceMeasurement {
    DeviceMeasurement {
        unique_id: unique_id.into(),
        device_id: device_id.into(),
        channel,
        measurement: measurement.into(),
        unit: unit.into(),
        conversion_id: None,
        measurement_type: MeasurementType::Normal,
        is_enabled: true,
        rescale: None,
    }
}

pub fn clock_and_store() -> (Arc<ManualClock>, Arc<InMemoryStore>) {
    let clock = Arc::new(ManualClock::at_noon());
    let store = Arc::new(InMemoryStore::new(clock.clone()));
    (clock, store)
}

/// Writes `value` for `dm` at `at`.
pub fn put_at(store: &InMemoryStore, dm: &DeviceMeasurement, value: f64, at: DateTime<Utc>) {
    store
        .write(MeasurementSample {
            timestamp: at,
            device_id: dm.device_id.clone(),
            unit: dm.unit.clone(),
            measurement: dm.measurement.clone(),
            channel: Some(dm.channel),
            value,
        })
        .unwrap();
}

/// Writes `value` for `dm` at the clock's current time.
pub fn put(store: &InMemoryStore, clock: &ManualClock, dm: &DeviceMeasurement, value: f64) {
    put_at(store, dm, value, clock.now());
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputCall {
    On {
        output_id: String,
        channel: u32,
        kind: OutputOnKind,
        amount: f64,
        min_off: f64,
    },
    Off {
        output_id: String,
        channel: u32,
    },
}

/// Output contract that records every command.
#[derive(Default)]
pub struct RecordingOutputs {
    calls: Mutex<Vec<OutputCall>>,
    states: Mutex<HashMap<(String, u32), OutputState>>,
}

impl RecordingOutputs {
    pub fn take(&self) -> Vec<OutputCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn set_state(&self, output_id: &str, channel: u32, state: OutputState) {
        self.states.lock().insert((output_id.to_string(), channel), state);
    }
}

impl OutputControl for RecordingOutputs {
    fn output_on(
        &self,
        output_id: &str,
        channel: u32,
        kind: OutputOnKind,
        amount: f64,
        min_off: f64,
        _trigger_conditionals: bool,
    ) -> OutputReply {
        self.calls.lock().push(OutputCall::On {
            output_id: output_id.to_string(),
            channel,
            kind,
            amount,
            min_off,
        });
        self.set_state(output_id, channel, OutputState::On);
        OutputReply::ok("on")
    }

    fn output_off(&self, output_id: &str, channel: u32, _trigger_conditionals: bool) -> OutputReply {
        self.calls.lock().push(OutputCall::Off {
            output_id: output_id.to_string(),
            channel,
        });
        self.set_state(output_id, channel, OutputState::Off);
        OutputReply::ok("off")
    }

    fn output_state(&self, output_id: &str, channel: u32) -> OutputState {
        self.states
            .lock()
            .get(&(output_id.to_string(), channel))
            .copied()
            .unwrap_or(OutputState::Off)
    }

    fn output_seconds_currently_on(&self, _output_id: &str, _channel: u32) -> f64 {
        0.0
    }
}
