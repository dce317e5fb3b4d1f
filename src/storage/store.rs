//! Time-series measurement store.
//!
//! Every controller talks to the store through [`MeasurementStore`]; the daemon wires in
//! [`InMemoryStore`], which keeps an append-only series per device and evicts the oldest
//! samples once a device exceeds its retention cap.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{ControlError, Result};
use crate::runtime::clock::{secs_to_duration, Clock};
use crate::storage::measurement::ChannelValue;
use crate::utils::recorder::SampleRecorder;

/// One persisted value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSample {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub unit: String,
    pub measurement: String,
    pub channel: Option<u32>,
    pub value: f64,
}

/// Identifies a series. `channel` and `measurement` narrow the match when set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub device_id: String,
    pub unit: String,
    pub channel: Option<u32>,
    pub measurement: Option<String>,
}

impl SeriesKey {
    pub fn new(device_id: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            unit: unit.into(),
            channel: None,
            measurement: None,
        }
    }

    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn measurement(mut self, measurement: impl Into<String>) -> Self {
        self.measurement = Some(measurement.into());
        self
    }

    fn matches(&self, sample: &MeasurementSample) -> bool {
        sample.unit == self.unit
            && self.channel.is_none_or(|c| sample.channel == Some(c))
            && self
                .measurement
                .as_deref()
                .is_none_or(|m| sample.measurement == m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    PastSeconds(f64),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Mean,
    Sum,
    Count,
    Min,
    Max,
    Last,
}

pub trait MeasurementStore: Send + Sync {
    fn write(&self, sample: MeasurementSample) -> Result<()>;

    /// Writes one batch for a device. Entries without a timestamp are stamped "now".
    fn write_batch(&self, device_id: &str, batch: &BTreeMap<u32, ChannelValue>) -> Result<()>;

    /// Newest matching sample no older than `max_age` seconds (any age when `None`).
    fn read_last(&self, key: &SeriesKey, max_age: Option<f64>) -> Result<Option<(DateTime<Utc>, f64)>>;

    fn read_list(&self, key: &SeriesKey, window: Window) -> Result<Vec<(DateTime<Utc>, f64)>>;

    fn read_aggregate(&self, key: &SeriesKey, function: AggregateFn, window: Window) -> Result<Option<f64>>;
}

pub type SharedStore = Arc<dyn MeasurementStore>;

pub const DEFAULT_RETENTION_PER_DEVICE: usize = 10_000;

pub struct InMemoryStore {
    series: RwLock<HashMap<String, VecDeque<MeasurementSample>>>,
    clock: Arc<dyn Clock>,
    retention: usize,
    recorder: Option<SampleRecorder>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_retention(clock, DEFAULT_RETENTION_PER_DEVICE)
    }

    pub fn with_retention(clock: Arc<dyn Clock>, retention: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            clock,
            retention: retention.max(1),
            recorder: None,
        }
    }

    /// Mirrors every written sample into `recorder`.
    pub fn with_recorder(mut self, recorder: SampleRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn sample_count(&self, device_id: &str) -> usize {
        self.series.read().get(device_id).map_or(0, |s| s.len())
    }

    fn window_bounds(&self, window: Window) -> (DateTime<Utc>, DateTime<Utc>) {
        match window {
            Window::PastSeconds(secs) => {
                let now = self.clock.now();
                (now - secs_to_duration(secs), now)
            }
            Window::Range { start, end } => (start, end),
        }
    }
}

impl MeasurementStore for InMemoryStore {
    fn write(&self, sample: MeasurementSample) -> Result<()> {
        if sample.device_id.is_empty() || sample.unit.is_empty() {
            return Err(ControlError::Store(
                "sample must carry a device id and unit".into(),
            ));
        }
        if !sample.value.is_finite() {
            return Err(ControlError::Store(format!(
                "refusing non-finite value for {}",
                sample.device_id
            )));
        }

        if let Some(recorder) = &self.recorder {
            recorder.record(sample.clone());
        }

        let mut series = self.series.write();
        let entries = series.entry(sample.device_id.clone()).or_default();
        if entries.len() >= self.retention {
            entries.pop_front();
        }
        // keep the series ordered even if a driver reports an older timestamp
        let pos = entries
            .iter()
            .rposition(|s| s.timestamp <= sample.timestamp)
            .map_or(0, |p| p + 1);
        entries.insert(pos, sample);
        Ok(())
    }

    fn write_batch(&self, device_id: &str, batch: &BTreeMap<u32, ChannelValue>) -> Result<()> {
        let now = self.clock.now();
        for (channel, entry) in batch {
            self.write(MeasurementSample {
                timestamp: entry.timestamp.unwrap_or(now),
                device_id: device_id.to_string(),
                unit: entry.unit.clone(),
                measurement: entry.measurement.clone(),
                channel: Some(*channel),
                value: entry.value,
            })?;
        }
        Ok(())
    }

    fn read_last(&self, key: &SeriesKey, max_age: Option<f64>) -> Result<Option<(DateTime<Utc>, f64)>> {
        let series = self.series.read();
        let Some(entries) = series.get(&key.device_id) else {
            return Ok(None);
        };
        let Some(sample) = entries.iter().rev().find(|s| key.matches(s)) else {
            return Ok(None);
        };
        if let Some(age) = max_age {
            if sample.timestamp < self.clock.now() - secs_to_duration(age) {
                return Ok(None);
            }
        }
        Ok(Some((sample.timestamp, sample.value)))
    }

    fn read_list(&self, key: &SeriesKey, window: Window) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let (start, end) = self.window_bounds(window);
        let series = self.series.read();
        Ok(series
            .get(&key.device_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|s| key.matches(s) && s.timestamp >= start && s.timestamp <= end)
                    .map(|s| (s.timestamp, s.value))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_aggregate(&self, key: &SeriesKey, function: AggregateFn, window: Window) -> Result<Option<f64>> {
        let values: Vec<f64> = self.read_list(key, window)?.into_iter().map(|(_, v)| v).collect();
        if values.is_empty() {
            return Ok(match function {
                AggregateFn::Count => Some(0.0),
                _ => None,
            });
        }
        let result = match function {
            AggregateFn::Mean => values.iter().sum::<f64>() / values.len() as f64,
            AggregateFn::Sum => values.iter().sum(),
            AggregateFn::Count => values.len() as f64,
            AggregateFn::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggregateFn::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggregateFn::Last => values[values.len() - 1],
        };
        Ok(Some(result))
    }
}

/// Writes a converted batch for one device.
///
/// With `use_same_timestamp` every channel is stamped with one shared "now"; otherwise each
/// channel keeps its own reading timestamp and falls back to the time of the write.
pub fn write_measurements(
    store: &dyn MeasurementStore,
    clock: &dyn Clock,
    device_id: &str,
    batch: BTreeMap<u32, ChannelValue>,
    use_same_timestamp: bool,
) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }
    let shared = clock.now();
    let stamped: BTreeMap<u32, ChannelValue> = batch
        .into_iter()
        .map(|(channel, mut entry)| {
            if use_same_timestamp {
                entry.timestamp = Some(shared);
            } else if entry.timestamp.is_none() {
                entry.timestamp = Some(clock.now());
            }
            (channel, entry)
        })
        .collect();
    let count = stamped.len();
    store.write_batch(device_id, &stamped)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::at_noon());
        let store = InMemoryStore::new(clock.clone());
        (clock, store)
    }

    fn sample(clock: &ManualClock, channel: u32, value: f64) -> MeasurementSample {
        MeasurementSample {
            timestamp: clock.now(),
            device_id: "in1".into(),
            unit: "C".into(),
            measurement: "temperature".into(),
            channel: Some(channel),
            value,
        }
    }

    #[test]
    fn read_last_respects_max_age() {
        let (clock, store) = setup();
        store.write(sample(&clock, 0, 21.5)).unwrap();
        clock.advance(30.0);
        let key = SeriesKey::new("in1", "C").channel(0);
        assert_eq!(store.read_last(&key, Some(60.0)).unwrap().map(|(_, v)| v), Some(21.5));
        assert!(store.read_last(&key, Some(10.0)).unwrap().is_none());
        assert!(store.read_last(&key, None).unwrap().is_some());
    }

    #[test]
    fn channel_disambiguates_same_unit() {
        let (clock, store) = setup();
        store.write(sample(&clock, 0, 1.0)).unwrap();
        store.write(sample(&clock, 1, 2.0)).unwrap();
        let ch0 = SeriesKey::new("in1", "C").channel(0);
        let ch1 = SeriesKey::new("in1", "C").channel(1);
        assert_eq!(store.read_last(&ch0, None).unwrap().map(|(_, v)| v), Some(1.0));
        assert_eq!(store.read_last(&ch1, None).unwrap().map(|(_, v)| v), Some(2.0));
    }

    #[test]
    fn aggregates_over_past_window() {
        let (clock, store) = setup();
        for v in [1.0, 2.0, 3.0, 6.0] {
            store.write(sample(&clock, 0, v)).unwrap();
            clock.advance(10.0);
        }
        let key = SeriesKey::new("in1", "C");
        // last 25 s covers the samples written at t=20 and t=30
        let w = Window::PastSeconds(25.0);
        assert_eq!(store.read_aggregate(&key, AggregateFn::Mean, w).unwrap(), Some(4.5));
        assert_eq!(store.read_aggregate(&key, AggregateFn::Sum, w).unwrap(), Some(9.0));
        assert_eq!(store.read_aggregate(&key, AggregateFn::Count, w).unwrap(), Some(2.0));
        assert_eq!(store.read_aggregate(&key, AggregateFn::Last, w).unwrap(), Some(6.0));
        let empty = Window::PastSeconds(1.0);
        assert_eq!(store.read_aggregate(&key, AggregateFn::Max, empty).unwrap(), None);
        assert_eq!(store.read_aggregate(&key, AggregateFn::Count, empty).unwrap(), Some(0.0));
    }

    #[test]
    fn retention_evicts_oldest() {
        let clock = Arc::new(ManualClock::at_noon());
        let store = InMemoryStore::with_retention(clock.clone(), 2);
        for v in [1.0, 2.0, 3.0] {
            store.write(sample(&clock, 0, v)).unwrap();
            clock.advance(1.0);
        }
        assert_eq!(store.sample_count("in1"), 2);
        let all = store.read_list(&SeriesKey::new("in1", "C"), Window::PastSeconds(100.0)).unwrap();
        assert_eq!(all.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn rejects_samples_without_unit() {
        let (clock, store) = setup();
        let mut s = sample(&clock, 0, 1.0);
        s.unit.clear();
        assert!(store.write(s).is_err());
    }

    #[test]
    fn same_timestamp_batch() {
        let (clock, store) = setup();
        let mut batch = BTreeMap::new();
        let earlier = clock.now() - chrono::Duration::seconds(5);
        for ch in 0..2u32 {
            batch.insert(
                ch,
                ChannelValue {
                    measurement: "temperature".into(),
                    unit: "C".into(),
                    value: ch as f64,
                    timestamp: Some(earlier),
                },
            );
        }
        write_measurements(&store, clock.as_ref(), "in1", batch.clone(), true).unwrap();
        let key = SeriesKey::new("in1", "C").channel(1);
        let (ts, _) = store.read_last(&key, None).unwrap().unwrap();
        assert_eq!(ts, clock.now());

        clock.advance(1.0);
        write_measurements(&store, clock.as_ref(), "in1", batch, false).unwrap();
        let list = store.read_list(&key, Window::PastSeconds(60.0)).unwrap();
        assert!(list.iter().any(|(t, _)| *t == earlier));
    }
}
