//! Input driver contract and the compiled-in driver registry.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::random_range;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::acquisition::options::{DecodedOptions, OptionSpec, decode};
use crate::error::{ControlError, Result};
use crate::runtime::clock::SharedClock;
use crate::storage::measurement::{ChannelValue, Conversion, DeviceMeasurement, parse_measurement};
use crate::storage::store::{SharedStore, write_measurements};
use crate::utils::metrics::{SharedMetrics, lock};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Reading {
    pub fn now(value: f64) -> Self {
        Self { value, timestamp: None }
    }
}

/// Raw values keyed by channel.
pub type ChannelReadings = BTreeMap<u32, Reading>;

pub trait InputDriver: Send {
    /// Next set of raw readings. `ControlError::NoData` means "nothing yet".
    fn next_measurement(&mut self) -> Result<ChannelReadings>;

    /// Listener drivers push readings from their own thread; the input loop idles.
    fn is_listener(&self) -> bool {
        false
    }

    fn measurements_use_same_timestamp(&self) -> bool {
        true
    }

    fn start_listener(&mut self, _sink: ListenerSink) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Channel metadata resolved once when the input initialises.
pub type ChannelTable = Arc<Vec<(DeviceMeasurement, Option<Conversion>)>>;

/// Converts raw readings for the enabled, configured channels. Readings for channels
/// nobody configured are dropped; a failed conversion drops only that channel.
pub fn readings_to_batch(
    label: &str,
    channels: &[(DeviceMeasurement, Option<Conversion>)],
    readings: &ChannelReadings,
) -> BTreeMap<u32, ChannelValue> {
    let mut batch = BTreeMap::new();
    for (dm, conversion) in channels.iter().filter(|(dm, _)| dm.is_enabled) {
        let Some(reading) = readings.get(&dm.channel) else {
            continue;
        };
        match parse_measurement(dm, conversion.as_ref(), reading.value, reading.timestamp) {
            Ok(value) => {
                batch.insert(dm.channel, value);
            }
            Err(e) => warn!("[{}] Channel {} conversion failed: {}", label, dm.channel, e),
        }
    }
    batch
}

/// Write path handed to listener drivers.
#[derive(Clone)]
pub struct ListenerSink {
    device_id: String,
    channels: ChannelTable,
    store: SharedStore,
    clock: SharedClock,
    metrics: Option<SharedMetrics>,
    use_same_timestamp: bool,
}

impl ListenerSink {
    pub fn new(
        device_id: String,
        channels: ChannelTable,
        store: SharedStore,
        clock: SharedClock,
        metrics: Option<SharedMetrics>,
        use_same_timestamp: bool,
    ) -> Self {
        Self { device_id, channels, store, clock, metrics, use_same_timestamp }
    }

    pub fn push(&self, readings: &ChannelReadings) -> Result<usize> {
        let label = format!("Input {}", self.device_id);
        let batch = readings_to_batch(&label, &self.channels, readings);
        let written = write_measurements(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.device_id,
            batch,
            self.use_same_timestamp,
        )?;
        if let Some(metrics) = &self.metrics {
            lock(metrics).record_samples(written);
        }
        Ok(written)
    }
}

type BuildFn = fn(&DecodedOptions) -> Result<Box<dyn InputDriver>>;

pub struct DriverInfo {
    pub name: &'static str,
    pub options: &'static [OptionSpec],
    build: BuildFn,
}

pub static INPUT_DRIVERS: &[DriverInfo] = &[
    DriverInfo {
        name: "simulated_environment",
        options: &[
            OptionSpec::float("base_temperature", 22.0),
            OptionSpec::float("base_humidity", 55.0),
            OptionSpec::float("base_pressure", 101_325.0),
            OptionSpec::float("noise", 0.2),
        ],
        build: SimulatedEnvironment::build,
    },
    DriverInfo {
        name: "constant",
        options: &[OptionSpec::float_list("values", &[0.0])],
        build: ConstantDriver::build,
    },
    DriverInfo {
        name: "sequence",
        options: &[
            OptionSpec::float_list("values", &[]),
            OptionSpec::integer("channel", 0),
            OptionSpec::boolean("repeat", false),
        ],
        build: SequenceDriver::build,
    },
    DriverInfo {
        name: "simulated_listener",
        options: &[
            OptionSpec::float("interval", 1.0),
            OptionSpec::float("start", 20.0),
            OptionSpec::float("step", 0.1),
            OptionSpec::integer("channel", 0),
        ],
        build: SimulatedListener::build,
    },
];

pub fn driver_info(name: &str) -> Option<&'static DriverInfo> {
    INPUT_DRIVERS.iter().find(|d| d.name == name)
}

/// Builds a driver by registry name. An unknown name is a fatal configuration error.
pub fn build_driver(name: &str, raw_options: &toml::Table) -> Result<Box<dyn InputDriver>> {
    let info = driver_info(name).ok_or_else(|| ControlError::UnknownDevice(name.to_string()))?;
    let options = decode(info.options, raw_options)?;
    (info.build)(&options)
}

/// Temperature (C, ch 0), humidity (percent, ch 1) and pressure (Pa, ch 2) with noise.
pub struct SimulatedEnvironment {
    base: [f64; 3],
    noise: f64,
}

impl SimulatedEnvironment {
    fn build(opts: &DecodedOptions) -> Result<Box<dyn InputDriver>> {
        Ok(Box::new(Self {
            base: [
                opts.float("base_temperature")?,
                opts.float("base_humidity")?,
                opts.float("base_pressure")?,
            ],
            noise: opts.float("noise")?.abs(),
        }))
    }
}

impl InputDriver for SimulatedEnvironment {
    fn next_measurement(&mut self) -> Result<ChannelReadings> {
        let noise = self.noise;
        let mut readings = ChannelReadings::new();
        for (channel, base) in self.base.iter().enumerate() {
            let jitter = random_range(-noise..=noise);
            let value = if channel == 1 {
                (base + jitter).clamp(0.0, 100.0)
            } else {
                base + jitter
            };
            readings.insert(channel as u32, Reading::now(value));
        }
        Ok(readings)
    }
}

/// Fixed value per channel, channel index = position in `values`.
pub struct ConstantDriver {
    values: Vec<f64>,
}

impl ConstantDriver {
    fn build(opts: &DecodedOptions) -> Result<Box<dyn InputDriver>> {
        Ok(Box::new(Self { values: opts.float_list("values")?.to_vec() }))
    }
}

impl InputDriver for ConstantDriver {
    fn next_measurement(&mut self) -> Result<ChannelReadings> {
        Ok(self
            .values
            .iter()
            .enumerate()
            .map(|(ch, v)| (ch as u32, Reading::now(*v)))
            .collect())
    }
}

/// Replays `values` on one channel, then reports no data (or starts over with `repeat`).
pub struct SequenceDriver {
    values: Vec<f64>,
    pending: VecDeque<f64>,
    channel: u32,
    repeat: bool,
}

impl SequenceDriver {
    fn build(opts: &DecodedOptions) -> Result<Box<dyn InputDriver>> {
        let values = opts.float_list("values")?.to_vec();
        let channel = u32::try_from(opts.integer("channel")?)
            .map_err(|_| ControlError::Config("sequence channel must be >= 0".into()))?;
        Ok(Box::new(Self {
            pending: values.iter().copied().collect(),
            values,
            channel,
            repeat: opts.boolean("repeat")?,
        }))
    }
}

impl InputDriver for SequenceDriver {
    fn next_measurement(&mut self) -> Result<ChannelReadings> {
        if self.pending.is_empty() && self.repeat {
            self.pending = self.values.iter().copied().collect();
        }
        let value = self.pending.pop_front().ok_or(ControlError::NoData)?;
        Ok(ChannelReadings::from([(self.channel, Reading::now(value))]))
    }
}

/// Pushes a ramp from a background thread instead of being polled.
pub struct SimulatedListener {
    interval: f64,
    start: f64,
    step: f64,
    channel: u32,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedListener {
    fn build(opts: &DecodedOptions) -> Result<Box<dyn InputDriver>> {
        let channel = u32::try_from(opts.integer("channel")?)
            .map_err(|_| ControlError::Config("listener channel must be >= 0".into()))?;
        Ok(Box::new(Self {
            interval: opts.float("interval")?.max(0.01),
            start: opts.float("start")?,
            step: opts.float("step")?,
            channel,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

impl InputDriver for SimulatedListener {
    fn next_measurement(&mut self) -> Result<ChannelReadings> {
        Err(ControlError::NoData)
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn start_listener(&mut self, sink: ListenerSink) -> Result<()> {
        self.stop();
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let interval = Duration::from_secs_f64(self.interval);
        let (start, step, channel) = (self.start, self.step, self.channel);

        let handle = thread::Builder::new()
            .name(format!("listener-{}", sink.device_id))
            .spawn(move || {
                info!("[Listener {}] Receiving", sink.device_id);
                let mut value = start;
                while running.load(Ordering::Acquire) {
                    let readings = ChannelReadings::from([(channel, Reading::now(value))]);
                    match sink.push(&readings) {
                        Ok(n) => debug!("[Listener {}] Wrote {} values", sink.device_id, n),
                        Err(e) => error!("[Listener {}] Write failed: {}", sink.device_id, e),
                    }
                    value += step;
                    thread::sleep(interval);
                }
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimulatedListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_driver_is_fatal() {
        let err = build_driver("does_not_exist", &toml::Table::new()).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn sequence_runs_dry_with_no_data() {
        let opts: toml::Table = "values = [1.0, 2.0]\nchannel = 3".parse().unwrap();
        let mut driver = build_driver("sequence", &opts).unwrap();
        assert_eq!(driver.next_measurement().unwrap()[&3].value, 1.0);
        assert_eq!(driver.next_measurement().unwrap()[&3].value, 2.0);
        assert!(matches!(driver.next_measurement(), Err(ControlError::NoData)));
    }

    #[test]
    fn simulated_environment_stays_near_base() {
        let opts: toml::Table = "base_temperature = 25.0\nnoise = 0.5".parse().unwrap();
        let mut driver = build_driver("simulated_environment", &opts).unwrap();
        let r = driver.next_measurement().unwrap();
        assert_eq!(r.len(), 3);
        assert!((r[&0].value - 25.0).abs() <= 0.5);
        assert!((0.0..=100.0).contains(&r[&1].value));
    }

    #[test]
    fn disabled_and_unconfigured_channels_are_skipped() {
        let dm = |ch: u32, enabled: bool| DeviceMeasurement {
            unique_id: format!("m{}", ch),
            device_id: "in1".into(),
            channel: ch,
            measurement: "temperature".into(),
            unit: "C".into(),
            conversion_id: None,
            measurement_type: Default::default(),
            is_enabled: enabled,
            rescale: None,
        };
        let channels = vec![(dm(0, true), None), (dm(1, false), None)];
        let readings: ChannelReadings =
            [(0, Reading::now(1.0)), (1, Reading::now(2.0)), (2, Reading::now(3.0))].into();
        let batch = readings_to_batch("test", &channels, &readings);
        assert_eq!(batch.keys().copied().collect::<Vec<_>>(), vec![0]);
    }
}
