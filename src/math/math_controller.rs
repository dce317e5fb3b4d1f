//! Math controller: derives new measurements from stored ones on a fixed period.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use std::collections::BTreeMap;

use crate::config::{ConfigStore, ControllerKind, DaemonSettings, MeasurementRef};
use crate::error::{ControlError, Result};
use crate::math::equation::Expression;
use crate::math::psychrometrics::{STANDARD_PRESSURE_PA, state_from_wet_bulb, vapor_pressure_deficit};
use crate::runtime::clock::SharedClock;
use crate::runtime::controller::{Controller, LoopControl, RetryPolicy};
use crate::storage::measurement::{ChannelValue, Conversion, ConversionTable, DeviceMeasurement, parse_measurement};
use crate::storage::source::{read_source_last, read_source_past};
use crate::storage::store::{AggregateFn, SharedStore, write_measurements};
use crate::utils::metrics::{SharedMetrics, lock};

fn default_true() -> bool {
    true
}

fn default_max_measure_age() -> f64 {
    360.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    pub period: f64,
    #[serde(default)]
    pub start_offset: f64,
    #[serde(default = "default_max_measure_age")]
    pub max_measure_age: f64,
    #[serde(flatten)]
    pub kind: MathKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "math_type", rename_all = "snake_case")]
pub enum MathKind {
    Average {
        inputs: Vec<MeasurementRef>,
    },
    /// Mean of one measurement over the past `max_measure_age` seconds.
    AverageSingle {
        input: MeasurementRef,
    },
    Sum {
        inputs: Vec<MeasurementRef>,
    },
    SumSingle {
        input: MeasurementRef,
    },
    Difference {
        first: MeasurementRef,
        second: MeasurementRef,
        #[serde(default)]
        reverse_order: bool,
        #[serde(default)]
        absolute: bool,
    },
    Equation {
        input: MeasurementRef,
        equation: String,
    },
    Redundancy {
        inputs: Vec<MeasurementRef>,
    },
    Statistics {
        inputs: Vec<MeasurementRef>,
    },
    Verification {
        inputs: Vec<MeasurementRef>,
        max_difference: f64,
    },
    Humidity {
        dry_bulb: MeasurementRef,
        wet_bulb: MeasurementRef,
        #[serde(default)]
        pressure: Option<MeasurementRef>,
    },
    VaporPressureDeficit {
        temperature: MeasurementRef,
        humidity: MeasurementRef,
    },
}

impl MathKind {
    pub fn name(&self) -> &'static str {
        match self {
            MathKind::Average { .. } => "average",
            MathKind::AverageSingle { .. } => "average_single",
            MathKind::Sum { .. } => "sum",
            MathKind::SumSingle { .. } => "sum_single",
            MathKind::Difference { .. } => "difference",
            MathKind::Equation { .. } => "equation",
            MathKind::Redundancy { .. } => "redundancy",
            MathKind::Statistics { .. } => "statistics",
            MathKind::Verification { .. } => "verification",
            MathKind::Humidity { .. } => "humidity",
            MathKind::VaporPressureDeficit { .. } => "vapor_pressure_deficit",
        }
    }
}

/// Statistics output slots. The discriminant is the output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Mean = 0,
    Median = 1,
    Min = 2,
    Max = 3,
    StdDev = 4,
    MeanPlusStdDev = 5,
    MeanMinusStdDev = 6,
}

/// Humidity output slots. The discriminant is the output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumidityValue {
    RelativeHumidity = 0,
    HumidityRatio = 1,
    SpecificEnthalpy = 2,
    SpecificVolume = 3,
}

/// `[mean, median, min, max, population stdev, mean + stdev, mean - stdev]`.
pub fn statistics(values: &[f64]) -> Option<[f64; 7]> {
    if values.is_empty() {
        return None;
    }
    let mean = Statistics::mean(values.iter());
    let stdev = Statistics::population_std_dev(values.iter());
    let median = Data::new(values.to_vec()).median();
    let mut out = [0.0; 7];
    out[Statistic::Mean as usize] = mean;
    out[Statistic::Median as usize] = median;
    out[Statistic::Min as usize] = Statistics::min(values.iter());
    out[Statistic::Max as usize] = Statistics::max(values.iter());
    out[Statistic::StdDev as usize] = stdev;
    out[Statistic::MeanPlusStdDev as usize] = mean + stdev;
    out[Statistic::MeanMinusStdDev as usize] = mean - stdev;
    Some(out)
}

/// Emits the spread of `values` when it is strictly below `max_difference`.
pub fn verify(values: &[f64], max_difference: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let spread = Statistics::max(values.iter()) - Statistics::min(values.iter());
    (spread < max_difference).then_some(spread)
}

pub fn difference(first: f64, second: f64, reverse_order: bool, absolute: bool) -> f64 {
    let d = if reverse_order { second - first } else { first - second };
    if absolute { d.abs() } else { d }
}

fn is_percent(unit: &str) -> bool {
    matches!(unit, "percent" | "%")
}

pub struct MathController {
    id: String,
    label: String,
    config: ConfigStore,
    store: SharedStore,
    clock: SharedClock,
    metrics: Option<SharedMetrics>,

    settings: DaemonSettings,
    math: Option<MathConfig>,
    equation: Option<Expression>,
    conversions: ConversionTable,
    channels: Vec<(DeviceMeasurement, Option<Conversion>)>,
    retry: RetryPolicy,
    timer: f64,
    schedule_started: bool,
}

impl MathController {
    pub fn new(
        id: &str,
        config: ConfigStore,
        store: SharedStore,
        clock: SharedClock,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            id: id.to_string(),
            label: format!("Math {}", id),
            settings: config.settings(),
            config,
            store,
            clock,
            metrics,
            math: None,
            equation: None,
            conversions: ConversionTable::default(),
            channels: Vec::new(),
            retry: RetryPolicy::default(),
            timer: 0.0,
            schedule_started: false,
        }
    }

    fn error_not_within_max_age(&self) -> Option<BTreeMap<u32, ChannelValue>> {
        error!(
            "[{}] One or more measurements were not within the max age of {}s. Not calculating.",
            self.label,
            self.math.as_ref().map_or(0.0, |m| m.max_measure_age)
        );
        None
    }

    fn last(&self, source: &MeasurementRef, max_age: f64) -> Result<Option<(String, f64)>> {
        Ok(read_source_last(&self.config, self.store.as_ref(), source, max_age)?
            .map(|s| (s.info.unit, s.value)))
    }

    fn last_all(&self, sources: &[MeasurementRef], max_age: f64) -> Result<Option<Vec<f64>>> {
        let mut values = Vec::with_capacity(sources.len());
        for source in sources {
            match self.last(source, max_age)? {
                Some((_, v)) => values.push(v),
                None => return Ok(None),
            }
        }
        Ok((!values.is_empty()).then_some(values))
    }

    /// Writes `value` to this math's first channel.
    fn single(&self, value: f64) -> Result<Option<BTreeMap<u32, ChannelValue>>> {
        let Some((dm, conversion)) = self.channels.first() else {
            error!("[{}] No enabled output measurement configured", self.label);
            return Ok(None);
        };
        let entry = parse_measurement(dm, conversion.as_ref(), value, None)?;
        Ok(Some(BTreeMap::from([(dm.channel, entry)])))
    }

    /// Writes `values[channel]` to each enabled channel that has a slot.
    fn positional(&self, values: &[f64]) -> Result<Option<BTreeMap<u32, ChannelValue>>> {
        let mut batch = BTreeMap::new();
        for (dm, conversion) in &self.channels {
            let Some(value) = values.get(dm.channel as usize) else {
                debug!("[{}] Channel {} has no computed value", self.label, dm.channel);
                continue;
            };
            batch.insert(dm.channel, parse_measurement(dm, conversion.as_ref(), *value, None)?);
        }
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Latest value of `source` converted to `unit`. `None` when stale or unconvertible.
    fn last_in_unit(&self, source: &MeasurementRef, unit: &str, max_age: f64) -> Result<Option<f64>> {
        let Some((from, value)) = self.last(source, max_age)? else {
            return Ok(None);
        };
        if from == unit || (is_percent(&from) && is_percent(unit)) {
            return Ok(Some(value));
        }
        match self.conversions.convert_between(value, &from, unit) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                error!("[{}] Cannot convert {} to {}: {}", self.label, from, unit, e);
                Ok(None)
            }
        }
    }

    /// One calculation. `None` means nothing is written this cycle.
    pub fn calculate_math(&self) -> Result<Option<BTreeMap<u32, ChannelValue>>> {
        let Some(math) = self.math.as_ref() else {
            return Ok(None);
        };
        let age = math.max_measure_age;
        match &math.kind {
            MathKind::Average { inputs } => match self.last_all(inputs, age)? {
                Some(values) => self.single(values.iter().sum::<f64>() / values.len() as f64),
                None => Ok(self.error_not_within_max_age()),
            },
            MathKind::AverageSingle { input } => {
                match read_source_past(&self.config, self.store.as_ref(), input, AggregateFn::Mean, age)? {
                    Some((_, v)) => self.single(v),
                    None => Ok(self.error_not_within_max_age()),
                }
            }
            MathKind::Sum { inputs } => match self.last_all(inputs, age)? {
                Some(values) => self.single(values.iter().sum()),
                None => Ok(self.error_not_within_max_age()),
            },
            MathKind::SumSingle { input } => {
                match read_source_past(&self.config, self.store.as_ref(), input, AggregateFn::Sum, age)? {
                    Some((_, v)) => self.single(v),
                    None => Ok(self.error_not_within_max_age()),
                }
            }
            MathKind::Difference { first, second, reverse_order, absolute } => {
                match (self.last(first, age)?, self.last(second, age)?) {
                    (Some((_, a)), Some((_, b))) => self.single(difference(a, b, *reverse_order, *absolute)),
                    _ => Ok(self.error_not_within_max_age()),
                }
            }
            MathKind::Equation { input, .. } => {
                let Some(expression) = self.equation.as_ref() else {
                    return Err(ControlError::Expression("equation not compiled".into()));
                };
                match self.last(input, age)? {
                    Some((_, x)) => self.single(expression.eval(x)?),
                    None => Ok(self.error_not_within_max_age()),
                }
            }
            MathKind::Redundancy { inputs } => {
                for source in inputs {
                    if let Some((_, v)) = self.last(source, age)? {
                        return self.single(v);
                    }
                }
                Ok(self.error_not_within_max_age())
            }
            MathKind::Statistics { inputs } => match self.last_all(inputs, age)? {
                Some(values) => match statistics(&values) {
                    Some(stats) => self.positional(&stats),
                    None => Ok(None),
                },
                None => Ok(self.error_not_within_max_age()),
            },
            MathKind::Verification { inputs, max_difference } => match self.last_all(inputs, age)? {
                Some(values) => match verify(&values, *max_difference) {
                    Some(spread) => self.single(spread),
                    None => {
                        debug!(
                            "[{}] Measurements differ by more than {}. Not writing.",
                            self.label, max_difference
                        );
                        Ok(None)
                    }
                },
                None => Ok(self.error_not_within_max_age()),
            },
            MathKind::Humidity { dry_bulb, wet_bulb, pressure } => {
                let dry = self.last_in_unit(dry_bulb, "K", age)?;
                let wet = self.last_in_unit(wet_bulb, "K", age)?;
                let (Some(dry), Some(wet)) = (dry, wet) else {
                    error!("[{}] Critical error: missing or unconvertible bulb temperature", self.label);
                    return Ok(None);
                };
                let pressure_pa = match pressure {
                    Some(source) => match self.last_in_unit(source, "Pa", age)? {
                        Some(p) => p,
                        None => {
                            debug!("[{}] Pressure unavailable, using {} Pa", self.label, STANDARD_PRESSURE_PA);
                            STANDARD_PRESSURE_PA
                        }
                    },
                    None => STANDARD_PRESSURE_PA,
                };
                let state = state_from_wet_bulb(dry, wet, pressure_pa);
                let mut values = [0.0; 4];
                values[HumidityValue::RelativeHumidity as usize] = state.relative_humidity;
                values[HumidityValue::HumidityRatio as usize] = state.humidity_ratio;
                values[HumidityValue::SpecificEnthalpy as usize] = state.specific_enthalpy;
                values[HumidityValue::SpecificVolume as usize] = state.specific_volume;
                self.positional(&values)
            }
            MathKind::VaporPressureDeficit { temperature, humidity } => {
                let t = self.last_in_unit(temperature, "C", age)?;
                let rh = self.last_in_unit(humidity, "percent", age)?;
                match (t, rh) {
                    (Some(t), Some(rh)) => self.single(vapor_pressure_deficit(t, rh)),
                    _ => Ok(self.error_not_within_max_age()),
                }
            }
        }
    }
}

impl Controller for MathController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Math
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.settings = self.config.settings();
        let math = self.config.math(&self.id)?;
        if math.period <= 0.0 {
            return Err(ControlError::Config(format!("math {} period must be positive", self.id)));
        }
        self.equation = match &math.kind {
            MathKind::Equation { equation, .. } => Some(
                Expression::parse(equation)
                    .map_err(|e| ControlError::Config(format!("math {} equation: {}", self.id, e)))?,
            ),
            _ => None,
        };
        self.conversions = self.config.conversions();
        self.channels = self
            .config
            .device_measurements(&self.id)
            .into_iter()
            .filter(|dm| dm.is_enabled)
            .map(|dm| {
                let conversion = self.conversions.for_measurement(&dm).cloned();
                (dm, conversion)
            })
            .collect();
        self.retry = RetryPolicy::new(self.settings.attempt_execute_times, self.settings.attempt_execute_delay);
        if !self.schedule_started {
            self.timer = self.clock.epoch() + math.start_offset;
            self.schedule_started = true;
        }
        info!("[{}] Initialized '{}' ({})", self.label, math.name, math.kind.name());
        self.math = Some(math);
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        let Some(period) = self.math.as_ref().map(|m| m.period) else {
            return Ok(LoopControl::Continue);
        };
        let now = self.clock.epoch();
        if now <= self.timer {
            return Ok(LoopControl::Continue);
        }
        while self.timer < now {
            self.timer += period;
        }

        let label = format!("[{}] Calculation", self.label);
        let Some(batch) = self.retry.attempt_execute(&label, || self.calculate_math())? else {
            return Ok(LoopControl::Continue);
        };
        let written = write_measurements(self.store.as_ref(), self.clock.as_ref(), &self.id, batch, true)?;
        if let Some(metrics) = &self.metrics {
            lock(metrics).record_samples(written);
        }
        debug!("[{}] Wrote {} value(s)", self.label, written);
        Ok(LoopControl::Continue)
    }

    fn sample_rate(&self) -> f64 {
        self.settings.sample_rate_controller_math
    }
}
