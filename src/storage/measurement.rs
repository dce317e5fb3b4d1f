//! Device measurement records, unit conversions, and the channel resolution shared by
//! every consumer that needs "which (channel, unit, measurement) does this value land in".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ControlError, Result};
use crate::math::equation::Expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    #[default]
    Normal,
    Setpoint,
}

/// Optional rescaling applied to the raw value before unit conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Rescale {
    Linear {
        from_min: f64,
        from_max: f64,
        to_min: f64,
        to_max: f64,
        #[serde(default)]
        invert: bool,
        unit: String,
        measurement: String,
    },
    Equation {
        equation: String,
        unit: String,
        measurement: String,
    },
}

impl Rescale {
    pub fn apply(&self, value: f64) -> Result<f64> {
        match self {
            Rescale::Linear { from_min, from_max, to_min, to_max, invert, .. } => {
                let span = from_max - from_min;
                if span == 0.0 {
                    return Err(ControlError::Config("linear rescale with zero input span".into()));
                }
                let mut fraction = (value - from_min) / span;
                if *invert {
                    fraction = 1.0 - fraction;
                }
                Ok(to_min + fraction * (to_max - to_min))
            }
            Rescale::Equation { equation, .. } => Expression::parse(equation)?.eval(value),
        }
    }

    pub fn unit(&self) -> &str {
        match self {
            Rescale::Linear { unit, .. } | Rescale::Equation { unit, .. } => unit,
        }
    }

    pub fn measurement(&self) -> &str {
        match self {
            Rescale::Linear { measurement, .. } | Rescale::Equation { measurement, .. } => measurement,
        }
    }
}

/// One channel of one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMeasurement {
    pub unique_id: String,
    pub device_id: String,
    pub channel: u32,
    pub measurement: String,
    pub unit: String,
    #[serde(default)]
    pub conversion_id: Option<String>,
    #[serde(default)]
    pub measurement_type: MeasurementType,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub rescale: Option<Rescale>,
}

fn default_true() -> bool {
    true
}

/// Stored unit conversion: `equation` is an expression in `x`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub unique_id: String,
    pub convert_unit_from: String,
    pub convert_unit_to: String,
    pub equation: String,
}

impl Conversion {
    pub fn convert(&self, value: f64) -> Result<f64> {
        Expression::parse(&self.equation)?.eval(value)
    }
}

/// Conversions that exist without any stored record.
const BUILTIN_CONVERSIONS: &[(&str, &str, &str)] = &[
    ("C", "F", "x*(9/5)+32"),
    ("F", "C", "(x-32)*5/9"),
    ("C", "K", "x+273.15"),
    ("K", "C", "x-273.15"),
    ("F", "K", "(x-32)*5/9+273.15"),
    ("K", "F", "(x-273.15)*9/5+32"),
    ("kPa", "Pa", "x*1000"),
    ("hPa", "Pa", "x*100"),
    ("mbar", "Pa", "x*100"),
    ("bar", "Pa", "x*100000"),
    ("psi", "Pa", "x*6894.757293168"),
    ("Pa", "kPa", "x/1000"),
    ("percent", "decimal", "x/100"),
    ("decimal", "percent", "x*100"),
];

/// Lookup table over stored conversions plus the built-ins.
#[derive(Debug, Clone, Default)]
pub struct ConversionTable {
    by_id: HashMap<String, Conversion>,
}

impl ConversionTable {
    pub fn new(conversions: &[Conversion]) -> Self {
        Self {
            by_id: conversions
                .iter()
                .map(|c| (c.unique_id.clone(), c.clone()))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Conversion> {
        self.by_id.get(id)
    }

    /// Conversion for a device measurement, if it names one.
    pub fn for_measurement(&self, dm: &DeviceMeasurement) -> Option<&Conversion> {
        dm.conversion_id.as_deref().and_then(|id| self.get(id))
    }

    /// Stored conversion for a unit pair first, then the built-ins.
    pub fn find(&self, from: &str, to: &str) -> Option<Conversion> {
        let mut stored: Vec<&Conversion> = self
            .by_id
            .values()
            .filter(|c| c.convert_unit_from == from && c.convert_unit_to == to)
            .collect();
        stored.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        if let Some(c) = stored.first() {
            return Some((*c).clone());
        }
        BUILTIN_CONVERSIONS
            .iter()
            .find(|(f, t, _)| *f == from && *t == to)
            .map(|(f, t, eq)| Conversion {
                unique_id: format!("builtin_{}_to_{}", f, t),
                convert_unit_from: (*f).to_string(),
                convert_unit_to: (*t).to_string(),
                equation: (*eq).to_string(),
            })
    }

    /// Converts `value` from `from` into `to`; identity when the units already match.
    pub fn convert_between(&self, value: f64, from: &str, to: &str) -> Result<f64> {
        if from == to {
            return Ok(value);
        }
        match self.find(from, to) {
            Some(conversion) => conversion.convert(value),
            None => Err(ControlError::Config(format!(
                "no conversion from '{}' to '{}'",
                from, to
            ))),
        }
    }
}

/// Resolved identity of a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasurementInfo {
    pub channel: u32,
    pub unit: String,
    pub measurement: String,
}

/// Resolves where a device measurement's values are stored: a conversion target unit
/// wins, then the rescaled unit/measurement, then the raw unit.
pub fn return_measurement_info(
    dm: &DeviceMeasurement,
    conversion: Option<&Conversion>,
) -> MeasurementInfo {
    let (unit, measurement) = match (conversion, &dm.rescale) {
        (Some(conv), Some(rescale)) => (conv.convert_unit_to.clone(), rescale.measurement().to_string()),
        (Some(conv), None) => (conv.convert_unit_to.clone(), dm.measurement.clone()),
        (None, Some(rescale)) => (rescale.unit().to_string(), rescale.measurement().to_string()),
        (None, None) => (dm.unit.clone(), dm.measurement.clone()),
    };
    MeasurementInfo {
        channel: dm.channel,
        unit,
        measurement,
    }
}

/// A single channel's value ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelValue {
    pub measurement: String,
    pub unit: String,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Raw value → rescale → convert.
pub fn parse_measurement(
    dm: &DeviceMeasurement,
    conversion: Option<&Conversion>,
    raw_value: f64,
    timestamp: Option<DateTime<Utc>>,
) -> Result<ChannelValue> {
    let mut value = raw_value;
    if let Some(rescale) = &dm.rescale {
        value = rescale.apply(value)?;
    }
    if let Some(conv) = conversion {
        value = conv.convert(value)?;
    }
    let info = return_measurement_info(dm, conversion);
    Ok(ChannelValue {
        measurement: info.measurement,
        unit: info.unit,
        value,
        timestamp,
    })
}
