//! Typed decoding of per-driver custom options.
//!
//! Each driver declares its options as a static [`OptionSpec`] list; the raw TOML table
//! from the input record is decoded against it. Unknown ids and type mismatches are
//! configuration errors, absent ids take their declared default.

use std::collections::HashMap;

use crate::error::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Float,
    Integer,
    Bool,
    Text,
    FloatList,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionDefault {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(&'static str),
    FloatList(&'static [f64]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionSpec {
    pub id: &'static str,
    pub kind: OptionKind,
    pub default: OptionDefault,
}

impl OptionSpec {
    pub const fn float(id: &'static str, default: f64) -> Self {
        Self { id, kind: OptionKind::Float, default: OptionDefault::Float(default) }
    }

    pub const fn integer(id: &'static str, default: i64) -> Self {
        Self { id, kind: OptionKind::Integer, default: OptionDefault::Integer(default) }
    }

    pub const fn boolean(id: &'static str, default: bool) -> Self {
        Self { id, kind: OptionKind::Bool, default: OptionDefault::Bool(default) }
    }

    pub const fn text(id: &'static str, default: &'static str) -> Self {
        Self { id, kind: OptionKind::Text, default: OptionDefault::Text(default) }
    }

    pub const fn float_list(id: &'static str, default: &'static [f64]) -> Self {
        Self { id, kind: OptionKind::FloatList, default: OptionDefault::FloatList(default) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(String),
    FloatList(Vec<f64>),
}

impl From<OptionDefault> for OptionValue {
    fn from(d: OptionDefault) -> Self {
        match d {
            OptionDefault::Float(v) => OptionValue::Float(v),
            OptionDefault::Integer(v) => OptionValue::Integer(v),
            OptionDefault::Bool(v) => OptionValue::Bool(v),
            OptionDefault::Text(v) => OptionValue::Text(v.to_string()),
            OptionDefault::FloatList(v) => OptionValue::FloatList(v.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedOptions {
    values: HashMap<&'static str, OptionValue>,
}

impl DecodedOptions {
    fn get(&self, id: &str) -> Result<&OptionValue> {
        self.values
            .get(id)
            .ok_or_else(|| ControlError::UnknownField(id.to_string()))
    }

    pub fn float(&self, id: &str) -> Result<f64> {
        match self.get(id)? {
            OptionValue::Float(v) => Ok(*v),
            other => Err(mismatch(id, "float", other)),
        }
    }

    pub fn integer(&self, id: &str) -> Result<i64> {
        match self.get(id)? {
            OptionValue::Integer(v) => Ok(*v),
            other => Err(mismatch(id, "integer", other)),
        }
    }

    pub fn boolean(&self, id: &str) -> Result<bool> {
        match self.get(id)? {
            OptionValue::Bool(v) => Ok(*v),
            other => Err(mismatch(id, "bool", other)),
        }
    }

    pub fn text(&self, id: &str) -> Result<&str> {
        match self.get(id)? {
            OptionValue::Text(v) => Ok(v),
            other => Err(mismatch(id, "text", other)),
        }
    }

    pub fn float_list(&self, id: &str) -> Result<&[f64]> {
        match self.get(id)? {
            OptionValue::FloatList(v) => Ok(v),
            other => Err(mismatch(id, "float list", other)),
        }
    }
}

fn mismatch(id: &str, wanted: &str, got: &OptionValue) -> ControlError {
    ControlError::Config(format!("option '{}' is not a {} ({:?})", id, wanted, got))
}

pub fn decode(specs: &[OptionSpec], raw: &toml::Table) -> Result<DecodedOptions> {
    if let Some(unknown) = raw.keys().find(|k| !specs.iter().any(|s| s.id == k.as_str())) {
        return Err(ControlError::Config(format!("unknown option '{}'", unknown)));
    }

    let mut values = HashMap::with_capacity(specs.len());
    for spec in specs {
        let value = match raw.get(spec.id) {
            None => OptionValue::from(spec.default),
            Some(v) => decode_value(spec, v)?,
        };
        values.insert(spec.id, value);
    }
    Ok(DecodedOptions { values })
}

fn decode_value(spec: &OptionSpec, v: &toml::Value) -> Result<OptionValue> {
    use toml::Value;
    let bad = || {
        ControlError::Config(format!(
            "option '{}' expects {:?}, got {}",
            spec.id,
            spec.kind,
            v.type_str()
        ))
    };
    Ok(match (spec.kind, v) {
        (OptionKind::Float, Value::Float(f)) => OptionValue::Float(*f),
        (OptionKind::Float, Value::Integer(i)) => OptionValue::Float(*i as f64),
        (OptionKind::Integer, Value::Integer(i)) => OptionValue::Integer(*i),
        (OptionKind::Bool, Value::Boolean(b)) => OptionValue::Bool(*b),
        (OptionKind::Text, Value::String(s)) => OptionValue::Text(s.clone()),
        (OptionKind::FloatList, Value::Array(items)) => OptionValue::FloatList(
            items
                .iter()
                .map(|item| match item {
                    Value::Float(f) => Ok(*f),
                    Value::Integer(i) => Ok(*i as f64),
                    _ => Err(bad()),
                })
                .collect::<Result<Vec<f64>>>()?,
        ),
        _ => return Err(bad()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECS: &[OptionSpec] = &[
        OptionSpec::float("noise", 0.2),
        OptionSpec::integer("channel", 0),
        OptionSpec::boolean("loop", false),
        OptionSpec::float_list("values", &[1.0, 2.0]),
    ];

    fn table(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    #[test]
    fn defaults_fill_missing_options() {
        let opts = decode(SPECS, &table("noise = 1")).unwrap();
        assert_eq!(opts.float("noise").unwrap(), 1.0);
        assert_eq!(opts.integer("channel").unwrap(), 0);
        assert!(!opts.boolean("loop").unwrap());
        assert_eq!(opts.float_list("values").unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn unknown_and_mismatched_options_are_errors() {
        assert!(decode(SPECS, &table("bogus = 1")).is_err());
        assert!(decode(SPECS, &table("channel = 1.5")).is_err());
        assert!(decode(SPECS, &table("values = [1, \"a\"]")).is_err());
        let opts = decode(SPECS, &table("")).unwrap();
        assert!(opts.text("noise").is_err());
        assert!(opts.float("missing").is_err());
    }
}
