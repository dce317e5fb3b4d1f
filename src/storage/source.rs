//! Reading configured source measurements back out of the store.

use chrono::{DateTime, Utc};

use crate::config::{ConfigStore, MeasurementRef};
use crate::error::Result;
use crate::storage::measurement::MeasurementInfo;
use crate::storage::store::{AggregateFn, MeasurementStore, Window};

#[derive(Debug, Clone, PartialEq)]
pub struct SourceValue {
    pub info: MeasurementInfo,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Latest value of `source` no older than `max_age` seconds.
pub fn read_source_last(
    config: &ConfigStore,
    store: &dyn MeasurementStore,
    source: &MeasurementRef,
    max_age: f64,
) -> Result<Option<SourceValue>> {
    let (info, key) = config.resolve(source)?;
    Ok(store
        .read_last(&key, Some(max_age))?
        .map(|(timestamp, value)| SourceValue { info, timestamp, value }))
}

/// Aggregate of `source` over the past `seconds`.
pub fn read_source_past(
    config: &ConfigStore,
    store: &dyn MeasurementStore,
    source: &MeasurementRef,
    function: AggregateFn,
    seconds: f64,
) -> Result<Option<(MeasurementInfo, f64)>> {
    let (info, key) = config.resolve(source)?;
    Ok(store
        .read_aggregate(&key, function, Window::PastSeconds(seconds))?
        .map(|value| (info, value)))
}
