//! Wall-clock access for every controller.
//!
//! Scheduling decisions (next measurement time, PID `dt`, method position, min-off windows)
//! all read time through [`Clock`], so tests can drive a controller cycle by cycle with a
//! [`ManualClock`] instead of sleeping.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch, with millisecond resolution.
    fn epoch(&self) -> f64 {
        self.now().timestamp_millis() as f64 / 1000.0
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Starts at 2024-06-01 12:00:00 UTC.
    pub fn at_noon() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }

    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock();
        *now += secs_to_duration(secs);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

pub fn duration_to_secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_in_fractional_seconds() {
        let clock = ManualClock::at_noon();
        let t0 = clock.epoch();
        clock.advance(1.25);
        assert!((clock.epoch() - t0 - 1.25).abs() < 1e-9);
    }
}
