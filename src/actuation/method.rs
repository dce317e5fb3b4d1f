//! Time-parameterised setpoint functions.
//!
//! A method maps `(now, start_time)` to a setpoint. Daily kinds repeat every 24 h on the
//! UTC time of day; `duration` runs segments from the start time and is the only kind that
//! can end. `cascade` multiplies the setpoints of other methods.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::runtime::clock::{duration_to_secs, secs_to_duration};

const SECONDS_PER_DAY: f64 = 86_400.0;
const MAX_CASCADE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: MethodKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method_type", rename_all = "snake_case")]
pub enum MethodKind {
    Daily {
        segments: Vec<DailySegment>,
    },
    DailySine {
        amplitude: f64,
        frequency: f64,
        #[serde(default)]
        shift_angle: f64,
        #[serde(default)]
        shift_y: f64,
    },
    DailyBezier {
        /// Control points as `[x, y]`, x in degrees of the day (0..=360).
        points: [[f64; 2]; 4],
        #[serde(default)]
        shift_angle: f64,
    },
    Duration {
        segments: Vec<DurationSegment>,
        #[serde(default)]
        repeat: bool,
        /// Total run time when repeating; forever when absent.
        #[serde(default)]
        repeat_duration: Option<f64>,
    },
    Cascade {
        methods: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySegment {
    pub time_start: NaiveTime,
    pub time_end: NaiveTime,
    pub setpoint_start: f64,
    #[serde(default)]
    pub setpoint_end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSegment {
    pub duration_sec: f64,
    pub setpoint_start: f64,
    #[serde(default)]
    pub setpoint_end: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MethodOutcome {
    pub setpoint: Option<f64>,
    pub ended: bool,
}

impl MethodOutcome {
    fn value(setpoint: Option<f64>) -> Self {
        Self { setpoint, ended: false }
    }

    fn ended() -> Self {
        Self { setpoint: None, ended: true }
    }
}

fn interpolate(start: f64, end: Option<f64>, fraction: f64) -> f64 {
    match end {
        Some(end) => start + (end - start) * fraction.clamp(0.0, 1.0),
        None => start,
    }
}

fn seconds_of_day(t: NaiveTime) -> f64 {
    t.num_seconds_from_midnight() as f64 + t.nanosecond() as f64 / 1e9
}

fn daily_setpoint(segments: &[DailySegment], now: DateTime<Utc>) -> Option<f64> {
    let t = seconds_of_day(now.time());
    segments.iter().find_map(|seg| {
        let start = seconds_of_day(seg.time_start);
        let end = seconds_of_day(seg.time_end);
        (start <= t && t < end).then(|| interpolate(seg.setpoint_start, seg.setpoint_end, (t - start) / (end - start)))
    })
}

fn sine_setpoint(amplitude: f64, frequency: f64, shift_angle: f64, shift_y: f64, now: DateTime<Utc>) -> f64 {
    let angle = seconds_of_day(now.time()) / SECONDS_PER_DAY * 360.0;
    amplitude * (frequency * angle.to_radians() + shift_angle.to_radians()).sin() + shift_y
}

fn bezier_axis(p: &[[f64; 2]; 4], axis: usize, t: f64) -> f64 {
    let u = 1.0 - t;
    u * u * u * p[0][axis] + 3.0 * u * u * t * p[1][axis] + 3.0 * u * t * t * p[2][axis] + t * t * t * p[3][axis]
}

/// Solves `x(t) = x` by bisection (x must be monotonic along the curve), returns `y(t)`.
fn bezier_setpoint(points: &[[f64; 2]; 4], shift_angle: f64, now: DateTime<Utc>) -> f64 {
    let x = (seconds_of_day(now.time()) / SECONDS_PER_DAY * 360.0 + shift_angle).rem_euclid(360.0);
    let (mut lo, mut hi) = (0.0, 1.0);
    for _ in 0..60 {
        let mid = (lo + hi) / 2.0;
        if bezier_axis(points, 0, mid) < x {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    bezier_axis(points, 1, (lo + hi) / 2.0)
}

fn duration_setpoint(
    segments: &[DurationSegment],
    repeat: bool,
    repeat_duration: Option<f64>,
    elapsed: f64,
) -> MethodOutcome {
    let total: f64 = segments.iter().map(|s| s.duration_sec).sum();
    if total <= 0.0 {
        return MethodOutcome::ended();
    }
    let offset = if repeat {
        if repeat_duration.is_some_and(|limit| elapsed >= limit) {
            return MethodOutcome::ended();
        }
        elapsed.rem_euclid(total)
    } else if elapsed >= total {
        return MethodOutcome::ended();
    } else {
        elapsed
    };

    let mut segment_start = 0.0;
    for seg in segments {
        if offset < segment_start + seg.duration_sec {
            let fraction = (offset - segment_start) / seg.duration_sec;
            return MethodOutcome::value(Some(interpolate(seg.setpoint_start, seg.setpoint_end, fraction)));
        }
        segment_start += seg.duration_sec;
    }
    MethodOutcome::ended()
}

impl MethodConfig {
    /// Duration methods (and cascades that contain one) run from a start time and end.
    pub fn is_time_bound(&self, library: &[MethodConfig]) -> bool {
        self.is_time_bound_at(library, 0)
    }

    fn is_time_bound_at(&self, library: &[MethodConfig], depth: usize) -> bool {
        match &self.kind {
            MethodKind::Duration { .. } => true,
            MethodKind::Cascade { methods } if depth < MAX_CASCADE_DEPTH => methods.iter().any(|id| {
                library
                    .iter()
                    .find(|m| &m.unique_id == id)
                    .is_some_and(|m| m.is_time_bound_at(library, depth + 1))
            }),
            _ => false,
        }
    }

    /// When a run started at `start` ends. `None` for open-ended methods.
    pub fn end_time(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            MethodKind::Duration { segments, repeat, repeat_duration } => {
                let length = if *repeat {
                    (*repeat_duration)?
                } else {
                    segments.iter().map(|s| s.duration_sec).sum()
                };
                Some(start + secs_to_duration(length))
            }
            _ => None,
        }
    }

    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        start: Option<DateTime<Utc>>,
        library: &[MethodConfig],
    ) -> Result<MethodOutcome> {
        self.evaluate_at(now, start, library, 0)
    }

    fn evaluate_at(
        &self,
        now: DateTime<Utc>,
        start: Option<DateTime<Utc>>,
        library: &[MethodConfig],
        depth: usize,
    ) -> Result<MethodOutcome> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(ControlError::Config(format!(
                "method {} nests cascades deeper than {}",
                self.unique_id, MAX_CASCADE_DEPTH
            )));
        }
        Ok(match &self.kind {
            MethodKind::Daily { segments } => MethodOutcome::value(daily_setpoint(segments, now)),
            MethodKind::DailySine { amplitude, frequency, shift_angle, shift_y } => {
                MethodOutcome::value(Some(sine_setpoint(*amplitude, *frequency, *shift_angle, *shift_y, now)))
            }
            MethodKind::DailyBezier { points, shift_angle } => {
                MethodOutcome::value(Some(bezier_setpoint(points, *shift_angle, now)))
            }
            MethodKind::Duration { segments, repeat, repeat_duration } => {
                let Some(start) = start else {
                    return Ok(MethodOutcome::value(None));
                };
                let elapsed = duration_to_secs(now - start);
                if elapsed < 0.0 {
                    MethodOutcome::value(None)
                } else {
                    duration_setpoint(segments, *repeat, *repeat_duration, elapsed)
                }
            }
            MethodKind::Cascade { methods } => {
                let mut product = 1.0;
                let mut missing = false;
                for id in methods {
                    let method = library
                        .iter()
                        .find(|m| &m.unique_id == id)
                        .ok_or_else(|| ControlError::Config(format!("cascade references unknown method '{}'", id)))?;
                    let outcome = method.evaluate_at(now, start, library, depth + 1)?;
                    if outcome.ended {
                        return Ok(MethodOutcome::ended());
                    }
                    match outcome.setpoint {
                        Some(v) => product *= v,
                        None => missing = true,
                    }
                }
                MethodOutcome::value((!missing && !methods.is_empty()).then_some(product))
            }
        })
    }
}
