//! Daemon-wide counters for housekeeping and the status console.
//!
//! Controllers report every cycle (duration, success/failure); the output controller
//! reports accepted and refused commands. Duration history is bounded to the
//! most recent [`MAX_POINTS`] cycles per controller.

use average::{Estimate, Max, Mean, Min};
use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

pub const MAX_POINTS: usize = 1_000;

#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    pub kind: String,
    pub cycles: u64,
    pub errors: u64,
    pub cycle_ms: VecDeque<f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub controllers: BTreeMap<String, ControllerStats>,
    pub samples_written: u64,
    pub output_commands: u64,
    pub output_refusals: u64,
}

pub type SharedMetrics = Arc<Mutex<Metrics>>;

pub fn new_shared() -> SharedMetrics {
    Arc::new(Mutex::new(Metrics::default()))
}

/// Locks the metrics, recovering the data if a panicking thread poisoned the mutex.
pub fn lock(metrics: &SharedMetrics) -> MutexGuard<'_, Metrics> {
    match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Metrics {
    pub fn record_cycle(&mut self, id: &str, kind: &str, elapsed_ms: f64, error: Option<String>) {
        let stats = self.controllers.entry(id.to_string()).or_default();
        if stats.kind.is_empty() {
            stats.kind = kind.to_string();
        }
        stats.cycles += 1;
        push_capped(&mut stats.cycle_ms, elapsed_ms);
        if let Some(e) = error {
            stats.errors += 1;
            stats.last_error = Some(e);
        }
    }

    pub fn record_samples(&mut self, count: usize) {
        self.samples_written += count as u64;
    }

    pub fn record_output_command(&mut self, accepted: bool) {
        if accepted {
            self.output_commands += 1;
        } else {
            self.output_refusals += 1;
        }
    }

    pub fn forget(&mut self, id: &str) {
        self.controllers.remove(id);
    }

    /// One summary row per controller, ordered by id.
    pub fn summary_rows(&self) -> Vec<ControllerSummary> {
        self.controllers
            .iter()
            .map(|(id, s)| {
                let stats = calculate_stats(&s.cycle_ms);
                ControllerSummary {
                    unique_id: id.clone(),
                    kind: s.kind.clone(),
                    cycles: s.cycles,
                    errors: s.errors,
                    mean_cycle_ms: stats.as_ref().map_or(0.0, |st| st.mean),
                    max_cycle_ms: stats.as_ref().map_or(0.0, |st| st.max),
                    last_error: s.last_error.clone().unwrap_or_default(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSummary {
    pub unique_id: String,
    pub kind: String,
    pub cycles: u64,
    pub errors: u64,
    pub mean_cycle_ms: f64,
    pub max_cycle_ms: f64,
    pub last_error: String,
}

#[inline]
pub fn push_capped(buf: &mut VecDeque<f64>, val: f64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

pub fn calculate_stats(data: &VecDeque<f64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }
    let mut mean = Mean::new();
    let mut min = Min::new();
    let mut max = Max::new();
    for &v in data {
        mean.add(v);
        min.add(v);
        max.add(v);
    }
    Some(Stats {
        min: min.min(),
        max: max.max(),
        mean: mean.mean(),
        count: data.len(),
    })
}
