//! CSV export of per-controller housekeeping summaries.
//!
//! Each housekeeping pass appends one row per controller to `path`, creating the file and
//! its header on first write, so the file trends cycle counts and errors over the daemon's
//! lifetime.

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::{
    fs::{OpenOptions, create_dir_all},
    path::Path,
};

use crate::error::Result;
use crate::utils::metrics::{Metrics, SharedMetrics, lock};

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    exported_at: DateTime<Utc>,
    unique_id: &'a str,
    kind: &'a str,
    cycles: u64,
    errors: u64,
    mean_cycle_ms: f64,
    max_cycle_ms: f64,
    samples_written: u64,
    output_commands: u64,
    output_refusals: u64,
    last_error: &'a str,
}

pub fn export_summary_csv(metrics: &SharedMetrics, path: &Path, at: DateTime<Utc>) -> Result<usize> {
    let snapshot: Metrics = lock(metrics).clone();
    let rows = snapshot.summary_rows();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let file_exists = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for row in &rows {
        writer.serialize(SummaryRow {
            exported_at: at,
            unique_id: &row.unique_id,
            kind: &row.kind,
            cycles: row.cycles,
            errors: row.errors,
            mean_cycle_ms: row.mean_cycle_ms,
            max_cycle_ms: row.max_cycle_ms,
            samples_written: snapshot.samples_written,
            output_commands: snapshot.output_commands,
            output_refusals: snapshot.output_refusals,
            last_error: &row.last_error,
        })?;
    }
    writer.flush()?;

    info!("[Export] {} controller rows appended to {:?}", rows.len(), path);
    Ok(rows.len())
}
