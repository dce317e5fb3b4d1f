//! Non-blocking sample recorder with background CSV export.
//!
//! `record()` pushes onto a lock-free queue and returns immediately; a full queue drops the
//! sample rather than stall the writing controller. `start_exporter()` drains the queue to a
//! CSV file until `stop()` is called and the queue is empty.

use crossbeam_queue::ArrayQueue;
use log::{error, info};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crate::storage::store::MeasurementSample;

const SAMPLE_QUEUE_CAPACITY: usize = 16_384;

#[derive(Clone)]
pub struct SampleRecorder {
    queue: Arc<ArrayQueue<MeasurementSample>>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl Default for SampleRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self::with_capacity(SAMPLE_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            running: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn record(&self, sample: MeasurementSample) {
        if self.queue.push(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Spawns the exporter thread; it exits once stopped and drained.
    pub fn start_exporter(&self, output_csv: PathBuf) -> thread::JoinHandle<()> {
        let queue = self.queue.clone();
        let running = self.running.clone();

        thread::spawn(move || {
            if let Some(parent) = output_csv.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("[Recorder] Failed to create {:?}: {}", parent, e);
                    return;
                }
            }
            let mut writer = match csv::Writer::from_path(&output_csv) {
                Ok(w) => w,
                Err(e) => {
                    error!("[Recorder] Failed to create sample CSV {:?}: {}", output_csv, e);
                    return;
                }
            };

            let mut written: u64 = 0;
            loop {
                match queue.pop() {
                    Some(sample) => {
                        if let Err(e) = writer.serialize(&sample) {
                            error!("[Recorder] Failed to write sample: {}", e);
                        } else {
                            written += 1;
                        }
                    }
                    None => {
                        if !running.load(Ordering::Acquire) && queue.is_empty() {
                            break;
                        }
                        let _ = writer.flush();
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }

            let _ = writer.flush();
            info!("[Recorder] Exported {} samples to {:?}", written, output_csv);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(v: f64) -> MeasurementSample {
        MeasurementSample {
            timestamp: Utc::now(),
            device_id: "dev".into(),
            unit: "C".into(),
            measurement: "temperature".into(),
            channel: Some(0),
            value: v,
        }
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let recorder = SampleRecorder::with_capacity(2);
        for v in 0..5 {
            recorder.record(sample(v as f64));
        }
        assert_eq!(recorder.pending(), 2);
        assert_eq!(recorder.dropped(), 3);
    }

    #[test]
    fn exporter_drains_to_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        let recorder = SampleRecorder::new();
        recorder.record(sample(1.5));
        recorder.record(sample(2.5));
        let handle = recorder.start_exporter(path.clone());
        recorder.stop();
        handle.join().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,device_id,unit"));
        assert!(lines[2].contains("2.5"));
    }
}
