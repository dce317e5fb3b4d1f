//! The daemon: owns the shared services and the table of running controllers.
//!
//! Controllers are started in dependency order (inputs before the loops that read them) and
//! stopped in reverse. Everything a function action, script or console command can do goes
//! through the [`DaemonControl`] implementation here; commands aimed at a specific
//! controller are queued onto its loop thread with [`ControllerHandle::call`].

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::acquisition::input::InputController;
use crate::actuation::actions::{DaemonControl, DaemonLink};
use crate::actuation::conditional::ConditionalController;
use crate::actuation::output::{OutputController, OutputTimerLoop, SharedOutputs};
use crate::actuation::pid_controller::{PidController, PidField};
use crate::actuation::trigger::TriggerController;
use crate::config::{ConfigStore, ControllerKind, DaemonSettings};
use crate::error::{ControlError, Result};
use crate::math::math_controller::MathController;
use crate::runtime::clock::SharedClock;
use crate::runtime::controller::{Controller, ControllerHandle, ControllerState, ManagedController, RunnerOptions};
use crate::runtime::lock_manager::LockManager;
use crate::storage::store::{InMemoryStore, SharedStore};
use crate::utils::export::export_summary_csv;
use crate::utils::metrics::{SharedMetrics, lock, new_shared};
use crate::utils::recorder::SampleRecorder;

const HOUSEKEEPING_POLL: Duration = Duration::from_millis(100);

/// One row of the console's `status` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub unique_id: String,
    pub kind: ControllerKind,
    pub state: ControllerState,
}

fn managed<C: Controller>(handle: Arc<ControllerHandle<C>>) -> Arc<dyn ManagedController> {
    handle
}

pub struct Supervisor {
    config: ConfigStore,
    store: SharedStore,
    clock: SharedClock,
    locks: LockManager,
    outputs: Arc<OutputController>,
    metrics: SharedMetrics,
    recorder: Option<SampleRecorder>,
    exporter: Mutex<Option<JoinHandle<()>>>,

    controllers: DashMap<String, Arc<dyn ManagedController>>,
    output_loop: Mutex<Option<Arc<ControllerHandle<OutputTimerLoop>>>>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    me: Weak<Supervisor>,
}

impl Supervisor {
    /// Builds the shared services. Output drivers are set up here; an unknown output type
    /// is fatal to the daemon.
    pub fn new(config: ConfigStore, clock: SharedClock) -> Result<Arc<Self>> {
        let settings = config.settings();
        let recorder = settings.sample_export_csv.as_ref().map(|_| SampleRecorder::new());
        let mut store = InMemoryStore::with_retention(clock.clone(), settings.retention_per_device);
        if let Some(recorder) = &recorder {
            store = store.with_recorder(recorder.clone());
        }
        Self::with_store(config, clock, Arc::new(store), recorder)
    }

    pub fn with_store(
        config: ConfigStore,
        clock: SharedClock,
        store: SharedStore,
        recorder: Option<SampleRecorder>,
    ) -> Result<Arc<Self>> {
        let settings = config.settings();
        let locks = LockManager::new(&settings.lock_dir)?;
        let metrics = new_shared();
        let outputs = Arc::new(OutputController::new(
            &config.outputs(),
            clock.clone(),
            store.clone(),
            Some(metrics.clone()),
        )?);
        let exporter = match (&recorder, &settings.sample_export_csv) {
            (Some(recorder), Some(path)) => Some(recorder.start_exporter(path.clone())),
            _ => None,
        };

        Ok(Arc::new_cyclic(|me| Self {
            config,
            store,
            clock,
            locks,
            outputs,
            metrics,
            recorder,
            exporter: Mutex::new(exporter),
            controllers: DashMap::new(),
            output_loop: Mutex::new(None),
            housekeeping: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            me: me.clone(),
        }))
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn output_controller(&self) -> Arc<OutputController> {
        self.outputs.clone()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    fn settings(&self) -> DaemonSettings {
        self.config.settings()
    }

    fn link(&self) -> DaemonLink {
        self.me.clone()
    }

    fn runner_options(&self, kind: ControllerKind, settings: &DaemonSettings) -> RunnerOptions {
        RunnerOptions {
            command_timeout: Duration::from_secs_f64(settings.pause_ack_timeout.max(0.1)),
            metrics: Some(self.metrics.clone()),
            realtime: settings.realtime_priority && matches!(kind, ControllerKind::Pid | ControllerKind::Output),
        }
    }

    /// Launches the output timer loop, every activated controller and the housekeeping thread.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let settings = self.settings();
        info!("=== GREENHOUSE DAEMON START ===");

        let timers = OutputTimerLoop::new(self.outputs.clone(), settings.sample_rate_controller_output);
        let handle = ControllerHandle::spawn(timers, self.runner_options(ControllerKind::Output, &settings))?;
        *self.output_loop.lock() = Some(handle);

        for kind in ControllerKind::START_ORDER {
            let ids = self.config.read(|doc| doc.activated(kind));
            for id in ids {
                if let Err(e) = self.start_controller(kind, &id) {
                    error!("[Supervisor] {} {} failed to start: {}", kind, id, e);
                }
            }
        }

        *self.housekeeping.lock() = Some(self.spawn_housekeeping(&settings)?);
        info!("[Supervisor] Started {} controller(s)", self.controllers.len());
        Ok(())
    }

    fn start_controller(&self, kind: ControllerKind, id: &str) -> Result<()> {
        let settings = self.settings();
        let options = self.runner_options(kind, &settings);
        let outputs: SharedOutputs = self.outputs.clone();
        let metrics = Some(self.metrics.clone());
        let handle = match kind {
            ControllerKind::Input => managed(ControllerHandle::spawn(
                InputController::new(
                    id,
                    self.config.clone(),
                    self.store.clone(),
                    self.clock.clone(),
                    outputs,
                    self.locks.clone(),
                    metrics,
                ),
                options,
            )?),
            ControllerKind::Math => managed(ControllerHandle::spawn(
                MathController::new(id, self.config.clone(), self.store.clone(), self.clock.clone(), metrics),
                options,
            )?),
            ControllerKind::Pid => managed(ControllerHandle::spawn(
                PidController::new(
                    id,
                    self.config.clone(),
                    self.store.clone(),
                    self.clock.clone(),
                    outputs,
                    metrics,
                ),
                options,
            )?),
            ControllerKind::Conditional => managed(ControllerHandle::spawn(
                ConditionalController::new(id, self.config.clone(), self.store.clone(), self.clock.clone(), self.link()),
                options,
            )?),
            ControllerKind::Trigger => managed(ControllerHandle::spawn(
                TriggerController::new(id, self.config.clone(), self.clock.clone(), outputs, self.link()),
                options,
            )?),
            ControllerKind::Output => {
                return Err(ControlError::Config("the output controller is owned by the daemon".into()));
            }
        };
        if let Some(old) = self.controllers.insert(id.to_string(), handle) {
            // a finished loop not yet pruned
            old.stop();
        }
        Ok(())
    }

    fn handle(&self, id: &str) -> Option<Arc<dyn ManagedController>> {
        self.controllers.get(id).map(|entry| entry.value().clone())
    }

    /// Runs `f` on the loop thread of controller `id`, which must be of type `C`.
    fn call_on<C, R, F>(&self, id: &str, f: F) -> Result<R>
    where
        C: Controller,
        R: Send + 'static,
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        let handle = self
            .handle(id)
            .ok_or_else(|| ControlError::ControllerNotRunning(id.to_string()))?;
        let typed = handle
            .as_any()
            .downcast_ref::<ControllerHandle<C>>()
            .ok_or_else(|| ControlError::ControllerNotFound(format!("{} is a {} controller", id, handle.kind())))?;
        typed.call(f)
    }

    pub fn status(&self) -> Vec<ControllerStatus> {
        let mut rows: Vec<ControllerStatus> = self
            .controllers
            .iter()
            .map(|entry| ControllerStatus {
                unique_id: entry.key().clone(),
                kind: entry.value().kind(),
                state: entry.value().state(),
            })
            .collect();
        rows.sort_by_key(|r| {
            let order = ControllerKind::START_ORDER.iter().position(|k| *k == r.kind).unwrap_or(usize::MAX);
            (order, r.unique_id.clone())
        });
        rows
    }

    /// Drops controllers whose loops ended on their own, logs a summary and exports metrics.
    /// Returns how many controllers were pruned.
    pub fn run_housekeeping(&self) -> usize {
        let finished: Vec<String> = self
            .controllers
            .iter()
            .filter(|entry| !entry.value().is_running())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &finished {
            if let Some((_, handle)) = self.controllers.remove(id) {
                handle.stop();
                info!("[Supervisor] {} {} ended, removed from table", handle.kind(), id);
            }
        }

        {
            let m = lock(&self.metrics);
            let errors: u64 = m.controllers.values().map(|s| s.errors).sum();
            info!(
                "[Supervisor] {} running, {} samples written, {} output commands ({} refused), {} loop errors",
                self.controllers.len(),
                m.samples_written,
                m.output_commands,
                m.output_refusals,
                errors
            );
        }
        if let Some(recorder) = &self.recorder {
            if recorder.dropped() > 0 {
                warn!("[Supervisor] Sample recorder dropped {} samples", recorder.dropped());
            }
        }
        if let Some(path) = self.settings().summary_export_csv {
            match export_summary_csv(&self.metrics, &path, self.clock.now()) {
                Ok(rows) => debug!("[Supervisor] Exported {} summary rows to {:?}", rows, path),
                Err(e) => warn!("[Supervisor] Summary export to {:?} failed: {}", path, e),
            }
        }
        finished.len()
    }

    fn spawn_housekeeping(&self, settings: &DaemonSettings) -> Result<JoinHandle<()>> {
        let me = self.me.clone();
        let running = self.running.clone();
        let interval = Duration::from_secs_f64(settings.housekeeping_interval.max(0.1));
        let handle = thread::Builder::new().name("housekeeping".into()).spawn(move || {
            let mut last = Instant::now();
            while running.load(Ordering::Acquire) {
                thread::sleep(HOUSEKEEPING_POLL);
                if last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                match me.upgrade() {
                    Some(supervisor) => {
                        supervisor.run_housekeeping();
                    }
                    None => break,
                }
            }
        })?;
        Ok(handle)
    }

    /// Stops every controller in reverse start order, then the outputs.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("[Supervisor] Shutting down");
        if let Some(handle) = self.housekeeping.lock().take() {
            if handle.join().is_err() {
                error!("[Supervisor] Housekeeping thread panicked");
            }
        }

        for kind in ControllerKind::START_ORDER.iter().rev() {
            let ids: Vec<String> = self
                .controllers
                .iter()
                .filter(|entry| entry.value().kind() == *kind)
                .map(|entry| entry.key().clone())
                .collect();
            for id in ids {
                if let Some((_, handle)) = self.controllers.remove(&id) {
                    handle.stop();
                }
            }
        }

        if let Some(handle) = self.output_loop.lock().take() {
            handle.stop();
        }
        self.run_housekeeping();

        if let Some(recorder) = &self.recorder {
            recorder.stop();
        }
        if let Some(handle) = self.exporter.lock().take() {
            if handle.join().is_err() {
                error!("[Supervisor] Sample exporter panicked");
            }
        }
        info!("=== GREENHOUSE DAEMON STOPPED ===");
    }
}

impl DaemonControl for Supervisor {
    fn controller_activate(&self, id: &str) -> Result<()> {
        let kind = self
            .config
            .kind_of(id)
            .ok_or_else(|| ControlError::ControllerNotFound(id.to_string()))?;
        if self.controller_is_active(id) {
            debug!("[Supervisor] {} {} already active", kind, id);
            return Ok(());
        }
        self.config.set_activated(id, true)?;
        if let Err(e) = self.start_controller(kind, id) {
            self.config.set_activated(id, false)?;
            return Err(e);
        }
        info!("[Supervisor] Activated {} {}", kind, id);
        Ok(())
    }

    /// Safe from the controller's own loop: the handle then only clears its running flag.
    fn controller_deactivate(&self, id: &str) -> Result<()> {
        if self.config.kind_of(id).is_none() {
            return Err(ControlError::ControllerNotFound(id.to_string()));
        }
        self.config.set_activated(id, false)?;
        if let Some((_, handle)) = self.controllers.remove(id) {
            handle.stop();
            info!("[Supervisor] Deactivated {} {}", handle.kind(), id);
        }
        Ok(())
    }

    fn controller_is_active(&self, id: &str) -> bool {
        self.handle(id).is_some_and(|h| h.is_running())
    }

    fn refresh_settings(&self, id: &str) -> Result<()> {
        let handle = self
            .handle(id)
            .ok_or_else(|| ControlError::ControllerNotRunning(id.to_string()))?;
        handle.refresh_settings()
    }

    fn pid_hold(&self, id: &str) -> Result<()> {
        self.call_on(id, |pid: &mut PidController| pid.set_hold())?
    }

    fn pid_pause(&self, id: &str) -> Result<()> {
        self.call_on(id, |pid: &mut PidController| pid.set_pause())?
    }

    fn pid_resume(&self, id: &str) -> Result<()> {
        self.call_on(id, |pid: &mut PidController| pid.set_resume())?
    }

    fn pid_get(&self, id: &str, field: PidField) -> Result<Option<f64>> {
        self.call_on(id, move |pid: &mut PidController| pid.get(field))
    }

    fn pid_set(&self, id: &str, field: PidField, value: f64) -> Result<()> {
        self.call_on(id, move |pid: &mut PidController| pid.set(field, value))?
    }

    fn pid_set_method(&self, id: &str, method_id: &str) -> Result<()> {
        let method_id = method_id.to_string();
        self.call_on(id, move |pid: &mut PidController| pid.set_method(&method_id))?
    }

    fn input_force_measurement(&self, id: &str) -> Result<()> {
        self.call_on(id, |input: &mut InputController| input.force_measurement())?;
        if let Some(handle) = self.handle(id) {
            handle.wake();
        }
        Ok(())
    }

    fn outputs(&self) -> SharedOutputs {
        self.outputs.clone()
    }
}
