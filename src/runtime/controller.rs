//! controller.rs
//! Controller lifecycle shared by every controller kind.
//!
//! Each controller instance runs on its own thread. The thread owns the controller value;
//! everything else talks to it through a [`ControllerHandle`], which queues commands the
//! loop drains while it sleeps between ticks. Setters and queries therefore never race the
//! control law: they run on the loop thread, between two `tick()` calls.
//!
//! Lifecycle: `Created → Initializing → Running → Stopping → Stopped`. A fatal
//! initialisation error goes `Errored → Stopping → Stopped` and is reported back to
//! whoever activated the controller.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::{
    any::Any,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use crate::config::ControllerKind;
use crate::error::{ControlError, Result};
use crate::utils::metrics::{SharedMetrics, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    Initializing,
    Running,
    Errored,
    Stopping,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Returned by `tick()`: `Stop` ends the loop from the inside (e.g. a finished method).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

pub trait Controller: Send + 'static {
    fn kind(&self) -> ControllerKind;

    fn unique_id(&self) -> &str;

    /// (Re)loads configuration. Runs once at start and again on every refresh.
    fn initialize_variables(&mut self) -> Result<()>;

    /// One loop iteration.
    fn tick(&mut self) -> Result<LoopControl>;

    /// Seconds slept between ticks.
    fn sample_rate(&self) -> f64;

    fn pre_stop(&mut self) {}

    fn run_finally(&mut self) {}
}

type Apply<C> = Box<dyn FnOnce(&mut C) + Send>;

enum Command<C> {
    /// Pause handshake: ack, wait for resume, re-initialise, ack again.
    Pause {
        ack: Sender<()>,
        resume: Receiver<()>,
    },
    Apply(Apply<C>),
    /// Cut the current sleep short.
    Wake,
    Stop,
}

/// Bounded retry around fallible periodic work.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub times: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            times: 3,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(times: u32, delay_secs: f64) -> Self {
        Self {
            times: times.max(1),
            delay: Duration::from_secs_f64(delay_secs.max(0.0)),
        }
    }

    /// Calls `f` up to `times` times, sleeping `delay` between failures.
    pub fn attempt_execute<T>(&self, label: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.times => {
                    error!("{} failed after {} attempts: {}", label, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        label, attempt, self.times, e, self.delay
                    );
                    attempt += 1;
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct RunnerOptions {
    pub command_timeout: Duration,
    pub metrics: Option<SharedMetrics>,
    pub realtime: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            metrics: None,
            realtime: false,
        }
    }
}

/// Object-safe view of a running controller, used by the supervisor's table.
pub trait ManagedController: Send + Sync {
    fn unique_id(&self) -> &str;
    fn kind(&self) -> ControllerKind;
    fn state(&self) -> ControllerState;
    fn is_running(&self) -> bool;
    fn stop(&self);
    fn refresh_settings(&self) -> Result<()>;
    fn wake(&self);
    fn as_any(&self) -> &dyn Any;
}

pub struct ControllerHandle<C: Controller> {
    id: String,
    kind: ControllerKind,
    tx: Sender<Command<C>>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<ControllerState>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
    command_timeout: Duration,
}

impl<C: Controller> ControllerHandle<C> {
    /// Starts `controller` on its own thread and blocks until it has attempted
    /// initialisation. A fatal initialisation error is returned as activation failure.
    pub fn spawn(controller: C, options: RunnerOptions) -> Result<Arc<Self>> {
        let id = controller.unique_id().to_string();
        let kind = controller.kind();
        let (tx, rx) = channel::unbounded::<Command<C>>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(Mutex::new(ControllerState::Created));

        let runner = LoopRunner {
            controller,
            rx,
            running: running.clone(),
            state: state.clone(),
            metrics: options.metrics.clone(),
        };

        let builder = thread::Builder::new().name(format!("{}-{}", kind, id));
        let join = if options.realtime {
            builder.spawn_with_priority(ThreadPriority::Max, move |priority| {
                if let Err(e) = priority {
                    warn!("[{}] Could not raise thread priority: {:?}", runner.label(), e);
                }
                runner.run(ready_tx);
            })?
        } else {
            builder.spawn(move || runner.run(ready_tx))?
        };

        let thread_id = join.thread().id();
        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(ControlError::ControllerNotRunning(id.clone()))
        });
        if let Err(e) = ready {
            let _ = join.join();
            return Err(e);
        }

        Ok(Arc::new(Self {
            id,
            kind,
            tx,
            running,
            state,
            thread: Mutex::new(Some(join)),
            thread_id: Mutex::new(Some(thread_id)),
            command_timeout: options.command_timeout,
        }))
    }

    fn on_loop_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }

    /// Runs `f` on the loop thread and returns its result.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        if !self.is_running() {
            return Err(ControlError::ControllerNotRunning(self.id.clone()));
        }
        if self.on_loop_thread() {
            return Err(ControlError::Config(format!(
                "controller {} cannot queue a command to itself",
                self.id
            )));
        }
        let (reply_tx, reply_rx) = channel::bounded(1);
        let apply: Apply<C> = Box::new(move |c: &mut C| {
            let _ = reply_tx.send(f(c));
        });
        self.tx
            .send(Command::Apply(apply))
            .map_err(|_| ControlError::ControllerNotRunning(self.id.clone()))?;
        reply_rx
            .recv_timeout(self.command_timeout)
            .map_err(|_| ControlError::ControllerNotRunning(self.id.clone()))
    }

    /// Two-phase pause: waits for the loop to acknowledge, lets it re-initialise, then
    /// waits for it to resume. A stopped controller counts as paused.
    pub fn pause_and_refresh(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if self.on_loop_thread() {
            return Err(ControlError::Config(format!(
                "controller {} cannot refresh itself from its own loop",
                self.id
            )));
        }
        let (ack_tx, ack_rx) = channel::bounded(2);
        let (resume_tx, resume_rx) = channel::bounded(1);
        if self
            .tx
            .send(Command::Pause { ack: ack_tx, resume: resume_rx })
            .is_err()
        {
            return Ok(());
        }

        match ack_rx.recv_timeout(self.command_timeout) {
            Ok(()) => {}
            Err(_) if !self.is_running() => return Ok(()),
            Err(_) => {
                return Err(ControlError::Lock(format!(
                    "{} {} did not acknowledge pause within {:?}",
                    self.kind, self.id, self.command_timeout
                )));
            }
        }
        let _ = resume_tx.send(());
        match ack_rx.recv_timeout(self.command_timeout) {
            Ok(()) => Ok(()),
            Err(_) if !self.is_running() => Ok(()),
            Err(_) => Err(ControlError::Lock(format!(
                "{} {} did not resume within {:?}",
                self.kind, self.id, self.command_timeout
            ))),
        }
    }

    pub fn join(&self) {
        if self.on_loop_thread() {
            return;
        }
        if let Some(join) = self.thread.lock().take() {
            if join.join().is_err() {
                error!("[{} {}] Loop thread panicked", self.kind, self.id);
            }
        }
    }
}

impl<C: Controller> ManagedController for ControllerHandle<C> {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cooperative stop. From the controller's own thread this only clears the flag.
    fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
        if self.on_loop_thread() {
            self.running.store(false, Ordering::Release);
            return;
        }
        self.join();
    }

    fn refresh_settings(&self) -> Result<()> {
        self.pause_and_refresh()
    }

    fn wake(&self) {
        let _ = self.tx.send(Command::Wake);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct LoopRunner<C: Controller> {
    controller: C,
    rx: Receiver<Command<C>>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<ControllerState>>,
    metrics: Option<SharedMetrics>,
}

impl<C: Controller> LoopRunner<C> {
    fn label(&self) -> String {
        format!("{} {}", self.controller.kind(), self.controller.unique_id())
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock() = state;
    }

    fn run(mut self, ready: Sender<Result<()>>) {
        let label = self.label();
        self.set_state(ControllerState::Initializing);

        match self.controller.initialize_variables() {
            Ok(()) => {
                let _ = ready.send(Ok(()));
            }
            Err(e) if e.is_fatal() => {
                error!("[{}] Initialization failed, controller will not run: {}", label, e);
                self.set_state(ControllerState::Errored);
                self.running.store(false, Ordering::Release);
                self.set_state(ControllerState::Stopping);
                let _ = ready.send(Err(e));
                self.set_state(ControllerState::Stopped);
                return;
            }
            Err(e) => {
                error!("[{}] Initialization error, starting loop anyway: {}", label, e);
                let _ = ready.send(Ok(()));
            }
        }

        self.set_state(ControllerState::Running);
        info!("[{}] Activated", label);

        while self.running.load(Ordering::Acquire) {
            let started = Instant::now();
            let outcome = self.controller.tick();
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let failure = match outcome {
                Ok(LoopControl::Continue) => None,
                Ok(LoopControl::Stop) => {
                    info!("[{}] Loop requested stop", label);
                    self.controller.pre_stop();
                    self.running.store(false, Ordering::Release);
                    None
                }
                Err(e) => {
                    error!("[{}] Loop error: {}", label, e);
                    Some(e.to_string())
                }
            };
            if let Some(metrics) = &self.metrics {
                lock(metrics).record_cycle(
                    self.controller.unique_id(),
                    &self.controller.kind().to_string(),
                    elapsed_ms,
                    failure,
                );
            }

            self.sleep_and_serve(&label);
        }

        self.set_state(ControllerState::Stopping);
        self.controller.run_finally();
        // drop queued commands so their callers see the controller as stopped
        while self.rx.try_recv().is_ok() {}
        self.set_state(ControllerState::Stopped);
        info!("[{}] Deactivated", label);
    }

    /// Sleeps for one sample period while serving queued commands.
    fn sleep_and_serve(&mut self, label: &str) {
        let period = Duration::from_secs_f64(self.controller.sample_rate().max(0.001));
        let deadline = Instant::now() + period;

        while self.running.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(Command::Apply(f)) => f(&mut self.controller),
                Ok(Command::Pause { ack, resume }) => {
                    debug!("[{}] Paused for refresh", label);
                    let _ = ack.send(());
                    let _ = resume.recv();
                    if let Err(e) = self.controller.initialize_variables() {
                        error!("[{}] Refresh failed: {}", label, e);
                    }
                    let _ = ack.send(());
                    debug!("[{}] Resumed", label);
                }
                Ok(Command::Wake) => return,
                Ok(Command::Stop) => {
                    self.controller.pre_stop();
                    self.running.store(false, Ordering::Release);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    // handle dropped: nobody can stop us any more
                    self.running.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}
