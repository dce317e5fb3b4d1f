//! conditional.rs
//! Conditional controller: runs a user Rhai script on a period.
//!
//! The script sees a small API:
//! - `condition(id)`: the current value of a configured condition, or `()` when unavailable
//! - `run_action(id)` and `run_all_actions()`
//! - `log(message)`
//!
//! The engine has no filesystem or module access, `eval` is disabled and every run is
//! bounded by an operation limit.

use log::{debug, error, info};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, Dynamic, Engine, EvalAltResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::actuation::actions::{DaemonLink, run_action, run_all_actions, upgrade};
use crate::actuation::output::OutputState;
use crate::config::{ConfigStore, ControllerKind, DaemonSettings, MeasurementRef};
use crate::error::{ControlError, Result};
use crate::runtime::clock::SharedClock;
use crate::runtime::controller::{Controller, LoopControl, RetryPolicy};
use crate::storage::source::{read_source_last, read_source_past};
use crate::storage::store::{AggregateFn, SharedStore};

const MAX_OPERATIONS: u64 = 100_000;
const MAX_EXPR_DEPTH: usize = 64;

fn default_true() -> bool {
    true
}

fn default_max_age() -> f64 {
    120.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalConfig {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    pub period: f64,
    #[serde(default)]
    pub start_offset: f64,
    /// Rhai source.
    pub code: String,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub unique_id: String,
    #[serde(flatten)]
    pub kind: ConditionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition_type", rename_all = "snake_case")]
pub enum ConditionKind {
    Measurement {
        source: MeasurementRef,
        #[serde(default = "default_max_age")]
        max_age: f64,
    },
    MeasurementPastAverage {
        source: MeasurementRef,
        past_seconds: f64,
    },
    MeasurementPastSum {
        source: MeasurementRef,
        past_seconds: f64,
    },
    OutputState {
        output_id: String,
        #[serde(default)]
        channel: u32,
    },
    OutputDurationOn {
        output_id: String,
        #[serde(default)]
        channel: u32,
    },
    ControllerStatus {
        controller_id: String,
    },
}

/// What the script's registered functions close over.
#[derive(Clone)]
struct ScriptContext {
    owner: String,
    label: String,
    config: ConfigStore,
    store: SharedStore,
    daemon: DaemonLink,
    conditions: Arc<Vec<ConditionConfig>>,
}

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

impl ScriptContext {
    fn condition(&self, id: &str) -> ScriptResult<Dynamic> {
        let Some(condition) = self.conditions.iter().find(|c| c.unique_id == id) else {
            return Err(format!("unknown condition '{}'", id).into());
        };
        let value = match &condition.kind {
            ConditionKind::Measurement { source, max_age } => {
                read_source_last(&self.config, self.store.as_ref(), source, *max_age)
                    .map_err(|e| e.to_string())?
                    .map(|s| Dynamic::from(s.value))
            }
            ConditionKind::MeasurementPastAverage { source, past_seconds } => {
                read_source_past(&self.config, self.store.as_ref(), source, AggregateFn::Mean, *past_seconds)
                    .map_err(|e| e.to_string())?
                    .map(|(_, v)| Dynamic::from(v))
            }
            ConditionKind::MeasurementPastSum { source, past_seconds } => {
                read_source_past(&self.config, self.store.as_ref(), source, AggregateFn::Sum, *past_seconds)
                    .map_err(|e| e.to_string())?
                    .map(|(_, v)| Dynamic::from(v))
            }
            ConditionKind::OutputState { output_id, channel } => {
                let daemon = upgrade(&self.daemon).map_err(|e| e.to_string())?;
                let state = daemon.output_state(output_id, *channel);
                Some(Dynamic::from(state.to_string()))
            }
            ConditionKind::OutputDurationOn { output_id, channel } => {
                let daemon = upgrade(&self.daemon).map_err(|e| e.to_string())?;
                let outputs = daemon.outputs();
                let seconds = match outputs.output_state(output_id, *channel) {
                    OutputState::On => outputs.output_seconds_currently_on(output_id, *channel),
                    OutputState::Off => 0.0,
                };
                Some(Dynamic::from(seconds))
            }
            ConditionKind::ControllerStatus { controller_id } => {
                let daemon = upgrade(&self.daemon).map_err(|e| e.to_string())?;
                Some(Dynamic::from(daemon.controller_is_active(controller_id)))
            }
        };
        Ok(value.unwrap_or(Dynamic::UNIT))
    }

    fn run_action(&self, id: &str) -> ScriptResult<bool> {
        let daemon = upgrade(&self.daemon).map_err(|e| e.to_string())?;
        let action = self.config.action(id).map_err(|e| e.to_string())?;
        match run_action(&action, daemon.as_ref(), &self.label) {
            Ok(_) => Ok(true),
            Err(e) => {
                error!("[{}] Action {} failed: {}", self.label, id, e);
                Ok(false)
            }
        }
    }

    fn run_all_actions(&self) -> ScriptResult<i64> {
        let daemon = upgrade(&self.daemon).map_err(|e| e.to_string())?;
        Ok(run_all_actions(&self.config, &self.owner, daemon.as_ref(), &self.label) as i64)
    }
}

fn build_engine(ctx: &ScriptContext) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.disable_symbol("import");

    let label = ctx.label.clone();
    engine.on_print(move |s| info!("[{}] {}", label, s));
    let label = ctx.label.clone();
    engine.on_debug(move |s, _, _| debug!("[{}] {}", label, s));

    let c = ctx.clone();
    engine.register_fn("condition", move |id: &str| c.condition(id));
    let c = ctx.clone();
    engine.register_fn("run_action", move |id: &str| c.run_action(id));
    let c = ctx.clone();
    engine.register_fn("run_all_actions", move || c.run_all_actions());
    let label = ctx.label.clone();
    engine.register_fn("log", move |message: &str| info!("[{}] {}", label, message));
    engine
}

pub struct ConditionalController {
    id: String,
    label: String,
    config: ConfigStore,
    store: SharedStore,
    clock: SharedClock,
    daemon: DaemonLink,

    settings: DaemonSettings,
    engine: Option<Engine>,
    ast: Option<AST>,
    period: f64,
    timer: f64,
    schedule_started: bool,
    retry: RetryPolicy,
}

impl ConditionalController {
    pub fn new(id: &str, config: ConfigStore, store: SharedStore, clock: SharedClock, daemon: DaemonLink) -> Self {
        Self {
            id: id.to_string(),
            label: format!("Conditional {}", id),
            settings: config.settings(),
            config,
            store,
            clock,
            daemon,
            engine: None,
            ast: None,
            period: 0.0,
            timer: 0.0,
            schedule_started: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Runs the script once.
    pub fn check_conditionals(&self) -> Result<()> {
        let (Some(engine), Some(ast)) = (self.engine.as_ref(), self.ast.as_ref()) else {
            return Ok(());
        };
        engine
            .run_ast(ast)
            .map_err(|e| ControlError::Script(e.to_string()))
    }
}

impl Controller for ConditionalController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Conditional
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.settings = self.config.settings();
        let conditional = self.config.conditional(&self.id)?;
        if conditional.period <= 0.0 {
            return Err(ControlError::Config(format!("conditional {} period must be positive", self.id)));
        }
        let ctx = ScriptContext {
            owner: self.id.clone(),
            label: self.label.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            daemon: self.daemon.clone(),
            conditions: Arc::new(conditional.conditions.clone()),
        };
        let engine = build_engine(&ctx);
        let ast = engine
            .compile(&conditional.code)
            .map_err(|e| ControlError::ScriptCompile(format!("conditional {}: {}", self.id, e)))?;
        self.engine = Some(engine);
        self.ast = Some(ast);
        self.period = conditional.period;
        self.retry = RetryPolicy::new(self.settings.attempt_execute_times, self.settings.attempt_execute_delay);
        if !self.schedule_started {
            self.timer = self.clock.epoch() + conditional.start_offset;
            self.schedule_started = true;
        }
        info!(
            "[{}] Initialized '{}' with {} condition(s)",
            self.label,
            conditional.name,
            conditional.conditions.len()
        );
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        if self.ast.is_none() {
            return Ok(LoopControl::Continue);
        }
        let now = self.clock.epoch();
        if self.timer >= now {
            return Ok(LoopControl::Continue);
        }
        while self.timer < now {
            self.timer += self.period;
        }
        let label = format!("[{}] Check", self.label);
        self.retry.attempt_execute(&label, || self.check_conditionals())?;
        Ok(LoopControl::Continue)
    }

    fn sample_rate(&self) -> f64 {
        self.settings.sample_rate_controller_conditional
    }
}
