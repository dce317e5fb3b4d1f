//! # Greenhouse control daemon
//!
//! Periodic controllers acquire sensor readings, derive values, run PID loops and react to
//! conditions, all sharing one measurement store and one output controller.
//!
//! ## Layout
//! - `acquisition`: input drivers and the Input controller
//! - `math`: expression evaluator, psychrometrics and the Math controller
//! - `actuation`: outputs, PID, methods, conditionals, triggers and function actions
//! - `storage`: measurement records, conversions and the time-series store
//! - `runtime`: clock, controller lifecycle, named locks and the supervisor
//! - `utils`: metrics, CSV export and the sample recorder

pub mod acquisition;
pub mod actuation;
pub mod config;
pub mod error;
pub mod math;
pub mod runtime;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigStore, SystemConfig};
pub use error::{ControlError, Result};
pub use runtime::supervisor::Supervisor;
