//! Crate-wide error type.
//!
//! Every fallible operation returns [`Result`]. The variants split into three groups
//! that the controller runtime treats differently:
//! - fatal-to-instance configuration errors (`Config`, `UnknownDevice`, `ScriptCompile`):
//!   the controller never leaves its initialisation step
//! - transient errors (store, driver, lock, output): logged, the cycle is abandoned
//! - `NoData`: the benign "nothing to read yet" signal from input drivers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unrecognized device type '{0}'")]
    UnknownDevice(String),

    #[error("Measurement store error: {0}")]
    Store(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("No data available from driver")]
    NoData,

    #[error("Output error: {0}")]
    Output(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Script compile error: {0}")]
    ScriptCompile(String),

    #[error("Script runtime error: {0}")]
    Script(String),

    #[error("Controller '{0}' not found")]
    ControllerNotFound(String),

    #[error("Controller '{0}' is not running")]
    ControllerNotRunning(String),

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ControlError {
    /// Errors that leave a controller permanently unable to run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::Config(_) | ControlError::UnknownDevice(_) | ControlError::ScriptCompile(_)
        )
    }
}
