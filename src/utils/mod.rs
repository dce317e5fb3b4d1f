pub mod export;
pub mod metrics;
pub mod recorder;
