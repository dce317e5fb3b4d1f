pub mod measurement;
pub mod source;
pub mod store;
