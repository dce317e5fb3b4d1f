pub mod clock;
pub mod controller;
pub mod lock_manager;
pub mod supervisor;
