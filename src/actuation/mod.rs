// Actuation: outputs and everything that decides what they do
// (PID, methods, conditionals, triggers and their actions).

pub mod actions;
pub mod conditional;
pub mod method;
pub mod output;
pub mod pid;
pub mod pid_controller;
pub mod trigger;
