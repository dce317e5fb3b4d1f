pub mod equation;
pub mod math_controller;
pub mod psychrometrics;
