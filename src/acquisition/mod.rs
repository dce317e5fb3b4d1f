// Acquisition: input drivers, their options and the periodic input controller.

pub mod driver;
pub mod input;
pub mod options;
