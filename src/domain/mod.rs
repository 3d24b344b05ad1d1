//! Domain types: commands, state models, settings and the pure estimators.

pub mod calibration;
pub mod models;
pub mod position;
pub mod settings;
