//! Adapters to the outside world: the BLE stack and log sinks.

pub mod bluetooth;
pub mod logging;
