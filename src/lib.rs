//! Controller core for Octo smart beds over Bluetooth Low Energy.
//!
//! Connect with [`OctoBed::connect`], then drive the head, feet or both
//! sections to a target position, toggle the under-bed light, or run a
//! full-travel calibration. State changes arrive as [`BedEvent`]s.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod services;

pub use domain::models::{
    Axis, AxisSnapshot, BedEvent, CalibrationStatus, Command, DeviceIdentity, Direction,
    HandshakeState, MovementState, Pin, SessionState,
};
pub use domain::settings::{BedConfig, Settings, SettingsService};
pub use error::{BedError, TransportError};
pub use infrastructure::bluetooth::{BleTransport, TransportEvent};
pub use services::{OctoBed, SessionRegistry};
