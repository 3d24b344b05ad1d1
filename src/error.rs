//! Error types shared across the controller core.

use crate::domain::models::Command;
use thiserror::Error;

/// Failures reported by a [`BleTransport`](crate::infrastructure::bluetooth::transport::BleTransport)
/// implementation. These never leave the session layer unwrapped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("characteristic for handle {0:#06x} not found")]
    CharacteristicNotFound(u16),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("not connected")]
    NotConnected,
}

/// Errors surfaced by the bed controller core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BedError {
    #[error("timed out connecting to the bed")]
    ConnectTimeout,
    #[error("bed unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("not connected to the bed")]
    NotConnected,
    #[error("write to the bed failed: {0}")]
    WriteFailed(String),
    #[error("PIN must be exactly 4 digits")]
    InvalidPin,
    #[error("bed did not acknowledge the PIN in time")]
    AckTimeout,
    #[error("bed rejected the PIN")]
    PinRejected,
    #[error("session is not ready")]
    SessionNotReady,
    #[error("session is not authenticated")]
    SessionNotAuthenticated,
    #[error("position {0} is outside 0..=100")]
    InvalidPercent(f64),
    #[error("no calibration is in progress")]
    CalibrationNotActive,
    #[error("calibration is only supported for head or feet")]
    CalibrationUnsupportedAxis,
    #[error("a session for {0} is already open")]
    SessionAlreadyOpen(String),
    #[error("the bed has no opcode for {0:?}")]
    UnsupportedCommand(Command),
}
