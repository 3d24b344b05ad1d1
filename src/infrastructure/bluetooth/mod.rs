//! Bluetooth Module
//!
//! BLE link to an Octo bed, from raw bytes up to an authenticated session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  PinHandshake                     │
//! │  (PIN write, ack wait, keep-alive re-sends)       │
//! └─────────────────────┬────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────┐
//! │                   BleSession                      │
//! │  (connect, notify stream, write accounting)       │
//! └─────────────┬───────────────────────┬────────────┘
//!               │                       │
//!               ▼                       ▼
//!        ┌─────────────┐         ┌────────────┐
//!        │ BleTransport│         │  Protocol  │
//!        │ - btleplug  │         │ - opcodes  │
//!        │ - mock      │         │ - PIN frame│
//!        └─────────────┘         └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Opcodes, PIN payload encoding and notification parsing
//! - [`transport`] - Capability trait every BLE stack implements
//! - [`session`] - Connection lifecycle and write failure accounting
//! - [`handshake`] - PIN authentication and keep-alive

#[cfg(feature = "btleplug")]
pub mod btleplug;
pub mod handshake;
#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;
pub mod session;
pub mod transport;

pub use session::BleSession;
pub use transport::{BleTransport, TransportEvent};
