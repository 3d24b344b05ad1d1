//! Transport capability interface.
//!
//! The session is written against this narrow trait so that any BLE stack
//! (local radio, remote proxy, test double) can carry the bytes.

use crate::error::TransportError;
use std::future::Future;
use tokio::sync::mpsc;

/// Event delivered by a transport after subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification { handle: u16, data: Vec<u8> },
    /// The link dropped without `disconnect` being called.
    Disconnected,
}

pub trait BleTransport: Send + Sync + 'static {
    /// Establish the link to `address`. Callers bound this with their own deadline.
    fn connect(&self, address: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Enable notifications on `handle`. Events arrive in transport order.
    fn subscribe(
        &self,
        handle: u16,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>> + Send;

    /// ATT write to `handle`.
    fn write(
        &self,
        handle: u16,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the link. Must tolerate being called when already disconnected.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}
