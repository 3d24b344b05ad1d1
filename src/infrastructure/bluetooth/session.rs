//! BLE Session Module
//!
//! Owns the link to one bed: connect, notification subscription, writes with
//! failure accounting, and drop detection. Every write to the bed passes one
//! gate that serializes it and keeps a minimum gap after the previous write. The session never reconnects on its
//! own; a dropped link is published as [`SessionState::Disconnected`] and the
//! adapter layer decides when to call [`BleSession::open`] again.

use crate::domain::models::SessionState;
use crate::error::BedError;
use crate::infrastructure::bluetooth::protocol::{self, COMMAND_HANDLE, NOTIFY_HANDLE};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Consecutive write failures after which the session enters `Error`.
pub const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 3;

/// Minimum gap between two writes unless configured otherwise.
pub const DEFAULT_WRITE_SPACING: Duration = Duration::from_millis(200);

pub struct BleSession<T: BleTransport> {
    transport: T,
    address: String,
    state: Arc<watch::Sender<SessionState>>,
    consecutive_failures: AtomicU32,
    write_spacing: Duration,
    /// When the last write finished.
    write_gate: tokio::sync::Mutex<Option<Instant>>,
    notify_tx: mpsc::UnboundedSender<Vec<u8>>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BleTransport> BleSession<T> {
    /// Create a disconnected session for `address`.
    pub fn new(transport: T, address: impl Into<String>) -> Arc<Self> {
        Self::with_write_spacing(transport, address, DEFAULT_WRITE_SPACING)
    }

    pub fn with_write_spacing(
        transport: T,
        address: impl Into<String>,
        write_spacing: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            address: address.into(),
            state: Arc::new(state),
            consecutive_failures: AtomicU32::new(0),
            write_spacing,
            write_gate: tokio::sync::Mutex::new(None),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            pump: Mutex::new(None),
        })
    }

    /// Create a session for `address` and open it.
    pub async fn connect(
        transport: T,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Arc<Self>, BedError> {
        let session = Self::new(transport, address);
        session.open(timeout).await?;
        Ok(session)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Ready)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Hand out the notification stream for the notify handle. There is exactly
    /// one consumer; later calls return `None`. The stream survives re-opens.
    pub fn on_notification(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.notify_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Connect and subscribe to notifications, bounded by `timeout`.
    pub async fn open(&self, timeout: Duration) -> Result<(), BedError> {
        info!("Connecting to bed at {}", self.address);
        self.stop_pump();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.set_state(SessionState::Connecting);

        let events = match tokio::time::timeout(timeout, self.establish()).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                error!("Failed to connect to bed at {}: {}", self.address, e);
                self.transport.disconnect().await;
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                error!(
                    "Connecting to bed at {} timed out after {:?}",
                    self.address, timeout
                );
                self.transport.disconnect().await;
                self.set_state(SessionState::Disconnected);
                return Err(BedError::ConnectTimeout);
            }
        };

        self.set_state(SessionState::Ready);
        let handle = tokio::spawn(pump_events(
            events,
            self.notify_tx.clone(),
            self.state.clone(),
            self.address.clone(),
        ));
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
        info!("Session ready for {}", self.address);
        Ok(())
    }

    async fn establish(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, BedError> {
        self.transport
            .connect(&self.address)
            .await
            .map_err(|e| BedError::DeviceUnreachable(e.to_string()))?;
        debug!("Link up, subscribing to handle {:#06x}", NOTIFY_HANDLE);

        self.set_state(SessionState::Authenticating);
        self.transport
            .subscribe(NOTIFY_HANDLE)
            .await
            .map_err(|e| BedError::DeviceUnreachable(e.to_string()))
    }

    /// Write to the command handle, waiting for the gap after the previous
    /// write. Concurrent callers go through one at a time.
    pub async fn write(&self, data: &[u8]) -> Result<(), BedError> {
        if !self.is_ready() {
            return Err(BedError::NotConnected);
        }

        let mut last_write = self.write_gate.lock().await;
        if let Some(last) = *last_write {
            tokio::time::sleep_until(last + self.write_spacing).await;
        }
        if !self.is_ready() {
            return Err(BedError::NotConnected);
        }

        let result = self.transport.write(COMMAND_HANDLE, data).await;
        *last_write = Some(Instant::now());
        drop(last_write);

        match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                trace!("Sent {}", protocol::hex(data));
                Ok(())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Write to {} failed ({}/{}): {}",
                    self.address, failures, MAX_CONSECUTIVE_WRITE_FAILURES, e
                );
                if failures >= MAX_CONSECUTIVE_WRITE_FAILURES {
                    error!("Too many write failures, session for {} in error", self.address);
                    self.set_state(SessionState::Error(format!(
                        "{} consecutive write failures",
                        failures
                    )));
                }
                Err(BedError::WriteFailed(e.to_string()))
            }
        }
    }

    /// Release the connection. Safe to call from any state.
    pub async fn close(&self) {
        self.stop_pump();
        self.transport.disconnect().await;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state() != SessionState::Disconnected {
            info!("Disconnected from {}", self.address);
        }
        self.set_state(SessionState::Disconnected);
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().ok().and_then(|mut pump| pump.take()) {
            handle.abort();
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Session {}: {:?} -> {:?}", self.address, current, state);
                *current = state;
                true
            }
        });
    }
}

impl<T: BleTransport> Drop for BleSession<T> {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Forward transport events: notifications to the single consumer, link drops
/// to the state channel.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    notify_tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<watch::Sender<SessionState>>,
    address: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Notification { handle, data } if handle == NOTIFY_HANDLE => {
                debug!("Notification: {}", protocol::hex(&data));
                let _ = notify_tx.send(data);
            }
            TransportEvent::Notification { handle, .. } => {
                trace!("Ignoring notification on handle {:#06x}", handle);
            }
            TransportEvent::Disconnected => break,
        }
    }

    warn!("Bed at {} disconnected", address);
    state.send_replace(SessionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::infrastructure::bluetooth::mock::MockTransport;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    async fn ready_session() -> (Arc<BleSession<MockTransport>>, MockTransport) {
        let transport = MockTransport::new();
        let session = BleSession::connect(transport.clone(), ADDRESS, Duration::from_secs(15))
            .await
            .unwrap();
        (session, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_reaches_ready() {
        let (session, transport) = ready_session().await;
        assert_eq!(session.state(), SessionState::Ready);
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out() {
        let transport = MockTransport::new();
        transport.set_connect_delay(Duration::from_secs(60));
        let session = BleSession::new(transport.clone(), ADDRESS);

        let result = session.open(Duration::from_secs(15)).await;
        assert_eq!(result, Err(BedError::ConnectTimeout));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_unreachable() {
        let transport = MockTransport::new();
        transport.set_connect_error(TransportError::DeviceNotFound(ADDRESS.into()));
        let session = BleSession::new(transport, ADDRESS);

        let result = session.open(Duration::from_secs(15)).await;
        assert!(matches!(result, Err(BedError::DeviceUnreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_requires_ready() {
        let session = BleSession::new(MockTransport::new(), ADDRESS);
        assert_eq!(session.write(&[0x01]).await, Err(BedError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_write_failures_enter_error() {
        let (session, transport) = ready_session().await;
        transport.fail_next_writes(2);
        assert!(session.write(&[0x01]).await.is_err());
        assert!(session.write(&[0x01]).await.is_err());
        // A success resets the count.
        session.write(&[0x01]).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        transport.set_fail_all_writes(true);
        for _ in 0..3 {
            assert!(matches!(
                session.write(&[0x02]).await,
                Err(BedError::WriteFailed(_))
            ));
        }
        assert!(matches!(session.state(), SessionState::Error(_)));
        assert_eq!(session.write(&[0x02]).await, Err(BedError::NotConnected));

        // A full open recovers.
        transport.set_fail_all_writes(false);
        session.open(Duration::from_secs(15)).await.unwrap();
        session.write(&[0x03]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_forwarded_in_order() {
        let (session, transport) = ready_session().await;
        let mut rx = session.on_notification().unwrap();
        assert!(session.on_notification().is_none());

        transport.notify(&[1]);
        transport.notify(&[2]);
        transport.notify(&[3]);

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
        assert_eq!(rx.recv().await, Some(vec![3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_is_observable() {
        let (session, transport) = ready_session().await;
        let mut state = session.subscribe_state();

        transport.drop_link();
        state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(session.write(&[0x01]).await, Err(BedError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writes_are_spaced() {
        let (session, transport) = ready_session().await;
        let (a, b, c) = tokio::join!(
            session.write(&[0x01]),
            session.write(&[0x02]),
            session.write(&[0x03]),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.handle == COMMAND_HANDLE));
        for pair in writes.windows(2) {
            assert!(pair[1].at - pair[0].at >= DEFAULT_WRITE_SPACING);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (session, transport) = ready_session().await;
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!transport.is_connected());
        assert_eq!(transport.disconnect_calls(), 2);
    }
}
