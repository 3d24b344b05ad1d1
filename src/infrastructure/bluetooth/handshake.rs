//! PIN Keep-Alive Handshake
//!
//! The bed only accepts motion commands after it has seen the PIN, and it
//! forgets the PIN after a while. This module sends the PIN payload, waits
//! for the bed to answer on the notify handle, and keeps re-sending the
//! payload on a fixed interval for as long as the session stays up.

use crate::domain::models::{HandshakeState, SessionState};
use crate::error::BedError;
use crate::infrastructure::bluetooth::protocol::{self, NotificationKind};
use crate::infrastructure::bluetooth::session::BleSession;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Consecutive keep-alive write failures tolerated before giving up.
pub const MAX_KEEP_ALIVE_FAILURES: u32 = 3;

type Notifications = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub ack_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(20),
        }
    }
}

/// Which notifications count as an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    /// Any notification on the notify handle.
    Any,
    /// Only an explicit "PIN accepted" frame; "PIN rejected" fails.
    Explicit,
}

pub struct PinHandshake<T: BleTransport> {
    session: Arc<BleSession<T>>,
    config: HandshakeConfig,
    state: Arc<watch::Sender<HandshakeState>>,
    notifications: Notifications,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BleTransport> PinHandshake<T> {
    /// Attach to `session`, taking its notification stream.
    ///
    /// Returns `None` if another consumer already owns the stream.
    pub fn new(session: Arc<BleSession<T>>, config: HandshakeConfig) -> Option<Self> {
        let notifications = session.on_notification()?;
        let (state, _) = watch::channel(HandshakeState::Idle);
        Some(Self {
            session,
            config,
            state: Arc::new(state),
            notifications: Arc::new(tokio::sync::Mutex::new(notifications)),
            keep_alive: Mutex::new(None),
        })
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == HandshakeState::Authenticated
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    /// Send the PIN and wait for any notification as acknowledgement.
    pub async fn authenticate(&self, pin: &str) -> Result<(), BedError> {
        self.run(pin, AckMode::Any).await
    }

    /// Like [`authenticate`](Self::authenticate), but only an explicit
    /// "PIN accepted" frame counts and "PIN rejected" fails with
    /// [`BedError::PinRejected`].
    pub async fn verify_pin(&self, pin: &str) -> Result<(), BedError> {
        self.run(pin, AckMode::Explicit).await
    }

    async fn run(&self, pin: &str, mode: AckMode) -> Result<(), BedError> {
        let payload = protocol::encode_pin_payload(pin)?;
        if !self.session.is_ready() {
            return Err(BedError::SessionNotReady);
        }

        self.stop_keep_alive();
        let mut rx = self.notifications.lock().await;
        // Anything queued before the PIN went out is not an answer to it.
        while rx.try_recv().is_ok() {}

        self.set_state(HandshakeState::AwaitingAck);
        info!("Sending PIN to {}", self.session.address());
        if let Err(e) = self.session.write(&payload).await {
            error!("Failed to send PIN: {}", e);
            self.set_state(HandshakeState::Failed);
            return Err(e);
        }

        let result = match tokio::time::timeout(self.config.ack_timeout, wait_for_ack(&mut rx, mode))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BedError::AckTimeout),
        };
        drop(rx);

        if let Err(e) = result {
            warn!("PIN handshake with {} failed: {}", self.session.address(), e);
            self.set_state(HandshakeState::Failed);
            return Err(e);
        }

        info!("PIN accepted by {}", self.session.address());
        self.set_state(HandshakeState::Authenticated);
        self.start_keep_alive(payload);
        Ok(())
    }

    fn start_keep_alive(&self, payload: Vec<u8>) {
        let handle = tokio::spawn(keep_alive_loop(
            self.session.clone(),
            self.state.clone(),
            self.notifications.clone(),
            payload,
            self.config.keep_alive_interval,
        ));
        if let Ok(mut keep_alive) = self.keep_alive.lock() {
            if let Some(previous) = keep_alive.replace(handle) {
                previous.abort();
            }
        }
    }

    fn stop_keep_alive(&self) {
        if let Some(handle) = self.keep_alive.lock().ok().and_then(|mut k| k.take()) {
            handle.abort();
        }
    }

    /// Stop the keep-alive timer and forget the authentication.
    pub fn reset(&self) {
        self.stop_keep_alive();
        self.set_state(HandshakeState::Idle);
    }

    fn set_state(&self, state: HandshakeState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Handshake: {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }
}

impl<T: BleTransport> Drop for PinHandshake<T> {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

async fn wait_for_ack(
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    mode: AckMode,
) -> Result<(), BedError> {
    while let Some(data) = rx.recv().await {
        let kind = NotificationKind::classify(&data);
        trace!("Handshake notification {:?}: {}", kind, protocol::hex(&data));
        match (mode, kind) {
            (AckMode::Any, _) | (AckMode::Explicit, NotificationKind::PinAccepted) => return Ok(()),
            (AckMode::Explicit, NotificationKind::PinRejected) => {
                return Err(BedError::PinRejected)
            }
            (AckMode::Explicit, _) => {}
        }
    }
    Err(BedError::NotConnected)
}

/// Re-send the PIN every `interval`, and right away whenever the bed asks
/// for it. Ends on session loss or after too many failed writes.
async fn keep_alive_loop<T: BleTransport>(
    session: Arc<BleSession<T>>,
    state: Arc<watch::Sender<HandshakeState>>,
    notifications: Notifications,
    payload: Vec<u8>,
    interval: Duration,
) {
    let mut rx = notifications.lock().await;
    let mut session_state = session.subscribe_state();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Keep-alive: sending PIN");
            }
            data = rx.recv() => match data {
                Some(data) if NotificationKind::classify(&data) == NotificationKind::PinRequired => {
                    debug!("Bed requested PIN, re-sending");
                }
                Some(_) => continue,
                None => break,
            },
            changed = session_state.changed() => {
                let ready = changed.is_ok() && *session_state.borrow_and_update() == SessionState::Ready;
                if ready {
                    continue;
                }
                info!("Session lost, authentication dropped");
                state.send_replace(HandshakeState::Idle);
                break;
            }
        }

        match session.write(&payload).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(
                    "Keep-alive write failed ({}/{}): {}",
                    failures, MAX_KEEP_ALIVE_FAILURES, e
                );
                if failures >= MAX_KEEP_ALIVE_FAILURES {
                    error!("Keep-alive failed, authentication lost");
                    state.send_replace(HandshakeState::Failed);
                    break;
                }
            }
        }
    }
}
