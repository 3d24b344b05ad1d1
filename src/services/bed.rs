//! Bed facade
//!
//! One [`OctoBed`] per physical bed: it owns the BLE session, the PIN
//! handshake, the motion controller, the three virtual covers and the
//! calibration state, and merges their state into a single [`BedEvent`]
//! stream for the host layer.

use crate::domain::calibration::{self, Calibration};
use crate::domain::models::{
    Axis, AxisSnapshot, BedEvent, CalibrationStatus, DeviceIdentity, Direction, HandshakeState,
    SessionState,
};
use crate::domain::settings::{clamp_full_travel_seconds, BedConfig};
use crate::error::BedError;
use crate::infrastructure::bluetooth::handshake::{HandshakeConfig, PinHandshake};
use crate::infrastructure::bluetooth::session::BleSession;
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::services::cover::PositionEstimator;
use crate::services::motion::MotionController;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 256;

pub struct OctoBed<T: BleTransport> {
    identity: DeviceIdentity,
    config: BedConfig,
    session: Arc<BleSession<T>>,
    handshake: PinHandshake<T>,
    motion: MotionController,
    covers: PositionEstimator,
    events: broadcast::Sender<BedEvent>,
    full_travel_seconds: Arc<AtomicU32>,
    calibration: Mutex<Calibration>,
    forwarders: Vec<JoinHandle<()>>,
}

impl<T: BleTransport> OctoBed<T> {
    /// Assemble a bed without touching the radio.
    pub fn new(transport: T, identity: DeviceIdentity, config: BedConfig) -> Result<Self, BedError> {
        let session = BleSession::with_write_spacing(
            transport,
            identity.address.clone(),
            config.command_spacing,
        );
        let handshake = PinHandshake::new(
            session.clone(),
            HandshakeConfig {
                ack_timeout: config.ack_timeout,
                keep_alive_interval: config.keep_alive_interval,
            },
        )
        .ok_or(BedError::SessionNotReady)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let full_travel_seconds = Arc::new(AtomicU32::new(clamp_full_travel_seconds(
            config.full_travel_seconds,
        )));
        let motion =
            MotionController::new(session.clone(), handshake.subscribe_state(), events.clone());
        let covers = PositionEstimator::new(
            motion.clone(),
            handshake.subscribe_state(),
            full_travel_seconds.clone(),
            config.tick_interval,
            events.clone(),
        );
        let forwarders = vec![
            tokio::spawn(forward_state(
                session.subscribe_state(),
                events.clone(),
                BedEvent::Session,
            )),
            tokio::spawn(forward_state(
                handshake.subscribe_state(),
                events.clone(),
                BedEvent::Handshake,
            )),
        ];

        Ok(Self {
            identity,
            config,
            session,
            handshake,
            motion,
            covers,
            events,
            full_travel_seconds,
            calibration: Mutex::new(Calibration::default()),
            forwarders,
        })
    }

    /// Assemble a bed, connect and authenticate.
    pub async fn connect(
        transport: T,
        identity: DeviceIdentity,
        config: BedConfig,
    ) -> Result<Self, BedError> {
        let bed = Self::new(transport, identity, config)?;
        if let Err(e) = bed.open().await {
            bed.close().await;
            return Err(e);
        }
        Ok(bed)
    }

    /// Open the link and run the PIN handshake. Also used to recover after
    /// the link dropped.
    pub async fn open(&self) -> Result<(), BedError> {
        self.open_link().await?;
        self.handshake.authenticate(self.identity.pin.as_str()).await
    }

    /// Open the link only; the bed stays unauthenticated.
    pub async fn open_link(&self) -> Result<(), BedError> {
        self.handshake.reset();
        self.session.open(self.config.connect_timeout).await
    }

    /// Authenticate with an explicit "PIN accepted" answer from the bed.
    pub async fn verify_pin(&self) -> Result<(), BedError> {
        self.handshake.verify_pin(self.identity.pin.as_str()).await
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BedEvent> {
        self.events.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.handshake.is_authenticated()
    }

    pub fn motion(&self) -> &MotionController {
        &self.motion
    }

    pub fn covers(&self) -> &PositionEstimator {
        &self.covers
    }

    pub fn snapshot(&self, axis: Axis) -> AxisSnapshot {
        self.covers.snapshot(axis)
    }

    pub async fn set_target_position(&self, axis: Axis, percent: f64) -> Result<(), BedError> {
        self.covers.set_target_position(axis, percent).await
    }

    pub async fn stop(&self, axis: Axis) -> Result<(), BedError> {
        self.covers.stop(axis).await
    }

    pub async fn light_on(&self) -> Result<(), BedError> {
        self.motion.light_on().await
    }

    pub async fn light_off(&self) -> Result<(), BedError> {
        self.motion.light_off().await
    }

    pub fn light_state(&self) -> Option<bool> {
        self.motion.light_state()
    }

    pub fn full_travel_seconds(&self) -> u32 {
        self.full_travel_seconds.load(Ordering::SeqCst)
    }

    /// Set the installation's full-travel time. Returns the applied value
    /// after clamping. Motion already in progress picks it up on the next tick.
    pub fn set_full_travel_seconds(&self, seconds: u32) -> u32 {
        let seconds = clamp_full_travel_seconds(seconds);
        self.full_travel_seconds.store(seconds, Ordering::SeqCst);
        info!("Full travel for {} set to {}s", self.identity.address, seconds);
        seconds
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.with_calibration(|c| c.status())
    }

    /// Start driving `axis` up and timing it.
    pub async fn start_calibration(&self, axis: Axis) -> Result<(), BedError> {
        self.with_calibration(|c| c.start(axis, Instant::now()))?;
        self.publish_calibration();
        info!("Calibrating {}: raising", axis);

        if let Err(e) = self.motion.send(axis.move_command(Direction::Up)).await {
            error!("Calibration of {} aborted: {}", axis, e);
            self.with_calibration(|c| c.finish());
            self.publish_calibration();
            return Err(e);
        }
        Ok(())
    }

    /// Stop the running calibration, apply the measured full travel and drive
    /// the axis back down. Returns the measured time in whole seconds.
    pub async fn complete_calibration(&self) -> Result<u32, BedError> {
        let (axis, elapsed) = self.with_calibration(|c| c.complete(Instant::now()))?;
        self.publish_calibration();

        let result = self.return_from_calibration(axis, elapsed).await;
        self.with_calibration(|c| c.finish());
        self.publish_calibration();
        result
    }

    async fn return_from_calibration(
        &self,
        axis: Axis,
        elapsed: std::time::Duration,
    ) -> Result<u32, BedError> {
        self.motion.stop().await?;

        let measured = calibration::measured_seconds(elapsed);
        let applied = self.set_full_travel_seconds(measured);
        info!(
            "Calibrated {}: measured {}s, applied {}s, lowering",
            axis, measured, applied
        );

        self.motion.move_for(axis, Direction::Down, elapsed).await?;
        self.covers.reset_position(axis, 0.0).await?;
        Ok(measured)
    }

    fn with_calibration<R>(&self, f: impl FnOnce(&mut Calibration) -> R) -> R {
        let mut calibration = match self.calibration.lock() {
            Ok(calibration) => calibration,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut calibration)
    }

    fn publish_calibration(&self) {
        let status = self.calibration_status();
        let _ = self.events.send(BedEvent::Calibration(status));
    }

    /// Tear everything down. The bed cannot be reopened afterwards.
    pub async fn close(&self) {
        info!("Closing bed {}", self.identity.address);
        self.motion.shutdown();
        self.covers.shutdown();
        self.handshake.reset();
        self.session.close().await;
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

impl<T: BleTransport> Drop for OctoBed<T> {
    fn drop(&mut self) {
        self.motion.shutdown();
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        if self.session.is_ready() {
            warn!(
                "Bed {} dropped without close; link left to the transport",
                self.identity.address
            );
        }
    }
}

async fn forward_state<S>(
    mut rx: watch::Receiver<S>,
    events: broadcast::Sender<BedEvent>,
    wrap: fn(S) -> BedEvent,
) where
    S: Clone + Send + Sync + 'static,
{
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        let _ = events.send(wrap(state));
    }
}
