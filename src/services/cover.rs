//! Virtual cover: timer-driven position estimation per axis.
//!
//! A target request issues one directional command, then a periodic tick
//! advances the estimate until it reaches the target and a stop is sent.
//! Each axis has its own tick task and its own operation lock; the motion
//! controller's queue orders the resulting writes.

use crate::domain::models::{Axis, AxisSnapshot, BedEvent, Command, HandshakeState};
use crate::domain::position::{self, AxisState, TargetPlan, TickOutcome};
use crate::error::BedError;
use crate::services::motion::MotionController;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct AxisSlot {
    state: Mutex<AxisState>,
    /// Held across a whole move/stop so requests on one axis do not interleave.
    op: tokio::sync::Mutex<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl AxisSlot {
    fn new(axis: Axis) -> Self {
        Self {
            state: Mutex::new(AxisState::new(axis, Instant::now())),
            op: tokio::sync::Mutex::new(()),
            ticker: Mutex::new(None),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut AxisState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().ok().and_then(|mut t| t.take()) {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct Shared {
    motion: MotionController,
    full_travel_seconds: Arc<AtomicU32>,
    available: Arc<AtomicBool>,
    events: broadcast::Sender<BedEvent>,
    tick_interval: Duration,
}

impl Shared {
    fn publish(&self, snapshot: AxisSnapshot) {
        let _ = self.events.send(BedEvent::Axis(snapshot));
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

pub struct PositionEstimator {
    shared: Shared,
    axes: [Arc<AxisSlot>; 3],
    watcher: JoinHandle<()>,
}

impl PositionEstimator {
    pub fn new(
        motion: MotionController,
        handshake: watch::Receiver<HandshakeState>,
        full_travel_seconds: Arc<AtomicU32>,
        tick_interval: Duration,
        events: broadcast::Sender<BedEvent>,
    ) -> Self {
        let available = *handshake.borrow() == HandshakeState::Authenticated;
        let shared = Shared {
            motion,
            full_travel_seconds,
            available: Arc::new(AtomicBool::new(available)),
            events,
            tick_interval,
        };
        let axes = Axis::ALL.map(|axis| Arc::new(AxisSlot::new(axis)));
        let watcher = tokio::spawn(watch_authentication(
            handshake,
            shared.clone(),
            axes.clone(),
        ));

        Self {
            shared,
            axes,
            watcher,
        }
    }

    fn slot(&self, axis: Axis) -> &Arc<AxisSlot> {
        match axis {
            Axis::Head => &self.axes[0],
            Axis::Feet => &self.axes[1],
            Axis::Both => &self.axes[2],
        }
    }

    pub fn snapshot(&self, axis: Axis) -> AxisSnapshot {
        let available = self.shared.available();
        self.slot(axis).with_state(|s| s.snapshot(available))
    }

    /// Move `axis` toward `percent` (0 = flat, 100 = fully raised).
    pub async fn set_target_position(&self, axis: Axis, percent: f64) -> Result<(), BedError> {
        let percent = position::validate_percent(percent)?;
        if !self.shared.motion.is_authenticated() {
            return Err(BedError::SessionNotAuthenticated);
        }

        let slot = self.slot(axis).clone();
        let _op = slot.op.lock().await;

        let plan = slot.with_state(|s| s.plan(percent));
        let direction = match plan {
            TargetPlan::NoOp => {
                debug!("{} already at {:.1}%", axis, percent);
                return Ok(());
            }
            TargetPlan::Retarget => {
                let snapshot = slot.with_state(|s| {
                    s.retarget(percent);
                    s.snapshot(self.shared.available())
                });
                self.shared.publish(snapshot);
                return Ok(());
            }
            TargetPlan::Start(direction) | TargetPlan::Reverse(direction) => direction,
        };

        if let TargetPlan::Reverse(_) = plan {
            // Bank the distance covered so far before switching direction.
            let full_travel = self.shared.full_travel_seconds.load(Ordering::SeqCst);
            slot.with_state(|s| s.advance(Instant::now(), full_travel));
        }

        info!("Moving {} {:?} toward {:.1}%", axis, direction, percent);
        if let Err(e) = self.shared.motion.send(axis.move_command(direction)).await {
            slot.cancel_ticker();
            let snapshot = slot.with_state(|s| {
                s.halt();
                s.snapshot(self.shared.available())
            });
            self.shared.publish(snapshot);
            return Err(e);
        }

        let snapshot = slot.with_state(|s| {
            s.begin(percent, direction, Instant::now());
            s.snapshot(self.shared.available())
        });
        self.shared.publish(snapshot);
        self.ensure_ticker(&slot);
        Ok(())
    }

    /// Cancel motion on `axis` and keep the last estimated position.
    pub async fn stop(&self, axis: Axis) -> Result<(), BedError> {
        let slot = self.slot(axis).clone();
        let _op = slot.op.lock().await;

        slot.cancel_ticker();
        let full_travel = self.shared.full_travel_seconds.load(Ordering::SeqCst);
        let snapshot = slot.with_state(|s| {
            if s.is_moving() {
                s.advance(Instant::now(), full_travel);
            }
            s.halt();
            s.snapshot(self.shared.available())
        });
        self.shared.publish(snapshot);
        info!("Stopped {} at {:.1}%", axis, snapshot.position);
        self.shared.motion.send(Command::Stop).await
    }

    /// Overwrite the estimate for `axis`, cancelling any tracked motion.
    pub async fn reset_position(&self, axis: Axis, percent: f64) -> Result<(), BedError> {
        let percent = position::validate_percent(percent)?;
        let slot = self.slot(axis).clone();
        let _op = slot.op.lock().await;

        slot.cancel_ticker();
        let snapshot = slot.with_state(|s| {
            s.set_position(percent, Instant::now());
            s.snapshot(self.shared.available())
        });
        self.shared.publish(snapshot);
        Ok(())
    }

    fn ensure_ticker(&self, slot: &Arc<AxisSlot>) {
        let Ok(mut ticker) = slot.ticker.lock() else {
            return;
        };
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *ticker = Some(tokio::spawn(run_ticks(slot.clone(), self.shared.clone())));
    }

    /// Cancel every tick task and the authentication watcher.
    pub fn shutdown(&self) {
        self.watcher.abort();
        for slot in &self.axes {
            slot.cancel_ticker();
        }
    }
}

impl Drop for PositionEstimator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_ticks(slot: Arc<AxisSlot>, shared: Shared) {
    let period = shared.tick_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        interval.tick().await;
        let _op = slot.op.lock().await;

        let full_travel = shared.full_travel_seconds.load(Ordering::SeqCst);
        let (outcome, snapshot) = slot.with_state(|s| {
            let outcome = s.advance(Instant::now(), full_travel);
            if outcome == TickOutcome::Reached {
                s.halt();
            }
            (outcome, s.snapshot(shared.available()))
        });

        match outcome {
            TickOutcome::Moving => {
                shared.publish(snapshot);
                continue;
            }
            TickOutcome::Reached => {
                info!("{} reached {:.1}%", snapshot.axis, snapshot.position);
                // Idle either way; a failed stop only gets logged.
                if let Err(e) = shared.motion.send(Command::Stop).await {
                    warn!("Stop for {} failed: {}", snapshot.axis, e);
                }
                shared.publish(snapshot);
            }
            TickOutcome::Idle => {}
        }

        // Release the slot while still holding the op lock, so a concurrent
        // request never sees a finishing ticker as running.
        if let Ok(mut ticker) = slot.ticker.lock() {
            ticker.take();
        }
        break;
    }
}

/// Freeze every axis when authentication is lost and mark them unavailable
/// until it comes back.
async fn watch_authentication(
    mut handshake: watch::Receiver<HandshakeState>,
    shared: Shared,
    axes: [Arc<AxisSlot>; 3],
) {
    while handshake.changed().await.is_ok() {
        let authenticated = *handshake.borrow_and_update() == HandshakeState::Authenticated;
        if shared.available.swap(authenticated, Ordering::SeqCst) == authenticated {
            continue;
        }

        if authenticated {
            info!("Authentication restored, positions available");
        } else {
            warn!("Authentication lost, freezing estimated positions");
        }

        let full_travel = shared.full_travel_seconds.load(Ordering::SeqCst);
        for slot in &axes {
            if !authenticated {
                slot.cancel_ticker();
            }
            let snapshot = slot.with_state(|s| {
                if !authenticated && s.is_moving() {
                    s.advance(Instant::now(), full_travel);
                    s.halt();
                }
                s.snapshot(authenticated)
            });
            shared.publish(snapshot);
        }
    }
}
