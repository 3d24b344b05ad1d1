//! Open-loop position estimation for one bed axis.
//!
//! The bed has no position sensor. Position is derived from how long the
//! actuator has been driven relative to the configured full-travel time.
//! This module is pure state; timers and BLE writes live in
//! [`services::cover`](crate::services::cover).

use crate::domain::models::{Axis, AxisSnapshot, Direction, MovementState};
use crate::error::BedError;
use tokio::time::Instant;

/// Positions closer than this (in percent) are treated as equal.
pub const POSITION_TOLERANCE: f64 = 1.0;

/// What a new target means for an axis in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlan {
    /// Idle and already at the target.
    NoOp,
    /// Idle; start moving in this direction.
    Start(Direction),
    /// Already moving the right way; only the target changes.
    Retarget,
    /// Moving the wrong way; the actuator must be driven the other way.
    Reverse(Direction),
}

/// Outcome of one estimator tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Moving,
    Reached,
}

#[derive(Debug, Clone)]
pub struct AxisState {
    axis: Axis,
    current: f64,
    target: Option<f64>,
    movement: MovementState,
    last_update: Instant,
}

impl AxisState {
    /// New axis, assumed fully down.
    pub fn new(axis: Axis, now: Instant) -> Self {
        Self {
            axis,
            current: 0.0,
            target: None,
            movement: MovementState::Idle,
            last_update: now,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    pub fn movement(&self) -> MovementState {
        self.movement
    }

    pub fn is_moving(&self) -> bool {
        self.movement != MovementState::Idle
    }

    pub fn snapshot(&self, available: bool) -> AxisSnapshot {
        AxisSnapshot {
            axis: self.axis,
            position: self.current,
            movement: self.movement,
            available,
        }
    }

    /// Decide how to reach `target` without changing any state.
    pub fn plan(&self, target: f64) -> TargetPlan {
        let wanted = if target > self.current {
            Direction::Up
        } else {
            Direction::Down
        };

        match self.movement.direction() {
            None if (target - self.current).abs() < POSITION_TOLERANCE => TargetPlan::NoOp,
            None => TargetPlan::Start(wanted),
            Some(_) if (target - self.current).abs() < POSITION_TOLERANCE => TargetPlan::Retarget,
            Some(moving) if moving == wanted => TargetPlan::Retarget,
            Some(_) => TargetPlan::Reverse(wanted),
        }
    }

    /// Record that the actuator is now being driven toward `target`.
    pub fn begin(&mut self, target: f64, direction: Direction, now: Instant) {
        if !self.is_moving() {
            self.last_update = now;
        }
        self.target = Some(target);
        self.movement = MovementState::from_direction(direction);
    }

    /// Change the target of an in-flight motion without touching its timing.
    /// A target within tolerance of the current position means stop here, so
    /// the estimate never runs against the direction of travel.
    pub fn retarget(&mut self, target: f64) {
        if !self.is_moving() {
            return;
        }
        if (target - self.current).abs() < POSITION_TOLERANCE {
            self.target = Some(self.current);
        } else {
            self.target = Some(target);
        }
    }

    /// Advance the estimate to `now`. Distance is computed from the time
    /// since the previous update, so a new full-travel value only affects
    /// motion from here on.
    pub fn advance(&mut self, now: Instant, full_travel_seconds: u32) -> TickOutcome {
        let (Some(target), Some(direction)) = (self.target, self.movement.direction()) else {
            return TickOutcome::Idle;
        };

        let elapsed = now.saturating_duration_since(self.last_update);
        let delta = elapsed.as_secs_f64() / f64::from(full_travel_seconds.max(1)) * 100.0;
        self.last_update = now;

        let next = match direction {
            Direction::Up => (self.current + delta).min(target),
            Direction::Down => (self.current - delta).max(target),
        };
        self.current = next.clamp(0.0, 100.0);

        if (target - self.current).abs() < POSITION_TOLERANCE {
            self.current = target;
            TickOutcome::Reached
        } else {
            TickOutcome::Moving
        }
    }

    /// Stop tracking motion and keep the last computed position.
    pub fn halt(&mut self) {
        self.target = None;
        self.movement = MovementState::Idle;
    }

    /// Overwrite the estimate, e.g. after a calibration run.
    pub fn set_position(&mut self, percent: f64, now: Instant) {
        self.halt();
        self.current = percent.clamp(0.0, 100.0);
        self.last_update = now;
    }
}

/// Validate a caller-supplied target percentage.
pub fn validate_percent(percent: f64) -> Result<f64, BedError> {
    if percent.is_finite() && (0.0..=100.0).contains(&percent) {
        Ok(percent)
    } else {
        Err(BedError::InvalidPercent(percent))
    }
}
