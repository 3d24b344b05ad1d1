//! Full-travel calibration.
//!
//! The user drives one section all the way up while a stopwatch runs, then
//! completes the session. The measured time becomes the full-travel value and
//! the section is driven back down for the same duration.

use crate::domain::models::{Axis, CalibrationStatus};
use crate::error::BedError;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Tracking { axis: Axis, started: Instant },
    Returning { axis: Axis },
}

#[derive(Debug)]
pub struct Calibration {
    phase: Phase,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl Calibration {
    pub fn status(&self) -> CalibrationStatus {
        match self.phase {
            Phase::Idle => CalibrationStatus::Idle,
            Phase::Tracking { axis, .. } => CalibrationStatus::Tracking(axis),
            Phase::Returning { axis } => CalibrationStatus::Returning(axis),
        }
    }

    /// Begin timing `axis`. Restarts any session already in progress.
    pub fn start(&mut self, axis: Axis, now: Instant) -> Result<(), BedError> {
        if axis == Axis::Both {
            return Err(BedError::CalibrationUnsupportedAxis);
        }
        self.phase = Phase::Tracking {
            axis,
            started: now,
        };
        Ok(())
    }

    /// Stop timing and enter the return phase.
    pub fn complete(&mut self, now: Instant) -> Result<(Axis, Duration), BedError> {
        let Phase::Tracking { axis, started } = self.phase else {
            return Err(BedError::CalibrationNotActive);
        };
        self.phase = Phase::Returning { axis };
        Ok((axis, now.saturating_duration_since(started)))
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Idle;
    }
}

/// Convert a measured run into a whole number of seconds.
pub fn measured_seconds(duration: Duration) -> u32 {
    // Saturating float-to-int cast.
    duration.as_secs_f64().round() as u32
}
