use crate::error::BedError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of travel for an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

/// Logical bed section driven by the actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Head,
    Feet,
    /// Head and feet together. Tracked with its own position.
    Both,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Head, Axis::Feet, Axis::Both];

    /// Directional command that moves this axis.
    pub fn move_command(self, direction: Direction) -> Command {
        match self {
            Self::Head => Command::MoveHead(direction),
            Self::Feet => Command::MoveFeet(direction),
            Self::Both => Command::MoveBoth(direction),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Head => "head",
            Self::Feet => "feet",
            Self::Both => "both",
        };
        f.write_str(name)
    }
}

/// Logical action sent to the bed. Encoded by
/// [`protocol::encode_command`](crate::infrastructure::bluetooth::protocol::encode_command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    MoveHead(Direction),
    MoveFeet(Direction),
    MoveBoth(Direction),
    Stop,
    LightOn,
    LightOff,
    /// Keeps moving until an explicit [`Command::Stop`].
    MomentaryContinuous(Axis, Direction),
}

impl Command {
    /// Continuous motion for the combinations the bed has an opcode for.
    pub fn continuous(axis: Axis, direction: Direction) -> Option<Self> {
        match (axis, direction) {
            (Axis::Head, Direction::Up) | (Axis::Both, Direction::Up) => {
                Some(Self::MomentaryContinuous(axis, direction))
            }
            _ => None,
        }
    }

    pub fn is_motion(&self) -> bool {
        !matches!(self, Self::Stop | Self::LightOn | Self::LightOff)
    }
}

/// A 4-digit numeric PIN.
#[derive(Clone, PartialEq, Eq)]
pub struct Pin(String);

impl Pin {
    pub fn parse(pin: &str) -> Result<Self, BedError> {
        if pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(pin.to_string()))
        } else {
            Err(BedError::InvalidPin)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep PINs out of logs.
impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

/// Address and PIN of one bed. Immutable once a session is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: String,
    pub pin: Pin,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, pin: &str) -> Result<Self, BedError> {
        Ok(Self {
            address: address.into(),
            pin: Pin::parse(pin)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Link is up; notification subscription in progress.
    Authenticating,
    Ready,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingAck,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementState {
    Idle,
    MovingUp,
    MovingDown,
}

impl MovementState {
    pub fn from_direction(direction: Direction) -> Self {
        match direction {
            Direction::Up => Self::MovingUp,
            Direction::Down => Self::MovingDown,
        }
    }

    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Idle => None,
            Self::MovingUp => Some(Direction::Up),
            Self::MovingDown => Some(Direction::Down),
        }
    }
}

/// Estimated state of one axis as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSnapshot {
    pub axis: Axis,
    pub position: f64,
    pub movement: MovementState,
    /// False while the session is not authenticated.
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStatus {
    Idle,
    Tracking(Axis),
    Returning(Axis),
}

/// Observable output stream consumed by the host layer.
#[derive(Debug, Clone, PartialEq)]
pub enum BedEvent {
    Session(SessionState),
    Handshake(HandshakeState),
    Axis(AxisSnapshot),
    Light(bool),
    Calibration(CalibrationStatus),
}
