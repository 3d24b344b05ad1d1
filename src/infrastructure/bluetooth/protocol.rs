//! Octo Bed Protocol
//!
//! This module contains the wire definitions for communicating with the
//! Octo bed controller: characteristic handles, the fixed command opcode
//! table, the PIN payload and notification classification.

use crate::domain::models::{Axis, Command, Direction};
use crate::error::BedError;

/// Handle commands and PIN payloads are written to
pub const COMMAND_HANDLE: u16 = 0x0011;

/// Handle the bed sends notifications on
pub const NOTIFY_HANDLE: u16 = 0x0012;

/// Bed BLE Service UUID
pub const SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";

/// Command characteristic UUID (value handle 0x0011)
pub const COMMAND_CHAR_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Names the bed advertises with
pub const DEVICE_NAMES: &[&str] = &["Octo", "OCTO", "octo"];

/// PIN payload framing
pub const PIN_PREFIX: [u8; 7] = [0x40, 0x20, 0x43, 0x00, 0x04, 0x00, 0x01];
pub const PIN_SUFFIX: u8 = 0x40;
pub const PIN_PAYLOAD_LEN: usize = PIN_PREFIX.len() + 4 + 1;

// Opcodes captured from the vendor remote app. Treat as opaque.
const HEAD_UP: &[u8] = &[0x40, 0x02, 0x70, 0x00, 0x01, 0x0b, 0x02, 0x40];
const HEAD_DOWN: &[u8] = &[0x40, 0x02, 0x71, 0x00, 0x01, 0x0a, 0x02, 0x40];
const FEET_UP: &[u8] = &[0x40, 0x02, 0x70, 0x00, 0x01, 0x09, 0x04, 0x40];
const FEET_DOWN: &[u8] = &[0x40, 0x02, 0x71, 0x00, 0x01, 0x08, 0x04, 0x40];
const BOTH_UP: &[u8] = &[0x40, 0x02, 0x70, 0x00, 0x01, 0x07, 0x06, 0x40];
const BOTH_DOWN: &[u8] = &[0x40, 0x02, 0x71, 0x00, 0x01, 0x06, 0x06, 0x40];
const CONTINUOUS_UP: &[u8] = &[0x40, 0x02, 0x71, 0x00, 0x01, 0x08, 0x04, 0x40];
const STOP: &[u8] = &[0x40, 0x02, 0x71, 0x00, 0x01, 0x00, 0x00, 0x40];
const LIGHT_ON: &[u8] = &[
    0x40, 0x20, 0x72, 0x00, 0x08, 0xde, 0x00, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01, 0x01, 0x40,
];
const LIGHT_OFF: &[u8] = &[
    0x40, 0x20, 0x72, 0x00, 0x08, 0xdf, 0x00, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01, 0x00, 0x40,
];

/// Notifications from the bed
const NOTIFY_PIN_REQUIRED: [u8; 7] = [0x40, 0x21, 0x44, 0x00, 0x00, 0x1b, 0x40];
const NOTIFY_PIN_REQUIRED_ALT: [u8; 7] = [0x40, 0x21, 0x7f, 0x00, 0x00, 0xe0, 0x40];
const NOTIFY_PIN_ACCEPTED: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1a, 0x01, 0x40];
const NOTIFY_PIN_REJECTED: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1b, 0x00, 0x40];

/// Get the raw bytes for a command, or `None` for a
/// [`Command::MomentaryContinuous`] combination the bed has no opcode for.
pub fn encode_command(command: Command) -> Option<&'static [u8]> {
    let bytes = match command {
        Command::MoveHead(Direction::Up) => HEAD_UP,
        Command::MoveHead(Direction::Down) => HEAD_DOWN,
        Command::MoveFeet(Direction::Up) => FEET_UP,
        Command::MoveFeet(Direction::Down) => FEET_DOWN,
        Command::MoveBoth(Direction::Up) => BOTH_UP,
        Command::MoveBoth(Direction::Down) => BOTH_DOWN,
        Command::Stop => STOP,
        Command::LightOn => LIGHT_ON,
        Command::LightOff => LIGHT_OFF,
        Command::MomentaryContinuous(Axis::Head | Axis::Both, Direction::Up) => CONTINUOUS_UP,
        Command::MomentaryContinuous(..) => return None,
    };
    Some(bytes)
}

/// Encode the PIN authentication payload.
///
/// ```text
/// [0-6]  : 40 20 43 00 04 00 01
/// [7-10] : PIN digits as values (b'7' -> 0x07)
/// [11]   : 40
/// ```
pub fn encode_pin_payload(pin: &str) -> Result<Vec<u8>, BedError> {
    if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BedError::InvalidPin);
    }

    let mut payload = Vec::with_capacity(PIN_PAYLOAD_LEN);
    payload.extend_from_slice(&PIN_PREFIX);
    payload.extend(pin.bytes().map(|b| b - b'0'));
    payload.push(PIN_SUFFIX);
    Ok(payload)
}

/// What an inbound notification means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The bed wants the PIN (periodic request or initial prompt)
    PinRequired,
    PinAccepted,
    PinRejected,
    Other,
}

impl NotificationKind {
    pub fn classify(data: &[u8]) -> Self {
        if data.starts_with(&NOTIFY_PIN_REQUIRED) || data == NOTIFY_PIN_REQUIRED_ALT {
            Self::PinRequired
        } else if data == NOTIFY_PIN_ACCEPTED {
            Self::PinAccepted
        } else if data == NOTIFY_PIN_REJECTED {
            Self::PinRejected
        } else {
            Self::Other
        }
    }
}

/// Normalise a Bluetooth address for use as an identity key.
pub fn format_address(address: &str) -> String {
    address.to_uppercase().replace(':', "")
}

/// Whether an advertised name looks like an Octo bed.
pub fn is_bed_name(name: &str) -> bool {
    DEVICE_NAMES.contains(&name.trim())
}

/// Render bytes as lowercase hex for logging.
pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_payload_layout() {
        for pin in ["0000", "1234", "9876", "0509"] {
            let payload = encode_pin_payload(pin).unwrap();
            assert_eq!(payload.len(), 12);
            assert_eq!(&payload[..7], &PIN_PREFIX);
            assert_eq!(payload[11], 0x40);
            let digits: Vec<u8> = pin.bytes().map(|b| b - b'0').collect();
            assert_eq!(&payload[7..11], digits.as_slice());
        }
    }

    #[test]
    fn test_pin_payload_bytes() {
        assert_eq!(
            hex(&encode_pin_payload("1234").unwrap()),
            "402043000400010102030440"
        );
    }

    #[test]
    fn test_invalid_pins() {
        for pin in ["", "123", "12345", "abcd", "12 4", "-123"] {
            assert_eq!(encode_pin_payload(pin), Err(BedError::InvalidPin));
        }
    }

    fn bytes(command: Command) -> &'static [u8] {
        encode_command(command).unwrap()
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(hex(bytes(Command::Stop)), "4002710001000040");
        assert_eq!(
            hex(bytes(Command::MoveHead(Direction::Up))),
            "40027000010b0240"
        );
        assert_eq!(
            hex(bytes(Command::MoveFeet(Direction::Down))),
            "4002710001080440"
        );
        assert_eq!(
            hex(bytes(Command::MoveBoth(Direction::Down))),
            "4002710001060640"
        );
        assert_eq!(
            hex(bytes(Command::LightOn)),
            "4020720008de000102010101010140"
        );
        assert_eq!(
            hex(bytes(Command::LightOff)),
            "4020720008df000102010101010040"
        );
    }

    #[test]
    fn test_continuous_commands() {
        let head = Command::continuous(Axis::Head, Direction::Up).unwrap();
        let both = Command::continuous(Axis::Both, Direction::Up).unwrap();
        assert_eq!(hex(bytes(head)), "4002710001080440");
        assert_eq!(bytes(head), bytes(both));
    }

    #[test]
    fn test_unsupported_continuous_has_no_opcode() {
        assert_eq!(
            encode_command(Command::MomentaryContinuous(Axis::Feet, Direction::Down)),
            None
        );
        assert_eq!(
            encode_command(Command::MomentaryContinuous(Axis::Head, Direction::Down)),
            None
        );
    }

    #[test]
    fn test_classify_notifications() {
        assert_eq!(
            NotificationKind::classify(&[0x40, 0x21, 0x44, 0x00, 0x00, 0x1b, 0x40]),
            NotificationKind::PinRequired
        );
        assert_eq!(
            NotificationKind::classify(&[0x40, 0x21, 0x44, 0x00, 0x00, 0x1b, 0x40, 0x00]),
            NotificationKind::PinRequired
        );
        assert_eq!(
            NotificationKind::classify(&[0x40, 0x21, 0x7f, 0x00, 0x00, 0xe0, 0x40]),
            NotificationKind::PinRequired
        );
        assert_eq!(
            NotificationKind::classify(&[0x40, 0x21, 0x43, 0x00, 0x01, 0x1a, 0x01, 0x40]),
            NotificationKind::PinAccepted
        );
        assert_eq!(
            NotificationKind::classify(&[0x40, 0x21, 0x43, 0x00, 0x01, 0x1b, 0x00, 0x40]),
            NotificationKind::PinRejected
        );
        assert_eq!(NotificationKind::classify(&[0x01]), NotificationKind::Other);
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address("aa:bb:cc:dd:ee:ff"), "AABBCCDDEEFF");
        assert!(is_bed_name(" Octo "));
        assert!(!is_bed_name("Octopus"));
    }
}
