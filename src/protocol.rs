//! Bushido headunit command set and packet parsing.
//!
//! Every packet is the 8-byte application payload of an ANT data message.
//! Multi-byte values are big-endian.
//!
//! | Direction     | Bytes                     | Meaning                               |
//! |---------------|---------------------------|---------------------------------------|
//! | brake → host  | `DD 01 sH sL pH pL cad`   | speed (0.1 km/h), power (W), cadence  |
//! | brake → host  | `DD 02 d3 d2 d1 d0 hr`    | distance (m), heart rate (bpm)        |
//! | brake → host  | `DD 10 btn phase tH tL`   | button press, hold time in 0.1 s      |
//! | brake → host  | `AD 01 04` / `AD 01 00`   | connection successful / no connection |
//! | brake → host  | `AD 01 03` / `AD 02`      | pause status request / data request   |
//! | host → brake  | `DC 01 00 gH gL wt`       | slope × 10 (signed), rider weight     |

use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;

use crate::{
    error::{Result, TrainerError},
    message::DATA_LEN,
    types::{Button, ButtonPress},
};

/// Leading bytes of the reply to a successful INIT
pub const CONNECTION_SUCCESSFUL: [u8; 3] = [0xAD, 0x01, 0x04];

/// Leading bytes of the reply once the headunit has dropped the connection
pub const NO_CONNECTION: [u8; 3] = [0xAD, 0x01, 0x00];

/// Virtual speed gain per percent of descent
pub const DOWNHILL_GAIN_PER_PERCENT: f64 = 0.05;

/// Upper bound of the virtual speed gain
pub const MAX_DOWNHILL_FACTOR: f64 = 2.0;

/// Host-to-headunit commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open the connection
    Init,
    /// Start a cycling session
    Start,
    /// Zero the distance counter
    ResetOdometer,
    /// Answer to a pause status request
    KeepAlive,
    /// Close the connection
    Disconnect,
}

impl Command {
    /// Zero-padded 8-byte packet for this command
    #[must_use]
    pub const fn packet(self) -> [u8; DATA_LEN] {
        match self {
            Self::Init => [0xAC, 0x03, 0x04, 0, 0, 0, 0, 0],
            Self::Start => [0xAC, 0x03, 0x03, 0, 0, 0, 0, 0],
            Self::ResetOdometer => [0xAC, 0x03, 0x01, 0, 0, 0, 0, 0],
            Self::KeepAlive => [0xAC, 0x03, 0x02, 0, 0, 0, 0, 0],
            Self::Disconnect => [0xAC, 0x03, 0, 0, 0, 0, 0, 0],
        }
    }
}

/// Decoded headunit packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadunitPacket {
    /// Speed, power and cadence
    Speed {
        /// km/h
        speed: f64,
        /// W
        power: f64,
        /// rpm
        cadence: f64,
    },
    /// Distance and heart rate
    Distance {
        /// m
        distance: f64,
        /// bpm
        heart_rate: f64,
    },
    /// Button held or released
    Button(ButtonPress),
    /// INIT accepted
    ConnectionSuccessful,
    /// Headunit reports no connection
    NoConnection,
    /// Headunit asks for pause status; answered with [`Command::KeepAlive`]
    PauseRequest,
    /// Headunit asks for the current slope and weight
    DataRequest,
    /// Anything else
    Unknown,
}

/// Parse an 8-byte headunit packet
///
/// # Errors
///
/// Returns [`TrainerError::MalformedFrame`] if `data` is not exactly 8 bytes.
pub fn parse_packet(data: &[u8]) -> Result<HeadunitPacket> {
    if data.len() != DATA_LEN {
        return Err(TrainerError::MalformedFrame(format!(
            "headunit packet of {} bytes, expected {DATA_LEN}",
            data.len()
        )));
    }

    let mut buf = data;
    let packet = match (buf.get_u8(), buf.get_u8()) {
        (0xDD, 0x01) => {
            let speed = f64::from(buf.get_u16()) / 10.0;
            let power = f64::from(buf.get_u16());
            let cadence = f64::from(buf.get_u8());
            HeadunitPacket::Speed {
                speed,
                power,
                cadence,
            }
        }
        (0xDD, 0x02) => {
            let distance = f64::from(buf.get_u32());
            let heart_rate = f64::from(buf.get_u8());
            HeadunitPacket::Distance {
                distance,
                heart_rate,
            }
        }
        (0xDD, 0x10) => {
            let button = Button::from(buf.get_u8());
            let active = buf.get_u8() == 0x01;
            let duration = Duration::from_millis(u64::from(buf.get_u16()) * 100);
            HeadunitPacket::Button(ButtonPress {
                button,
                active,
                duration,
            })
        }
        (0xAD, 0x01) => match buf.get_u8() {
            0x04 => HeadunitPacket::ConnectionSuccessful,
            0x00 => HeadunitPacket::NoConnection,
            0x03 => HeadunitPacket::PauseRequest,
            _ => HeadunitPacket::Unknown,
        },
        (0xAD, 0x02) => HeadunitPacket::DataRequest,
        _ => HeadunitPacket::Unknown,
    };
    Ok(packet)
}

/// Build the data reply sent in answer to [`HeadunitPacket::DataRequest`]
#[must_use]
pub fn data_packet(slope: f64, weight: u8) -> [u8; DATA_LEN] {
    #[allow(clippy::cast_possible_truncation)]
    let grade = (slope * 10.0)
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;

    let mut buf = BytesMut::with_capacity(DATA_LEN);
    buf.put_u8(0xDC);
    buf.put_u8(0x01);
    buf.put_u8(0x00);
    buf.put_i16(grade);
    buf.put_u8(weight);
    buf.put_bytes(0, DATA_LEN - buf.len());

    let mut packet = [0u8; DATA_LEN];
    packet.copy_from_slice(&buf);
    packet
}

/// How much faster distance accrues than measured at a given slope.
///
/// Only descents speed things up: 5 % per percent of descent, capped at 2×.
#[must_use]
pub fn downhill_factor(slope: f64) -> f64 {
    if slope < 0.0 {
        (-slope)
            .mul_add(DOWNHILL_GAIN_PER_PERCENT, 1.0)
            .min(MAX_DOWNHILL_FACTOR)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packets() {
        assert_eq!(Command::Init.packet(), [0xAC, 0x03, 0x04, 0, 0, 0, 0, 0]);
        assert_eq!(Command::Start.packet()[..3], [0xAC, 0x03, 0x03]);
        assert_eq!(Command::ResetOdometer.packet()[..3], [0xAC, 0x03, 0x01]);
        assert_eq!(Command::KeepAlive.packet()[..3], [0xAC, 0x03, 0x02]);
        assert_eq!(Command::Disconnect.packet(), [0xAC, 0x03, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_speed_packet() {
        let packet = parse_packet(&[0xDD, 0x01, 0x01, 0x2C, 0x00, 0xFA, 90, 0]).unwrap();
        assert_eq!(
            packet,
            HeadunitPacket::Speed {
                speed: 30.0,
                power: 250.0,
                cadence: 90.0
            }
        );
    }

    #[test]
    fn test_parse_distance_packet() {
        let packet = parse_packet(&[0xDD, 0x02, 0x00, 0x00, 0x04, 0xD2, 142, 0]).unwrap();
        assert_eq!(
            packet,
            HeadunitPacket::Distance {
                distance: 1234.0,
                heart_rate: 142.0
            }
        );
    }

    #[test]
    fn test_parse_button_packet() {
        let packet = parse_packet(&[0xDD, 0x10, 0x05, 0x01, 0x00, 0x0F, 0, 0]).unwrap();
        match packet {
            HeadunitPacket::Button(press) => {
                assert_eq!(press.button, Button::Ok);
                assert!(press.active);
                assert_eq!(press.duration, Duration::from_millis(1500));
            }
            other => panic!("expected button press, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_requests_and_replies() {
        let pad = |prefix: &[u8]| {
            let mut data = [0u8; 8];
            data[..prefix.len()].copy_from_slice(prefix);
            data
        };
        assert_eq!(
            parse_packet(&pad(&CONNECTION_SUCCESSFUL)).unwrap(),
            HeadunitPacket::ConnectionSuccessful
        );
        assert_eq!(
            parse_packet(&pad(&NO_CONNECTION)).unwrap(),
            HeadunitPacket::NoConnection
        );
        assert_eq!(
            parse_packet(&pad(&[0xAD, 0x01, 0x03])).unwrap(),
            HeadunitPacket::PauseRequest
        );
        assert_eq!(
            parse_packet(&pad(&[0xAD, 0x02])).unwrap(),
            HeadunitPacket::DataRequest
        );
        assert_eq!(
            parse_packet(&pad(&[0x12, 0x34])).unwrap(),
            HeadunitPacket::Unknown
        );
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        assert!(matches!(
            parse_packet(&[0xDD, 0x01]),
            Err(TrainerError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_data_packet_encodes_slope_and_weight() {
        assert_eq!(data_packet(2.5, 70), [0xDC, 0x01, 0x00, 0x00, 0x19, 70, 0, 0]);
        assert_eq!(
            data_packet(-1.0, 80),
            [0xDC, 0x01, 0x00, 0xFF, 0xF6, 80, 0, 0]
        );
    }

    #[test]
    fn test_downhill_factor() {
        assert!((downhill_factor(3.0) - 1.0).abs() < f64::EPSILON);
        assert!((downhill_factor(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((downhill_factor(-4.0) - 1.2).abs() < 1e-9);
        assert!((downhill_factor(-50.0) - MAX_DOWNHILL_FACTOR).abs() < f64::EPSILON);
    }
}
