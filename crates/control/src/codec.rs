//! Line protocol spoken with the microcontroller.
//!
//! Every packet is one ASCII line: an integer kind code followed by
//! comma-separated integer fields, terminated by `\n`. Kind codes overlap
//! between directions (`0` is a sensor report coming in and a pump command
//! going out), so each direction gets its own kind enum and packet type.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CodecError;

/// Highest actuator level accepted by the board (10-bit PWM).
pub const LEVEL_MAX: u16 = 1023;

const HEARTBEAT_CODE: u8 = 9;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Packet kinds sent by the board to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    SensorReport,
    Heartbeat,
}

impl InboundKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::SensorReport),
            9 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::SensorReport => 0,
            Self::Heartbeat => HEARTBEAT_CODE,
        }
    }
}

/// Packet kinds sent by the host to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Pump,
    Peltier,
    Fans,
    Heartbeat,
}

impl OutboundKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pump),
            1 => Some(Self::Peltier),
            2 => Some(Self::Fans),
            9 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Pump => 0,
            Self::Peltier => 1,
            Self::Fans => 2,
            Self::Heartbeat => HEARTBEAT_CODE,
        }
    }
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// One telemetry sample from the board, in sensor-native units.
///
/// `illumination` never travels over the wire; the host fills it in from its
/// own light sensor after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
    pub moisture: i32,
    pub temp_inner: i32,
    pub humd_inner: i32,
    pub temp_outer: i32,
    pub humd_outer: i32,
    #[serde(default)]
    pub illumination: Option<f64>,
}

impl SensorReport {
    pub fn new(
        moisture: i32,
        temp_inner: i32,
        humd_inner: i32,
        temp_outer: i32,
        humd_outer: i32,
    ) -> Self {
        Self {
            moisture,
            temp_inner,
            humd_inner,
            temp_outer,
            humd_outer,
            illumination: None,
        }
    }

    pub fn with_illumination(self, lux: Option<f64>) -> Self {
        Self {
            illumination: lux,
            ..self
        }
    }
}

/// A decoded board-to-host packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Report(SensorReport),
    Heartbeat,
}

impl Inbound {
    pub fn kind(&self) -> InboundKind {
        match self {
            Self::Report(_) => InboundKind::SensorReport,
            Self::Heartbeat => InboundKind::Heartbeat,
        }
    }

    /// Encode as the board would send it, including the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Self::Report(r) => format!(
                "{},{},{},{},{},{}\n",
                InboundKind::SensorReport.code(),
                r.moisture,
                r.temp_inner,
                r.humd_inner,
                r.temp_outer,
                r.humd_outer
            ),
            Self::Heartbeat => format!("{HEARTBEAT_CODE}\n"),
        }
    }
}

/// A validated host-to-board packet. Construct through [`Outbound::pump`],
/// [`Outbound::peltier`] and [`Outbound::fans`] so levels are range-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Pump { level: u16 },
    Peltier { level: u16, forward: bool },
    Fans { level: u16 },
    Heartbeat,
}

impl Outbound {
    pub fn pump(level: i64) -> Result<Self, CodecError> {
        Ok(Self::Pump {
            level: check_level("pump", level)?,
        })
    }

    pub fn peltier(level: i64, forward: i64) -> Result<Self, CodecError> {
        let level = check_level("peltier", level)?;
        let forward = match forward {
            0 => false,
            1 => true,
            other => return Err(CodecError::FlagOutOfRange(other)),
        };
        Ok(Self::Peltier { level, forward })
    }

    pub fn fans(level: i64) -> Result<Self, CodecError> {
        Ok(Self::Fans {
            level: check_level("fans", level)?,
        })
    }

    pub fn kind(&self) -> OutboundKind {
        match self {
            Self::Pump { .. } => OutboundKind::Pump,
            Self::Peltier { .. } => OutboundKind::Peltier,
            Self::Fans { .. } => OutboundKind::Fans,
            Self::Heartbeat => OutboundKind::Heartbeat,
        }
    }

    /// Encode as a protocol line, including the trailing newline.
    pub fn encode(&self) -> String {
        let code = self.kind().code();
        match *self {
            Self::Pump { level } | Self::Fans { level } => format!("{code},{level}\n"),
            Self::Peltier { level, forward } => format!("{code},{level},{}\n", u8::from(forward)),
            Self::Heartbeat => format!("{code}\n"),
        }
    }
}

fn check_level(what: &'static str, value: i64) -> Result<u16, CodecError> {
    u16::try_from(value)
        .ok()
        .filter(|level| *level <= LEVEL_MAX)
        .ok_or(CodecError::LevelOutOfRange { what, value })
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a board-to-host line. Surrounding whitespace (including `\r`) is
/// ignored.
pub fn decode_line(line: &str) -> Result<Inbound, CodecError> {
    let (code, fields) = split_line(line)?;
    match InboundKind::from_code(code) {
        Some(InboundKind::SensorReport) => {
            let [moisture, temp_inner, humd_inner, temp_outer, humd_outer] =
                parse_fields::<i32, 5>(InboundKind::SensorReport.code(), &fields)?;
            Ok(Inbound::Report(SensorReport::new(
                moisture, temp_inner, humd_inner, temp_outer, humd_outer,
            )))
        }
        Some(InboundKind::Heartbeat) => {
            parse_fields::<i64, 0>(HEARTBEAT_CODE, &fields)?;
            Ok(Inbound::Heartbeat)
        }
        None => Err(CodecError::UnknownKind(code)),
    }
}

/// Decode a host-to-board line, as the board side of the link does.
pub fn decode_command(line: &str) -> Result<Outbound, CodecError> {
    let (code, fields) = split_line(line)?;
    let kind = OutboundKind::from_code(code).ok_or(CodecError::UnknownKind(code))?;
    match kind {
        OutboundKind::Pump => {
            let [level] = parse_fields::<i64, 1>(kind.code(), &fields)?;
            Outbound::pump(level)
        }
        OutboundKind::Peltier => {
            let [level, forward] = parse_fields::<i64, 2>(kind.code(), &fields)?;
            Outbound::peltier(level, forward)
        }
        OutboundKind::Fans => {
            let [level] = parse_fields::<i64, 1>(kind.code(), &fields)?;
            Outbound::fans(level)
        }
        OutboundKind::Heartbeat => {
            parse_fields::<i64, 0>(kind.code(), &fields)?;
            Ok(Outbound::Heartbeat)
        }
    }
}

fn split_line(line: &str) -> Result<(i64, Vec<&str>), CodecError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CodecError::Empty);
    }
    let mut parts = line.split(',').map(str::trim);
    let head = parts.next().unwrap_or_default();
    let code = head.parse::<i64>().map_err(|_| CodecError::NotInteger {
        index: 0,
        value: head.to_string(),
    })?;
    Ok((code, parts.collect()))
}

fn parse_fields<T: FromStr + Copy + Default, const N: usize>(
    kind: u8,
    fields: &[&str],
) -> Result<[T; N], CodecError> {
    if fields.len() != N {
        return Err(CodecError::FieldCount {
            kind,
            expected: N,
            got: fields.len(),
        });
    }
    let mut out = [T::default(); N];
    for (i, field) in fields.iter().enumerate() {
        out[i] = field.parse().map_err(|_| CodecError::NotInteger {
            index: i + 1,
            value: field.to_string(),
        })?;
    }
    Ok(out)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- decode_line ------------------------------------------------------

    #[test]
    fn decode_sensor_report() {
        let packet = decode_line("0,10,20,50,18,55\n").unwrap();
        assert_eq!(packet, Inbound::Report(SensorReport::new(10, 20, 50, 18, 55)));
        assert_eq!(packet.kind(), InboundKind::SensorReport);
    }

    #[test]
    fn decode_report_tolerates_crlf_and_spaces() {
        let packet = decode_line(" 0, 1 ,2,3, 4,5 \r\n").unwrap();
        assert_eq!(packet, Inbound::Report(SensorReport::new(1, 2, 3, 4, 5)));
    }

    #[test]
    fn decode_report_leaves_illumination_empty() {
        let Inbound::Report(r) = decode_line("0,1,2,3,4,5").unwrap() else {
            panic!("expected a report");
        };
        assert_eq!(r.illumination, None);
    }

    #[test]
    fn decode_negative_temperatures() {
        let packet = decode_line("0,30,-4,80,-12,90").unwrap();
        assert_eq!(packet, Inbound::Report(SensorReport::new(30, -4, 80, -12, 90)));
    }

    #[test]
    fn decode_heartbeat() {
        assert_eq!(decode_line("9\n").unwrap(), Inbound::Heartbeat);
        assert_eq!(decode_line("9").unwrap().kind(), InboundKind::Heartbeat);
    }

    #[test]
    fn decode_heartbeat_with_fields_rejected() {
        assert_eq!(
            decode_line("9,1"),
            Err(CodecError::FieldCount {
                kind: 9,
                expected: 0,
                got: 1
            })
        );
    }

    #[test]
    fn decode_non_numeric_kind() {
        assert!(matches!(
            decode_line("abc,1,2\n"),
            Err(CodecError::NotInteger { index: 0, .. })
        ));
    }

    #[test]
    fn decode_unknown_kind() {
        assert_eq!(decode_line("5,1,2"), Err(CodecError::UnknownKind(5)));
    }

    #[test]
    fn decode_report_wrong_field_count() {
        assert_eq!(
            decode_line("0,1,2,3,4"),
            Err(CodecError::FieldCount {
                kind: 0,
                expected: 5,
                got: 4
            })
        );
        assert!(decode_line("0,1,2,3,4,5,6").is_err());
    }

    #[test]
    fn decode_report_non_integer_field() {
        assert_eq!(
            decode_line("0,1,2,x,4,5"),
            Err(CodecError::NotInteger {
                index: 3,
                value: "x".into()
            })
        );
        assert!(decode_line("0,1.5,2,3,4,5").is_err());
    }

    #[test]
    fn decode_empty_line() {
        assert_eq!(decode_line(""), Err(CodecError::Empty));
        assert_eq!(decode_line("  \r\n"), Err(CodecError::Empty));
    }

    // -- Outbound validation + encoding -----------------------------------

    #[test]
    fn pump_level_bounds() {
        assert_eq!(Outbound::pump(0).unwrap().encode(), "0,0\n");
        assert_eq!(Outbound::pump(1023).unwrap().encode(), "0,1023\n");
        assert_eq!(
            Outbound::pump(1024),
            Err(CodecError::LevelOutOfRange {
                what: "pump",
                value: 1024
            })
        );
        assert!(Outbound::pump(-1).is_err());
    }

    #[test]
    fn every_valid_level_is_accepted() {
        for level in 0..=i64::from(LEVEL_MAX) {
            assert!(Outbound::pump(level).is_ok(), "pump {level}");
            assert!(Outbound::fans(level).is_ok(), "fans {level}");
            assert!(Outbound::peltier(level, 1).is_ok(), "peltier {level}");
        }
    }

    #[test]
    fn peltier_encoding_and_flag() {
        assert_eq!(Outbound::peltier(512, 1).unwrap().encode(), "1,512,1\n");
        assert_eq!(Outbound::peltier(7, 0).unwrap().encode(), "1,7,0\n");
        assert_eq!(Outbound::peltier(7, 2), Err(CodecError::FlagOutOfRange(2)));
        assert!(Outbound::peltier(2000, 0).is_err());
    }

    #[test]
    fn fans_and_heartbeat_encoding() {
        assert_eq!(Outbound::fans(1023).unwrap().encode(), "2,1023\n");
        assert_eq!(Outbound::Heartbeat.encode(), "9\n");
        assert!(Outbound::fans(-5).is_err());
    }

    // -- Direction separation ---------------------------------------------

    #[test]
    fn kind_zero_means_different_things_per_direction() {
        assert_eq!(InboundKind::from_code(0), Some(InboundKind::SensorReport));
        assert_eq!(OutboundKind::from_code(0), Some(OutboundKind::Pump));
        assert_eq!(InboundKind::from_code(1), None);
    }

    #[test]
    fn decode_command_lines() {
        assert_eq!(decode_command("0,300").unwrap(), Outbound::Pump { level: 300 });
        assert_eq!(
            decode_command("1,64,1\n").unwrap(),
            Outbound::Peltier {
                level: 64,
                forward: true
            }
        );
        assert_eq!(decode_command("2,0").unwrap(), Outbound::Fans { level: 0 });
        assert_eq!(decode_command("9").unwrap(), Outbound::Heartbeat);
        assert!(decode_command("0,2000").is_err());
        assert!(decode_command("1,5").is_err());
    }

    #[test]
    fn inbound_encoding_matches_board_format() {
        let line = Inbound::Report(SensorReport::new(10, 20, 50, 18, 55)).encode();
        assert_eq!(line, "0,10,20,50,18,55\n");
        assert_eq!(Inbound::Heartbeat.encode(), "9\n");
    }
}
