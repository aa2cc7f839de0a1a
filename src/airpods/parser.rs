//! Frame parsing for the `AirPods` protocol.
//!
//! [`parse`] turns one received frame into exactly one [`ParsedEvent`].
//! Every offset access is preceded by an explicit length check, and the
//! error kinds keep "need more bytes" ([`ParseError::Incomplete`]) apart
//! from "structurally wrong" ([`ParseError::Malformed`]).

use log::debug;
use smol_str::SmolStr;
use thiserror::Error;

use crate::airpods::protocol::{
   BatteryInfo, BatteryState, BatteryStatus, Component, ControlId, EarDetectionStatus,
   ListeningModes, NoiseControlMode, OP_BATTERY, OP_CA_DETECTION, OP_CONTROL, OP_EAR_DETECTION,
   OP_METADATA, has_valid_header, opcode,
};

/// Error type for frame parsing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
   /// Frame does not start with the steady-state magic header
   #[error("Invalid frame header")]
   InvalidHeader,

   /// Frame is too short for the structure it declares
   #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
   Incomplete { expected: usize, actual: usize },

   /// Frame is long enough but structurally invalid
   #[error("Malformed frame: {reason}")]
   Malformed { reason: &'static str },

   /// Well-formed frame with an opcode we do not handle
   #[error("Unknown opcode 0x{0:02x}")]
   UnknownOpcode(u8),
}

/// Raw ear detection report.
///
/// The frame only says "primary" and "secondary"; which physical side is
/// primary is not carried, so `primary_left` is always `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarDetection {
   pub primary_in_ear: bool,
   pub secondary_in_ear: bool,
   pub primary_left: bool,
}

impl EarDetection {
   pub const fn status(&self) -> EarDetectionStatus {
      EarDetectionStatus::from_primary(self.primary_in_ear, self.secondary_in_ear, self.primary_left)
   }
}

/// Identification strings reported by the accessory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
   pub device_name: SmolStr,
   pub model_number: SmolStr,
   pub manufacturer: SmolStr,
}

/// Decoded content of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
   Battery(BatteryInfo),
   EarDetection(EarDetection),
   NoiseControlMode(NoiseControlMode),
   ConversationalAwareness(bool),
   /// Conversational awareness fired; carries the volume ducking level when
   /// the frame is long enough to hold it.
   ConversationalAwarenessVolume(Option<u8>),
   ListeningModes(ListeningModes),
   Metadata(Metadata),
   /// Control frame with a control id we do not interpret.
   Unrecognized(ControlId),
}

const BATTERY_RECORD_LEN: usize = 5;
const BATTERY_RECORDS_OFFSET: usize = 7;
const METADATA_PREAMBLE_LEN: usize = 12;
const DEVICE_NAME_MAX: usize = 63;
const MODEL_NUMBER_MAX: usize = 15;
const MANUFACTURER_MAX: usize = 31;

const fn need(data: &[u8], expected: usize) -> Result<(), ParseError> {
   if data.len() < expected {
      Err(ParseError::Incomplete {
         expected,
         actual: data.len(),
      })
   } else {
      Ok(())
   }
}

/// Parses one frame.
pub fn parse(data: &[u8]) -> Result<ParsedEvent, ParseError> {
   if !has_valid_header(data) {
      return Err(ParseError::InvalidHeader);
   }
   need(data, 5)?;

   match opcode(data).unwrap_or_default() {
      OP_BATTERY => parse_battery(data).map(ParsedEvent::Battery),
      OP_EAR_DETECTION => parse_ear_detection(data).map(ParsedEvent::EarDetection),
      OP_CONTROL => parse_control(data),
      OP_CA_DETECTION => Ok(ParsedEvent::ConversationalAwarenessVolume(data.get(9).copied())),
      OP_METADATA => parse_metadata(data).map(ParsedEvent::Metadata),
      op => Err(ParseError::UnknownOpcode(op)),
   }
}

/// Parses a battery frame: `HEADER 04 00 <count> (<tag> 00 <level> <status> 01)*`.
pub fn parse_battery(data: &[u8]) -> Result<BatteryInfo, ParseError> {
   need(data, BATTERY_RECORDS_OFFSET)?;
   if data[4] != OP_BATTERY || data[5] != 0x00 {
      return Err(ParseError::Malformed {
         reason: "not a battery frame",
      });
   }

   let count = data[6] as usize;
   if !(1..=3).contains(&count) {
      return Err(ParseError::Malformed {
         reason: "battery component count must be 1-3",
      });
   }
   need(data, BATTERY_RECORDS_OFFSET + count * BATTERY_RECORD_LEN)?;

   let mut info = BatteryInfo::UNAVAILABLE;
   let records = data[BATTERY_RECORDS_OFFSET..]
      .chunks_exact(BATTERY_RECORD_LEN)
      .take(count);
   for record in records {
      let &[tag, _, level, status, _] = record else {
         unreachable!("chunks_exact yields {BATTERY_RECORD_LEN}-byte records");
      };
      let state = BatteryState::from_raw(i32::from(level), BatteryStatus::from_byte(status));

      match Component::from_repr(tag) {
         Some(Component::Single | Component::Left) => info.left = state,
         Some(Component::Right) => info.right = state,
         Some(Component::Case) => info.case = state,
         None => debug!("Skipping unknown battery component 0x{tag:02x}"),
      }
   }
   Ok(info)
}

/// Parses an ear detection frame: `HEADER 06 00 <primary> <secondary>`.
pub fn parse_ear_detection(data: &[u8]) -> Result<EarDetection, ParseError> {
   need(data, 8)?;
   if data[4] != OP_EAR_DETECTION || data[5] != 0x00 {
      return Err(ParseError::Malformed {
         reason: "not an ear detection frame",
      });
   }
   Ok(EarDetection {
      primary_in_ear: data[6] == 0x00,
      secondary_in_ear: data[7] == 0x00,
      primary_left: true,
   })
}

/// Parses a noise control response: `HEADER 09 00 0D <mode> ...`.
pub fn parse_noise_control(data: &[u8]) -> Result<NoiseControlMode, ParseError> {
   need(data, 8)?;
   if data[4] != OP_CONTROL || ControlId::from_id(data[6]) != ControlId::NOISE_CONTROL {
      return Err(ParseError::Malformed {
         reason: "not a noise control frame",
      });
   }
   Ok(NoiseControlMode::from_byte(data[7]))
}

fn parse_control(data: &[u8]) -> Result<ParsedEvent, ParseError> {
   need(data, 8)?;
   let value = data[7];
   match ControlId::from_id(data[6]) {
      ControlId::NOISE_CONTROL => parse_noise_control(data).map(ParsedEvent::NoiseControlMode),
      ControlId::CONVERSATIONAL => Ok(ParsedEvent::ConversationalAwareness(value == 0x01)),
      ControlId::LISTENING_MODES => Ok(ParsedEvent::ListeningModes(ListeningModes::from_bits(value))),
      other => Ok(ParsedEvent::Unrecognized(other)),
   }
}

/// Reads one NUL-terminated field starting at `*pos`, truncated to `max`
/// bytes. A missing terminator at the end of the buffer is accepted.
fn take_cstr(data: &[u8], pos: &mut usize, max: usize) -> SmolStr {
   let rest = data.get(*pos..).unwrap_or_default();
   let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
   *pos += end + 1;
   let field = &rest[..end.min(max)];
   String::from_utf8_lossy(field).into()
}

/// Parses a metadata frame: a 12-byte preamble followed by device name,
/// model number and manufacturer as NUL-terminated strings.
pub fn parse_metadata(data: &[u8]) -> Result<Metadata, ParseError> {
   need(data, METADATA_PREAMBLE_LEN)?;
   let mut pos = METADATA_PREAMBLE_LEN;
   let device_name = take_cstr(data, &mut pos, DEVICE_NAME_MAX);
   let model_number = take_cstr(data, &mut pos, MODEL_NUMBER_MAX);
   let manufacturer = take_cstr(data, &mut pos, MANUFACTURER_MAX);
   Ok(Metadata {
      device_name,
      model_number,
      manufacturer,
   })
}
