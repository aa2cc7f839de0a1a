//! `AirPods` protocol definitions and frame builders.
//!
//! This module contains the wire constants, the pre-built initialization
//! frames and the typed values shared by the parser and the command
//! builders. Every layout here is byte-exact with the accessory firmware.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Magic header that starts every steady-state frame.
pub const HEADER: [u8; 4] = [0x04, 0x00, 0x04, 0x00];
/// Prefix of the initial handshake frame.
pub const HANDSHAKE_PREFIX: [u8; 2] = [0x00, 0x00];

/// Size of every control command frame.
pub const CONTROL_CMD_LEN: usize = 11;

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff];

// Opcodes (byte 4)
pub const OP_BATTERY: u8 = 0x04;
pub const OP_EAR_DETECTION: u8 = 0x06;
pub const OP_CONTROL: u8 = 0x09;
pub const OP_REQUEST_NOTIFY: u8 = 0x0f;
pub const OP_METADATA: u8 = 0x1d;
pub const OP_CA_DETECTION: u8 = 0x4b;
pub const OP_SET_FEATURES: u8 = 0x4d;

/// Identifies the sub-command of a control (`0x09`) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ControlId(u8);

impl ControlId {
   pub const NOISE_CONTROL: Self = Self(0x0D);
   pub const LISTENING_MODES: Self = Self(0x1A);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const CONVERSATIONAL: Self = Self(0x28);
   pub const ADAPTIVE_LEVEL: Self = Self(0x2E);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   pub const fn try_to_str(self) -> Option<&'static str> {
      match self {
         Self::NOISE_CONTROL => Some("noise_control"),
         Self::LISTENING_MODES => Some("listening_modes"),
         Self::ONE_BUD_ANC => Some("one_bud_anc"),
         Self::CONVERSATIONAL => Some("conversational"),
         Self::ADAPTIVE_LEVEL => Some("adaptive_level"),
         _ => None,
      }
   }
}

impl fmt::Display for ControlId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.try_to_str() {
         Some(name) => f.write_str(name),
         None => write!(f, "{:02x}", self.0),
      }
   }
}

/// Battery record tags inside a battery frame.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   /// Single-battery headphones; reported in the left slot.
   Single = 0x01,
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Charge status of one battery component.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum BatteryStatus {
   #[default]
   Unknown = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

impl BatteryStatus {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }
}

/// Noise control modes supported by `AirPods`.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
   strum::EnumIter,
)]
#[repr(u8)]
#[strum(ascii_case_insensitive)]
pub enum NoiseControlMode {
   #[default]
   #[strum(to_string = "off")]
   Off = 0x01,
   #[strum(to_string = "anc", serialize = "noise_cancellation", serialize = "cancellation")]
   Anc = 0x02,
   #[strum(to_string = "transparency", serialize = "transparent")]
   Transparency = 0x03,
   #[strum(to_string = "adaptive")]
   Adaptive = 0x04,
}

impl NoiseControlMode {
   /// Decodes the mode byte of a noise-control frame; unknown values are `Off`.
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or_default()
   }

   /// Parses a mode name as accepted on the control interface; unknown names
   /// are `Off`.
   pub fn from_name(name: &str) -> Self {
      name.parse().unwrap_or_default()
   }

   pub const fn to_byte(self) -> u8 {
      self as u8
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Battery state for a single component.
///
/// `level` is `None` when the accessory did not report a usable value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: Option<u8>,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const UNAVAILABLE: Self = Self {
      level: None,
      status: BatteryStatus::Unknown,
   };

   /// Builds a state from a raw level; anything outside `0..=100` is
   /// unavailable regardless of `status`.
   pub fn from_raw(level: i32, status: BatteryStatus) -> Self {
      let level = u8::try_from(level).ok().filter(|l| *l <= 100);
      Self { level, status }
   }

   pub const fn is_available(&self) -> bool {
      self.level.is_some()
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   /// Level as reported over IPC: `-1` when unavailable.
   pub fn level_or_neg(&self) -> i32 {
      self.level.map_or(-1, i32::from)
   }
}

/// Battery information for all components.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub const UNAVAILABLE: Self = Self {
      left: BatteryState::UNAVAILABLE,
      right: BatteryState::UNAVAILABLE,
      case: BatteryState::UNAVAILABLE,
   };

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": self.left.level_or_neg(),
          "right_level": self.right.level_or_neg(),
          "case_level": self.case.level_or_neg(),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

impl fmt::Display for BatteryInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut side = |name: &str, s: &BatteryState| match s.level {
         Some(level) => write!(f, "{name}={level}% ({}) ", s.status),
         None => write!(f, "{name}=n/a "),
      };
      side("L", &self.left)?;
      side("R", &self.right)?;
      side("C", &self.case)
   }
}

/// Ear presence for both pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarDetectionStatus {
   pub left_in_ear: bool,
   pub right_in_ear: bool,
   /// Whether the primary pod is the left one.
   pub primary_left: bool,
}

impl Default for EarDetectionStatus {
   fn default() -> Self {
      Self {
         left_in_ear: false,
         right_in_ear: false,
         primary_left: true,
      }
   }
}

impl EarDetectionStatus {
   /// Maps primary/secondary presence onto left/right.
   pub const fn from_primary(primary_in_ear: bool, secondary_in_ear: bool, primary_left: bool) -> Self {
      if primary_left {
         Self {
            left_in_ear: primary_in_ear,
            right_in_ear: secondary_in_ear,
            primary_left,
         }
      } else {
         Self {
            left_in_ear: secondary_in_ear,
            right_in_ear: primary_in_ear,
            primary_left,
         }
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_in_ear": self.left_in_ear,
          "right_in_ear": self.right_in_ear,
      })
   }
}

/// Set of noise-control modes the accessory cycles through on long press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ListeningModes(u8);

impl Default for ListeningModes {
   fn default() -> Self {
      Self(Self::TRANSPARENCY | Self::ANC | Self::ADAPTIVE)
   }
}

impl ListeningModes {
   pub const OFF: u8 = 1 << 0;
   pub const TRANSPARENCY: u8 = 1 << 1;
   pub const ANC: u8 = 1 << 2;
   pub const ADAPTIVE: u8 = 1 << 3;

   pub const fn new(off: bool, transparency: bool, anc: bool, adaptive: bool) -> Self {
      let mut bits = 0;
      if off {
         bits |= Self::OFF;
      }
      if transparency {
         bits |= Self::TRANSPARENCY;
      }
      if anc {
         bits |= Self::ANC;
      }
      if adaptive {
         bits |= Self::ADAPTIVE;
      }
      Self(bits)
   }

   /// Wraps a raw bitmask as received from the accessory.
   pub const fn from_bits(bits: u8) -> Self {
      Self(bits)
   }

   pub const fn bits(self) -> u8 {
      self.0
   }

   pub const fn off(self) -> bool {
      self.0 & Self::OFF != 0
   }
   pub const fn transparency(self) -> bool {
      self.0 & Self::TRANSPARENCY != 0
   }
   pub const fn anc(self) -> bool {
      self.0 & Self::ANC != 0
   }
   pub const fn adaptive(self) -> bool {
      self.0 & Self::ADAPTIVE != 0
   }

   /// Number of modes enabled among the four known ones.
   pub const fn count(self) -> u32 {
      (self.0 & 0x0f).count_ones()
   }
}

impl fmt::Display for ListeningModes {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "off={} transparency={} anc={} adaptive={} (raw=0x{:02x})",
         self.off(),
         self.transparency(),
         self.anc(),
         self.adaptive(),
         self.0
      )
   }
}

/// Returns true when `data` begins with the steady-state magic header.
pub fn has_valid_header(data: &[u8]) -> bool {
   data.starts_with(&HEADER)
}

/// Returns the opcode byte, if present.
pub fn opcode(data: &[u8]) -> Option<u8> {
   data.get(4).copied()
}

/// Builds a control frame: `HEADER 09 00 <id> <value> 00 00 00`.
pub const fn build_control_packet(id: ControlId, value: u8) -> [u8; CONTROL_CMD_LEN] {
   [
      HEADER[0],
      HEADER[1],
      HEADER[2],
      HEADER[3],
      OP_CONTROL,
      0x00,
      id.id(),
      value,
      0x00,
      0x00,
      0x00,
   ]
}

pub const fn build_noise_control_cmd(mode: NoiseControlMode) -> [u8; CONTROL_CMD_LEN] {
   build_control_packet(ControlId::NOISE_CONTROL, mode.to_byte())
}

/// Builds the adaptive noise level command; `level` is clamped to `0..=100`.
pub fn build_adaptive_level_cmd(level: i32) -> [u8; CONTROL_CMD_LEN] {
   build_control_packet(ControlId::ADAPTIVE_LEVEL, level.clamp(0, 100) as u8)
}

pub const fn build_conversational_awareness_cmd(enable: bool) -> [u8; CONTROL_CMD_LEN] {
   build_control_packet(ControlId::CONVERSATIONAL, if enable { 0x01 } else { 0x02 })
}

pub const fn build_listening_modes_cmd(modes: ListeningModes) -> [u8; CONTROL_CMD_LEN] {
   build_control_packet(ControlId::LISTENING_MODES, modes.bits())
}

/// Renders a frame for debug logs, eliding the middle of long ones.
pub fn hex_preview(data: &[u8]) -> String {
   if data.len() <= 64 {
      hex::encode(data)
   } else {
      format!("{}.. (+{} bytes)", hex::encode(&data[..64]), data.len() - 64)
   }
}
