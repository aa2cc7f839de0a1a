//! Device state store.
//!
//! A single coarse-locked record of everything known about the connected
//! accessory. Writers go through the setters, which hold the lock only for
//! the mutation itself; readers take full [`DeviceState`] copies via
//! [`StateStore::snapshot`].

use std::mem;

use bluer::Address;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   airpods::{
      model::Model,
      protocol::{BatteryInfo, EarDetectionStatus, ListeningModes, NoiseControlMode},
   },
   config::EAR_PAUSE_ONE_OUT,
   event::Property,
};

/// Default adaptive noise level reported until the accessory says otherwise.
pub const DEFAULT_ADAPTIVE_LEVEL: u8 = 50;

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// The value changed; carries the previous value
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn replace(dst: &mut T, new: T) -> Self {
      if *dst == new {
         Self::Noop
      } else {
         Self::Updated(mem::replace(dst, new))
      }
   }

   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Updated(_))
   }
}

/// Snapshot of the accessory's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceState {
   pub connected: bool,
   pub name: SmolStr,
   #[serde(serialize_with = "ser_address")]
   pub address: Option<Address>,
   pub model: Model,
   pub battery: BatteryInfo,
   pub noise_mode: NoiseControlMode,
   pub conversational_awareness: bool,
   pub adaptive_noise_level: u8,
   pub listening_modes: ListeningModes,
   pub ear_detection: EarDetectionStatus,
   pub ear_pause_mode: u8,
}

fn ser_address<S: serde::Serializer>(addr: &Option<Address>, s: S) -> Result<S::Ok, S::Error> {
   match addr {
      Some(addr) => s.collect_str(addr),
      None => s.serialize_none(),
   }
}

impl Default for DeviceState {
   fn default() -> Self {
      Self {
         connected: false,
         name: SmolStr::default(),
         address: None,
         model: Model::Unknown,
         battery: BatteryInfo::UNAVAILABLE,
         noise_mode: NoiseControlMode::Off,
         conversational_awareness: false,
         adaptive_noise_level: DEFAULT_ADAPTIVE_LEVEL,
         listening_modes: ListeningModes::default(),
         ear_detection: EarDetectionStatus::default(),
         ear_pause_mode: EAR_PAUSE_ONE_OUT,
      }
   }
}

impl DeviceState {
   /// Lists the exposed properties whose value differs in `newer`.
   pub fn changed_properties(&self, newer: &Self) -> Vec<Property> {
      let mut changed = Vec::new();
      let mut check = |differs: bool, property: Property| {
         if differs {
            changed.push(property);
         }
      };
      check(self.connected != newer.connected, Property::Connected);
      check(self.name != newer.name, Property::DeviceName);
      check(self.address != newer.address, Property::DeviceAddress);
      check(self.model != newer.model, Property::DeviceModel);
      check(self.battery != newer.battery, Property::Battery);
      check(self.noise_mode != newer.noise_mode, Property::NoiseControlMode);
      check(
         self.conversational_awareness != newer.conversational_awareness,
         Property::ConversationalAwareness,
      );
      check(
         self.adaptive_noise_level != newer.adaptive_noise_level,
         Property::AdaptiveNoiseLevel,
      );
      check(self.listening_modes != newer.listening_modes, Property::ListeningModes);
      check(
         self.ear_detection.left_in_ear != newer.ear_detection.left_in_ear
            || self.ear_detection.right_in_ear != newer.ear_detection.right_in_ear,
         Property::EarDetection,
      );
      check(self.ear_pause_mode != newer.ear_pause_mode, Property::EarPauseMode);
      changed
   }

   /// Converts the state to the JSON document returned by `GetStatus`.
   pub fn to_json(&self) -> serde_json::Value {
      let caps = self.model.capabilities();
      json!({
          "connected": self.connected,
          "name": self.name.as_str(),
          "address": self.address.map(|a| a.to_string()),
          "model": self.model.display_name(),
          "battery": self.battery.to_json(),
          "noise_control_mode": self.noise_mode.to_str(),
          "conversational_awareness": self.conversational_awareness,
          "adaptive_noise_level": self.adaptive_noise_level,
          "listening_modes": {
              "off": self.listening_modes.off(),
              "transparency": self.listening_modes.transparency(),
              "anc": self.listening_modes.anc(),
              "adaptive": self.listening_modes.adaptive(),
          },
          "ear_detection": self.ear_detection.to_json(),
          "ear_pause_mode": self.ear_pause_mode,
          "capabilities": {
              "supports_anc": caps.supports_anc,
              "supports_adaptive": caps.supports_adaptive,
              "is_headphones": caps.is_headphones,
          },
      })
   }
}

/// Process-wide device state guarded by a single lock.
#[derive(Debug, Default)]
pub struct StateStore {
   inner: Mutex<DeviceState>,
}

impl StateStore {
   pub fn new() -> Self {
      Self::default()
   }

   /// Returns a full copy of the current state.
   pub fn snapshot(&self) -> DeviceState {
      self.inner.lock().clone()
   }

   pub fn is_connected(&self) -> bool {
      self.inner.lock().connected
   }

   /// Marks a device as connected under `address` and `name`.
   pub fn set_device(&self, address: Address, name: &str) {
      let mut state = self.inner.lock();
      state.connected = true;
      state.address = Some(address);
      state.name = name.into();
   }

   /// Replaces all battery components at once.
   ///
   /// Levels outside `0..=100` are already folded into "unavailable" by
   /// [`BatteryState::from_raw`](crate::airpods::protocol::BatteryState::from_raw).
   pub fn set_battery(&self, battery: BatteryInfo) -> UpdateOp<BatteryInfo> {
      UpdateOp::replace(&mut self.inner.lock().battery, battery)
   }

   pub fn set_noise_control(&self, mode: NoiseControlMode) -> UpdateOp<NoiseControlMode> {
      UpdateOp::replace(&mut self.inner.lock().noise_mode, mode)
   }

   pub fn set_ear_detection(
      &self,
      left_in_ear: bool,
      right_in_ear: bool,
      primary_left: bool,
   ) -> UpdateOp<EarDetectionStatus> {
      let status = EarDetectionStatus {
         left_in_ear,
         right_in_ear,
         primary_left,
      };
      UpdateOp::replace(&mut self.inner.lock().ear_detection, status)
   }

   pub fn set_conversational_awareness(&self, enabled: bool) -> UpdateOp<bool> {
      UpdateOp::replace(&mut self.inner.lock().conversational_awareness, enabled)
   }

   /// Sets the adaptive noise level, clamped to `0..=100`.
   pub fn set_adaptive_noise_level(&self, level: i32) -> UpdateOp<u8> {
      let level = level.clamp(0, 100) as u8;
      UpdateOp::replace(&mut self.inner.lock().adaptive_noise_level, level)
   }

   pub fn set_listening_modes(
      &self,
      off: bool,
      transparency: bool,
      anc: bool,
      adaptive: bool,
   ) -> UpdateOp<ListeningModes> {
      self.set_listening_mode_bits(ListeningModes::new(off, transparency, anc, adaptive))
   }

   pub fn set_listening_mode_bits(&self, modes: ListeningModes) -> UpdateOp<ListeningModes> {
      UpdateOp::replace(&mut self.inner.lock().listening_modes, modes)
   }

   pub fn set_model(&self, model: Model) -> UpdateOp<Model> {
      UpdateOp::replace(&mut self.inner.lock().model, model)
   }

   pub fn set_ear_pause_mode(&self, mode: u8) -> UpdateOp<u8> {
      UpdateOp::replace(&mut self.inner.lock().ear_pause_mode, mode)
   }

   /// Restores every attribute to its disconnected default. The ear-pause
   /// mode is a user setting and is kept.
   pub fn reset(&self) {
      let mut state = self.inner.lock();
      let ear_pause_mode = state.ear_pause_mode;
      *state = DeviceState {
         ear_pause_mode,
         ..DeviceState::default()
      };
   }
}
