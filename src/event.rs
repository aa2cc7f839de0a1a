//! Event handling system for `AirPods` status updates.
//!
//! The link session reports everything it learns through an [`EventBus`].
//! Implementations must not block and must not call back into the session.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::airpods::protocol::{BatteryInfo, EarDetectionStatus, NoiseControlMode};

/// Groups of device properties exposed over IPC.
///
/// `Battery` covers levels and charging flags of all components,
/// `EarDetection` both in-ear flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum Property {
   Connected,
   DeviceName,
   DeviceAddress,
   DeviceModel,
   Battery,
   NoiseControlMode,
   EarDetection,
   ConversationalAwareness,
   AdaptiveNoiseLevel,
   ListeningModes,
   EarPauseMode,
}

/// Events that can be emitted by the `AirPods` service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirPodsEvent {
   DeviceConnected { address: Address, name: SmolStr },
   DeviceDisconnected { address: Address, name: SmolStr },
   BatteryChanged(BatteryInfo),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarDetectionStatus),
   PropertyChanged(Property),
   /// A connection attempt or an established link failed.
   ConnectionError(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: AirPodsEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

