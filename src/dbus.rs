//! D-Bus interface `org.airpodsd.Device1`.
//!
//! Read-only properties mirror the [`StateStore`](crate::airpods::state::StateStore);
//! methods forward to the [`LinkSession`] control operations.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   airpods::state::DeviceState, bluetooth::session::LinkSession, config::Config,
   error::AirPodsError,
};

pub const SERVICE_NAME: &str = "org.airpodsd";
pub const OBJECT_PATH: &str = "/org/airpodsd/device";

impl From<AirPodsError> for zbus::fdo::Error {
   fn from(e: AirPodsError) -> Self {
      match e {
         AirPodsError::InvalidArgument(msg) => Self::InvalidArgs(msg),
         e => Self::Failed(e.to_string()),
      }
   }
}

pub struct DeviceService {
   session: Arc<LinkSession>,
   config: Arc<Mutex<Config>>,
}

impl DeviceService {
   pub const fn new(session: Arc<LinkSession>, config: Arc<Mutex<Config>>) -> Self {
      Self { session, config }
   }

   fn snapshot(&self) -> DeviceState {
      self.session.store().snapshot()
   }
}

#[interface(name = "org.airpodsd.Device1")]
impl DeviceService {
   async fn set_noise_control_mode(&self, mode: String) -> zbus::fdo::Result<()> {
      self.session.set_noise_control_mode(&mode).await?;
      Ok(())
   }

   async fn set_conversational_awareness(&self, enabled: bool) -> zbus::fdo::Result<()> {
      Ok(self.session.set_conversational_awareness(enabled).await?)
   }

   async fn set_adaptive_noise_level(&self, level: i32) -> zbus::fdo::Result<()> {
      Ok(self.session.set_adaptive_noise_level(level).await?)
   }

   async fn set_listening_modes(
      &self,
      off: bool,
      transparency: bool,
      anc: bool,
      adaptive: bool,
   ) -> zbus::fdo::Result<()> {
      Ok(self
         .session
         .set_listening_modes(off, transparency, anc, adaptive)
         .await?)
   }

   async fn set_ear_pause_mode(&self, mode: i32) -> zbus::fdo::Result<()> {
      let mode = self.session.set_ear_pause_mode(mode)?;
      let mut config = self.config.lock();
      config.ear_pause_mode = mode;
      config.save()?;
      info!("Saved ear pause mode {mode}");
      Ok(())
   }

   async fn get_status(&self) -> String {
      self.snapshot().to_json().to_string()
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_changed(
      emitter: &SignalEmitter<'_>,
      left: i32,
      right: i32,
      case_battery: i32,
   ) -> zbus::Result<()>;

   #[zbus(signal, name = "NoiseControlModeChanged")]
   pub async fn noise_mode_signal(emitter: &SignalEmitter<'_>, mode: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      left_in_ear: bool,
      right_in_ear: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

   // Properties
   #[zbus(property)]
   async fn connected(&self) -> bool {
      self.session.store().is_connected()
   }

   #[zbus(property)]
   async fn device_name(&self) -> String {
      self.snapshot().name.to_string()
   }

   #[zbus(property)]
   async fn device_address(&self) -> String {
      self
         .snapshot()
         .address
         .map(|a| a.to_string())
         .unwrap_or_default()
   }

   #[zbus(property)]
   async fn device_model(&self) -> String {
      self.snapshot().model.display_name()
   }

   #[zbus(property)]
   async fn battery_left(&self) -> i32 {
      self.snapshot().battery.left.level_or_neg()
   }

   #[zbus(property)]
   async fn battery_right(&self) -> i32 {
      self.snapshot().battery.right.level_or_neg()
   }

   #[zbus(property)]
   async fn battery_case(&self) -> i32 {
      self.snapshot().battery.case.level_or_neg()
   }

   #[zbus(property)]
   async fn charging_left(&self) -> bool {
      self.snapshot().battery.left.is_charging()
   }

   #[zbus(property)]
   async fn charging_right(&self) -> bool {
      self.snapshot().battery.right.is_charging()
   }

   #[zbus(property)]
   async fn charging_case(&self) -> bool {
      self.snapshot().battery.case.is_charging()
   }

   #[zbus(property)]
   async fn noise_control_mode(&self) -> String {
      self.snapshot().noise_mode.to_str().to_owned()
   }

   #[zbus(property)]
   async fn conversational_awareness(&self) -> bool {
      self.snapshot().conversational_awareness
   }

   #[zbus(property)]
   async fn left_in_ear(&self) -> bool {
      self.snapshot().ear_detection.left_in_ear
   }

   #[zbus(property)]
   async fn right_in_ear(&self) -> bool {
      self.snapshot().ear_detection.right_in_ear
   }

   #[zbus(property)]
   async fn adaptive_noise_level(&self) -> i32 {
      i32::from(self.snapshot().adaptive_noise_level)
   }

   #[zbus(property)]
   async fn listening_mode_off(&self) -> bool {
      self.snapshot().listening_modes.off()
   }

   #[zbus(property)]
   async fn listening_mode_transparency(&self) -> bool {
      self.snapshot().listening_modes.transparency()
   }

   #[zbus(property, name = "ListeningModeANC")]
   async fn listening_mode_anc(&self) -> bool {
      self.snapshot().listening_modes.anc()
   }

   #[zbus(property)]
   async fn listening_mode_adaptive(&self) -> bool {
      self.snapshot().listening_modes.adaptive()
   }

   #[zbus(property)]
   async fn ear_pause_mode(&self) -> i32 {
      i32::from(self.snapshot().ear_pause_mode)
   }

   #[zbus(property)]
   async fn is_headphones(&self) -> bool {
      self.snapshot().model.capabilities().is_headphones
   }

   #[zbus(property, name = "SupportsANC")]
   async fn supports_anc(&self) -> bool {
      self.snapshot().model.capabilities().supports_anc
   }

   #[zbus(property)]
   async fn supports_adaptive(&self) -> bool {
      self.snapshot().model.capabilities().supports_adaptive
   }
}
