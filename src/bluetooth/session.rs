//! Link session: connection lifecycle for one accessory.
//!
//! A [`LinkSession`] owns the L2CAP link, runs the initialization sequence,
//! feeds every received frame through the parser into the [`StateStore`]
//! and reports changes on the [`EventBus`](crate::event::EventBus).
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                      |             |
//!                      +--> Error <--+
//!                             |
//!                             v
//!                        Disconnected
//! ```

use std::{
   future::Future,
   sync::{Arc, Weak},
   time::Duration,
};

use bluer::Address;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, format_smolstr};
use tokio::{task::JoinSet, time};

use crate::{
   airpods::{
      model::Model,
      parser::{self, ParseError, ParsedEvent},
      protocol::{
         ListeningModes, NoiseControlMode, PKT_HANDSHAKE, PKT_REQUEST_NOTIFY, PKT_SET_FEATURES,
         build_adaptive_level_cmd, build_conversational_awareness_cmd, build_listening_modes_cmd,
         build_noise_control_cmd, hex_preview,
      },
      state::StateStore,
   },
   bluetooth::l2cap::{self, L2CapReceiver, L2CapSender, Packet},
   config::{Config, EAR_PAUSE_MODE_MAX},
   error::{AirPodsError, Result},
   event::{AirPodsEvent, EventSender, Property},
   profile::{DeviceProfile, ProfileStore},
};

/// Link state of the session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LinkState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Error,
}

/// Opens the transport for a session.
pub trait Connector: Send + Sync + 'static {
   /// Connects to `address`, spawning any I/O tasks on `jset`.
   fn connect(
      &self,
      jset: &mut JoinSet<()>,
      address: Address,
   ) -> impl Future<Output = Result<(L2CapReceiver, L2CapSender)>> + Send;
}

/// Connector for the real L2CAP control channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct L2CapConnector;

impl Connector for L2CapConnector {
   fn connect(
      &self,
      jset: &mut JoinSet<()>,
      address: Address,
   ) -> impl Future<Output = Result<(L2CapReceiver, L2CapSender)>> + Send {
      l2cap::connect(jset, address)
   }
}

/// Timing of the initialization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
   /// Wait before the handshake frame
   pub handshake_delay: Duration,
   /// Wait before each following initialization frame
   pub step_delay: Duration,
}

impl Default for SessionOptions {
   fn default() -> Self {
      Self {
         handshake_delay: Duration::from_millis(100),
         step_delay: Duration::from_millis(50),
      }
   }
}

impl SessionOptions {
   pub fn from_config(config: &Config) -> Self {
      Self {
         handshake_delay: Duration::from_millis(config.handshake_delay_ms),
         step_delay: Duration::from_millis(config.handshake_step_delay_ms),
      }
   }
}

/// Internal state for an active L2CAP connection.
#[derive(Debug)]
struct ConnectionState {
   sender: L2CapSender,
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

#[derive(Debug, Default)]
struct Inner {
   state: LinkState,
   address: Option<Address>,
   name: SmolStr,
   conn: Option<ConnectionState>,
   /// Bumped on every connect and disconnect; lets a receive task detect
   /// that the link it was started for is gone.
   generation: u64,
}

/// Connection to one accessory.
pub struct LinkSession<C: Connector = L2CapConnector> {
   connector: C,
   store: Arc<StateStore>,
   events: EventSender,
   profiles: Option<ProfileStore>,
   options: SessionOptions,
   inner: Mutex<Inner>,
}

impl<C: Connector> LinkSession<C> {
   pub fn new(
      connector: C,
      store: Arc<StateStore>,
      events: EventSender,
      profiles: Option<ProfileStore>,
      options: SessionOptions,
   ) -> Arc<Self> {
      Arc::new(Self {
         connector,
         store,
         events,
         profiles,
         options,
         inner: Mutex::new(Inner::default()),
      })
   }

   pub fn state(&self) -> LinkState {
      self.inner.lock().state
   }

   pub fn is_connected(&self) -> bool {
      self.state() == LinkState::Connected
   }

   /// Address of the peer while connecting or connected.
   pub fn address(&self) -> Option<Address> {
      self.inner.lock().address
   }

   pub fn store(&self) -> &Arc<StateStore> {
      &self.store
   }

   /// Connects to `address` and runs the initialization sequence.
   ///
   /// Fails with [`AirPodsError::AlreadyConnecting`] unless the session is
   /// `Disconnected`; the request is not queued.
   pub async fn connect(self: &Arc<Self>, address: Address, name: &str) -> Result<()> {
      let generation = {
         let mut inner = self.inner.lock();
         if inner.state != LinkState::Disconnected {
            debug!("Rejecting connect to {address}: session is {}", inner.state);
            return Err(AirPodsError::AlreadyConnecting);
         }
         inner.state = LinkState::Connecting;
         inner.address = Some(address);
         inner.name = name.into();
         inner.generation += 1;
         inner.generation
      };
      info!("Connecting to {name} ({address})");

      let mut jset = JoinSet::new();
      let (receiver, sender) = match self.connector.connect(&mut jset, address).await {
         Ok(halves) => halves,
         Err(e) => {
            self.fail(generation, format_smolstr!("Failed to connect to {address}: {e}"));
            return Err(e);
         },
      };

      jset.spawn(Self::receive_loop(Arc::downgrade(self), generation, receiver));
      {
         let mut inner = self.inner.lock();
         if inner.generation != generation {
            // disconnect() ran while the socket was connecting
            debug!("Connect to {address} superseded");
            return Err(AirPodsError::DeviceNotConnected);
         }
         inner.state = LinkState::Connected;
         inner.conn = Some(ConnectionState { sender, jset });
      }
      info!("Connected to {name} ({address})");

      self.store.set_device(address, name);
      self.events.emit(AirPodsEvent::DeviceConnected {
         address,
         name: name.into(),
      });
      for property in [Property::Connected, Property::DeviceName, Property::DeviceAddress] {
         self.emit_property(property);
      }
      let preferred_mode = self.restore_profile(address, name);

      self.initialize(address).await;
      if let Some(mode) = preferred_mode
         && self.is_connected()
      {
         info!("{address}: applying preferred noise control mode {mode}");
         if let Err(e) = self.send(&build_noise_control_cmd(mode)).await {
            warn!("{address}: failed to apply noise control mode: {e}");
         }
      }

      if self.current_generation() != generation || !self.is_connected() {
         return Err(AirPodsError::DeviceNotConnected);
      }
      Ok(())
   }

   /// Sends handshake, feature and notification requests with the
   /// configured pacing. Failures are logged; the link stays up.
   async fn initialize(&self, address: Address) {
      let steps: [(&str, &[u8], Duration); 3] = [
         ("handshake", PKT_HANDSHAKE, self.options.handshake_delay),
         ("set features", PKT_SET_FEATURES, self.options.step_delay),
         ("request notifications", PKT_REQUEST_NOTIFY, self.options.step_delay),
      ];
      for (what, frame, delay) in steps {
         time::sleep(delay).await;
         if let Err(e) = self.send(frame).await {
            warn!("{address}: failed to send {what}: {e}");
            if !self.is_connected() {
               return;
            }
         }
      }
      info!("{address}: initialization sequence sent");
   }

   /// Seeds the store from the saved profile and returns the preferred
   /// noise control mode, if any.
   fn restore_profile(&self, address: Address, name: &str) -> Option<NoiseControlMode> {
      let profiles = self.profiles.as_ref()?;
      match profiles.touch(address, name) {
         Ok(profile) => {
            if let Some(modes) = profile.listening_modes
               && self.store.set_listening_mode_bits(modes).is_updated()
            {
               self.emit_property(Property::ListeningModes);
            }
            if let Some(level) = profile.adaptive_level
               && self.store.set_adaptive_noise_level(i32::from(level)).is_updated()
            {
               self.emit_property(Property::AdaptiveNoiseLevel);
            }
            debug!("{address}: restored profile {profile:?}");
            profile.noise_mode
         },
         Err(e) => {
            warn!("{address}: failed to load profile: {e}");
            None
         },
      }
   }

   fn save_profile<F>(&self, f: F)
   where
      F: FnOnce(&mut DeviceProfile),
   {
      let (Some(profiles), Some(address)) = (&self.profiles, self.address()) else {
         return;
      };
      if let Err(e) = profiles.update(address, f) {
         warn!("{address}: failed to save profile: {e}");
      }
   }

   /// Closes the link and returns to `Disconnected`.
   ///
   /// Idempotent. The store is reset and `DeviceDisconnected` emitted only
   /// when a device was connected.
   pub fn disconnect(&self) {
      let (conn, address, name, was_connected) = {
         let mut inner = self.inner.lock();
         if inner.state == LinkState::Disconnected && inner.conn.is_none() {
            return;
         }
         let was_connected = matches!(inner.state, LinkState::Connected | LinkState::Error)
            && inner.conn.is_some();
         inner.state = LinkState::Disconnected;
         inner.generation += 1;
         (
            inner.conn.take(),
            inner.address.take(),
            std::mem::take(&mut inner.name),
            was_connected,
         )
      };
      drop(conn);

      if let Some(address) = address
         && was_connected
      {
         info!("Disconnected from {name} ({address})");
         let before = self.store.snapshot();
         self.store.reset();
         let changed = before.changed_properties(&self.store.snapshot());
         self.events.emit(AirPodsEvent::DeviceDisconnected { address, name });
         for property in changed {
            self.emit_property(property);
         }
      }
   }

   /// Moves a live attempt to `Error`, reports `message` and tears down.
   fn fail(&self, generation: u64, message: SmolStr) {
      {
         let mut inner = self.inner.lock();
         if inner.generation != generation {
            return;
         }
         inner.state = LinkState::Error;
      }
      warn!("{message}");
      self.events.emit(AirPodsEvent::ConnectionError(message));
      self.disconnect();
   }

   fn current_generation(&self) -> u64 {
      self.inner.lock().generation
   }

   /// Handles the end of the receive stream for `generation`.
   fn link_lost(&self, generation: u64, err: &AirPodsError) {
      if self.current_generation() != generation {
         trace!("Ignoring link loss of a stale connection: {err}");
         return;
      }
      if matches!(err, AirPodsError::PeerClosed) {
         info!("Link closed by peer");
         self.disconnect();
      } else {
         self.fail(generation, format_smolstr!("Connection lost: {err}"));
      }
   }

   async fn receive_loop(weak: Weak<Self>, generation: u64, mut rx: L2CapReceiver) {
      loop {
         let item = rx.recv().await;
         let Some(this) = weak.upgrade() else {
            return;
         };
         match item {
            Ok(packet) => this.process_packet(&packet),
            Err(e) => {
               this.link_lost(generation, &e);
               return;
            },
         }
      }
   }

   /// Parses one frame and applies it to the store.
   pub fn process_packet(&self, packet: &Packet) {
      match parser::parse(packet) {
         Ok(event) => self.apply(event),
         Err(ParseError::UnknownOpcode(op)) => {
            trace!("Ignoring opcode 0x{op:02x}: {}", hex_preview(packet));
         },
         Err(ParseError::InvalidHeader) => {
            debug!("Ignoring frame without header: {}", hex_preview(packet));
         },
         Err(e) => warn!("Dropping frame ({e}): {}", hex_preview(packet)),
      }
   }

   fn apply(&self, event: ParsedEvent) {
      match event {
         ParsedEvent::Battery(battery) => {
            info!("Battery: {battery}");
            if self.store.set_battery(battery).is_updated() {
               self.events.emit(AirPodsEvent::BatteryChanged(battery));
            }
         },
         ParsedEvent::EarDetection(ear) => {
            let status = ear.status();
            info!(
               "Ear detection: primary={} secondary={}",
               if ear.primary_in_ear { "in" } else { "out" },
               if ear.secondary_in_ear { "in" } else { "out" }
            );
            if self
               .store
               .set_ear_detection(status.left_in_ear, status.right_in_ear, status.primary_left)
               .is_updated()
            {
               self.events.emit(AirPodsEvent::EarDetectionChanged(status));
            }
         },
         ParsedEvent::NoiseControlMode(mode) => {
            info!("Noise control mode: {mode}");
            if self.store.set_noise_control(mode).is_updated() {
               self.events.emit(AirPodsEvent::NoiseControlChanged(mode));
            }
         },
         ParsedEvent::ConversationalAwareness(enabled) => {
            info!(
               "Conversational awareness: {}",
               if enabled { "enabled" } else { "disabled" }
            );
            if self.store.set_conversational_awareness(enabled).is_updated() {
               self.emit_property(Property::ConversationalAwareness);
            }
         },
         ParsedEvent::ConversationalAwarenessVolume(level) => {
            debug!("Conversational awareness detection: level={level:?}");
         },
         ParsedEvent::ListeningModes(modes) => {
            info!("Listening modes: {modes}");
            if self.store.set_listening_mode_bits(modes).is_updated() {
               self.emit_property(Property::ListeningModes);
            }
         },
         ParsedEvent::Metadata(meta) => {
            info!(
               "Metadata: device='{}' model='{}' manufacturer='{}'",
               meta.device_name, meta.model_number, meta.manufacturer
            );
            let model = Model::from_number(&meta.model_number);
            if model.is_known() && self.store.set_model(model).is_updated() {
               info!("Detected model: {model}");
               self.emit_property(Property::DeviceModel);
            }
         },
         ParsedEvent::Unrecognized(id) => debug!("Unhandled control id {id}"),
      }
   }

   fn emit_property(&self, property: Property) {
      self.events.emit(AirPodsEvent::PropertyChanged(property));
   }

   /// Writes one frame to the accessory.
   ///
   /// A transport error that means the link is gone moves the session to
   /// `Disconnected` before the error is returned.
   pub async fn send(&self, data: &[u8]) -> Result<()> {
      let (sender, generation) = {
         let inner = self.inner.lock();
         match (&inner.conn, inner.state) {
            (Some(conn), LinkState::Connected) => (conn.sender.clone(), inner.generation),
            _ => return Err(AirPodsError::DeviceNotConnected),
         }
      };
      match sender.send(data).await {
         Err(e) if e.is_link_loss() => {
            self.fail(generation, format_smolstr!("Send failed: {e}"));
            Err(e)
         },
         other => other,
      }
   }

   /// Requests a noise control mode by name (`off`, `anc`, `transparency`,
   /// `adaptive`). The store follows once the accessory echoes the change.
   pub async fn set_noise_control_mode(&self, name: &str) -> Result<NoiseControlMode> {
      let mode = NoiseControlMode::from_name(name);
      info!("Setting noise control mode: {mode}");
      self.send(&build_noise_control_cmd(mode)).await?;
      self.save_profile(|p| p.noise_mode = Some(mode));
      Ok(mode)
   }

   pub async fn set_conversational_awareness(&self, enabled: bool) -> Result<()> {
      info!("Setting conversational awareness: {enabled}");
      self.send(&build_conversational_awareness_cmd(enabled)).await
   }

   /// Sets the adaptive noise level (clamped to `0..=100`).
   pub async fn set_adaptive_noise_level(&self, level: i32) -> Result<()> {
      let level = level.clamp(0, 100);
      info!("Setting adaptive noise level: {level}");
      self.send(&build_adaptive_level_cmd(level)).await?;
      if self.store.set_adaptive_noise_level(level).is_updated() {
         self.emit_property(Property::AdaptiveNoiseLevel);
      }
      self.save_profile(|p| p.adaptive_level = Some(level as u8));
      Ok(())
   }

   /// Sets the modes cycled by a long press. At least two must be enabled.
   pub async fn set_listening_modes(
      &self,
      off: bool,
      transparency: bool,
      anc: bool,
      adaptive: bool,
   ) -> Result<()> {
      let modes = ListeningModes::new(off, transparency, anc, adaptive);
      if modes.count() < 2 {
         return Err(AirPodsError::InvalidArgument(
            "at least 2 listening modes must be enabled".into(),
         ));
      }
      info!("Setting listening modes: 0x{:02x}", modes.bits());
      self.send(&build_listening_modes_cmd(modes)).await?;
      if self
         .store
         .set_listening_modes(off, transparency, anc, adaptive)
         .is_updated()
      {
         self.emit_property(Property::ListeningModes);
      }
      self.save_profile(|p| p.listening_modes = Some(modes));
      Ok(())
   }

   /// Sets the ear-pause policy (0 disabled, 1 one out, 2 both out).
   ///
   /// This is a local setting and works without a connection.
   pub fn set_ear_pause_mode(&self, mode: i32) -> Result<u8> {
      let mode = u8::try_from(mode)
         .ok()
         .filter(|m| *m <= EAR_PAUSE_MODE_MAX)
         .ok_or_else(|| AirPodsError::InvalidArgument(format!("invalid ear pause mode {mode}")))?;
      info!("Setting ear pause mode: {mode}");
      if self.store.set_ear_pause_mode(mode).is_updated() {
         self.emit_property(Property::EarPauseMode);
      }
      Ok(mode)
   }
}

#[cfg(test)]
mod tests {
   use std::{
      io,
      sync::atomic::{AtomicBool, Ordering},
   };

   use tempfile::TempDir;
   use tokio::sync::Notify;

   use super::*;
   use crate::{
      airpods::protocol::{BatteryStatus, HEADER},
      bluetooth::l2cap::memory::{self, Peer},
      event::EventBus,
   };

   const ADDR: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   #[derive(Default)]
   struct FakeConnector {
      fail: AtomicBool,
      gate: Option<Arc<Notify>>,
      /// Applied to the link before the session sees it.
      send_error: Option<io::ErrorKind>,
      peer: Mutex<Option<Peer>>,
   }

   impl Connector for FakeConnector {
      fn connect(
         &self,
         jset: &mut JoinSet<()>,
         _address: Address,
      ) -> impl Future<Output = Result<(L2CapReceiver, L2CapSender)>> + Send {
         async move {
            if let Some(gate) = &self.gate {
               gate.notified().await;
            }
            if self.fail.load(Ordering::Relaxed) {
               return Err(AirPodsError::ConnectFailed(io::Error::from(
                  io::ErrorKind::ConnectionRefused,
               )));
            }
            let (rx, tx, peer) = memory::pair(jset);
            peer.fail_sends(self.send_error);
            *self.peer.lock() = Some(peer);
            Ok((rx, tx))
         }
      }
   }

   #[derive(Default)]
   struct RecordingBus(Mutex<Vec<AirPodsEvent>>);

   impl EventBus for RecordingBus {
      fn emit(&self, event: AirPodsEvent) {
         self.0.lock().push(event);
      }
   }

   impl RecordingBus {
      fn take(&self) -> Vec<AirPodsEvent> {
         std::mem::take(&mut *self.0.lock())
      }
   }

   const NO_DELAY: SessionOptions = SessionOptions {
      handshake_delay: Duration::ZERO,
      step_delay: Duration::ZERO,
   };

   struct Harness {
      session: Arc<LinkSession<FakeConnector>>,
      bus: Arc<RecordingBus>,
   }

   impl Harness {
      fn new(connector: FakeConnector) -> Self {
         Self::with_profiles(connector, None)
      }

      fn with_profiles(connector: FakeConnector, profiles: Option<ProfileStore>) -> Self {
         let bus = Arc::new(RecordingBus::default());
         let session = LinkSession::new(
            connector,
            Arc::new(StateStore::new()),
            bus.clone(),
            profiles,
            NO_DELAY,
         );
         Self { session, bus }
      }

      fn peer(&self) -> Peer {
         self.session.connector.peer.lock().take().unwrap()
      }

      async fn wait_for(&self, what: &str, cond: impl Fn(&LinkSession<FakeConnector>) -> bool) {
         for _ in 0..1000 {
            if cond(&self.session) {
               return;
            }
            tokio::task::yield_now().await;
         }
         panic!("timed out waiting for {what}");
      }
   }

   fn frame(body: &[u8]) -> Vec<u8> {
      let mut v = HEADER.to_vec();
      v.extend_from_slice(body);
      v
   }

   #[tokio::test]
   async fn test_connect_runs_init_sequence() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      assert_eq!(h.session.state(), LinkState::Connected);

      let mut peer = h.peer();
      let sent: Vec<Vec<u8>> = peer.sent().into_iter().map(|p| p.to_vec()).collect();
      assert_eq!(
         sent,
         vec![PKT_HANDSHAKE.to_vec(), PKT_SET_FEATURES.to_vec(), PKT_REQUEST_NOTIFY.to_vec()]
      );

      let state = h.session.store().snapshot();
      assert!(state.connected);
      assert_eq!(state.name, "Pods");
      assert_eq!(state.address, Some(ADDR));

      let events = h.bus.take();
      assert_eq!(
         events[0],
         AirPodsEvent::DeviceConnected {
            address: ADDR,
            name: "Pods".into()
         }
      );
      assert!(events.contains(&AirPodsEvent::PropertyChanged(Property::Connected)));
   }

   #[tokio::test]
   async fn test_connect_failure_returns_to_disconnected() {
      let h = Harness::new(FakeConnector {
         fail: AtomicBool::new(true),
         ..Default::default()
      });
      let err = h.session.connect(ADDR, "Pods").await.unwrap_err();
      assert!(matches!(err, AirPodsError::ConnectFailed(_)));
      assert_eq!(h.session.state(), LinkState::Disconnected);
      assert_eq!(h.session.address(), None);
      assert!(!h.session.store().is_connected());

      let events = h.bus.take();
      assert_eq!(events.len(), 1);
      assert!(matches!(&events[0], AirPodsEvent::ConnectionError(msg) if msg.contains("Failed to connect")));

      // A failed attempt never blocks the next one.
      h.session.connector.fail.store(false, Ordering::Relaxed);
      h.session.connect(ADDR, "Pods").await.unwrap();
      assert!(h.session.is_connected());
   }

   #[tokio::test]
   async fn test_connect_rejected_while_connecting_or_connected() {
      let gate = Arc::new(Notify::new());
      let h = Harness::new(FakeConnector {
         gate: Some(gate.clone()),
         ..Default::default()
      });

      let pending = {
         let session = h.session.clone();
         tokio::spawn(async move { session.connect(ADDR, "Pods").await })
      };
      h.wait_for("connecting", |s| s.state() == LinkState::Connecting)
         .await;

      let other = Address([0xaa; 6]);
      assert!(matches!(
         h.session.connect(other, "Other").await,
         Err(AirPodsError::AlreadyConnecting)
      ));
      assert_eq!(h.session.state(), LinkState::Connecting);
      assert_eq!(h.session.address(), Some(ADDR));

      gate.notify_one();
      pending.await.unwrap().unwrap();
      assert_eq!(h.session.state(), LinkState::Connected);

      assert!(matches!(
         h.session.connect(other, "Other").await,
         Err(AirPodsError::AlreadyConnecting)
      ));
      assert_eq!(h.session.state(), LinkState::Connected);
      assert_eq!(h.session.store().snapshot().name, "Pods");
   }

   #[tokio::test]
   async fn test_frames_update_store_in_order() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();
      h.bus.take();

      peer.push(&frame(&[0x04, 0x00, 0x02, 0x01, 0x00, 0x32, 0x01, 0x00, 0x02, 0x00, 0x64, 0x02, 0x00]))
         .await;
      peer.push(&frame(&[0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00])).await;
      peer.push(&frame(&[0x09, 0x00, 0x0d, 0x03, 0x00, 0x00, 0x00])).await;
      peer.push(&frame(&[0x06, 0x00, 0x00, 0x01])).await;
      h.wait_for("ear detection", |s| s.store().snapshot().ear_detection.left_in_ear)
         .await;

      let state = h.session.store().snapshot();
      assert_eq!(state.battery.left.level, Some(50));
      assert_eq!(state.battery.left.status, BatteryStatus::Charging);
      assert_eq!(state.battery.right.level, Some(100));
      assert_eq!(state.noise_mode, NoiseControlMode::Transparency);
      assert!(!state.ear_detection.right_in_ear);

      let events = h.bus.take();
      let noise: Vec<_> = events
         .iter()
         .filter_map(|e| match e {
            AirPodsEvent::NoiseControlChanged(m) => Some(*m),
            _ => None,
         })
         .collect();
      assert_eq!(noise, vec![NoiseControlMode::Anc, NoiseControlMode::Transparency]);
      assert!(matches!(events[0], AirPodsEvent::BatteryChanged(_)));
   }

   #[tokio::test]
   async fn test_bad_frames_keep_link_up() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();

      peer.push(&frame(&[0x04, 0x00, 0x00])).await;
      peer.push(&frame(&[0x77, 0x00])).await;
      peer.push(&[0x01, 0x00]).await;
      peer.push(&frame(&[0x09, 0x00, 0x28, 0x01, 0x00, 0x00, 0x00])).await;
      h.wait_for("conversational awareness", |s| {
         s.store().snapshot().conversational_awareness
      })
      .await;
      assert!(h.session.is_connected());
   }

   #[tokio::test]
   async fn test_metadata_sets_model() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();

      let mut data = frame(&[0x1d, 0x00, 0, 0, 0, 0, 0, 0]);
      data.extend_from_slice(b"Pods\0A2032\0Apple Inc.\0");
      peer.push(&data).await;
      h.wait_for("model", |s| s.store().snapshot().model == Model::AirPods2)
         .await;
      assert!(h.bus.take().contains(&AirPodsEvent::PropertyChanged(Property::DeviceModel)));
   }

   #[tokio::test]
   async fn test_peer_close_disconnects() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();
      peer.push(&frame(&[0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00])).await;
      h.bus.take();

      peer.close().await;
      h.wait_for("disconnect", |s| s.state() == LinkState::Disconnected)
         .await;

      let state = h.session.store().snapshot();
      assert!(!state.connected);
      assert_eq!(state.noise_mode, NoiseControlMode::Off);

      let events = h.bus.take();
      assert!(events.contains(&AirPodsEvent::DeviceDisconnected {
         address: ADDR,
         name: "Pods".into()
      }));
      assert!(!events.iter().any(|e| matches!(e, AirPodsEvent::ConnectionError(_))));
   }

   #[tokio::test]
   async fn test_transport_error_reports_and_disconnects() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();
      h.bus.take();

      let _ = peer
         .inbound
         .send(Err(AirPodsError::Io(io::Error::from(io::ErrorKind::ConnectionReset))))
         .await;
      h.wait_for("disconnect", |s| s.state() == LinkState::Disconnected)
         .await;

      let events = h.bus.take();
      assert!(matches!(events[0], AirPodsEvent::ConnectionError(_)));
      assert!(matches!(events[1], AirPodsEvent::DeviceDisconnected { .. }));
   }

   #[tokio::test]
   async fn test_disconnect_notifies_reset_properties() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();
      peer.push(&frame(&[0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00])).await;
      peer.push(&frame(&[0x06, 0x00, 0x00, 0x01])).await;
      h.wait_for("ear detection", |s| s.store().snapshot().ear_detection.left_in_ear)
         .await;
      h.bus.take();

      h.session.disconnect();
      let events = h.bus.take();
      assert_eq!(
         events,
         vec![
            AirPodsEvent::DeviceDisconnected {
               address: ADDR,
               name: "Pods".into()
            },
            AirPodsEvent::PropertyChanged(Property::Connected),
            AirPodsEvent::PropertyChanged(Property::DeviceName),
            AirPodsEvent::PropertyChanged(Property::DeviceAddress),
            AirPodsEvent::PropertyChanged(Property::NoiseControlMode),
            AirPodsEvent::PropertyChanged(Property::EarDetection),
         ]
      );
   }

   #[tokio::test]
   async fn test_send_link_loss_disconnects() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let peer = h.peer();
      h.bus.take();

      peer.fail_sends(Some(io::ErrorKind::BrokenPipe));
      let err = h.session.set_conversational_awareness(true).await.unwrap_err();
      assert!(matches!(err, AirPodsError::SendFailed(_)));
      assert_eq!(h.session.state(), LinkState::Disconnected);
      assert!(!h.session.store().is_connected());

      let events = h.bus.take();
      assert!(matches!(&events[0], AirPodsEvent::ConnectionError(msg) if msg.contains("Send failed")));
      assert!(matches!(events[1], AirPodsEvent::DeviceDisconnected { .. }));
   }

   #[tokio::test]
   async fn test_init_send_error_keeps_link() {
      let h = Harness::new(FakeConnector {
         send_error: Some(io::ErrorKind::Other),
         ..Default::default()
      });
      h.session.connect(ADDR, "Pods").await.unwrap();
      assert_eq!(h.session.state(), LinkState::Connected);
      assert!(h.session.store().is_connected());
      assert!(!h.bus.take().iter().any(|e| matches!(e, AirPodsEvent::ConnectionError(_))));
   }

   #[tokio::test]
   async fn test_link_loss_during_init_fails_connect() {
      let h = Harness::new(FakeConnector {
         send_error: Some(io::ErrorKind::ConnectionReset),
         ..Default::default()
      });
      assert!(matches!(
         h.session.connect(ADDR, "Pods").await,
         Err(AirPodsError::DeviceNotConnected)
      ));
      assert_eq!(h.session.state(), LinkState::Disconnected);
      assert!(h.bus.take().iter().any(|e| matches!(e, AirPodsEvent::ConnectionError(_))));
   }

   #[tokio::test]
   async fn test_disconnect_is_idempotent() {
      let h = Harness::new(FakeConnector::default());
      h.session.disconnect();
      assert!(h.bus.take().is_empty());

      h.session.connect(ADDR, "Pods").await.unwrap();
      h.bus.take();
      h.session.disconnect();
      h.session.disconnect();
      assert_eq!(h.session.state(), LinkState::Disconnected);

      let events = h.bus.take();
      let disconnects = events
         .iter()
         .filter(|e| matches!(e, AirPodsEvent::DeviceDisconnected { .. }))
         .count();
      assert_eq!(disconnects, 1);

      // The stale receive task must not touch the next connection.
      h.session.connect(ADDR, "Pods").await.unwrap();
      tokio::task::yield_now().await;
      assert!(h.session.is_connected());
   }

   #[tokio::test]
   async fn test_control_ops_require_connection() {
      let h = Harness::new(FakeConnector::default());
      assert!(matches!(
         h.session.set_noise_control_mode("anc").await,
         Err(AirPodsError::DeviceNotConnected)
      ));
      assert!(matches!(
         h.session.set_conversational_awareness(true).await,
         Err(AirPodsError::DeviceNotConnected)
      ));
      assert!(matches!(
         h.session.set_adaptive_noise_level(10).await,
         Err(AirPodsError::DeviceNotConnected)
      ));
      assert!(matches!(
         h.session.set_listening_modes(false, true, true, false).await,
         Err(AirPodsError::DeviceNotConnected)
      ));

      // Ear pause mode is local.
      assert_eq!(h.session.set_ear_pause_mode(2).unwrap(), 2);
      assert_eq!(h.session.store().snapshot().ear_pause_mode, 2);
      assert!(matches!(
         h.session.set_ear_pause_mode(3),
         Err(AirPodsError::InvalidArgument(_))
      ));
      assert!(matches!(
         h.session.set_ear_pause_mode(-1),
         Err(AirPodsError::InvalidArgument(_))
      ));
   }

   #[tokio::test]
   async fn test_control_ops_send_frames() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let mut peer = h.peer();
      peer.sent();

      assert_eq!(
         h.session.set_noise_control_mode("transparent").await.unwrap(),
         NoiseControlMode::Transparency
      );
      h.session.set_conversational_awareness(false).await.unwrap();
      h.session.set_adaptive_noise_level(150).await.unwrap();
      h.session.set_listening_modes(true, false, true, false).await.unwrap();

      let sent = peer.sent();
      assert_eq!(sent.len(), 4);
      assert_eq!(sent[0].as_slice(), &build_noise_control_cmd(NoiseControlMode::Transparency));
      assert_eq!(&sent[1][6..8], &[0x28, 0x02]);
      assert_eq!(&sent[2][6..8], &[0x2e, 100]);
      assert_eq!(&sent[3][6..8], &[0x1a, 0x05]);

      let state = h.session.store().snapshot();
      assert_eq!(state.adaptive_noise_level, 100);
      assert_eq!(state.listening_modes.bits(), 0x05);
      // Noise mode follows the accessory's echo, not the request.
      assert_eq!(state.noise_mode, NoiseControlMode::Off);
   }

   #[tokio::test]
   async fn test_listening_modes_need_two() {
      let h = Harness::new(FakeConnector::default());
      h.session.connect(ADDR, "Pods").await.unwrap();
      let mut peer = h.peer();
      peer.sent();

      for (off, t, anc, adaptive) in [
         (false, false, false, false),
         (true, false, false, false),
         (false, false, false, true),
      ] {
         assert!(matches!(
            h.session.set_listening_modes(off, t, anc, adaptive).await,
            Err(AirPodsError::InvalidArgument(_))
         ));
      }
      assert!(peer.sent().is_empty());
      assert_eq!(h.session.store().snapshot().listening_modes, ListeningModes::default());
   }

   #[tokio::test]
   async fn test_profile_restored_on_connect() {
      let dir = TempDir::new().unwrap();
      let profiles = ProfileStore::open_at(&dir.path().join("profiles.db")).unwrap();
      profiles
         .update(ADDR, |p| {
            p.listening_modes = Some(ListeningModes::new(true, true, false, false));
            p.adaptive_level = Some(20);
            p.noise_mode = Some(NoiseControlMode::Anc);
         })
         .unwrap();

      let h = Harness::with_profiles(FakeConnector::default(), Some(profiles.clone()));
      h.session.connect(ADDR, "Pods").await.unwrap();
      let state = h.session.store().snapshot();
      assert_eq!(state.listening_modes.bits(), 0x03);
      assert_eq!(state.adaptive_noise_level, 20);

      let events = h.bus.take();
      assert!(events.contains(&AirPodsEvent::PropertyChanged(Property::ListeningModes)));
      assert!(events.contains(&AirPodsEvent::PropertyChanged(Property::AdaptiveNoiseLevel)));

      // Preferred noise mode follows the init sequence.
      let mut peer = h.peer();
      let sent = peer.sent();
      assert_eq!(sent.len(), 4);
      assert_eq!(sent[3].as_slice(), &build_noise_control_cmd(NoiseControlMode::Anc));

      h.session.set_adaptive_noise_level(35).await.unwrap();
      let profile = profiles.get(ADDR).unwrap().unwrap();
      assert_eq!(profile.adaptive_level, Some(35));
      assert_eq!(profile.display_name, "Pods");
   }
}
