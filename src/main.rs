//! `AirPods` accessory daemon.
//!
//! Keeps one Bluetooth control link to a connected accessory, decodes its
//! status frames and exposes the resulting device state and control
//! operations over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use airpods::state::StateStore;
use bluetooth::{
   discovery::Discovery,
   session::{L2CapConnector, LinkSession, SessionOptions},
};
use dbus::{DeviceService, OBJECT_PATH, SERVICE_NAME};
use event::{AirPodsEvent, EventBus, Property};
use media::MprisController;
use profile::ProfileStore;

mod airpods;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod media;
mod profile;

use crate::{dbus::DeviceServiceSignals, error::Result};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting airpodsd...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices, ear pause mode {}",
      config.known_devices.len(),
      config.ear_pause_mode
   );

   let profiles = match ProfileStore::open() {
      Ok(store) => Some(store),
      Err(e) => {
         warn!("Device profiles unavailable: {e}");
         None
      },
   };

   let store = Arc::new(StateStore::new());
   store.set_ear_pause_mode(config.ear_pause_mode);

   let event_bus = EventProcessor::new();
   let session = LinkSession::new(
      L2CapConnector,
      store.clone(),
      event_bus.clone(),
      profiles,
      SessionOptions::from_config(&config),
   );

   let media_control = config.media_control;
   let discovery = Discovery::new(session.clone(), config.clone());
   let service = DeviceService::new(session.clone(), Arc::new(Mutex::new(config)));

   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("airpodsd D-Bus service started at {SERVICE_NAME}");

   let media = media_control.then(|| MprisController::new(connection.clone()));
   event_bus.spawn_dispatcher(connection, store, media).await?;

   tokio::spawn(async move {
      if let Err(e) = discovery.run().await {
         error!("Discovery stopped: {e}");
      }
   });

   signal::ctrl_c().await?;
   info!("Shutting down airpodsd...");
   session.disconnect();

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<AirPodsEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<AirPodsEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      connection: Connection,
      store: Arc<StateStore>,
      media: Option<MprisController>,
   ) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, DeviceService>(OBJECT_PATH)
         .await?;
      let mut dispatcher = Dispatcher { iface, store, media };
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = dispatcher.dispatch(event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: AirPodsEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

/// Turns session events into D-Bus signals and property notifications.
struct Dispatcher {
   iface: InterfaceRef<DeviceService>,
   store: Arc<StateStore>,
   media: Option<MprisController>,
}

impl Dispatcher {
   async fn dispatch(&mut self, event: AirPodsEvent) -> Result<()> {
      let iface = &self.iface;
      match event {
         AirPodsEvent::DeviceConnected { address, name } => {
            iface.device_connected(&address.to_string(), &name).await?;
         },
         AirPodsEvent::DeviceDisconnected { address, name } => {
            if let Some(media) = &mut self.media {
               media.reset();
            }
            iface.device_disconnected(&address.to_string(), &name).await?;
         },
         AirPodsEvent::BatteryChanged(battery) => {
            iface
               .battery_changed(
                  battery.left.level_or_neg(),
                  battery.right.level_or_neg(),
                  battery.case.level_or_neg(),
               )
               .await?;
            self.property_changed(Property::Battery).await?;
         },
         AirPodsEvent::NoiseControlChanged(mode) => {
            iface.noise_mode_signal(mode.to_str()).await?;
            self.property_changed(Property::NoiseControlMode).await?;
         },
         AirPodsEvent::EarDetectionChanged(status) => {
            iface
               .ear_detection_changed(status.left_in_ear, status.right_in_ear)
               .await?;
            self.property_changed(Property::EarDetection).await?;
            if let Some(media) = &mut self.media {
               let mode = self.store.snapshot().ear_pause_mode;
               media
                  .on_ear_detection(mode, status.left_in_ear, status.right_in_ear)
                  .await;
            }
         },
         AirPodsEvent::PropertyChanged(property) => self.property_changed(property).await?,
         AirPodsEvent::ConnectionError(message) => {
            iface.device_error(&message).await?;
         },
      }
      Ok(())
   }

   async fn property_changed(&self, property: Property) -> Result<()> {
      let service = self.iface.get().await;
      let emitter = self.iface.signal_emitter();
      match property {
         Property::Connected => service.connected_changed(emitter).await?,
         Property::DeviceName => service.device_name_changed(emitter).await?,
         Property::DeviceAddress => service.device_address_changed(emitter).await?,
         Property::DeviceModel => {
            service.device_model_changed(emitter).await?;
            service.is_headphones_changed(emitter).await?;
            service.supports_a_n_c_changed(emitter).await?;
            service.supports_adaptive_changed(emitter).await?;
         },
         Property::Battery => {
            service.battery_left_changed(emitter).await?;
            service.battery_right_changed(emitter).await?;
            service.battery_case_changed(emitter).await?;
            service.charging_left_changed(emitter).await?;
            service.charging_right_changed(emitter).await?;
            service.charging_case_changed(emitter).await?;
         },
         Property::NoiseControlMode => service.noise_control_mode_changed(emitter).await?,
         Property::EarDetection => {
            service.left_in_ear_changed(emitter).await?;
            service.right_in_ear_changed(emitter).await?;
         },
         Property::ConversationalAwareness => {
            service.conversational_awareness_changed(emitter).await?;
         },
         Property::AdaptiveNoiseLevel => service.adaptive_noise_level_changed(emitter).await?,
         Property::ListeningModes => {
            service.listening_mode_off_changed(emitter).await?;
            service.listening_mode_transparency_changed(emitter).await?;
            service.listening_mode_a_n_c_changed(emitter).await?;
            service.listening_mode_adaptive_changed(emitter).await?;
         },
         Property::EarPauseMode => service.ear_pause_mode_changed(emitter).await?,
      }
      Ok(())
   }
}
