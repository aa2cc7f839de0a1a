//! Accessory discovery.
//!
//! Polls the `BlueZ` adapters for a connected accessory, hands it to the
//! [`LinkSession`] and tears the session down when the accessory goes away.
//! Failed connection attempts back off exponentially with jitter.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::{AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::recognition,
   bluetooth::session::{LinkSession, LinkState},
   config::Config,
   error::Result,
};

/// Maximum delay between two connection attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Computes the wait before attempt `retry_count + 1`.
pub fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

/// Retry bookkeeping for connection attempts.
#[derive(Debug, Default)]
pub struct Backoff {
   failures: u32,
   not_before: Option<Instant>,
}

impl Backoff {
   pub fn ready(&self, now: Instant) -> bool {
      self.not_before.is_none_or(|t| now >= t)
   }

   pub fn record_failure(&mut self, now: Instant) -> Duration {
      let delay = calc_retry_delay(self.failures);
      self.failures = self.failures.saturating_add(1);
      self.not_before = Some(now + delay);
      delay
   }

   pub fn reset(&mut self) {
      *self = Self::default();
   }

   pub const fn failures(&self) -> u32 {
      self.failures
   }
}

/// Drives [`LinkSession::connect`] and [`LinkSession::disconnect`] from the
/// Bluetooth adapter state.
pub struct Discovery {
   session: Arc<LinkSession>,
   config: Config,
   backoff: Backoff,
}

impl Discovery {
   pub fn new(session: Arc<LinkSession>, config: Config) -> Self {
      Self {
         session,
         config,
         backoff: Backoff::default(),
      }
   }

   pub async fn run(mut self) -> Result<()> {
      let bt = Session::new().await?;
      let adapter = bt.default_adapter().await?;
      info!("Discovery running on adapter {}", adapter.name());

      let mut adapter_events = adapter.events().await?;
      let (attempt_tx, mut attempt_rx) = mpsc::channel::<(Address, Result<()>)>(4);

      let mut poll = time::interval(Duration::from_secs(self.config.poll_interval));
      poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = poll.tick() => {
               self.poll_adapter(&adapter, &attempt_tx).await;
            }
            Some((address, result)) = attempt_rx.recv() => {
               match result {
                  Ok(()) => self.backoff.reset(),
                  Err(e) => {
                     let delay = self.backoff.record_failure(Instant::now());
                     warn!(
                        "Connection to {address} failed ({e}), attempt {} - retrying in {delay:?}",
                        self.backoff.failures()
                     );
                  },
               }
            }
            event = adapter_events.next() => {
               match event {
                  Some(AdapterEvent::DeviceRemoved(addr)) => {
                     if self.session.address() == Some(addr) {
                        info!("{addr} removed from adapter");
                        self.session.disconnect();
                     }
                  },
                  Some(_) => {},
                  None => {
                     warn!("Adapter event stream ended");
                     break;
                  },
               }
            }
         }
      }
      self.session.disconnect();
      Ok(())
   }

   async fn poll_adapter(
      &mut self,
      adapter: &bluer::Adapter,
      attempt_tx: &mpsc::Sender<(Address, Result<()>)>,
   ) {
      // Managed peer still attached?
      if let Some(addr) = self.session.address() {
         if self.session.state() == LinkState::Connected {
            let attached = match adapter.device(addr) {
               Ok(dev) => dev.is_connected().await.unwrap_or(false),
               Err(_) => false,
            };
            if !attached {
               info!("{addr} detached, closing session");
               self.session.disconnect();
            }
         }
         return;
      }

      if !self.backoff.ready(Instant::now()) {
         return;
      }

      let Ok(addresses) = adapter.device_addresses().await else {
         return;
      };
      for addr in addresses {
         let Ok(device) = adapter.device(addr) else {
            continue;
         };
         if !device.is_connected().await.unwrap_or(false) {
            continue;
         }
         let Some(name) = self.recognize(&device).await else {
            continue;
         };

         debug!("Found connected accessory {name} ({addr})");
         let session = self.session.clone();
         let tx = attempt_tx.clone();
         tokio::spawn(async move {
            let result = session.connect(addr, &name).await;
            let _ = tx.send((addr, result)).await;
         });
         return;
      }
   }

   /// Returns the display name when `device` is an accessory we manage.
   async fn recognize(&self, device: &bluer::Device) -> Option<SmolStr> {
      let addr = device.address();
      if let Some(name) = self.config.is_known_device(&addr.to_string()) {
         return Some(name.into());
      }
      if !recognition::is_device_airpods(device).await {
         return None;
      }
      let name = match device.alias().await {
         Ok(alias) => alias,
         Err(_) => device.name().await.ok().flatten().unwrap_or_default(),
      };
      Some(name.into())
   }
}
