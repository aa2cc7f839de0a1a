//! Media pause/resume on ear detection.
//!
//! [`EarPausePolicy`] turns ear detection updates into pause/resume
//! decisions; [`MprisController`] carries them out against MPRIS players on
//! the session bus, resuming only the players it paused itself.

use log::{debug, info, warn};
use zbus::{Connection, fdo::DBusProxy, proxy, proxy::CacheProperties};

use crate::config::{EAR_PAUSE_BOTH_OUT, EAR_PAUSE_DISABLED, EAR_PAUSE_ONE_OUT};

const MPRIS_NAME_PREFIX: &str = "org.mpris.MediaPlayer2.";

#[proxy(
   interface = "org.mpris.MediaPlayer2.Player",
   default_path = "/org/mpris/MediaPlayer2"
)]
trait MediaPlayer {
   fn pause(&self) -> zbus::Result<()>;
   fn play(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn playback_status(&self) -> zbus::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
   Pause,
   Resume,
}

/// Edge detector over ear presence.
///
/// The first observation after construction or [`reset`](Self::reset) only
/// primes the detector.
#[derive(Debug, Default)]
pub struct EarPausePolicy {
   prev: Option<(bool, bool)>,
}

/// Returns `(pods_out, pods_in)` for `mode`, or `None` when disabled.
fn classify(mode: u8, left: bool, right: bool) -> Option<(bool, bool)> {
   match mode {
      EAR_PAUSE_DISABLED => None,
      EAR_PAUSE_ONE_OUT => Some((!left || !right, left && right)),
      EAR_PAUSE_BOTH_OUT => Some((!left && !right, left || right)),
      _ => None,
   }
}

impl EarPausePolicy {
   pub fn observe(&mut self, mode: u8, left_in_ear: bool, right_in_ear: bool) -> Option<MediaAction> {
      let (out, _) = classify(mode, left_in_ear, right_in_ear)?;
      let prev = self.prev.replace((left_in_ear, right_in_ear))?;
      let (prev_out, _) = classify(mode, prev.0, prev.1)?;
      let (_, now_in) = classify(mode, left_in_ear, right_in_ear)?;

      if !prev_out && out {
         Some(MediaAction::Pause)
      } else if prev_out && now_in {
         Some(MediaAction::Resume)
      } else {
         None
      }
   }

   pub fn reset(&mut self) {
      self.prev = None;
   }
}

/// Pauses and resumes MPRIS players over D-Bus.
pub struct MprisController {
   conn: Connection,
   policy: EarPausePolicy,
   paused: Vec<String>,
}

impl MprisController {
   pub fn new(conn: Connection) -> Self {
      Self {
         conn,
         policy: EarPausePolicy::default(),
         paused: Vec::new(),
      }
   }

   /// Feeds one ear detection update through the policy and acts on it.
   pub async fn on_ear_detection(&mut self, mode: u8, left_in_ear: bool, right_in_ear: bool) {
      match self.policy.observe(mode, left_in_ear, right_in_ear) {
         Some(MediaAction::Pause) => {
            info!("Pods removed, pausing media");
            self.pause_all().await;
         },
         Some(MediaAction::Resume) => {
            info!("Pods inserted, resuming media");
            self.resume().await;
         },
         None => {},
      }
   }

   /// Forgets the last ear state and the players paused so far.
   pub fn reset(&mut self) {
      self.policy.reset();
      self.paused.clear();
   }

   async fn player(&self, name: &str) -> zbus::Result<MediaPlayerProxy<'static>> {
      MediaPlayerProxy::builder(&self.conn)
         .destination(name.to_owned())?
         .cache_properties(CacheProperties::No)
         .build()
         .await
   }

   async fn players(&self) -> zbus::Result<Vec<String>> {
      let names = DBusProxy::new(&self.conn).await?.list_names().await?;
      Ok(names
         .into_iter()
         .map(|n| n.to_string())
         .filter(|n| n.starts_with(MPRIS_NAME_PREFIX))
         .collect())
   }

   /// Pauses every playing player and remembers which ones it paused.
   pub async fn pause_all(&mut self) {
      self.paused.clear();
      let players = match self.players().await {
         Ok(players) => players,
         Err(e) => {
            warn!("Failed to list D-Bus names: {e}");
            return;
         },
      };

      for name in players {
         let Ok(player) = self.player(&name).await else {
            continue;
         };
         match player.playback_status().await {
            Ok(status) if status == "Playing" => {},
            Ok(_) => continue,
            Err(e) => {
               debug!("Failed to get playback status from {name}: {e}");
               continue;
            },
         }
         match player.pause().await {
            Ok(()) => {
               info!("Paused media player: {name}");
               self.paused.push(name);
            },
            Err(e) => debug!("Failed to pause {name}: {e}"),
         }
      }
   }

   /// Resumes the players paused by the last [`pause_all`](Self::pause_all).
   pub async fn resume(&mut self) {
      for name in std::mem::take(&mut self.paused) {
         let result = match self.player(&name).await {
            Ok(player) => player.play().await,
            Err(e) => Err(e),
         };
         match result {
            Ok(()) => info!("Resumed media player: {name}"),
            Err(e) => debug!("Failed to play {name}: {e}"),
         }
      }
   }
}
