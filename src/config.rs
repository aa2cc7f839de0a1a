//! Configuration management for the `AirPods` service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices, connection timing and the ear-pause policy.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{AirPodsError, Result};

/// Ear-pause modes.
pub const EAR_PAUSE_DISABLED: u8 = 0;
pub const EAR_PAUSE_ONE_OUT: u8 = 1;
pub const EAR_PAUSE_BOTH_OUT: u8 = 2;
/// Highest accepted ear-pause mode.
pub const EAR_PAUSE_MODE_MAX: u8 = EAR_PAUSE_BOTH_OUT;

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// 0 = disabled, 1 = pause when one pod leaves, 2 = pause when both leave
   #[serde(default = "default_ear_pause_mode")]
   pub ear_pause_mode: u8,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Seconds between adapter polls during discovery
   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   /// Delay before the handshake frame after the link comes up
   #[serde(default = "default_handshake_delay_ms")]
   pub handshake_delay_ms: u64,

   /// Delay between the remaining initialization frames
   #[serde(default = "default_handshake_step_delay_ms")]
   pub handshake_step_delay_ms: u64,

   /// Pause and resume media players on ear detection changes
   #[serde(default = "default_media_control")]
   pub media_control: bool,
}

/// Represents a known `AirPods` device.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_ear_pause_mode() -> u8 {
   EAR_PAUSE_ONE_OUT
}

const fn default_poll_interval() -> u64 {
   5
}

const fn default_handshake_delay_ms() -> u64 {
   100
}

const fn default_handshake_step_delay_ms() -> u64 {
   50
}

const fn default_media_control() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         ear_pause_mode: default_ear_pause_mode(),
         known_devices: vec![],
         poll_interval: default_poll_interval(),
         handshake_delay_ms: default_handshake_delay_ms(),
         handshake_step_delay_ms: default_handshake_step_delay_ms(),
         media_control: default_media_control(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         let mut config: Self = toml::from_str(&contents)?;
         config.normalize();
         Ok(config)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(airpods_home) = env::var("AIRPODS_HOME") {
         PathBuf::from(airpods_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(AirPodsError::ConfigDirNotFound);
      };

      Ok(config_dir.join("airpodsd").join("config.toml"))
   }

   /// Replaces out-of-range values with their defaults.
   fn normalize(&mut self) {
      if self.ear_pause_mode > EAR_PAUSE_MODE_MAX {
         warn!(
            "Invalid ear_pause_mode {} in config, using {}",
            self.ear_pause_mode,
            default_ear_pause_mode()
         );
         self.ear_pause_mode = default_ear_pause_mode();
      }
      if self.poll_interval == 0 {
         self.poll_interval = default_poll_interval();
      }
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   #[test]
   fn test_load_creates_default() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("airpodsd").join("config.toml");
      let config = Config::load_from(&path)?;
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(config.ear_pause_mode, EAR_PAUSE_ONE_OUT);
      assert_eq!(config.handshake_delay_ms, 100);
      assert_eq!(config.handshake_step_delay_ms, 50);
      Ok(())
   }

   #[test]
   fn test_partial_file_uses_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "ear_pause_mode = 2\n\n[[known_devices]]\naddress = \"AA:BB:CC:DD:EE:FF\"\nname = \"Pods\"\n",
      )?;
      let config = Config::load_from(&path)?;
      assert_eq!(config.ear_pause_mode, 2);
      assert_eq!(config.poll_interval, 5);
      assert!(config.media_control);
      assert_eq!(config.is_known_device("aa:bb:cc:dd:ee:ff"), Some("Pods"));
      assert_eq!(config.is_known_device("00:00:00:00:00:00"), None);
      Ok(())
   }

   #[test]
   fn test_out_of_range_ear_pause_mode() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "ear_pause_mode = 7\n")?;
      assert_eq!(Config::load_from(&path)?.ear_pause_mode, EAR_PAUSE_ONE_OUT);
      assert_eq!(crate::airpods::state::DeviceState::default().ear_pause_mode, EAR_PAUSE_ONE_OUT);
      Ok(())
   }

   #[test]
   fn test_save_round_trip() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      let config = Config {
         ear_pause_mode: 0,
         media_control: false,
         ..Config::default()
      };
      config.save_to(&path)?;
      assert_eq!(Config::load_from(&path)?, config);
      Ok(())
   }

   #[test]
   fn test_garbage_is_an_error() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "ear_pause_mode = \"loud\"").unwrap();
      assert!(matches!(
         Config::load_from(&path),
         Err(AirPodsError::TomlParse(_))
      ));
   }
}
