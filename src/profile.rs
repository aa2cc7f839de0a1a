//! Persistent per-device profiles using heed (LMDB).
//!
//! A profile remembers the user's settings for one accessory (preferred
//! noise mode, listening-mode set, adaptive level, display name) so they can
//! be restored the next time it connects.

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
   time::SystemTime,
};

use bluer::Address;
use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::debug;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::airpods::protocol::{ListeningModes, NoiseControlMode};

/// Errors that can occur in profile store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create profile directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = Address;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = Address;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid address",
         )));
      };
      Ok(Address(s))
   }
}

fn unix_now() -> u64 {
   SystemTime::UNIX_EPOCH
      .elapsed()
      .map_or(0, |d| d.as_secs())
}

/// Settings remembered for one accessory.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
   pub display_name: SmolStr,
   pub noise_mode: Option<NoiseControlMode>,
   pub listening_modes: Option<ListeningModes>,
   pub adaptive_level: Option<u8>,
   /// Unix timestamp of the last connection
   pub last_seen: u64,
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// MAC address -> `DeviceProfile`
   profiles: Database<KeyCodec, SerdeBincode<DeviceProfile>>,
}

/// Thread-safe handle to the profile database.
#[derive(Clone, Debug)]
pub struct ProfileStore {
   db: Arc<Db>,
}

impl ProfileStore {
   /// Opens or creates the profile database at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   /// Opens or creates the profile database in `path`.
   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let profiles = env
         .create_database(&mut wtxn, Some("profiles"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Opened profile store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, profiles }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("AIRPODS_PROFILE_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/airpodsd/profiles.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("airpodsd").join("profiles.db"))
   }

   #[cfg(test)]
   pub fn get(&self, address: Address) -> Result<Option<DeviceProfile>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      self
         .db
         .profiles
         .get(&rtxn, &address)
         .map_err(Error::DatabaseOperation)
   }

   /// Applies `f` to the stored profile (or a default one) and writes it back
   /// in a single transaction.
   pub fn update<F>(&self, address: Address, f: F) -> Result<DeviceProfile>
   where
      F: FnOnce(&mut DeviceProfile),
   {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;

      let mut profile = self
         .db
         .profiles
         .get(&wtxn, &address)
         .map_err(Error::DatabaseOperation)?
         .unwrap_or_default();
      f(&mut profile);

      self
         .db
         .profiles
         .put(&mut wtxn, &address, &profile)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      Ok(profile)
   }

   /// Records a connection: refreshes the display name and `last_seen`.
   pub fn touch(&self, address: Address, name: &str) -> Result<DeviceProfile> {
      self.update(address, |p| {
         if !name.is_empty() {
            p.display_name = name.into();
         }
         p.last_seen = unix_now();
      })
   }
}
