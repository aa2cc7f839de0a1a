//! Error types for the `AirPods` service.
//!
//! This module defines the daemon-wide error type. Frame decoding has its
//! own taxonomy in [`crate::airpods::parser::ParseError`] and the profile
//! store in [`crate::profile::Error`].

use thiserror::Error;

use crate::profile;

/// Main error type for the `AirPods` service.
#[derive(Error, Debug)]
pub enum AirPodsError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Connect failed: {0}")]
   ConnectFailed(std::io::Error),

   #[error("Send failed: {0}")]
   SendFailed(std::io::Error),

   #[error("Connection closed by peer")]
   PeerClosed,

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Profile store error: {0}")]
   Profile(#[from] profile::Error),
}

impl AirPodsError {
   /// Whether the error means the link is gone and the session should drop
   /// to `Disconnected`.
   pub fn is_link_loss(&self) -> bool {
      use std::io::ErrorKind;
      match self {
         Self::PeerClosed | Self::DeviceNotConnected => true,
         Self::Io(e) | Self::SendFailed(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionReset
               | ErrorKind::ConnectionAborted
               | ErrorKind::BrokenPipe
               | ErrorKind::NotConnected
               | ErrorKind::UnexpectedEof
         ),
         _ => false,
      }
   }
}

/// Convenience type alias for Results with `AirPodsError`.
pub type Result<T> = std::result::Result<T, AirPodsError>;
