//! Error types for the connectivity service.
//!
//! This module defines the crate-level error type shared by the bus layer,
//! the audio router and the configuration loader. Executor and retry
//! failures keep their own enums next to their producers.

use smol_str::SmolStr;
use thiserror::Error;

use crate::{command::CommandError, retry::RetryError};

/// Main error type for the connectivity service.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus call error: {0}")]
   DBusCall(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Command error: {0}")]
   Command(#[from] CommandError),

   #[error("Audio server error: {0}")]
   AudioServer(String),

   #[error("Audio {kind} '{name}' is not available")]
   RouteNotFound { kind: &'static str, name: SmolStr },

   #[error("Failed to route audio {kind} to '{name}': {reason}")]
   RouteFailed {
      kind: &'static str,
      name: SmolStr,
      reason: String,
   },

   #[error("Gave up after {0:?}")]
   DeadlineExceeded(std::time::Duration),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Too many operations in flight")]
   Busy,

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Bluetooth is not supported on this system")]
   NotSupported,
}

impl<E: Into<Self>> From<RetryError<E>> for Error {
   fn from(err: RetryError<E>) -> Self {
      match err {
         RetryError::Operation(e) => e.into(),
         RetryError::DeadlineExceeded(after) => Self::DeadlineExceeded(after),
      }
   }
}

/// Convenience type alias for Results with the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
