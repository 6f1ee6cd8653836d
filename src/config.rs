//! Configuration management for the connectivity daemon.
//!
//! This module handles loading and saving configuration from disk. Every
//! field falls back to its default when absent from the file.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   audio::AudioTimings,
   cache::DEFAULT_TTL,
   command::DEFAULT_COMMAND_TIMEOUT,
   error::{Error, Result},
   retry::RetryPolicy,
};

/// Which Bluetooth backend to drive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BluetoothBackend {
   /// The daemon when reachable, `bluetoothctl` otherwise.
   #[default]
   Auto,
   Bluez,
   Bluetoothctl,
}

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
   #[serde(default = "default_command_timeout")]
   pub command_timeout_ms: u64,

   #[serde(default = "default_cache_ttl")]
   pub cache_ttl_ms: u64,

   #[serde(default)]
   pub bluetooth_backend: BluetoothBackend,

   #[serde(default = "default_init_attempts")]
   pub init_retry_attempts: u32,

   #[serde(default = "default_init_delay")]
   pub init_retry_delay_ms: u64,

   #[serde(default = "default_init_deadline")]
   pub init_retry_deadline_ms: u64,

   #[serde(default = "default_connect_settle")]
   pub connect_settle_ms: u64,

   #[serde(default = "default_async_settle")]
   pub async_settle_ms: u64,

   #[serde(default = "default_audio_register_delay")]
   pub audio_register_delay_ms: u64,

   #[serde(default = "default_audio_retry_delay")]
   pub audio_retry_delay_ms: u64,

   #[serde(default = "default_max_in_flight")]
   pub max_in_flight: usize,

   #[serde(default = "default_notification_title")]
   pub notification_title: String,

   /// Overrides where the last chosen sink is remembered.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub sink_state_file: Option<PathBuf>,
}

const fn default_command_timeout() -> u64 {
   DEFAULT_COMMAND_TIMEOUT.as_secs() * 1000
}

const fn default_cache_ttl() -> u64 {
   DEFAULT_TTL.as_secs() * 1000
}

const fn default_init_attempts() -> u32 {
   3
}

const fn default_init_delay() -> u64 {
   500
}

const fn default_init_deadline() -> u64 {
   10_000
}

const fn default_connect_settle() -> u64 {
   2000
}

const fn default_async_settle() -> u64 {
   1000
}

const fn default_audio_register_delay() -> u64 {
   1000
}

const fn default_audio_retry_delay() -> u64 {
   2000
}

const fn default_max_in_flight() -> usize {
   4
}

fn default_notification_title() -> String {
   "Better Control".to_string()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         command_timeout_ms: default_command_timeout(),
         cache_ttl_ms: default_cache_ttl(),
         bluetooth_backend: BluetoothBackend::default(),
         init_retry_attempts: default_init_attempts(),
         init_retry_delay_ms: default_init_delay(),
         init_retry_deadline_ms: default_init_deadline(),
         connect_settle_ms: default_connect_settle(),
         async_settle_ms: default_async_settle(),
         audio_register_delay_ms: default_audio_register_delay(),
         audio_retry_delay_ms: default_audio_retry_delay(),
         max_in_flight: default_max_in_flight(),
         notification_title: default_notification_title(),
         sink_state_file: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("CONNECTD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("connectd").join("config.toml"))
   }

   pub const fn command_timeout(&self) -> Duration {
      Duration::from_millis(self.command_timeout_ms)
   }

   pub const fn cache_ttl(&self) -> Duration {
      Duration::from_millis(self.cache_ttl_ms)
   }

   pub const fn connect_settle(&self) -> Duration {
      Duration::from_millis(self.connect_settle_ms)
   }

   pub const fn async_settle(&self) -> Duration {
      Duration::from_millis(self.async_settle_ms)
   }

   pub const fn init_retry(&self) -> RetryPolicy {
      RetryPolicy::new(
         self.init_retry_attempts,
         Duration::from_millis(self.init_retry_delay_ms),
         Duration::from_millis(self.init_retry_deadline_ms),
      )
   }

   pub const fn audio_timings(&self) -> AudioTimings {
      AudioTimings {
         register_delay: Duration::from_millis(self.audio_register_delay_ms),
         retry_delay: Duration::from_millis(self.audio_retry_delay_ms),
      }
   }

   /// File holding the last chosen sink, `None` when no location is known.
   pub fn sink_state_path(&self) -> Option<PathBuf> {
      self
         .sink_state_file
         .clone()
         .or_else(|| dirs::config_dir().map(|dir| dir.join("pulse").join("default-sink")))
   }
}
