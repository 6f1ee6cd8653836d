//! Device, network and audio endpoint records.
//!
//! Records are rebuilt from the live source on every query and never
//! persisted.

use serde::Serialize;
use smol_str::SmolStr;

/// Battery state of a Bluetooth device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "percent", rename_all = "snake_case")]
pub enum BatteryReading {
   /// Reported level, 0-100.
   Level(u8),
   /// The device does not expose a battery.
   #[default]
   NotSupported,
   /// The battery could not be queried.
   Failed,
}

impl BatteryReading {
   pub const fn level(self) -> Option<u8> {
      match self {
         Self::Level(level) => Some(level),
         _ => None,
      }
   }
}

/// A Bluetooth device, keyed by its hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
   pub address: SmolStr,
   pub name: SmolStr,
   pub connected: bool,
   pub paired: bool,
   pub trusted: bool,
   /// Icon/class tag such as `audio-headset`.
   pub device_type: SmolStr,
   /// Daemon object path, present only while the daemon enumerates it.
   pub object_path: Option<SmolStr>,
   pub battery: BatteryReading,
   pub rssi: Option<i16>,
   pub error: Option<String>,
}

impl Device {
   pub fn new(address: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
      Self {
         address: address.into(),
         name: name.into(),
         connected: false,
         paired: false,
         trusted: false,
         device_type: SmolStr::new_static("unknown"),
         object_path: None,
         battery: BatteryReading::NotSupported,
         rssi: None,
         error: None,
      }
   }

   /// Copies everything a detail query knows onto a listing record.
   pub fn merge_details(&mut self, details: &Self) {
      self.connected = details.connected;
      self.paired = details.paired;
      self.trusted = details.trusted;
      self.device_type = details.device_type.clone();
      self.battery = details.battery;
      self.rssi = details.rssi;
      if details.object_path.is_some() {
         self.object_path = details.object_path.clone();
      }
   }

   pub fn friendly_type(&self) -> &'static str {
      match self.device_type.as_str() {
         "audio-headset" => "Headset",
         "audio-headphones" => "Headphones",
         "audio-card" => "Speaker",
         "input-keyboard" => "Keyboard",
         "input-mouse" => "Mouse",
         "input-gaming" => "Game Controller",
         "phone" => "Phone",
         "unknown" => "Device",
         _ => "Bluetooth Device",
      }
   }
}

/// Wi-Fi security classification.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   strum::Display,
   strum::EnumString,
)]
pub enum Security {
   Open,
   #[strum(serialize = "WEP")]
   Wep,
   #[strum(serialize = "WPA")]
   Wpa,
   #[strum(serialize = "WPA2")]
   Wpa2,
   #[strum(serialize = "WPA3")]
   Wpa3,
   #[default]
   Unknown,
}

/// A visible or saved Wi-Fi network, keyed by SSID.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Network {
   pub ssid: SmolStr,
   /// 0-100.
   pub signal: u8,
   pub security: Security,
   pub in_use: bool,
   /// GHz, one decimal place.
   pub frequency: Option<f32>,
   pub channel: Option<u16>,
   pub rate: Option<SmolStr>,
   pub bssid: Option<SmolStr>,
   pub mode: Option<SmolStr>,
   pub raw: String,
}

impl Network {
   pub fn new(ssid: impl Into<SmolStr>) -> Self {
      Self {
         ssid: ssid.into(),
         ..Default::default()
      }
   }

   pub fn is_secured(&self) -> bool {
      self.security != Security::Open
   }
}

/// Addressing details of the active Wi-Fi connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionInfo {
   pub ip_address: Option<SmolStr>,
   pub gateway: Option<SmolStr>,
   pub dns_servers: Vec<SmolStr>,
   pub device: Option<SmolStr>,
}

/// Cumulative byte counters of the Wi-Fi interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NetworkCounters {
   pub rx_bytes: u64,
   pub tx_bytes: u64,
   pub wifi_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum EndpointKind {
   Sink,
   Source,
}

/// An audio output or input as enumerated by the sound server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioEndpoint {
   pub id: u32,
   pub name: SmolStr,
   pub description: String,
   /// Provided by a Bluetooth audio profile.
   pub wireless: bool,
}

pub type AudioSink = AudioEndpoint;
pub type AudioSource = AudioEndpoint;
