//! Session bus surface of the daemon.
//!
//! Structured results are returned as JSON strings. Device connect and
//! disconnect take BlueZ object paths; the remaining Bluetooth calls take
//! hardware addresses.

use std::{fmt::Display, time::Duration};

use log::{debug, info, warn};
use serde::Serialize;
use zbus::{
   fdo::{self, Error as FdoError},
   interface,
   object_server::SignalEmitter,
   zvariant::ObjectPath,
};

use crate::{
   bluetooth::manager::BluetoothManager,
   parser::is_hw_address,
   service::{SharedBluetooth, SharedWifi},
};

pub const SERVICE_NAME: &str = "org.connectd";
pub const OBJECT_PATH: &str = "/org/connectd/manager";

/// Longest scan a caller may request.
const MAX_SCAN_SECONDS: u32 = 60;

pub struct ConnectivityService {
   manager: BluetoothManager,
   bluetooth: Option<SharedBluetooth>,
   wifi: Option<SharedWifi>,
}

impl ConnectivityService {
   pub const fn new(
      manager: BluetoothManager,
      bluetooth: Option<SharedBluetooth>,
      wifi: Option<SharedWifi>,
   ) -> Self {
      Self {
         manager,
         bluetooth,
         wifi,
      }
   }

   fn bluetooth(&self) -> fdo::Result<&SharedBluetooth> {
      self
         .bluetooth
         .as_ref()
         .ok_or_else(|| FdoError::NotSupported("No Bluetooth backend available".into()))
   }

   fn wifi(&self) -> fdo::Result<&SharedWifi> {
      self
         .wifi
         .as_ref()
         .ok_or_else(|| FdoError::NotSupported("No Wi-Fi backend available".into()))
   }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
   serde_json::to_string(value).map_err(failed)
}

fn failed(e: impl Display) -> FdoError {
   FdoError::Failed(e.to_string())
}

fn address_arg(address: &str) -> fdo::Result<&str> {
   if is_hw_address(address) {
      Ok(address)
   } else {
      Err(FdoError::InvalidArgs(format!("Invalid Bluetooth address: {address}")))
   }
}

fn device_path_arg(path: &str) -> fdo::Result<&str> {
   ObjectPath::try_from(path)
      .map(|_| path)
      .map_err(|e| FdoError::InvalidArgs(format!("Invalid device path {path}: {e}")))
}

/// Empty strings mean "use the saved profile".
fn optional_password(password: &str) -> Option<&str> {
   (!password.is_empty()).then_some(password)
}

#[interface(name = "org.connectd.Manager1")]
impl ConnectivityService {
   // Bluetooth devices

   async fn get_bluetooth_devices(&self) -> fdo::Result<String> {
      to_json(&self.bluetooth()?.devices().await)
   }

   async fn get_bluetooth_device(&self, address: String) -> fdo::Result<String> {
      let address = address_arg(&address)?;
      let device = self
         .bluetooth()?
         .device_info(address)
         .await
         .ok_or_else(|| FdoError::Failed("Device not found".into()))?;
      to_json(&device)
   }

   async fn scan_bluetooth(&self, seconds: u32) -> fdo::Result<String> {
      let seconds = seconds.clamp(1, MAX_SCAN_SECONDS);
      let devices = self
         .bluetooth()?
         .scan(Duration::from_secs(u64::from(seconds)))
         .await;
      to_json(&devices)
   }

   async fn pair_device(&self, address: String) -> fdo::Result<bool> {
      let address = address_arg(&address)?;
      self.bluetooth()?.pair(address).await.map_err(FdoError::Failed)?;
      info!("Paired with {address}");
      Ok(true)
   }

   async fn unpair_device(&self, address: String) -> fdo::Result<bool> {
      let address = address_arg(&address)?;
      Ok(self.bluetooth()?.unpair(address).await)
   }

   async fn set_trusted(&self, address: String, trusted: bool) -> fdo::Result<bool> {
      let address = address_arg(&address)?;
      let service = self.bluetooth()?;
      Ok(if trusted {
         service.trust(address).await
      } else {
         service.untrust(address).await
      })
   }

   /// Connects by hardware address through the adapter backend.
   async fn connect_bluetooth_address(&self, address: String) -> fdo::Result<bool> {
      let address = address_arg(&address)?;
      let connected = self.bluetooth()?.connect(address).await;
      if connected {
         info!("Connected to {address}");
      }
      Ok(connected)
   }

   async fn disconnect_bluetooth_address(&self, address: String) -> fdo::Result<bool> {
      let address = address_arg(&address)?;
      Ok(self.bluetooth()?.disconnect(address).await)
   }

   async fn set_bluetooth_power(&self, on: bool) -> fdo::Result<bool> {
      Ok(self.bluetooth()?.set_power_state(on).await)
   }

   async fn device_battery(&self, path: String) -> fdo::Result<String> {
      let path = device_path_arg(&path)?;
      to_json(&self.manager.device_battery(path).await)
   }

   async fn start_discovery(&self) -> bool {
      self.manager.start_discovery().await
   }

   async fn stop_discovery(&self) -> bool {
      self.manager.stop_discovery().await
   }

   async fn connect_device(&self, path: String) -> fdo::Result<bool> {
      let path = device_path_arg(&path)?;
      Ok(self.manager.connect_device(path).await)
   }

   async fn disconnect_device(&self, path: String) -> fdo::Result<bool> {
      let path = device_path_arg(&path)?;
      Ok(self.manager.disconnect_device(path).await)
   }

   /// Starts a background connect; the outcome arrives as `OperationFinished`.
   async fn connect_device_async(&self, path: String) -> fdo::Result<()> {
      let path = device_path_arg(&path)?.to_owned();
      let label = path.clone();
      self
         .manager
         .connect_device_async(&path, move |ok| {
            if !ok {
               warn!("Background connect to {label} failed");
            }
         })
         .map_err(failed)
   }

   async fn disconnect_device_async(&self, path: String) -> fdo::Result<()> {
      let path = device_path_arg(&path)?.to_owned();
      let label = path.clone();
      self
         .manager
         .disconnect_device_async(&path, move |ok| {
            if !ok {
               warn!("Background disconnect from {label} failed");
            }
         })
         .map_err(failed)
   }

   // Wi-Fi

   async fn get_networks(&self) -> fdo::Result<String> {
      to_json(&self.wifi()?.networks().await)
   }

   async fn scan_networks(&self) -> fdo::Result<String> {
      to_json(&self.wifi()?.scan().await)
   }

   async fn get_network(&self, ssid: String) -> fdo::Result<String> {
      let network = self
         .wifi()?
         .network_info(&ssid)
         .await
         .ok_or_else(|| FdoError::Failed(format!("Network {ssid} not found")))?;
      to_json(&network)
   }

   async fn connect_network(&self, ssid: String, password: String, save: bool) -> fdo::Result<bool> {
      Ok(self
         .wifi()?
         .connect(&ssid, optional_password(&password), save)
         .await)
   }

   async fn disconnect_network(&self, ssid: String) -> fdo::Result<bool> {
      Ok(self.wifi()?.disconnect(&ssid).await)
   }

   async fn forget_network(&self, ssid: String) -> fdo::Result<bool> {
      Ok(self.wifi()?.forget(&ssid).await)
   }

   async fn get_connection_info(&self) -> fdo::Result<String> {
      to_json(&self.wifi()?.connection_info().await)
   }

   async fn get_saved_networks(&self) -> fdo::Result<Vec<String>> {
      Ok(self
         .wifi()?
         .saved_networks()
         .await
         .into_iter()
         .map(String::from)
         .collect())
   }

   async fn set_wifi_power(&self, on: bool) -> fdo::Result<bool> {
      Ok(self.wifi()?.set_power_state(on).await)
   }

   async fn get_network_speed(&self) -> fdo::Result<String> {
      to_json(&self.wifi()?.network_speed().await)
   }

   /// Drops every cached tool result of both adapter backends.
   async fn refresh_caches(&self) {
      if let Some(bluetooth) = &self.bluetooth {
         bluetooth.invalidate_cache(None);
      }
      if let Some(wifi) = &self.wifi {
         wifi.invalidate_cache(None);
      }
      debug!("Adapter caches cleared");
   }

   // Audio

   async fn list_sinks(&self) -> fdo::Result<String> {
      to_json(&self.manager.audio().list_sinks().await)
   }

   async fn list_sources(&self) -> fdo::Result<String> {
      to_json(&self.manager.audio().list_sources().await)
   }

   async fn set_default_sink(&self, name: String) -> fdo::Result<()> {
      self.manager.audio().set_default_sink(&name).await.map_err(failed)
   }

   async fn set_default_source(&self, name: String) -> fdo::Result<()> {
      self.manager.audio().set_default_source(&name).await.map_err(failed)
   }

   async fn switch_to_default_audio(&self) -> bool {
      self.manager.audio().switch_to_default_audio().await
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(
      emitter: &SignalEmitter<'_>,
      path: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(
      emitter: &SignalEmitter<'_>,
      path: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn audio_route_changed(emitter: &SignalEmitter<'_>, sink: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn operation_finished(
      emitter: &SignalEmitter<'_>,
      operation: &str,
      path: &str,
      success: bool,
   ) -> zbus::Result<()>;

   // Properties
   #[zbus(property)]
   async fn bluetooth_supported(&self) -> bool {
      self.manager.bluetooth_supported()
   }

   #[zbus(property)]
   async fn bluetooth_backend(&self) -> String {
      self
         .bluetooth
         .as_ref()
         .map_or("none", |b| b.backend())
         .to_string()
   }

   #[zbus(property)]
   async fn bluetooth_available(&self) -> bool {
      match &self.bluetooth {
         Some(bluetooth) => bluetooth.is_adapter_available().await,
         None => false,
      }
   }

   #[zbus(property)]
   async fn wifi_available(&self) -> bool {
      match &self.wifi {
         Some(wifi) => wifi.is_adapter_available().await,
         None => false,
      }
   }

   #[zbus(property)]
   async fn bluetooth_powered(&self) -> bool {
      self.manager.power_state().await
   }

   #[zbus(property)]
   async fn wifi_powered(&self) -> bool {
      match &self.wifi {
         Some(wifi) => wifi.power_state().await,
         None => false,
      }
   }

   #[zbus(property)]
   async fn current_sink(&self) -> String {
      self
         .manager
         .current_audio_sink()
         .await
         .map(String::from)
         .unwrap_or_default()
   }
}
