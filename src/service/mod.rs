//! Adapter services.
//!
//! Callers depend on [`BluetoothService`] and [`WifiService`] only; a
//! concrete backend is chosen once at startup by probing what the host
//! provides. Every operation degrades to `false`/empty/`None` and logs the
//! detail instead of returning an error.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{info, warn};
use smol_str::SmolStr;

use crate::{
   command::{self, SharedRunner},
   config::BluetoothBackend,
   model::{ConnectionInfo, Device, Network, NetworkCounters},
};

pub mod bluetoothctl;
pub mod bluez;
pub mod nmcli;

pub use bluetoothctl::BluetoothctlService;
pub use bluez::BluezService;
pub use nmcli::NmcliService;

#[async_trait]
pub trait BluetoothService: Send + Sync {
   /// Short backend name for logs and the bus surface.
   fn backend(&self) -> &'static str;

   async fn is_adapter_available(&self) -> bool;

   async fn power_state(&self) -> bool;

   async fn set_power_state(&self, on: bool) -> bool;

   /// Known devices, each enriched with its detail query.
   async fn devices(&self) -> Vec<Device>;

   /// Discovers for `duration`, then returns the refreshed device list.
   async fn scan(&self, duration: Duration) -> Vec<Device>;

   async fn device_info(&self, address: &str) -> Option<Device>;

   async fn connect(&self, address: &str) -> bool;

   async fn disconnect(&self, address: &str) -> bool;

   /// Pairs with `address`, returning the tool's diagnostic text on failure.
   async fn pair(&self, address: &str) -> Result<(), String>;

   async fn unpair(&self, address: &str) -> bool;

   async fn trust(&self, address: &str) -> bool;

   async fn untrust(&self, address: &str) -> bool;

   /// Drops one cached query result, or all of them.
   fn invalidate_cache(&self, key: Option<&str>);
}

#[async_trait]
pub trait WifiService: Send + Sync {
   fn backend(&self) -> &'static str;

   async fn is_adapter_available(&self) -> bool;

   async fn power_state(&self) -> bool;

   async fn set_power_state(&self, on: bool) -> bool;

   async fn networks(&self) -> Vec<Network>;

   /// Forces a fresh rescan regardless of cached results.
   async fn scan(&self) -> Vec<Network>;

   async fn network_info(&self, ssid: &str) -> Option<Network>;

   /// Activates `ssid`, using the saved profile when `password` is `None`.
   async fn connect(&self, ssid: &str, password: Option<&str>, save: bool) -> bool;

   async fn disconnect(&self, ssid: &str) -> bool;

   async fn forget(&self, ssid: &str) -> bool;

   async fn connection_info(&self) -> ConnectionInfo;

   async fn saved_networks(&self) -> Vec<SmolStr>;

   /// Byte counters of the Wi-Fi interface; zeroed when none is present.
   async fn network_speed(&self) -> NetworkCounters;

   fn invalidate_cache(&self, key: Option<&str>);
}

pub type SharedBluetooth = Arc<dyn BluetoothService>;
pub type SharedWifi = Arc<dyn WifiService>;

/// Picks the Bluetooth backend, or `None` when the host offers neither.
pub async fn select_bluetooth(
   backend: BluetoothBackend,
   runner: SharedRunner,
   cache_ttl: Duration,
) -> Option<SharedBluetooth> {
   if matches!(backend, BluetoothBackend::Auto | BluetoothBackend::Bluez) {
      match BluezService::new().await {
         Ok(service) => {
            info!("Using BlueZ daemon backend for Bluetooth");
            return Some(Arc::new(service));
         },
         Err(e) if backend == BluetoothBackend::Bluez => {
            warn!("BlueZ backend unavailable: {e}");
            return None;
         },
         Err(e) => warn!("BlueZ backend unavailable, trying bluetoothctl: {e}"),
      }
   }

   if command::probe(runner.as_ref(), "bluetoothctl").await {
      info!("Using bluetoothctl backend for Bluetooth");
      return Some(Arc::new(BluetoothctlService::new(runner, cache_ttl)));
   }

   warn!("No Bluetooth backend available");
   None
}

/// Picks the Wi-Fi backend, or `None` when `nmcli` is missing.
pub async fn select_wifi(runner: SharedRunner, cache_ttl: Duration) -> Option<SharedWifi> {
   if command::probe(runner.as_ref(), "nmcli").await {
      info!("Using nmcli backend for Wi-Fi");
      Some(Arc::new(NmcliService::new(runner, cache_ttl)))
   } else {
      warn!("No Wi-Fi backend available: nmcli not found");
      None
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::command::{CommandOutput, mock::MockRunner};

   #[tokio::test]
   async fn test_select_cli_backends() {
      let runner = MockRunner::new();
      runner
         .always("bluetoothctl --version", CommandOutput::ok("bluetoothctl: 5.72"))
         .always("nmcli --version", CommandOutput::ok("nmcli tool, version 1.46.0"));

      let bt = select_bluetooth(BluetoothBackend::Bluetoothctl, runner.clone(), Duration::from_secs(5))
         .await
         .unwrap();
      assert_eq!(bt.backend(), "bluetoothctl");
      let wifi = select_wifi(runner, Duration::from_secs(5)).await.unwrap();
      assert_eq!(wifi.backend(), "nmcli");
   }

   #[tokio::test]
   async fn test_missing_tools_yield_none() {
      let runner = MockRunner::new();
      assert!(
         select_bluetooth(BluetoothBackend::Bluetoothctl, runner.clone(), Duration::from_secs(5))
            .await
            .is_none()
      );
      assert!(select_wifi(runner, Duration::from_secs(5)).await.is_none());
   }
}
