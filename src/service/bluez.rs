//! Bluetooth backend talking to the BlueZ daemon through `bluer`.
//!
//! The daemon is the source of truth, so nothing is cached here.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time;

use super::BluetoothService;
use crate::{
   error::Result,
   model::{BatteryReading, Device},
};

pub struct BluezService {
   _session: Session,
   adapter: Adapter,
}

impl BluezService {
   /// Connects to the daemon and binds its default adapter.
   pub async fn new() -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      info!("Bound Bluetooth adapter {}", adapter.name());
      Ok(Self {
         _session: session,
         adapter,
      })
   }

   fn parse_address(address: &str) -> Option<Address> {
      address
         .parse()
         .inspect_err(|_| warn!("Invalid Bluetooth address: {address}"))
         .ok()
   }

   fn device(&self, address: &str) -> Option<bluer::Device> {
      let addr = Self::parse_address(address)?;
      self
         .adapter
         .device(addr)
         .inspect_err(|e| warn!("Device {address} unavailable: {e}"))
         .ok()
   }

   async fn describe(&self, device: &bluer::Device) -> bluer::Result<Device> {
      let address = device.address().to_string();
      let name = match device.alias().await {
         Ok(alias) => alias,
         Err(_) => device.name().await?.unwrap_or_else(|| address.clone()),
      };

      let mut record = Device::new(address.as_str(), name);
      record.connected = device.is_connected().await?;
      record.paired = device.is_paired().await?;
      record.trusted = device.is_trusted().await?;
      if let Some(icon) = device.icon().await? {
         record.device_type = icon.into();
      }
      record.battery = match device.battery_percentage().await {
         Ok(Some(level)) => BatteryReading::Level(level.min(100)),
         Ok(None) => BatteryReading::NotSupported,
         Err(e) => {
            debug!("Battery query for {address} failed: {e}");
            BatteryReading::Failed
         },
      };
      record.rssi = device.rssi().await.ok().flatten();
      record.object_path = Some(device_path(self.adapter.name(), &address).into());
      Ok(record)
   }
}

/// BlueZ object path of `address` under `adapter`.
pub fn device_path(adapter: &str, address: &str) -> String {
   format!("/org/bluez/{adapter}/dev_{}", address.replace(':', "_"))
}

/// Logs a failed device write and reports whether it went through.
fn write_ok<E: Display>(result: std::result::Result<(), E>, action: &str, address: &str) -> bool {
   match result {
      Ok(()) => true,
      Err(e) => {
         warn!("Failed to {action} {address}: {e}");
         false
      },
   }
}

#[async_trait]
impl BluetoothService for BluezService {
   fn backend(&self) -> &'static str {
      "bluez"
   }

   async fn is_adapter_available(&self) -> bool {
      self.adapter.address().await.is_ok()
   }

   async fn power_state(&self) -> bool {
      match self.adapter.is_powered().await {
         Ok(powered) => powered,
         Err(e) => {
            warn!("Failed to read adapter power state: {e}");
            false
         },
      }
   }

   async fn set_power_state(&self, on: bool) -> bool {
      match self.adapter.set_powered(on).await {
         Ok(()) => true,
         Err(e) => {
            warn!("Failed to set adapter power to {on}: {e}");
            false
         },
      }
   }

   async fn devices(&self) -> Vec<Device> {
      let addresses = match self.adapter.device_addresses().await {
         Ok(addresses) => addresses,
         Err(e) => {
            warn!("Failed to enumerate devices: {e}");
            return Vec::new();
         },
      };

      let mut devices = Vec::with_capacity(addresses.len());
      for addr in addresses {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         match self.describe(&device).await {
            Ok(record) => devices.push(record),
            Err(e) => debug!("Skipping device {addr}: {e}"),
         }
      }
      devices
   }

   async fn scan(&self, duration: Duration) -> Vec<Device> {
      match self.adapter.discover_devices().await {
         // Discovery stops when the stream is dropped.
         Ok(events) => {
            let _ = time::timeout(duration, events.for_each(|_| async {})).await;
         },
         Err(e) => warn!("Failed to start discovery: {e}"),
      }
      self.devices().await
   }

   async fn device_info(&self, address: &str) -> Option<Device> {
      let device = self.device(address)?;
      self
         .describe(&device)
         .await
         .inspect_err(|e| debug!("Failed to describe {address}: {e}"))
         .ok()
   }

   async fn connect(&self, address: &str) -> bool {
      let Some(device) = self.device(address) else {
         return false;
      };
      write_ok(device.connect().await, "connect", address)
   }

   async fn disconnect(&self, address: &str) -> bool {
      let Some(device) = self.device(address) else {
         return false;
      };
      write_ok(device.disconnect().await, "disconnect", address)
   }

   async fn pair(&self, address: &str) -> std::result::Result<(), String> {
      let device = self
         .device(address)
         .ok_or_else(|| format!("Unknown device {address}"))?;
      device.pair().await.map_err(|e| {
         warn!("Pairing with {address} failed: {e}");
         e.to_string()
      })
   }

   async fn unpair(&self, address: &str) -> bool {
      let Some(addr) = Self::parse_address(address) else {
         return false;
      };
      write_ok(self.adapter.remove_device(addr).await, "remove", address)
   }

   async fn trust(&self, address: &str) -> bool {
      let Some(device) = self.device(address) else {
         return false;
      };
      write_ok(device.set_trusted(true).await, "trust", address)
   }

   async fn untrust(&self, address: &str) -> bool {
      let Some(device) = self.device(address) else {
         return false;
      };
      write_ok(device.set_trusted(false).await, "untrust", address)
   }

   fn invalidate_cache(&self, _key: Option<&str>) {}
}
