//! Access to the BlueZ daemon over the system bus.
//!
//! [`DeviceBus`] is the orchestrator's only view of the daemon. Objects are
//! addressed by their object path strings.

use std::{collections::HashMap, pin::Pin};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use smol_str::SmolStr;
use zbus::{
   Connection, MatchRule, MessageStream,
   fdo::{self, ObjectManagerProxy},
   message::Type as MessageType,
   proxy::CacheProperties,
   zvariant::OwnedValue,
};

use crate::{
   error::{Error, Result},
   model::{BatteryReading, Device},
};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const BATTERY_INTERFACE: &str = "org.bluez.Battery1";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

#[zbus::proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
trait Adapter1 {
   fn start_discovery(&self) -> zbus::Result<()>;

   fn stop_discovery(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn powered(&self) -> zbus::Result<bool>;

   #[zbus(property)]
   fn set_powered(&self, value: bool) -> zbus::Result<()>;
}

#[zbus::proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
trait Device1 {
   fn connect(&self) -> zbus::Result<()>;

   fn disconnect(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn connected(&self) -> zbus::Result<bool>;

   #[zbus(property)]
   fn alias(&self) -> zbus::Result<String>;

   #[zbus(property)]
   fn name(&self) -> zbus::Result<String>;
}

#[zbus::proxy(interface = "org.bluez.Battery1", default_service = "org.bluez")]
trait Battery1 {
   #[zbus(property)]
   fn percentage(&self) -> zbus::Result<u8>;
}

/// A `PropertiesChanged` notification from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
   pub path: SmolStr,
   pub interface: SmolStr,
   /// New value of `Connected`, when the change carries one.
   pub connected: Option<bool>,
}

pub type PropertyStream = Pin<Box<dyn Stream<Item = PropertyChange> + Send>>;

#[async_trait]
pub trait DeviceBus: Send + Sync {
   /// Object path of the first adapter the daemon enumerates.
   async fn find_adapter(&self) -> Result<SmolStr>;

   async fn adapter_powered(&self, adapter: &str) -> Result<bool>;

   async fn set_adapter_powered(&self, adapter: &str, on: bool) -> Result<()>;

   async fn start_discovery(&self, adapter: &str) -> Result<()>;

   async fn stop_discovery(&self, adapter: &str) -> Result<()>;

   /// Every device object the daemon manages.
   async fn devices(&self) -> Result<Vec<Device>>;

   async fn connect(&self, device: &str) -> Result<()>;

   async fn disconnect(&self, device: &str) -> Result<()>;

   async fn connected(&self, device: &str) -> Result<bool>;

   async fn alias(&self, device: &str) -> Result<SmolStr>;

   async fn name(&self, device: &str) -> Result<SmolStr>;

   /// `Ok(None)` when the device exposes no battery interface.
   async fn battery_percentage(&self, device: &str) -> Result<Option<u8>>;

   /// Property changes in daemon emission order.
   async fn property_changes(&self) -> Result<PropertyStream>;

   /// Releases the bus connection.
   async fn close(&self) -> Result<()>;
}

/// [`DeviceBus`] over a system bus connection.
pub struct BluezBus {
   connection: Connection,
}

impl BluezBus {
   pub async fn system() -> Result<Self> {
      Ok(Self {
         connection: Connection::system().await?,
      })
   }

   pub const fn connection(&self) -> &Connection {
      &self.connection
   }

   async fn adapter(&self, path: &str) -> Result<Adapter1Proxy<'static>> {
      Ok(
         Adapter1Proxy::builder(&self.connection)
            .path(path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?,
      )
   }

   async fn device(&self, path: &str) -> Result<Device1Proxy<'static>> {
      Ok(
         Device1Proxy::builder(&self.connection)
            .path(path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?,
      )
   }

   async fn managed_objects(&self) -> Result<fdo::ManagedObjects> {
      let manager = ObjectManagerProxy::builder(&self.connection)
         .destination(BLUEZ_SERVICE)?
         .path("/")?
         .build()
         .await?;
      Ok(manager.get_managed_objects().await?)
   }
}

type Properties = HashMap<String, OwnedValue>;

fn prop_bool(props: &Properties, key: &str) -> bool {
   props
      .get(key)
      .and_then(|v| v.downcast_ref::<bool>().ok())
      .unwrap_or(false)
}

fn prop_str(props: &Properties, key: &str) -> Option<SmolStr> {
   props
      .get(key)
      .and_then(|v| v.downcast_ref::<String>().ok())
      .map(SmolStr::from)
}

fn device_from_properties(path: &str, props: &Properties, battery: Option<&Properties>) -> Option<Device> {
   let address = prop_str(props, "Address")?;
   let name = prop_str(props, "Alias")
      .or_else(|| prop_str(props, "Name"))
      .unwrap_or_else(|| address.clone());

   let mut device = Device::new(address, name);
   device.connected = prop_bool(props, "Connected");
   device.paired = prop_bool(props, "Paired");
   device.trusted = prop_bool(props, "Trusted");
   if let Some(icon) = prop_str(props, "Icon") {
      device.device_type = icon;
   }
   device.rssi = props.get("RSSI").and_then(|v| v.downcast_ref::<i16>().ok());
   device.object_path = Some(path.into());
   device.battery = battery
      .and_then(|b| b.get("Percentage"))
      .and_then(|v| v.downcast_ref::<u8>().ok())
      .map_or(BatteryReading::NotSupported, |level| BatteryReading::Level(level.min(100)));
   Some(device)
}

/// Whether `err` means the object lacks the requested interface or property.
fn is_missing_interface(err: &zbus::Error) -> bool {
   match err {
      zbus::Error::FDO(e) => matches!(
         **e,
         fdo::Error::UnknownInterface(_)
            | fdo::Error::UnknownProperty(_)
            | fdo::Error::UnknownObject(_)
            | fdo::Error::InvalidArgs(_)
      ),
      zbus::Error::InterfaceNotFound => true,
      zbus::Error::MethodError(name, ..) => {
         let name = name.as_str();
         name.ends_with("UnknownInterface")
            || name.ends_with("UnknownProperty")
            || name.ends_with("UnknownObject")
            || name.ends_with("InvalidArgs")
      },
      _ => false,
   }
}

#[async_trait]
impl DeviceBus for BluezBus {
   async fn find_adapter(&self) -> Result<SmolStr> {
      let objects = self.managed_objects().await?;
      let mut adapters: Vec<&str> = objects
         .iter()
         .filter(|(_, ifaces)| ifaces.keys().any(|i| i.as_str() == ADAPTER_INTERFACE))
         .map(|(path, _)| path.as_str())
         .collect();
      adapters.sort_unstable();
      adapters
         .first()
         .map(|path| SmolStr::from(*path))
         .ok_or(Error::AdapterNotFound)
   }

   async fn adapter_powered(&self, adapter: &str) -> Result<bool> {
      Ok(self.adapter(adapter).await?.powered().await?)
   }

   async fn set_adapter_powered(&self, adapter: &str, on: bool) -> Result<()> {
      Ok(self.adapter(adapter).await?.set_powered(on).await?)
   }

   async fn start_discovery(&self, adapter: &str) -> Result<()> {
      Ok(self.adapter(adapter).await?.start_discovery().await?)
   }

   async fn stop_discovery(&self, adapter: &str) -> Result<()> {
      Ok(self.adapter(adapter).await?.stop_discovery().await?)
   }

   async fn devices(&self) -> Result<Vec<Device>> {
      let objects = self.managed_objects().await?;
      let mut devices = Vec::new();
      for (path, ifaces) in &objects {
         let find = |name: &str| {
            ifaces
               .iter()
               .find(|(iface, _)| iface.as_str() == name)
               .map(|(_, props)| props)
         };
         let Some(props) = find(DEVICE_INTERFACE) else {
            continue;
         };
         match device_from_properties(path.as_str(), props, find(BATTERY_INTERFACE)) {
            Some(device) => devices.push(device),
            None => warn!("Skipping device object without address: {}", path.as_str()),
         }
      }
      devices.sort_by(|a, b| a.address.cmp(&b.address));
      Ok(devices)
   }

   async fn connect(&self, device: &str) -> Result<()> {
      Ok(self.device(device).await?.connect().await?)
   }

   async fn disconnect(&self, device: &str) -> Result<()> {
      Ok(self.device(device).await?.disconnect().await?)
   }

   async fn connected(&self, device: &str) -> Result<bool> {
      Ok(self.device(device).await?.connected().await?)
   }

   async fn alias(&self, device: &str) -> Result<SmolStr> {
      Ok(self.device(device).await?.alias().await?.into())
   }

   async fn name(&self, device: &str) -> Result<SmolStr> {
      Ok(self.device(device).await?.name().await?.into())
   }

   async fn battery_percentage(&self, device: &str) -> Result<Option<u8>> {
      let proxy = Battery1Proxy::builder(&self.connection)
         .path(device.to_owned())?
         .cache_properties(CacheProperties::No)
         .build()
         .await?;
      match proxy.percentage().await {
         Ok(level) => Ok(Some(level)),
         Err(e) if is_missing_interface(&e) => {
            debug!("{device} has no battery interface: {e}");
            Ok(None)
         },
         Err(e) => Err(e.into()),
      }
   }

   async fn property_changes(&self) -> Result<PropertyStream> {
      let rule = MatchRule::builder()
         .msg_type(MessageType::Signal)
         .sender(BLUEZ_SERVICE)?
         .interface(PROPERTIES_INTERFACE)?
         .member("PropertiesChanged")?
         .build();
      let stream = MessageStream::for_match_rule(rule, &self.connection, None).await?;

      Ok(Box::pin(stream.filter_map(|msg| async move {
         let msg = msg.ok()?;
         let header = msg.header();
         let path = header.path()?.as_str().into();
         let (interface, changed, _invalidated): (String, Properties, Vec<String>) =
            msg.body().deserialize().ok()?;
         let connected = changed
            .get("Connected")
            .and_then(|v| v.downcast_ref::<bool>().ok());
         Some(PropertyChange {
            path,
            interface: interface.into(),
            connected,
         })
      })))
   }

   async fn close(&self) -> Result<()> {
      Ok(self.connection.clone().close().await?)
   }
}


#[cfg(test)]
mod tests {
   use zbus::zvariant::Value;

   use super::*;

   fn props(entries: Vec<(&str, Value<'static>)>) -> Properties {
      entries
         .into_iter()
         .map(|(k, v)| (k.to_string(), OwnedValue::try_from(v).unwrap()))
         .collect()
   }

   #[test]
   fn test_device_from_properties() {
      let device_props = props(vec![
         ("Address", Value::from("AA:BB:CC:DD:EE:FF")),
         ("Alias", Value::from("Buds")),
         ("Connected", Value::from(true)),
         ("Paired", Value::from(true)),
         ("RSSI", Value::from(-58i16)),
      ]);
      let battery = props(vec![("Percentage", Value::from(64u8))]);

      let device =
         device_from_properties("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF", &device_props, Some(&battery))
            .unwrap();
      assert_eq!(device.name, "Buds");
      assert!(device.connected);
      assert!(device.paired);
      assert!(!device.trusted);
      assert_eq!(device.rssi, Some(-58));
      assert_eq!(device.battery, BatteryReading::Level(64));
      assert_eq!(
         device.object_path.as_deref(),
         Some("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF")
      );

      let no_battery = device_from_properties("/p", &device_props, None).unwrap();
      assert_eq!(no_battery.battery, BatteryReading::NotSupported);
      assert!(device_from_properties("/p", &Properties::new(), None).is_none());
   }

   #[test]
   fn test_missing_interface_detection() {
      let missing = zbus::Error::FDO(Box::new(fdo::Error::UnknownInterface("Battery1".into())));
      assert!(is_missing_interface(&missing));
      let failed = zbus::Error::FDO(Box::new(fdo::Error::Failed("boom".into())));
      assert!(!is_missing_interface(&failed));
   }
}
