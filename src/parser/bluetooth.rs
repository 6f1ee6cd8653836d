//! Parsers for `bluetoothctl` output.

use std::sync::LazyLock;

use log::warn;
use regex::Regex;

use super::is_hw_address;
use crate::model::{BatteryReading, Device};

const NO_CONTROLLER: &str = "No default controller available";
const UNKNOWN_NAME: &str = "Unknown Device";
const UNKNOWN_PAIR_ERROR: &str = "Unknown pairing error";

static ADDRESS_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"Device ([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})").unwrap());
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Name: (.+)").unwrap());
static ICON_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Icon: (\S+)").unwrap());
// Newer releases print the raw value first: `Battery Percentage: 0x55 (85)`.
static BATTERY_RE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"Battery Percentage: (?:0x[0-9a-fA-F]+ )?\((\d+)\)").unwrap()
});
static RSSI_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"RSSI: (?:0x[0-9a-fA-F]+ \()?(-?\d+)").unwrap());

/// Parses `bluetoothctl devices`: `Device <address> <name...>` per line.
pub fn parse_device_listing(output: &str) -> Vec<Device> {
   let mut devices = Vec::new();

   for line in output.lines() {
      let tokens: Vec<&str> = line.split_whitespace().collect();
      if tokens.len() < 2 {
         continue;
      }

      let address = tokens[1];
      if !is_hw_address(address) {
         warn!("Skipping malformed device line: {line}");
         continue;
      }

      let name = if tokens.len() > 2 {
         tokens[2..].join(" ")
      } else {
         UNKNOWN_NAME.to_string()
      };
      devices.push(Device::new(address, name));
   }

   devices
}

/// Parses a `bluetoothctl info <address>` block.
///
/// Returns `None` when no controller is available or the block names no device.
pub fn parse_device_info(output: &str) -> Option<Device> {
   if output.trim().is_empty() || output.contains(NO_CONTROLLER) {
      return None;
   }

   let address = ADDRESS_RE.captures(output)?.get(1)?.as_str();
   let name = NAME_RE
      .captures(output)
      .and_then(|c| c.get(1))
      .map_or(UNKNOWN_NAME, |m| m.as_str().trim());

   let mut device = Device::new(address, name);
   device.connected = output.contains("Connected: yes");
   device.paired = output.contains("Paired: yes");
   device.trusted = output.contains("Trusted: yes");

   if let Some(icon) = ICON_RE.captures(output).and_then(|c| c.get(1)) {
      device.device_type = icon.as_str().into();
   }

   if let Some(raw) = BATTERY_RE.captures(output).and_then(|c| c.get(1)) {
      match raw.as_str().parse::<u8>() {
         Ok(level) => device.battery = BatteryReading::Level(level.min(100)),
         Err(e) => warn!("Ignoring battery value {:?} for {address}: {e}", raw.as_str()),
      }
   }

   if let Some(raw) = RSSI_RE.captures(output).and_then(|c| c.get(1)) {
      device.rssi = raw.as_str().parse().ok();
   }

   Some(device)
}

/// `bluetoothctl show` reports `Powered: yes` for an enabled controller.
pub fn parse_power_state(output: &str) -> bool {
   output.contains("Powered: yes")
}

pub fn parse_controller_available(output: &str) -> bool {
   !output.contains(NO_CONTROLLER)
}

/// Returns the failure text of a `bluetoothctl pair` run, `None` on success.
pub fn parse_pair_error(output: &str) -> Option<String> {
   if output.contains("Pairing successful") {
      return None;
   }

   let reason = output
      .split_once("Failed to pair:")
      .map(|(_, rest)| rest.trim())
      .and_then(|rest| rest.lines().next())
      .map(str::trim)
      .filter(|reason| !reason.is_empty())
      .unwrap_or(UNKNOWN_PAIR_ERROR);
   Some(reason.to_string())
}

/// Parses `busctl get-property ... Percentage`, which prints `y 85`.
pub fn parse_busctl_battery(output: &str) -> BatteryReading {
   let parts: Vec<&str> = output.split_whitespace().collect();
   if parts.len() < 2 {
      return BatteryReading::NotSupported;
   }
   match parts[parts.len() - 1].parse::<u8>() {
      Ok(level) => BatteryReading::Level(level.min(100)),
      Err(_) => {
         warn!("Unexpected busctl battery output: {}", output.trim());
         BatteryReading::Failed
      },
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const INFO: &str = "Device AA:BB:CC:DD:EE:FF (public)
\tName: My Headphones
\tAlias: My Headphones
\tClass: 0x00240404
\tIcon: audio-headset
\tPaired: yes
\tTrusted: yes
\tBlocked: no
\tConnected: no
\tRSSI: 0xffffffc4 (-60)
\tBattery Percentage: 0x55 (85)
";

   #[test]
   fn test_listing_line() {
      let devices = parse_device_listing("Device AA:BB:CC:DD:EE:FF My Headphones");
      assert_eq!(devices.len(), 1);
      assert_eq!(devices[0].address, "AA:BB:CC:DD:EE:FF");
      assert_eq!(devices[0].name, "My Headphones");
   }

   #[test]
   fn test_listing_skips_short_and_malformed_lines() {
      let output = "Device\n\nDevice AA:BB:CC:DD:EE:FF\nWaiting to connect to bluetoothd...\nDevice 11:22:33:44:55:66 Desk   Speaker\n";
      let devices = parse_device_listing(output);
      assert_eq!(devices.len(), 2);
      assert_eq!(devices[0].name, UNKNOWN_NAME);
      assert_eq!(devices[1].name, "Desk Speaker");
   }

   #[test]
   fn test_info_block() {
      let device = parse_device_info(INFO).unwrap();
      assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
      assert_eq!(device.name, "My Headphones");
      assert!(device.paired);
      assert!(device.trusted);
      assert!(!device.connected);
      assert_eq!(device.device_type, "audio-headset");
      assert_eq!(device.battery, BatteryReading::Level(85));
      assert_eq!(device.rssi, Some(-60));
   }

   #[test]
   fn test_info_legacy_format() {
      let device = parse_device_info(
         "Device 11:22:33:44:55:66\n\tName: Mouse\n\tConnected: yes\n\tRSSI: -42\n\tBattery Percentage: (7)\n",
      )
      .unwrap();
      assert!(device.connected);
      assert_eq!(device.rssi, Some(-42));
      assert_eq!(device.battery, BatteryReading::Level(7));
      assert_eq!(device.device_type, "unknown");
   }

   #[test]
   fn test_info_without_controller() {
      assert!(parse_device_info("No default controller available\n").is_none());
      assert!(parse_device_info("").is_none());
      assert!(parse_device_info("Device 11:22:33:44:55:66 not available\n").is_some());
      assert!(parse_device_info("garbage").is_none());
   }

   #[test]
   fn test_pair_error() {
      assert_eq!(parse_pair_error("Attempting to pair\nPairing successful\n"), None);
      assert_eq!(
         parse_pair_error("Attempting to pair\nFailed to pair: org.bluez.Error.AuthenticationFailed\n"),
         Some("org.bluez.Error.AuthenticationFailed".to_string())
      );
      assert_eq!(parse_pair_error(""), Some(UNKNOWN_PAIR_ERROR.to_string()));
   }

   #[test]
   fn test_power_and_controller() {
      assert!(parse_power_state("Controller 00:11\n\tPowered: yes\n"));
      assert!(!parse_power_state("\tPowered: no\n"));
      assert!(!parse_controller_available(NO_CONTROLLER));
   }

   #[test]
   fn test_busctl_battery() {
      assert_eq!(parse_busctl_battery("y 85\n"), BatteryReading::Level(85));
      assert_eq!(parse_busctl_battery(""), BatteryReading::NotSupported);
      assert_eq!(parse_busctl_battery("y garbage"), BatteryReading::Failed);
   }
}
