//! Wi-Fi backend driving NetworkManager's `nmcli`.
//!
//! Networks are addressed by SSID only, which is all the tool's profile
//! commands accept; two access points sharing an SSID are indistinguishable.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use log::{debug, error, warn};
use smol_str::SmolStr;
use tokio::time;

use super::WifiService;
use crate::{
   cache::ResultCache,
   command::{CommandError, Invocation, SharedRunner},
   model::{ConnectionInfo, Network, NetworkCounters},
   parser::wifi as parser,
};

const KEY_RADIO: &str = "radio";
const KEY_LIST: &str = "wifi_list";
const KEY_ACTIVE: &str = "active_connections";
const KEY_SAVED: &str = "saved_connections";
const KEY_DEVICE_CHECK: &str = "device_check";

/// Time the driver gets to finish a rescan before listing.
const RESCAN_SETTLE: Duration = Duration::from_secs(1);
/// Activation includes association and DHCP.
const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(45);
const NET_DEV: &str = "/proc/net/dev";

fn conn_info_key(ssid: &str) -> String {
   format!("conn_info_{ssid}")
}

fn nmcli<'a>(args: impl IntoIterator<Item = &'a str>) -> Invocation {
   Invocation::new("nmcli").args(args)
}

pub struct NmcliService {
   runner: SharedRunner,
   cache: ResultCache<String>,
   ttl: Duration,
   net_dev: PathBuf,
}

impl NmcliService {
   pub fn new(runner: SharedRunner, ttl: Duration) -> Self {
      Self {
         runner,
         cache: ResultCache::new(),
         ttl,
         net_dev: PathBuf::from(NET_DEV),
      }
   }

   /// Reads interface counters from `path` instead of `/proc/net/dev`.
   #[must_use]
   pub fn with_net_dev(mut self, path: impl Into<PathBuf>) -> Self {
      self.net_dev = path.into();
      self
   }

   async fn wifi_device(&self) -> Option<SmolStr> {
      self
         .cached(KEY_DEVICE_CHECK, nmcli(["-t", "-f", "DEVICE,TYPE", "device"]))
         .await
         .ok()
         .and_then(|out| parser::parse_wifi_device(&out))
   }

   async fn run(&self, invocation: Invocation) -> Option<String> {
      match self.runner.run(&invocation).await {
         Ok(output) => {
            if !output.success() {
               debug!("`{invocation}` exited with {:?}: {}", output.status, output.stderr.trim());
            }
            Some(output.combined())
         },
         Err(e) => {
            error!("Command failed: {e}");
            None
         },
      }
   }

   async fn cached(&self, key: &str, invocation: Invocation) -> Result<String, CommandError> {
      self
         .cache
         .get_or_compute(key, self.ttl, || async {
            self.runner.run(&invocation).await.map(|out| out.combined())
         })
         .await
         .inspect_err(|e| error!("Command failed: {e}"))
   }

   fn invalidate_network(&self, ssid: &str) {
      self.cache.invalidate(Some(&conn_info_key(ssid)));
      self.cache.invalidate(Some(KEY_LIST));
   }
}

#[async_trait]
impl WifiService for NmcliService {
   fn backend(&self) -> &'static str {
      "nmcli"
   }

   async fn is_adapter_available(&self) -> bool {
      self.wifi_device().await.is_some()
   }

   async fn power_state(&self) -> bool {
      self
         .cached(KEY_RADIO, nmcli(["radio", "wifi"]))
         .await
         .is_ok_and(|out| parser::parse_radio_state(&out))
   }

   async fn set_power_state(&self, on: bool) -> bool {
      let state = if on { "on" } else { "off" };
      let output = self.run(nmcli(["radio", "wifi", state])).await;

      self.cache.invalidate(Some(KEY_RADIO));
      if on {
         self.cache.invalidate(Some(KEY_LIST));
      }

      // nmcli is silent on success
      match output {
         Some(out) if out.trim().is_empty() => true,
         Some(out) => {
            warn!("Failed to turn Wi-Fi {state}: {}", out.trim());
            false
         },
         None => false,
      }
   }

   async fn networks(&self) -> Vec<Network> {
      let listing = self
         .cache
         .get_or_compute(KEY_LIST, self.ttl, || async {
            self.run(nmcli(["device", "wifi", "rescan"])).await;
            time::sleep(RESCAN_SETTLE).await;
            self
               .runner
               .run(&nmcli(["-t", "-f", "SSID,SIGNAL,SECURITY,IN-USE", "dev", "wifi", "list"]))
               .await
               .map(|out| out.combined())
         })
         .await;

      match listing {
         Ok(listing) => parser::parse_network_list(&listing),
         Err(e) => {
            error!("Failed to list Wi-Fi networks: {e}");
            Vec::new()
         },
      }
   }

   async fn scan(&self) -> Vec<Network> {
      self.cache.invalidate(Some(KEY_LIST));
      self.networks().await
   }

   async fn network_info(&self, ssid: &str) -> Option<Network> {
      let saved = self
         .cached(&conn_info_key(ssid), nmcli(["-t", "connection", "show", ssid]))
         .await;

      if let Ok(output) = saved
         && !output.contains("Error: ")
      {
         return parser::parse_network_detail(&output, ssid);
      }

      // Not a saved profile: fall back to the scan results.
      self.networks().await.into_iter().find(|n| n.ssid == ssid)
   }

   async fn connect(&self, ssid: &str, password: Option<&str>, save: bool) -> bool {
      let invocation = match password {
         None => nmcli(["connection", "up", ssid]),
         Some(password) if save => {
            nmcli(["device", "wifi", "connect", ssid, "password"]).secret_arg(password)
         },
         Some(password) => nmcli(["--ask", "device", "wifi", "connect", ssid, "password"])
            .secret_arg(password)
            .arg("name")
            .arg(format!("{ssid}-temp")),
      };

      let output = self.run(invocation.timeout(ACTIVATION_TIMEOUT)).await;
      self.invalidate_network(ssid);
      self.cache.invalidate(Some(KEY_ACTIVE));

      output.is_some_and(|out| out.to_lowercase().contains("successfully activated"))
   }

   async fn disconnect(&self, ssid: &str) -> bool {
      let connected = self.networks().await.into_iter().find(|n| n.in_use);
      if connected.as_ref().is_none_or(|n| n.ssid != ssid) {
         debug!("Not connected to {ssid}, nothing to disconnect");
         return false;
      }

      let Ok(active) = self
         .cached(KEY_ACTIVE, nmcli(["-t", "-f", "NAME,UUID,DEVICE", "connection", "show", "--active"]))
         .await
      else {
         return false;
      };
      let Some(conn) = parser::parse_active_connection(&active, ssid) else {
         warn!("No active connection profile named {ssid}");
         return false;
      };

      let deactivated = |out: &Option<String>| {
         out.as_ref().is_some_and(|o| {
            let o = o.to_lowercase();
            o.contains("successfully deactivated") || o.contains("successfully disconnected")
         })
      };

      let mut output = self.run(nmcli(["connection", "down", conn.uuid.as_str()])).await;
      if !deactivated(&output) {
         debug!("Deactivating {} failed, disconnecting {}", conn.uuid, conn.device);
         output = self.run(nmcli(["device", "disconnect", conn.device.as_str()])).await;
      }

      self.invalidate_network(ssid);
      self.cache.invalidate(Some(KEY_ACTIVE));
      deactivated(&output)
   }

   async fn forget(&self, ssid: &str) -> bool {
      let output = self.run(nmcli(["connection", "delete", ssid])).await;
      self.invalidate_network(ssid);
      self.cache.invalidate(Some(KEY_SAVED));
      output.is_some_and(|out| out.to_lowercase().contains("successfully deleted"))
   }

   async fn connection_info(&self) -> ConnectionInfo {
      let Some(active) = self.networks().await.into_iter().find(|n| n.in_use) else {
         return ConnectionInfo::default();
      };

      let Ok(details) = self
         .cached(
            &conn_info_key(&active.ssid),
            nmcli(["-t", "connection", "show", active.ssid.as_str()]),
         )
         .await
      else {
         return ConnectionInfo::default();
      };

      let mut info = parser::parse_connection_info(&details);
      if info.ip_address.is_none()
         && let Some(device) = info.device.clone()
         && let Some(device_info) = self.run(nmcli(["-t", "device", "show", device.as_str()])).await
      {
         info.ip_address = parser::parse_connection_info(&device_info).ip_address;
      }
      info
   }

   async fn saved_networks(&self) -> Vec<SmolStr> {
      self
         .cached(KEY_SAVED, nmcli(["-t", "-f", "NAME,TYPE", "connection", "show"]))
         .await
         .map(|out| parser::parse_saved_networks(&out))
         .unwrap_or_default()
   }

   async fn network_speed(&self) -> NetworkCounters {
      let Some(device) = self.wifi_device().await else {
         return NetworkCounters::default();
      };
      let mut counters = NetworkCounters {
         wifi_supported: true,
         ..NetworkCounters::default()
      };

      match tokio::fs::read_to_string(&self.net_dev).await {
         Ok(contents) => match parser::parse_net_dev(&contents, &device) {
            Some((rx, tx)) => {
               counters.rx_bytes = rx;
               counters.tx_bytes = tx;
            },
            None => debug!("No counters for {device} in {}", self.net_dev.display()),
         },
         Err(e) => warn!("Failed to read {}: {e}", self.net_dev.display()),
      }
      counters
   }

   fn invalidate_cache(&self, key: Option<&str>) {
      self.cache.invalidate(key);
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::{
      command::{CommandOutput, mock::MockRunner},
      model::Security,
   };

   const LIST: &str = "nmcli -t -f SSID,SIGNAL,SECURITY,IN-USE dev wifi list";
   const RESCAN: &str = "nmcli device wifi rescan";
   const ACTIVE: &str = "nmcli -t -f NAME,UUID,DEVICE connection show --active";
   const DEVICES: &str = "nmcli -t -f DEVICE,TYPE device";

   fn service(runner: &Arc<MockRunner>) -> NmcliService {
      NmcliService::new(runner.clone(), Duration::from_secs(5))
   }

   fn listing(runner: &MockRunner, rows: &str) {
      runner
         .always(RESCAN, CommandOutput::ok(""))
         .always(LIST, CommandOutput::ok(rows));
   }

   #[tokio::test(start_paused = true)]
   async fn test_rescan_only_on_listing_miss() {
      let runner = MockRunner::new();
      listing(&runner, "HomeNet:72:WPA2:*\nCafe:40::\n");
      let svc = service(&runner);

      let networks = svc.networks().await;
      assert_eq!(networks.len(), 2);
      assert_eq!(networks[0].security, Security::Wpa2);
      svc.networks().await;
      assert_eq!(runner.count(RESCAN), 1);

      svc.scan().await;
      assert_eq!(runner.count(RESCAN), 2);
      assert_eq!(runner.count(LIST), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_with_password_is_redacted_and_invalidates() {
      let runner = MockRunner::new();
      listing(&runner, "HomeNet:72:WPA2:\n");
      runner.always(
         "nmcli device wifi connect HomeNet password ******",
         CommandOutput::ok("Device 'wlan0' successfully activated with 'uuid'.\n"),
      );
      let svc = service(&runner);

      svc.networks().await;
      assert!(svc.connect("HomeNet", Some("hunter2"), true).await);
      svc.networks().await;
      assert_eq!(runner.count(LIST), 2);
   }

   #[tokio::test]
   async fn test_temporary_connect_uses_temp_profile() {
      let runner = MockRunner::new();
      runner.always(
         "nmcli --ask device wifi connect Cafe password ****** name Cafe-temp",
         CommandOutput::ok("Device 'wlan0' successfully activated with 'uuid'.\n"),
      );
      assert!(service(&runner).connect("Cafe", Some("pw"), false).await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_requires_matching_connection() {
      let runner = MockRunner::new();
      listing(&runner, "HomeNet:72:WPA2:*\nCafe:40::\n");
      let svc = service(&runner);

      assert!(!svc.disconnect("Cafe").await);
      assert_eq!(runner.count(ACTIVE), 0);
      assert_eq!(runner.count_prefix("nmcli connection down"), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_falls_back_to_device() {
      let runner = MockRunner::new();
      listing(&runner, "HomeNet:72:WPA2:*\n");
      runner
         .always(ACTIVE, CommandOutput::ok("HomeNet:1234-abcd:wlan0\n"))
         .always(
            "nmcli connection down 1234-abcd",
            CommandOutput::failed(10, "Error: not an active connection"),
         )
         .always(
            "nmcli device disconnect wlan0",
            CommandOutput::ok("Device 'wlan0' successfully disconnected.\n"),
         );
      let svc = service(&runner);

      assert!(svc.disconnect("HomeNet").await);
      assert_eq!(runner.count("nmcli device disconnect wlan0"), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_network_info_falls_back_to_scan() {
      let runner = MockRunner::new();
      listing(&runner, "Cafe:40::\n");
      runner.always(
         "nmcli -t connection show Cafe",
         CommandOutput::failed(10, "Error: Cafe - no such connection profile."),
      );
      let net = service(&runner).network_info("Cafe").await.unwrap();
      assert_eq!(net.signal, 40);
      assert!(!net.is_secured());
   }

   #[tokio::test(start_paused = true)]
   async fn test_connection_info_of_active_network() {
      let runner = MockRunner::new();
      listing(&runner, "HomeNet:72:WPA2:*\n");
      runner
         .always(
            "nmcli -t connection show HomeNet",
            CommandOutput::ok("GENERAL.DEVICES:wlan0\nIP4.GATEWAY:10.0.0.1\nIP4.DNS[1]:10.0.0.1\n"),
         )
         .always(
            "nmcli -t device show wlan0",
            CommandOutput::ok("IP4.ADDRESS[1]:10.0.0.23/24\n"),
         );
      let info = service(&runner).connection_info().await;
      assert_eq!(info.ip_address.as_deref(), Some("10.0.0.23"));
      assert_eq!(info.gateway.as_deref(), Some("10.0.0.1"));
      assert_eq!(info.device.as_deref(), Some("wlan0"));
   }

   #[tokio::test]
   async fn test_radio_and_saved() {
      let runner = MockRunner::new();
      runner
         .always("nmcli radio wifi", CommandOutput::ok("enabled\n"))
         .always("nmcli radio wifi off", CommandOutput::ok(""))
         .always(
            "nmcli -t -f NAME,TYPE connection show",
            CommandOutput::ok("HomeNet:802-11-wireless\nWired:802-3-ethernet\n"),
         )
         .always(
            "nmcli connection delete HomeNet",
            CommandOutput::ok("Connection 'HomeNet' (uuid) successfully deleted.\n"),
         );
      let svc = service(&runner);

      assert!(svc.power_state().await);
      assert!(svc.set_power_state(false).await);
      svc.power_state().await;
      assert_eq!(runner.count("nmcli radio wifi"), 2);

      assert_eq!(svc.saved_networks().await, ["HomeNet"]);
      assert!(svc.forget("HomeNet").await);
      svc.saved_networks().await;
      assert_eq!(runner.count("nmcli -t -f NAME,TYPE connection show"), 2);
   }

   #[tokio::test]
   async fn test_network_speed_reads_wifi_interface() {
      let dir = tempfile::tempdir().unwrap();
      let net_dev = dir.path().join("dev");
      std::fs::write(
         &net_dev,
         "    lo:  9120  88  0  0  0  0  0  0   9120  88  0  0  0  0  0  0\n\
          wlan0: 4096  12  0  0  0  0  0  0   2048   9  0  0  0  0  0  0\n",
      )
      .unwrap();

      let runner = MockRunner::new();
      runner.always(DEVICES, CommandOutput::ok("eth0:ethernet\nwlan0:wifi\n"));
      let svc = service(&runner).with_net_dev(&net_dev);

      assert!(svc.is_adapter_available().await);
      let counters = svc.network_speed().await;
      assert_eq!(
         counters,
         NetworkCounters {
            rx_bytes: 4096,
            tx_bytes: 2048,
            wifi_supported: true,
         }
      );
      assert_eq!(runner.count(DEVICES), 1);

      std::fs::remove_file(&net_dev).unwrap();
      svc.invalidate_cache(None);
      let counters = svc.network_speed().await;
      assert!(counters.wifi_supported);
      assert_eq!(counters.rx_bytes, 0);
      assert_eq!(runner.count(DEVICES), 2);
   }

   #[tokio::test]
   async fn test_network_speed_without_wifi_device() {
      let runner = MockRunner::new();
      runner.always(DEVICES, CommandOutput::ok("eth0:ethernet\nlo:loopback\n"));
      let svc = service(&runner);

      assert!(!svc.is_adapter_available().await);
      assert_eq!(svc.network_speed().await, NetworkCounters::default());
   }
}
