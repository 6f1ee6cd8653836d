//! Bluetooth backend driving the `bluetoothctl` and `rfkill` tools.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::{task::JoinHandle, time};

use super::BluetoothService;
use crate::{
   cache::ResultCache,
   command::{CommandError, CommandOutput, Invocation, SharedRunner},
   model::Device,
   parser::bluetooth as parser,
};

const KEY_SHOW: &str = "show";
const KEY_DEVICES: &str = "devices";

/// Connect and pair wait on the remote device.
const REMOTE_OP_TIMEOUT: Duration = Duration::from_secs(20);

fn info_key(address: &str) -> String {
   format!("info_{address}")
}

fn bluetoothctl<'a>(args: impl IntoIterator<Item = &'a str>) -> Invocation {
   Invocation::new("bluetoothctl").args(args)
}

pub struct BluetoothctlService {
   runner: SharedRunner,
   cache: ResultCache<String>,
   ttl: Duration,
}

impl BluetoothctlService {
   pub fn new(runner: SharedRunner, ttl: Duration) -> Self {
      Self {
         runner,
         cache: ResultCache::new(),
         ttl,
      }
   }

   /// Runs an uncached command; tool failures yield an empty transcript.
   async fn run(&self, invocation: Invocation) -> String {
      match self.runner.run(&invocation).await {
         Ok(output) => {
            if !output.success() {
               debug!("`{invocation}` exited with {:?}", output.status);
            }
            output.combined()
         },
         Err(e) => {
            error!("Command failed: {e}");
            String::new()
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

   async fn show(&self) -> Option<String> {
      self.cached(KEY_SHOW, bluetoothctl(["show"])).await.ok()
   }

   /// Starts discovery in the background; the returned guard stops it.
   fn start_discovery(&self, duration: Duration) -> DiscoveryGuard {
      let secs = duration.as_secs().max(1).to_string();
      let scan = bluetoothctl(["--timeout", secs.as_str(), "scan", "on"])
         .timeout(duration + Duration::from_secs(2));
      let runner = self.runner.clone();
      let task = tokio::spawn(async move {
         if let Err(e) = runner.run(&scan).await {
            warn!("Discovery command failed: {e}");
         }
      });
      DiscoveryGuard {
         runner: self.runner.clone(),
         scan_task: Some(task),
      }
   }
}

/// Keeps discovery alive; `scan off` is issued on every exit path.
struct DiscoveryGuard {
   runner: SharedRunner,
   scan_task: Option<JoinHandle<()>>,
}

impl DiscoveryGuard {
   async fn stop(mut self) {
      if let Some(task) = self.scan_task.take() {
         task.abort();
      }
      if let Err(e) = self.runner.run(&bluetoothctl(["scan", "off"])).await {
         warn!("Failed to stop discovery: {e}");
      }
   }
}

impl Drop for DiscoveryGuard {
   fn drop(&mut self) {
      let Some(task) = self.scan_task.take() else {
         return;
      };
      task.abort();
      // Dropped mid-scan: stop discovery from a detached task.
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
         let runner = self.runner.clone();
         handle.spawn(async move {
            if let Err(e) = runner.run(&bluetoothctl(["scan", "off"])).await {
               warn!("Failed to stop discovery: {e}");
            }
         });
      }
   }
}

#[async_trait]
impl BluetoothService for BluetoothctlService {
   fn backend(&self) -> &'static str {
      "bluetoothctl"
   }

   async fn is_adapter_available(&self) -> bool {
      self
         .show()
         .await
         .is_some_and(|out| parser::parse_controller_available(&out))
   }

   async fn power_state(&self) -> bool {
      self
         .show()
         .await
         .is_some_and(|out| parser::parse_power_state(&out))
   }

   async fn set_power_state(&self, on: bool) -> bool {
      let action = if on { "unblock" } else { "block" };
      let invocation = Invocation::new("rfkill").args([action, "bluetooth"]);
      info!("Setting Bluetooth power state using: {invocation}");

      let output = match self.runner.run(&invocation).await {
         Ok(output) => output,
         Err(CommandError::NotFound(_)) => {
            error!("rfkill command not found, cannot change Bluetooth power state");
            return false;
         },
         Err(CommandError::PermissionDenied(_)) => {
            error!("Permission denied running rfkill");
            return false;
         },
         Err(e) => {
            error!("Unexpected error running rfkill: {e}");
            return false;
         },
      };

      if output.success() {
         debug!("rfkill output: {}", output.stdout.trim());
         self.cache.invalidate(Some(KEY_SHOW));
         return true;
      }

      log_rfkill_failure(&output);
      false
   }

   async fn devices(&self) -> Vec<Device> {
      let Ok(listing) = self.cached(KEY_DEVICES, bluetoothctl(["devices"])).await else {
         return Vec::new();
      };

      let mut devices = parser::parse_device_listing(&listing);
      for device in &mut devices {
         match self.device_info(&device.address).await {
            Some(details) => device.merge_details(&details),
            None => device.error = Some(format!("Failed to read details of {}", device.address)),
         }
      }
      devices
   }

   async fn scan(&self, duration: Duration) -> Vec<Device> {
      let guard = self.start_discovery(duration);
      time::sleep(duration).await;
      guard.stop().await;

      self.cache.invalidate(Some(KEY_DEVICES));
      self.devices().await
   }

   async fn device_info(&self, address: &str) -> Option<Device> {
      let output = self
         .cached(&info_key(address), bluetoothctl(["info", address]))
         .await
         .ok()?;
      parser::parse_device_info(&output)
   }

   async fn connect(&self, address: &str) -> bool {
      let output = self
         .run(bluetoothctl(["connect", address]).timeout(REMOTE_OP_TIMEOUT))
         .await;
      self.cache.invalidate(Some(&info_key(address)));
      output.contains("Connection successful")
   }

   async fn disconnect(&self, address: &str) -> bool {
      let output = self.run(bluetoothctl(["disconnect", address])).await;
      self.cache.invalidate(Some(&info_key(address)));
      output.contains("Successful disconnected")
   }

   async fn pair(&self, address: &str) -> Result<(), String> {
      let output = self
         .run(bluetoothctl(["pair", address]).timeout(REMOTE_OP_TIMEOUT))
         .await;
      self.cache.invalidate(Some(&info_key(address)));
      match parser::parse_pair_error(&output) {
         None => Ok(()),
         Some(reason) => {
            warn!("Pairing with {address} failed: {reason}");
            Err(reason)
         },
      }
   }

   async fn unpair(&self, address: &str) -> bool {
      let output = self.run(bluetoothctl(["remove", address])).await;
      self.cache.invalidate(Some(&info_key(address)));
      self.cache.invalidate(Some(KEY_DEVICES));
      output.contains("Device has been removed")
   }

   async fn trust(&self, address: &str) -> bool {
      let output = self.run(bluetoothctl(["trust", address])).await;
      self.cache.invalidate(Some(&info_key(address)));
      output.contains("trust succeeded")
   }

   async fn untrust(&self, address: &str) -> bool {
      let output = self.run(bluetoothctl(["untrust", address])).await;
      self.cache.invalidate(Some(&info_key(address)));
      output.contains("untrust succeeded")
   }

   fn invalidate_cache(&self, key: Option<&str>) {
      self.cache.invalidate(key);
   }
}

fn log_rfkill_failure(output: &CommandOutput) {
   let stderr = output.stderr.trim();
   if stderr.contains("Operation not possible due to RF-kill") {
      warn!("Bluetooth is blocked by a hardware switch or airplane mode: {stderr}");
   } else if stderr.contains("Permission denied") {
      error!("Permission denied for rfkill, the user may need to join the rfkill group: {stderr}");
   } else {
      error!("rfkill failed with {:?}: {stderr}", output.status);
   }
}
