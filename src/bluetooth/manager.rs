//! Bluetooth connectivity orchestration.
//!
//! [`BluetoothManager`] drives the adapter daemon through a [`DeviceBus`],
//! reacts to devices connecting by moving audio onto them, and runs
//! background connect/disconnect operations whose results are delivered
//! through a [`CompletionQueue`] owned by the caller.

use std::{
   panic::{self, AssertUnwindSafe},
   sync::Arc,
   time::Duration,
};

use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc},
   task::JoinHandle,
   time,
};

use super::bus::{
   BATTERY_INTERFACE, BLUEZ_SERVICE, BluezBus, DEVICE_INTERFACE, DeviceBus, PropertyStream,
};
use crate::{
   audio::{AudioRouter, CallbackError, SubscriptionId},
   command::{Invocation, SharedRunner},
   config::Config,
   error::{Error, Result},
   event::{ConnectivityEvent, EventSender, Operation},
   model::{BatteryReading, Device},
   notify::SharedNotifier,
   parser::bluetooth::parse_busctl_battery,
   retry::RetryPolicy,
};

/// Finished operations waiting for their callbacks.
const COMPLETION_QUEUE_SIZE: usize = 64;
/// Display name when the daemon reports none.
const FALLBACK_DEVICE_NAME: &str = "Bluetooth Device";

/// Runs on the caller's context with the outcome of a background operation.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// Timing and concurrency knobs of the manager.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
   /// Pause after a blocking connect before the device is queried.
   pub connect_settle: Duration,
   /// Pause after a background connect or disconnect.
   pub async_settle: Duration,
   pub init_retry: RetryPolicy,
   pub max_in_flight: usize,
}

impl From<&Config> for ManagerOptions {
   fn from(config: &Config) -> Self {
      Self {
         connect_settle: config.connect_settle(),
         async_settle: config.async_settle(),
         init_retry: config.init_retry(),
         max_in_flight: config.max_in_flight,
      }
   }
}

struct Completion {
   operation: Operation,
   path: SmolStr,
   success: bool,
   callback: CompletionCallback,
}

/// Receiving end for background operation results.
///
/// Callbacks only ever run inside [`next`](Self::next) or
/// [`drain`](Self::drain), on whatever task owns the queue.
pub struct CompletionQueue {
   rx: mpsc::Receiver<Completion>,
}

impl CompletionQueue {
   /// Waits for the next finished operation and runs its callback.
   ///
   /// Returns `None` once every manager handle has been dropped.
   pub async fn next(&mut self) -> Option<(Operation, bool)> {
      let completion = self.rx.recv().await?;
      Some(Self::complete(completion))
   }

   /// Runs the callbacks of every operation finished so far.
   pub fn drain(&mut self) -> usize {
      let mut count = 0;
      while let Ok(completion) = self.rx.try_recv() {
         Self::complete(completion);
         count += 1;
      }
      count
   }

   fn complete(completion: Completion) -> (Operation, bool) {
      let Completion {
         operation,
         path,
         success,
         callback,
      } = completion;
      debug!("Completing {operation} for {path}: success={success}");
      if panic::catch_unwind(AssertUnwindSafe(move || callback(success))).is_err() {
         error!("Completion callback for {operation} of {path} panicked");
      }
      (operation, success)
   }
}

struct Inner {
   bus: Option<Arc<dyn DeviceBus>>,
   adapter: Option<SmolStr>,
   runner: SharedRunner,
   audio: Arc<AudioRouter>,
   notifier: SharedNotifier,
   events: EventSender,
   options: ManagerOptions,
   permits: Arc<Semaphore>,
   completions: mpsc::Sender<Completion>,
   listener: Mutex<Option<JoinHandle<()>>>,
   route_subscription: Mutex<Option<SubscriptionId>>,
}

/// Handle to the connectivity orchestrator. Clones share one manager.
#[derive(Clone)]
pub struct BluetoothManager {
   inner: Arc<Inner>,
}

/// Failures worth another attempt while bringing the bus up.
fn is_transport_error(err: &Error) -> bool {
   matches!(err, Error::DBus(_) | Error::DBusCall(_) | Error::Io(_))
}

impl BluetoothManager {
   /// Connects to the system bus and binds the first adapter.
   ///
   /// When the bus stays unreachable after retries the manager is still
   /// returned, reporting Bluetooth as unsupported.
   pub async fn connect(
      config: &Config,
      runner: SharedRunner,
      notifier: SharedNotifier,
      events: EventSender,
   ) -> (Self, CompletionQueue) {
      let options = ManagerOptions::from(config);
      let bus = match options
         .init_retry
         .run(is_transport_error, BluezBus::system)
         .await
      {
         Ok(bus) => Some(Arc::new(bus) as Arc<dyn DeviceBus>),
         Err(e) => {
            error!("Failed to connect to the system bus: {e}");
            None
         },
      };

      let audio = Arc::new(AudioRouter::new(
         runner.clone(),
         config.sink_state_path(),
         config.audio_timings(),
      ));
      Self::with_bus(bus, audio, runner, notifier, events, options).await
   }

   /// Builds a manager over an existing bus; `None` yields a degraded manager.
   pub async fn with_bus(
      bus: Option<Arc<dyn DeviceBus>>,
      audio: Arc<AudioRouter>,
      runner: SharedRunner,
      notifier: SharedNotifier,
      events: EventSender,
      options: ManagerOptions,
   ) -> (Self, CompletionQueue) {
      let mut adapter = None;
      let mut listener = None;

      if let Some(bus) = &bus {
         match options
            .init_retry
            .run(is_transport_error, || bus.find_adapter())
            .await
         {
            Ok(path) => {
               info!("Using Bluetooth adapter {path}");
               adapter = Some(path);
            },
            Err(e) => warn!("No usable Bluetooth adapter: {e}"),
         }

         match bus.property_changes().await {
            Ok(changes) => {
               listener = Some(spawn_listener(
                  changes,
                  bus.clone(),
                  audio.clone(),
                  events.clone(),
               ));
            },
            Err(e) => warn!("Failed to subscribe to property changes: {e}"),
         }
      }

      let route_events = events.clone();
      let subscription = audio.register_callback(move |sink| {
         route_events.emit(ConnectivityEvent::AudioRouteChanged { sink: sink.into() });
         Ok::<(), CallbackError>(())
      });

      let (tx, rx) = mpsc::channel(COMPLETION_QUEUE_SIZE);
      let manager = Self {
         inner: Arc::new(Inner {
            bus,
            adapter,
            runner,
            audio,
            notifier,
            events,
            permits: Arc::new(Semaphore::new(options.max_in_flight.max(1))),
            options,
            completions: tx,
            listener: Mutex::new(listener),
            route_subscription: Mutex::new(Some(subscription)),
         }),
      };
      (manager, CompletionQueue { rx })
   }

   fn bus(&self) -> Option<&Arc<dyn DeviceBus>> {
      let bus = self.inner.bus.as_ref();
      if bus.is_none() {
         error!("Bluetooth bus not initialized");
      }
      bus
   }

   fn adapter(&self) -> Option<(&Arc<dyn DeviceBus>, &str)> {
      let bus = self.bus()?;
      let adapter = self.inner.adapter.as_deref()?;
      Some((bus, adapter))
   }

   pub fn audio(&self) -> &Arc<AudioRouter> {
      &self.inner.audio
   }

   pub fn bluetooth_supported(&self) -> bool {
      self.inner.bus.is_some() && self.inner.adapter.is_some()
   }

   pub async fn power_state(&self) -> bool {
      let Some((bus, adapter)) = self.adapter() else {
         return false;
      };
      bus.adapter_powered(adapter)
         .await
         .inspect_err(|e| error!("Failed getting power state: {e}"))
         .unwrap_or(false)
   }

   pub async fn set_power(&self, on: bool) -> bool {
      let Some((bus, adapter)) = self.adapter() else {
         return false;
      };
      match bus.set_adapter_powered(adapter, on).await {
         Ok(()) => {
            info!("Bluetooth power set to {on}");
            true
         },
         Err(e) => {
            error!("Failed setting power state: {e}");
            false
         },
      }
   }

   pub async fn devices(&self) -> Vec<Device> {
      let Some(bus) = self.bus() else {
         return Vec::new();
      };
      bus.devices()
         .await
         .inspect_err(|e| error!("Failed getting devices: {e}"))
         .unwrap_or_default()
   }

   pub async fn start_discovery(&self) -> bool {
      let Some((bus, adapter)) = self.adapter() else {
         return false;
      };
      bus.start_discovery(adapter)
         .await
         .inspect(|()| info!("Started device discovery"))
         .inspect_err(|e| error!("Failed starting discovery: {e}"))
         .is_ok()
   }

   pub async fn stop_discovery(&self) -> bool {
      let Some((bus, adapter)) = self.adapter() else {
         return false;
      };
      bus.stop_discovery(adapter)
         .await
         .inspect(|()| info!("Stopped device discovery"))
         .inspect_err(|e| error!("Failed stopping discovery: {e}"))
         .is_ok()
   }

   /// Battery level of the device at `path`.
   ///
   /// Reads the daemon's battery interface, then falls back to `busctl`.
   pub async fn device_battery(&self, path: &str) -> BatteryReading {
      if let Some(bus) = &self.inner.bus {
         match bus.battery_percentage(path).await {
            Ok(Some(level)) => return BatteryReading::Level(level.min(100)),
            Ok(None) => debug!("{path} has no battery interface, trying busctl"),
            Err(e) => debug!("Battery read for {path} failed ({e}), trying busctl"),
         }
      }

      let invocation = Invocation::new("busctl").args([
         "get-property",
         BLUEZ_SERVICE,
         path,
         BATTERY_INTERFACE,
         "Percentage",
      ]);
      match self.inner.runner.run(&invocation).await {
         Ok(out) if out.success() => parse_busctl_battery(&out.stdout),
         Ok(_) => BatteryReading::NotSupported,
         Err(e) => {
            error!("Failed retrieving battery info with busctl: {e}");
            BatteryReading::Failed
         },
      }
   }

   /// Name used in user notifications when disconnecting.
   async fn display_name(&self, bus: &dyn DeviceBus, path: &str) -> SmolStr {
      match bus.name(path).await {
         Ok(name) => name,
         Err(_) => bus
            .alias(path)
            .await
            .unwrap_or_else(|_| FALLBACK_DEVICE_NAME.into()),
      }
   }

   async fn announce_connected(&self, path: &str, name: &str) {
      let body = match self.device_battery(path).await.level() {
         Some(level) => format!("{name} connected.\nBattery: {level}%"),
         None => format!("{name} connected."),
      };
      self.inner.notifier.notify(&body).await;
      self.inner.audio.switch_to_wireless_audio(path).await;
   }

   /// Connects the device at `path`, then routes audio to it.
   pub async fn connect_device(&self, path: &str) -> bool {
      let Some(bus) = self.bus() else {
         return false;
      };
      if let Err(e) = bus.connect(path).await {
         error!("Failed connecting to device {path}: {e}");
         return false;
      }

      time::sleep(self.inner.options.connect_settle).await;

      let name = match bus.alias(path).await {
         Ok(name) => name,
         Err(e) => {
            error!("Failed connecting to device {path}: {e}");
            return false;
         },
      };
      self.announce_connected(path, &name).await;
      true
   }

   /// Disconnects the device at `path` and routes audio back to the
   /// wired endpoints.
   pub async fn disconnect_device(&self, path: &str) -> bool {
      let Some(bus) = self.bus() else {
         return false;
      };
      let name = self.display_name(bus.as_ref(), path).await;
      if let Err(e) = bus.disconnect(path).await {
         error!("Failed disconnecting from device {name}: {e}");
         return false;
      }

      self
         .inner
         .notifier
         .notify(&format!("{name} disconnected."))
         .await;
      self.inner.audio.switch_to_default_audio().await;
      true
   }

   async fn run_connect(&self, path: &str) -> bool {
      let Some(bus) = self.bus() else {
         return false;
      };
      let name = bus
         .alias(path)
         .await
         .unwrap_or_else(|_| FALLBACK_DEVICE_NAME.into());

      info!("Connecting to {name}...");
      if let Err(e) = bus.connect(path).await {
         error!("Failed connecting to device {name}: {e}");
         return false;
      }

      time::sleep(self.inner.options.async_settle).await;

      match bus.connected(path).await {
         Ok(true) => {},
         Ok(false) => {
            warn!("Connection to {name} reported as failed, but no error was raised");
            return false;
         },
         Err(e) => error!("Failed to verify connection status of {name}: {e}"),
      }

      self.announce_connected(path, &name).await;
      true
   }

   async fn run_disconnect(&self, path: &str) -> bool {
      let Some(bus) = self.bus() else {
         return false;
      };
      let name = self.display_name(bus.as_ref(), path).await;

      info!("Disconnecting from {name}...");
      if let Err(e) = bus.disconnect(path).await {
         error!("Failed disconnecting from device {name}: {e}");
         return false;
      }

      time::sleep(self.inner.options.async_settle).await;

      self
         .inner
         .notifier
         .notify(&format!("{name} disconnected."))
         .await;
      self.inner.audio.switch_to_default_audio().await;
      true
   }

   fn admit(&self) -> Result<OwnedSemaphorePermit> {
      self
         .inner
         .permits
         .clone()
         .try_acquire_owned()
         .map_err(|e| match e {
            TryAcquireError::Closed => Error::ManagerShutdown,
            TryAcquireError::NoPermits => Error::Busy,
         })
   }

   fn spawn_operation<F>(&self, operation: Operation, path: &str, callback: F) -> Result<()>
   where
      F: FnOnce(bool) + Send + 'static,
   {
      let permit = self.admit()?;
      let this = self.clone();
      let path = SmolStr::from(path);

      tokio::spawn(async move {
         let success = match operation {
            Operation::Connect => this.run_connect(&path).await,
            Operation::Disconnect => this.run_disconnect(&path).await,
         };
         drop(permit);

         this.inner.events.emit(ConnectivityEvent::OperationFinished {
            operation,
            path: path.clone(),
            success,
         });
         let completion = Completion {
            operation,
            path,
            success,
            callback: Box::new(callback),
         };
         if let Err(mpsc::error::SendError(dropped)) = this.inner.completions.send(completion).await {
            warn!(
               "Completion queue closed, dropping {} result for {}",
               dropped.operation, dropped.path
            );
         }
      });
      Ok(())
   }

   /// Connects in the background; `callback` runs through the
   /// [`CompletionQueue`] once the device reports connected or the attempt
   /// fails.
   ///
   /// Refused with [`Error::Busy`] when too many operations are in flight
   /// and with [`Error::ManagerShutdown`] after [`shutdown`](Self::shutdown).
   pub fn connect_device_async<F>(&self, path: &str, callback: F) -> Result<()>
   where
      F: FnOnce(bool) + Send + 'static,
   {
      self.spawn_operation(Operation::Connect, path, callback)
   }

   pub fn disconnect_device_async<F>(&self, path: &str, callback: F) -> Result<()>
   where
      F: FnOnce(bool) + Send + 'static,
   {
      self.spawn_operation(Operation::Disconnect, path, callback)
   }

   pub async fn restore_last_sink(&self) -> bool {
      self.inner.audio.restore_saved_sink().await
   }

   /// Sink most recently applied, else the sound server's current default.
   pub async fn current_audio_sink(&self) -> Option<SmolStr> {
      match self.inner.audio.applied_sink() {
         Some(sink) => Some(sink),
         None => self.inner.audio.current_sink().await,
      }
   }

   pub fn add_audio_routing_callback<F>(&self, callback: F) -> SubscriptionId
   where
      F: Fn(&str) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
   {
      self.inner.audio.register_callback(callback)
   }

   pub fn remove_audio_routing_callback(&self, id: SubscriptionId) -> bool {
      self.inner.audio.unregister_callback(id)
   }

   /// Stops the property listener and releases the bus.
   ///
   /// Background operations already running finish normally; new ones are
   /// refused. Teardown errors are logged and ignored.
   pub async fn shutdown(&self) {
      self.inner.permits.close();

      let listener = self.inner.listener.lock().take();
      if let Some(handle) = listener {
         handle.abort();
      }
      let subscription = self.inner.route_subscription.lock().take();
      if let Some(id) = subscription {
         self.inner.audio.unregister_callback(id);
      }
      if let Some(bus) = &self.inner.bus
         && let Err(e) = bus.close().await
      {
         debug!("Ignoring error while closing bus: {e}");
      }
      info!("Bluetooth manager shut down");
   }
}

/// Handles property changes one at a time, in emission order.
fn spawn_listener(
   mut changes: PropertyStream,
   bus: Arc<dyn DeviceBus>,
   audio: Arc<AudioRouter>,
   events: EventSender,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      while let Some(change) = changes.next().await {
         if change.interface != DEVICE_INTERFACE {
            continue;
         }
         let Some(connected) = change.connected else {
            continue;
         };

         let name = bus
            .alias(&change.path)
            .await
            .unwrap_or_else(|_| FALLBACK_DEVICE_NAME.into());
         if connected {
            info!("Device connected: {name} ({})", change.path);
            events.emit(ConnectivityEvent::DeviceConnected {
               path: change.path.clone(),
               name,
            });
            audio.switch_to_wireless_audio(&change.path).await;
         } else {
            info!("Device disconnected: {name} ({})", change.path);
            events.emit(ConnectivityEvent::DeviceDisconnected {
               path: change.path,
               name,
            });
         }
      }
      debug!("Property change stream ended");
   })
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicBool, Ordering};

   use async_trait::async_trait;

   use super::*;
   use crate::{
      audio::AudioTimings,
      bluetooth::bus::{PropertyChange, mock::MockBus},
      command::{CommandError, CommandOutput, mock::MockRunner},
      event::testing::RecordingBus,
      notify::Notifier,
   };

   const BUDS: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

   #[derive(Default)]
   struct RecordingNotifier {
      bodies: Mutex<Vec<String>>,
   }

   #[async_trait]
   impl Notifier for RecordingNotifier {
      async fn notify(&self, body: &str) -> bool {
         self.bodies.lock().push(body.to_string());
         true
      }
   }

   struct Fixture {
      bus: Arc<MockBus>,
      runner: Arc<MockRunner>,
      notifier: Arc<RecordingNotifier>,
      events: Arc<RecordingBus>,
   }

   fn options() -> ManagerOptions {
      ManagerOptions {
         connect_settle: Duration::from_secs(2),
         async_settle: Duration::from_secs(1),
         init_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(10)),
         max_in_flight: 4,
      }
   }

   impl Fixture {
      fn new(bus: MockBus) -> Self {
         Self {
            bus: Arc::new(bus),
            runner: MockRunner::new(),
            notifier: Arc::new(RecordingNotifier::default()),
            events: RecordingBus::new(),
         }
      }

      async fn manager(&self, with_bus: bool) -> (BluetoothManager, CompletionQueue) {
         self.manager_with(with_bus, options()).await
      }

      async fn manager_with(
         &self,
         with_bus: bool,
         options: ManagerOptions,
      ) -> (BluetoothManager, CompletionQueue) {
         let audio = Arc::new(AudioRouter::new(
            self.runner.clone(),
            None,
            AudioTimings::default(),
         ));
         let bus = with_bus.then(|| self.bus.clone() as Arc<dyn DeviceBus>);
         BluetoothManager::with_bus(
            bus,
            audio,
            self.runner.clone(),
            self.notifier.clone(),
            self.events.clone(),
            options,
         )
         .await
      }

      fn bodies(&self) -> Vec<String> {
         self.notifier.bodies.lock().clone()
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_degraded_manager() {
      let fixture = Fixture::new(MockBus::default());
      let (manager, _queue) = fixture.manager(false).await;

      assert!(!manager.bluetooth_supported());
      assert!(!manager.power_state().await);
      assert!(!manager.set_power(true).await);
      assert!(manager.devices().await.is_empty());
      assert!(!manager.start_discovery().await);
      assert!(!manager.connect_device(BUDS).await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_missing_adapter_is_unsupported() {
      let fixture = Fixture::new(MockBus::default());
      let (manager, _queue) = fixture.manager(true).await;
      assert!(!manager.bluetooth_supported());
      assert!(!manager.power_state().await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_and_discovery() {
      let fixture = Fixture::new(MockBus::with_adapter());
      let (manager, _queue) = fixture.manager(true).await;

      assert!(manager.bluetooth_supported());
      assert!(!manager.power_state().await);
      assert!(manager.set_power(true).await);
      assert!(manager.power_state().await);
      assert!(manager.start_discovery().await);
      assert!(manager.stop_discovery().await);
      assert_eq!(fixture.bus.count("start_discovery /org/bluez/hci0"), 1);
      assert_eq!(fixture.bus.count("stop_discovery /org/bluez/hci0"), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_async_never_connected_reports_failure() {
      let bus = MockBus::with_adapter();
      bus.device(BUDS, "Buds", false);
      let fixture = Fixture::new(bus);
      let (manager, mut queue) = fixture.manager(true).await;

      let reported = Arc::new(Mutex::new(None));
      let slot = reported.clone();
      manager
         .connect_device_async(BUDS, move |ok| *slot.lock() = Some(ok))
         .unwrap();

      assert_eq!(queue.next().await, Some((Operation::Connect, false)));
      assert_eq!(*reported.lock(), Some(false));
      assert_eq!(fixture.bus.count(&format!("connect {BUDS}")), 1);
      assert!(fixture.bodies().is_empty());
      assert!(fixture.events.events().contains(&ConnectivityEvent::OperationFinished {
         operation: Operation::Connect,
         path: BUDS.into(),
         success: false,
      }));
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_async_success_notifies_with_battery() {
      let bus = MockBus::with_adapter();
      bus.device(BUDS, "Buds", true).battery(BUDS, Ok(Some(80)));
      let fixture = Fixture::new(bus);
      let (manager, mut queue) = fixture.manager(true).await;

      let called = Arc::new(AtomicBool::new(false));
      let flag = called.clone();
      manager
         .connect_device_async(BUDS, move |ok| flag.store(ok, Ordering::SeqCst))
         .unwrap();

      assert_eq!(queue.next().await, Some((Operation::Connect, true)));
      assert!(called.load(Ordering::SeqCst));
      assert_eq!(fixture.bodies(), vec!["Buds connected.\nBattery: 80%".to_string()]);
      // the sound server is unreachable, so no route was applied
      assert_eq!(fixture.runner.count_prefix("pactl set-default"), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_callback_runs_only_when_drained() {
      let bus = MockBus::with_adapter();
      bus.device(BUDS, "Buds", true);
      let fixture = Fixture::new(bus);
      let (manager, mut queue) = fixture.manager(true).await;

      let called = Arc::new(AtomicBool::new(false));
      let flag = called.clone();
      manager
         .disconnect_device_async(BUDS, move |_| flag.store(true, Ordering::SeqCst))
         .unwrap();

      time::sleep(Duration::from_secs(5)).await;
      assert!(!called.load(Ordering::SeqCst));
      assert_eq!(queue.drain(), 1);
      assert!(called.load(Ordering::SeqCst));
      assert_eq!(fixture.bodies(), vec!["Buds disconnected.".to_string()]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_async_backpressure_and_shutdown() {
      let bus = MockBus::with_adapter();
      bus.device(BUDS, "Buds", true);
      let fixture = Fixture::new(bus);
      let (manager, mut queue) = fixture
         .manager_with(true, ManagerOptions {
            max_in_flight: 1,
            ..options()
         })
         .await;

      manager.connect_device_async(BUDS, |_| {}).unwrap();
      assert!(matches!(
         manager.connect_device_async(BUDS, |_| {}),
         Err(Error::Busy)
      ));
      assert!(queue.next().await.is_some());

      manager.shutdown().await;
      assert!(matches!(
         manager.disconnect_device_async(BUDS, |_| {}),
         Err(Error::ManagerShutdown)
      ));
      assert_eq!(fixture.bus.count("close"), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_sync_connect_and_disconnect() {
      let bus = MockBus::with_adapter();
      bus.device(BUDS, "Buds", true);
      let fixture = Fixture::new(bus);
      fixture.runner.always(
         &format!("busctl get-property org.bluez {BUDS} org.bluez.Battery1 Percentage"),
         CommandOutput::failed(1, "Unknown interface"),
      );
      let (manager, _queue) = fixture.manager(true).await;

      assert!(manager.connect_device(BUDS).await);
      assert!(manager.disconnect_device(BUDS).await);
      assert_eq!(
         fixture.bodies(),
         vec!["Buds connected.".to_string(), "Buds disconnected.".to_string()]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_battery_fallback() {
      let bus = MockBus::with_adapter();
      bus.battery(BUDS, Err(Error::NotSupported));
      let fixture = Fixture::new(bus);
      let busctl = format!("busctl get-property org.bluez {BUDS} org.bluez.Battery1 Percentage");
      fixture.runner.once(&busctl, CommandOutput::ok("y 85\n"));
      fixture.runner.once(&busctl, CommandOutput::failed(1, "No such interface"));
      fixture.runner.once_err(&busctl, CommandError::NotFound("busctl".into()));
      let (manager, _queue) = fixture.manager(true).await;

      assert_eq!(manager.device_battery(BUDS).await, BatteryReading::Level(85));
      assert_eq!(manager.device_battery(BUDS).await, BatteryReading::NotSupported);
      assert_eq!(manager.device_battery(BUDS).await, BatteryReading::Failed);

      fixture.bus.battery(BUDS, Ok(Some(42)));
      assert_eq!(manager.device_battery(BUDS).await, BatteryReading::Level(42));
   }

   #[tokio::test(start_paused = true)]
   async fn test_listener_routes_audio_on_connect() {
      let bus = MockBus::with_adapter();
      bus.device(BUDS, "Buds", true);
      let feed = bus.change_feed();
      let fixture = Fixture::new(bus);
      fixture.runner.always(
         "pactl list sinks short",
         CommandOutput::ok("1\tbluez_output.AA_BB.1\tmodule-bluez5-device.c\ts16le 2ch 48000Hz\tIDLE\n"),
      );
      fixture
         .runner
         .always("pactl list sources short", CommandOutput::ok(""));
      fixture.runner.always(
         "pactl set-default-sink bluez_output.AA_BB.1",
         CommandOutput::ok(""),
      );
      let (_manager, _queue) = fixture.manager(true).await;

      feed
         .send(PropertyChange {
            path: BUDS.into(),
            interface: "org.bluez.MediaControl1".into(),
            connected: Some(true),
         })
         .await
         .unwrap();
      feed
         .send(PropertyChange {
            path: BUDS.into(),
            interface: DEVICE_INTERFACE.into(),
            connected: Some(true),
         })
         .await
         .unwrap();

      time::sleep(Duration::from_secs(5)).await;

      assert_eq!(fixture.runner.count("pactl set-default-sink bluez_output.AA_BB.1"), 1);
      let events = fixture.events.events();
      assert_eq!(events[0], ConnectivityEvent::DeviceConnected {
         path: BUDS.into(),
         name: "Buds".into(),
      });
      assert!(events.contains(&ConnectivityEvent::AudioRouteChanged {
         sink: "bluez_output.AA_BB.1".into(),
      }));
   }
}
