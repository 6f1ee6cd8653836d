//! Connectivity D-Bus service
//!
//! This daemon exposes Bluetooth and Wi-Fi adapter control and audio
//! routing on the session bus, and moves audio onto Bluetooth devices as
//! they connect.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{pin, select, signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use connectd::{
   bluetooth::manager::BluetoothManager,
   command::{SharedRunner, SystemRunner},
   config::Config,
   dbus::{ConnectivityService, ConnectivityServiceSignals, OBJECT_PATH, SERVICE_NAME},
   error::Result,
   event::{ConnectivityEvent, EventBus},
   notify::{DesktopNotifier, SharedNotifier},
   service,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting connectd D-Bus service...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (bluetooth backend: {:?})",
      config.bluetooth_backend
   );

   let runner: SharedRunner = Arc::new(SystemRunner::new(config.command_timeout()));
   let notifier: SharedNotifier = Arc::new(DesktopNotifier::new(
      runner.clone(),
      config.notification_title.clone(),
   ));
   let event_bus = EventProcessor::new();

   let (manager, mut completions) =
      BluetoothManager::connect(&config, runner.clone(), notifier, event_bus.clone()).await;
   if !manager.bluetooth_supported() {
      warn!("Bluetooth is not supported on this system");
   }

   let bluetooth =
      service::select_bluetooth(config.bluetooth_backend, runner.clone(), config.cache_ttl()).await;
   let wifi = service::select_wifi(runner, config.cache_ttl()).await;

   if manager.restore_last_sink().await {
      info!("Restored saved audio sink");
   }

   let service = ConnectivityService::new(manager.clone(), bluetooth, wifi);
   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("connectd D-Bus service started at {SERVICE_NAME}");

   event_bus.spawn_dispatcher(connection).await?;

   // Background operation callbacks run here, never on the workers.
   let shutdown = signal::ctrl_c();
   pin!(shutdown);
   loop {
      select! {
         finished = completions.next() => {
            if finished.is_none() {
               break;
            }
         },
         result = &mut shutdown => {
            result?;
            info!("Shutting down connectd...");
            break;
         },
      }
   }

   manager.shutdown().await;
   completions.drain();

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<ConnectivityEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<ConnectivityEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<ConnectivityService>,
      event: ConnectivityEvent,
   ) -> Result<()> {
      match event {
         ConnectivityEvent::DeviceConnected { path, name } => {
            iface.device_connected(&path, &name).await?;
         },
         ConnectivityEvent::DeviceDisconnected { path, name } => {
            iface.device_disconnected(&path, &name).await?;
         },
         ConnectivityEvent::AudioRouteChanged { sink } => {
            iface.audio_route_changed(&sink).await?;
            let service = iface.get().await;
            service.current_sink_changed(iface.signal_emitter()).await?;
         },
         ConnectivityEvent::OperationFinished {
            operation,
            path,
            success,
         } => {
            iface
               .operation_finished(&operation.to_string(), &path, success)
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ConnectivityService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: ConnectivityEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
