//! Audio endpoint routing through `pactl`.
//!
//! The router switches the system default sink and source, remembers the
//! last sink chosen so it survives restarts, and tells subscribers about
//! every sink change.

use std::{
   panic::{self, AssertUnwindSafe},
   path::PathBuf,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::{fs, time};

use crate::{
   command::{Invocation, SharedRunner},
   error::{Error, Result},
   model::{AudioEndpoint, AudioSink, AudioSource, EndpointKind},
   parser::audio::parse_endpoints,
   retry::RetryPolicy,
};

/// Listing and applying are retried against a restarting sound server.
const AUDIO_RETRY: RetryPolicy =
   RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5));

/// Failure reported by a routing subscriber.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct CallbackError(pub String);

/// Called with the new default sink name after every sink switch.
pub type RoutingCallback = Arc<dyn Fn(&str) -> std::result::Result<(), CallbackError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
   pub const fn get(self) -> u64 {
      self.0
   }
}

/// Waits applied while a freshly connected device registers its endpoints.
#[derive(Debug, Clone, Copy)]
pub struct AudioTimings {
   pub register_delay: Duration,
   pub retry_delay: Duration,
}

impl Default for AudioTimings {
   fn default() -> Self {
      Self {
         register_delay: Duration::from_secs(1),
         retry_delay: Duration::from_secs(2),
      }
   }
}

pub struct AudioRouter {
   runner: SharedRunner,
   state_file: Option<PathBuf>,
   timings: AudioTimings,
   current_sink: Mutex<Option<SmolStr>>,
   callbacks: Mutex<Vec<(SubscriptionId, RoutingCallback)>>,
   next_id: AtomicU64,
}

fn is_retryable(err: &Error) -> bool {
   match err {
      Error::Command(e) => e.is_transient(),
      Error::AudioServer(_) => true,
      _ => false,
   }
}

impl AudioRouter {
   pub fn new(runner: SharedRunner, state_file: Option<PathBuf>, timings: AudioTimings) -> Self {
      Self {
         runner,
         state_file,
         timings,
         current_sink: Mutex::new(None),
         callbacks: Mutex::new(Vec::new()),
         next_id: AtomicU64::new(1),
      }
   }

   async fn list_once(&self, kind: EndpointKind) -> Result<Vec<AudioEndpoint>> {
      let what = match kind {
         EndpointKind::Sink => "sinks",
         EndpointKind::Source => "sources",
      };
      let output = self
         .runner
         .run(&Invocation::new("pactl").args(["list", what, "short"]))
         .await?;
      if !output.success() {
         return Err(Error::AudioServer(output.stderr.trim().to_string()));
      }
      Ok(parse_endpoints(&output.stdout))
   }

   async fn endpoints(&self, kind: EndpointKind) -> Result<Vec<AudioEndpoint>> {
      Ok(AUDIO_RETRY.run(is_retryable, || self.list_once(kind)).await?)
   }

   async fn endpoints_or_empty(&self, kind: EndpointKind) -> Vec<AudioEndpoint> {
      self.endpoints(kind).await.unwrap_or_else(|e| {
         error!("Failed to list audio {kind}s: {e}");
         Vec::new()
      })
   }

   pub async fn list_sinks(&self) -> Vec<AudioSink> {
      self.endpoints_or_empty(EndpointKind::Sink).await
   }

   pub async fn list_sources(&self) -> Vec<AudioSource> {
      self.endpoints_or_empty(EndpointKind::Source).await
   }

   async fn current(&self, kind: EndpointKind) -> Option<SmolStr> {
      let command = match kind {
         EndpointKind::Sink => "get-default-sink",
         EndpointKind::Source => "get-default-source",
      };
      match self.runner.run(&Invocation::new("pactl").arg(command)).await {
         Ok(out) if out.success() => {
            let name = out.stdout.trim();
            (!name.is_empty()).then(|| name.into())
         },
         Ok(out) => {
            error!("Failed getting current audio {kind}: {}", out.stderr.trim());
            None
         },
         Err(e) => {
            error!("Failed getting current audio {kind}: {e}");
            None
         },
      }
   }

   /// The system's current default sink.
   pub async fn current_sink(&self) -> Option<SmolStr> {
      self.current(EndpointKind::Sink).await
   }

   pub async fn current_source(&self) -> Option<SmolStr> {
      self.current(EndpointKind::Source).await
   }

   /// Sink most recently applied by this router.
   pub fn applied_sink(&self) -> Option<SmolStr> {
      self.current_sink.lock().clone()
   }

   /// Verifies `name` is enumerable, then makes it the default.
   async fn apply(&self, kind: EndpointKind, name: &str) -> Result<()> {
      let kind_name: &'static str = kind.into();
      if !self.endpoints(kind).await?.iter().any(|e| e.name == name) {
         warn!("Audio {kind} '{name}' not found");
         return Err(Error::RouteNotFound {
            kind: kind_name,
            name: name.into(),
         });
      }

      let command = match kind {
         EndpointKind::Sink => "set-default-sink",
         EndpointKind::Source => "set-default-source",
      };
      let invocation = Invocation::new("pactl").args([command, name]);
      AUDIO_RETRY
         .run(is_retryable, || async {
            let out = self.runner.run(&invocation).await.map_err(Error::from)?;
            if out.success() {
               Ok(())
            } else {
               Err(Error::AudioServer(out.stderr.trim().to_string()))
            }
         })
         .await
         .map_err(|e| Error::RouteFailed {
            kind: kind_name,
            name: name.into(),
            reason: e.to_string(),
         })?;

      info!("Set default {kind} to: {name}");
      Ok(())
   }

   /// Makes `name` the default sink, persists it and notifies subscribers.
   pub async fn set_default_sink(&self, name: &str) -> Result<()> {
      self.apply(EndpointKind::Sink, name).await?;
      *self.current_sink.lock() = Some(name.into());
      self.save_sink_state(name).await;
      self.notify(name);
      Ok(())
   }

   pub async fn set_default_source(&self, name: &str) -> Result<()> {
      self.apply(EndpointKind::Source, name).await
   }

   async fn save_sink_state(&self, name: &str) {
      let Some(path) = &self.state_file else {
         return;
      };
      if let Some(parent) = path.parent()
         && let Err(e) = fs::create_dir_all(parent).await
      {
         error!("Failed to save sink state: {e}");
         return;
      }
      match fs::write(path, name).await {
         Ok(()) => debug!("Saved sink state: {name}"),
         Err(e) => error!("Failed to save sink state: {e}"),
      }
   }

   /// Re-applies the persisted sink when it is currently available.
   pub async fn restore_saved_sink(&self) -> bool {
      let Some(path) = &self.state_file else {
         return false;
      };
      let saved = match fs::read_to_string(path).await {
         Ok(contents) => contents.trim().to_string(),
         Err(e) => {
            debug!("No saved sink state: {e}");
            return false;
         },
      };
      if saved.is_empty() {
         debug!("Saved sink state file is empty");
         return false;
      }

      if !self.list_sinks().await.iter().any(|s| s.name == saved) {
         info!("Saved sink '{saved}' is not currently available");
         return false;
      }

      info!("Restoring saved sink: {saved}");
      self
         .set_default_sink(&saved)
         .await
         .inspect_err(|e| error!("Error restoring saved sink: {e}"))
         .is_ok()
   }

   /// Single unretried listing; the caller's own retry bounds the wait.
   async fn wireless_once(&self, kind: EndpointKind) -> Vec<AudioEndpoint> {
      match self.list_once(kind).await {
         Ok(endpoints) => endpoints.into_iter().filter(|e| e.wireless).collect(),
         Err(e) => {
            debug!("Listing audio {kind}s failed: {e}");
            Vec::new()
         },
      }
   }

   async fn wireless_endpoints(&self) -> (Vec<AudioSink>, Vec<AudioSource>) {
      let sinks = self.wireless_once(EndpointKind::Sink).await;
      let sources = self.wireless_once(EndpointKind::Source).await;
      (sinks, sources)
   }

   /// Routes output and input to the first wireless endpoints once the
   /// device at `device_path` has registered them.
   ///
   /// Returns whether at least one of the two was switched.
   pub async fn switch_to_wireless_audio(&self, device_path: &str) -> bool {
      time::sleep(self.timings.register_delay).await;

      let (mut sinks, mut sources) = self.wireless_endpoints().await;
      if sinks.is_empty() && sources.is_empty() {
         debug!("No wireless audio endpoints for {device_path} yet, retrying");
         time::sleep(self.timings.retry_delay).await;
         (sinks, sources) = self.wireless_endpoints().await;
         if sinks.is_empty() && sources.is_empty() {
            warn!("No wireless audio endpoints found for {device_path}");
            return false;
         }
      }

      self.switch_pair(sinks.first(), sources.first(), "wireless").await
   }

   /// Routes output and input back to the first wired endpoints.
   pub async fn switch_to_default_audio(&self) -> bool {
      let sinks = self.list_sinks().await;
      let sources = self.list_sources().await;
      self
         .switch_pair(
            sinks.iter().find(|s| !s.wireless),
            sources.iter().find(|s| !s.wireless),
            "default",
         )
         .await
   }

   async fn switch_pair(
      &self,
      sink: Option<&AudioSink>,
      source: Option<&AudioSource>,
      label: &str,
   ) -> bool {
      let mut switched = false;
      if let Some(sink) = sink {
         match self.set_default_sink(&sink.name).await {
            Ok(()) => {
               info!("Switched to {label} output: {}", sink.name);
               switched = true;
            },
            Err(e) => error!("Failed to switch to {label} output: {e}"),
         }
      }
      if let Some(source) = source {
         match self.set_default_source(&source.name).await {
            Ok(()) => {
               info!("Switched to {label} input: {}", source.name);
               switched = true;
            },
            Err(e) => error!("Failed to switch to {label} input: {e}"),
         }
      }
      switched
   }

   pub fn register_callback<F>(&self, callback: F) -> SubscriptionId
   where
      F: Fn(&str) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
   {
      let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
      self.callbacks.lock().push((id, Arc::new(callback)));
      id
   }

   pub fn unregister_callback(&self, id: SubscriptionId) -> bool {
      let mut callbacks = self.callbacks.lock();
      let before = callbacks.len();
      callbacks.retain(|(cid, _)| *cid != id);
      callbacks.len() != before
   }

   /// Invokes every subscriber; failures and panics are logged and skipped.
   fn notify(&self, sink: &str) {
      let callbacks: Vec<RoutingCallback> =
         self.callbacks.lock().iter().map(|(_, cb)| cb.clone()).collect();
      for callback in callbacks {
         match panic::catch_unwind(AssertUnwindSafe(|| callback(sink))) {
            Ok(Ok(())) => {},
            Ok(Err(e)) => error!("Error in audio routing callback: {e}"),
            Err(_) => error!("Audio routing callback panicked"),
         }
      }
   }
}
