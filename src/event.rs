//! Event handling for connectivity and routing changes.
//!
//! The orchestrator reports device transitions, audio route changes and
//! finished background operations through an [`EventBus`]; the daemon
//! turns them into D-Bus signals.

use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;

/// Background operation kinds reported on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Operation {
   Connect,
   Disconnect,
}

/// Events that can be emitted by the connectivity manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectivityEvent {
   DeviceConnected {
      path: SmolStr,
      name: SmolStr,
   },
   DeviceDisconnected {
      path: SmolStr,
      name: SmolStr,
   },
   AudioRouteChanged {
      sink: SmolStr,
   },
   OperationFinished {
      operation: Operation,
      path: SmolStr,
      success: bool,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: ConnectivityEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
