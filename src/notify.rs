//! Desktop notifications.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::command::{Invocation, SharedRunner};

/// Fire-and-forget user notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
   /// Shows `body`; failures are logged and reported as `false`.
   async fn notify(&self, body: &str) -> bool;
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Sends notifications through `notify-send`.
pub struct DesktopNotifier {
   runner: SharedRunner,
   title: String,
}

impl DesktopNotifier {
   pub fn new(runner: SharedRunner, title: impl Into<String>) -> Self {
      Self {
         runner,
         title: title.into(),
      }
   }
}

#[async_trait]
impl Notifier for DesktopNotifier {
   async fn notify(&self, body: &str) -> bool {
      let invocation = Invocation::new("notify-send").args([self.title.as_str(), body]);
      match self.runner.run(&invocation).await {
         Ok(out) if out.success() => {
            debug!("Sent notification: {body}");
            true
         },
         Ok(out) => {
            warn!("notify-send failed: {}", out.stderr.trim());
            false
         },
         Err(e) => {
            warn!("Failed to send notification: {e}");
            false
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::command::{CommandOutput, mock::MockRunner};

   #[tokio::test]
   async fn test_desktop_notifier() {
      let runner = MockRunner::new();
      runner.always("notify-send Better Control Buds connected.", CommandOutput::ok(""));
      let notifier = DesktopNotifier::new(runner.clone(), "Better Control");

      assert!(notifier.notify("Buds connected.").await);
      // notify-send missing
      assert!(!notifier.notify("other").await);
   }
}
