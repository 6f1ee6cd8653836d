//! Exponential backoff bounded by attempt count and a wall-clock deadline.

use std::{future::Future, time::Duration};

use log::{debug, warn};
use thiserror::Error;
use tokio::time::{self, Instant};

/// Failure of a retried operation.
#[derive(Error, Debug)]
pub enum RetryError<E> {
   /// The last failure, or a failure that was not retryable.
   #[error("{0}")]
   Operation(E),

   /// The deadline passed before another attempt could start.
   #[error("Deadline of {0:?} exceeded")]
   DeadlineExceeded(Duration),
}

impl<E> RetryError<E> {
   pub fn into_operation(self) -> Option<E> {
      match self {
         Self::Operation(e) => Some(e),
         Self::DeadlineExceeded(_) => None,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
   pub max_attempts: u32,
   pub base_delay: Duration,
   pub deadline: Duration,
}

impl RetryPolicy {
   pub const fn new(max_attempts: u32, base_delay: Duration, deadline: Duration) -> Self {
      Self {
         max_attempts,
         base_delay,
         deadline,
      }
   }

   /// Backoff before the attempt following `attempt` (zero-based).
   pub fn delay_for(&self, attempt: u32) -> Duration {
      self
         .base_delay
         .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
   }

   /// Runs `op` until it succeeds, fails with a non-retryable error, runs
   /// out of attempts or the deadline passes.
   ///
   /// No sleep follows the final attempt, and no sleep extends past the
   /// deadline.
   pub async fn run<T, E, F, Fut>(
      &self,
      is_retryable: impl Fn(&E) -> bool,
      mut op: F,
   ) -> Result<T, RetryError<E>>
   where
      F: FnMut() -> Fut,
      Fut: Future<Output = Result<T, E>>,
      E: std::fmt::Display,
   {
      let start = Instant::now();
      let attempts = self.max_attempts.max(1);

      for attempt in 0..attempts {
         if start.elapsed() >= self.deadline {
            warn!("Giving up after {attempt} attempts: deadline of {:?} exceeded", self.deadline);
            return Err(RetryError::DeadlineExceeded(self.deadline));
         }

         let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Operation(e)),
            Err(e) => e,
         };

         if attempt + 1 == attempts {
            return Err(RetryError::Operation(err));
         }

         let remaining = self.deadline.saturating_sub(start.elapsed());
         let delay = self.delay_for(attempt).min(remaining);
         debug!(
            "Attempt {}/{attempts} failed ({err}), retrying in {delay:?}",
            attempt + 1
         );
         time::sleep(delay).await;
      }

      unreachable!("loop returns on its final attempt")
   }
}
