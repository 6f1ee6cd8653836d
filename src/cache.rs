//! TTL-bounded result cache for expensive tool queries.

use std::{collections::HashMap, future::Future, time::Duration};

use log::debug;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::time::Instant;

/// Default lifetime of a cached query result.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Entry<V> {
   value: V,
   stored_at: Instant,
}

/// Per-key cache of computed values.
///
/// Map access is serialized by a single mutex that is never held across a
/// computation, so two callers missing the same key at once may both
/// compute; the later store wins.
#[derive(Debug)]
pub struct ResultCache<V> {
   entries: Mutex<HashMap<SmolStr, Entry<V>>>,
}

impl<V> Default for ResultCache<V> {
   fn default() -> Self {
      Self {
         entries: Mutex::new(HashMap::new()),
      }
   }
}

impl<V: Clone> ResultCache<V> {
   pub fn new() -> Self {
      Self::default()
   }

   /// Returns the value stored under `key` if it is younger than `ttl`.
   pub fn get(&self, key: &str, ttl: Duration) -> Option<V> {
      let mut entries = self.entries.lock();
      match entries.get(key) {
         Some(entry) if entry.stored_at.elapsed() < ttl => Some(entry.value.clone()),
         Some(_) => {
            entries.remove(key);
            None
         },
         None => None,
      }
   }

   pub fn insert(&self, key: impl Into<SmolStr>, value: V) {
      self.entries.lock().insert(
         key.into(),
         Entry {
            value,
            stored_at: Instant::now(),
         },
      );
   }

   /// Returns the fresh value for `key`, computing and storing it on a miss.
   ///
   /// Failed computations are returned to the caller and never stored.
   pub async fn get_or_compute<E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = Result<V, E>>,
   {
      if let Some(value) = self.get(key, ttl) {
         debug!("Using cached result for: {key}");
         return Ok(value);
      }
      let value = compute().await?;
      self.insert(key, value.clone());
      Ok(value)
   }

   /// Drops one entry, or every entry when `key` is `None`.
   pub fn invalidate(&self, key: Option<&str>) {
      let mut entries = self.entries.lock();
      match key {
         Some(key) => {
            entries.remove(key);
         },
         None => entries.clear(),
      }
   }

   pub fn len(&self) -> usize {
      self.entries.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.lock().is_empty()
   }
}
