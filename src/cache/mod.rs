//! Tiered request cache with in-flight deduplication.
//!
//! Sits between feature code and the network: unexpired entries are served
//! without touching the backend, concurrent readers of the same key share a
//! single outstanding fetch, and writes invalidate by exact key or pattern.

mod entry;
pub mod key;

pub use entry::{CacheEntry, CacheOptions, DataClass, Priority};

use crate::config::CacheConfig;
use crate::error::{Result, SyncError};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

type FetchOutput = std::result::Result<Arc<Vec<u8>>, SyncError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutput>>;

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  in_flight: HashMap<String, SharedFetch>,
}

struct CacheInner {
  config: CacheConfig,
  state: Mutex<CacheState>,
}

/// Entry count and in-flight count, for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub in_flight: usize,
}

/// Process-wide request cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestCache {
  inner: Arc<CacheInner>,
}

impl RequestCache {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        config,
        state: Mutex::new(CacheState::default()),
      }),
    }
  }

  /// Cache-first read.
  ///
  /// 1. A live, unexpired entry is returned without calling `fetcher`.
  /// 2. An in-flight fetch for the same key is shared instead of duplicated.
  /// 3. Otherwise `fetcher` runs; success is stored with a TTL resolved from
  ///    `class` (or `options.ttl_override`), failure propagates to every
  ///    waiter and is not cached, so the next call retries.
  pub async fn get<T, F, Fut>(
    &self,
    cache_key: &str,
    class: DataClass,
    options: CacheOptions,
    fetcher: F,
  ) -> Result<T>
  where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let shared = {
      let mut state = lock_state(&self.inner);
      let now = Utc::now();

      if let Some(entry) = state.entries.get(cache_key) {
        if !entry.is_expired(now) {
          let bytes = entry.decode()?;
          return Ok(serde_json::from_slice(&bytes)?);
        }
        // Lazy expiry: drop the stale entry on read.
        state.entries.remove(cache_key);
      }

      if let Some(pending) = state.in_flight.get(cache_key).cloned() {
        pending
      } else {
        let ttl = options
          .ttl_override
          .unwrap_or_else(|| class.ttl(&self.inner.config));
        let fut = fetcher();
        let inner = Arc::clone(&self.inner);
        let owned_key = cache_key.to_string();

        let driving = async move {
          let result = fut.await;
          let mut state = lock_state(&inner);
          state.in_flight.remove(&owned_key);
          match result {
            Ok(value) => {
              let json = serde_json::to_vec(&value).map_err(SyncError::from)?;
              let entry =
                CacheEntry::encode(&json, options.compress, Utc::now() + ttl, options.priority)?;
              store_entry(&mut state, inner.config.max_entries, owned_key, entry);
              Ok(Arc::new(json))
            }
            Err(e) => Err(e),
          }
        }
        .boxed()
        .shared();

        state.in_flight.insert(cache_key.to_string(), driving.clone());
        driving
      }
    };

    let bytes = shared.await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Remove a single entry immediately.
  pub fn invalidate(&self, cache_key: &str) {
    let mut state = lock_state(&self.inner);
    state.entries.remove(cache_key);
  }

  /// Remove every entry whose key matches `pattern` (prefix, or `*` glob).
  /// Used after writes that affect an unbounded set of cached queries.
  pub fn invalidate_pattern(&self, pattern: &str) {
    let mut state = lock_state(&self.inner);
    let before = state.entries.len();
    state.entries.retain(|k, _| !key::key_matches(pattern, k));
    let removed = before - state.entries.len();
    if removed > 0 {
      trace!(pattern, removed, "cache pattern invalidation");
    }
  }

  /// Drop every entry. In-flight fetches are left to settle normally.
  pub fn clear(&self) {
    let mut state = lock_state(&self.inner);
    state.entries.clear();
  }

  pub fn stats(&self) -> CacheStats {
    let state = lock_state(&self.inner);
    CacheStats {
      entries: state.entries.len(),
      in_flight: state.in_flight.len(),
    }
  }
}

fn lock_state(inner: &CacheInner) -> MutexGuard<'_, CacheState> {
  // State is only touched in short synchronous blocks, never across an
  // await, so a poisoned lock still holds consistent data.
  inner.state.lock().unwrap_or_else(|e| e.into_inner())
}

fn store_entry(state: &mut CacheState, max_entries: usize, key: String, entry: CacheEntry) {
  if state.entries.len() >= max_entries && !state.entries.contains_key(&key) {
    evict(state, max_entries);
  }
  state.entries.insert(key, entry);
}

/// Make room: expired entries first, then lowest priority / oldest.
fn evict(state: &mut CacheState, max_entries: usize) {
  let now = Utc::now();
  state.entries.retain(|_, e| !e.is_expired(now));

  while state.entries.len() >= max_entries {
    let victim = state
      .entries
      .iter()
      .min_by_key(|(_, e)| (e.priority, e.stored_at))
      .map(|(k, _)| k.clone());
    match victim {
      Some(k) => {
        trace!(key = %k, "cache eviction");
        state.entries.remove(&k);
      }
      None => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn count_fetcher(
    calls: &Arc<AtomicUsize>,
    value: u32,
  ) -> impl Future<Output = Result<u32>> + Send + 'static {
    let calls = Arc::clone(calls);
    async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok(value)
    }
  }

  #[tokio::test]
  async fn concurrent_gets_share_one_fetch() {
    let cache = RequestCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let a = cache.get::<u32, _, _>("progress:alice", DataClass::Progress, CacheOptions::default(), || {
      count_fetcher(&calls, 7)
    });
    let b = cache.get::<u32, _, _>("progress:alice", DataClass::Progress, CacheOptions::default(), || {
      count_fetcher(&calls, 7)
    });

    let (a, b) = tokio::join!(a, b);
    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().in_flight, 0);
  }

  #[tokio::test]
  async fn fresh_entry_skips_fetcher() {
    let cache = RequestCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
      let v: u32 = cache
        .get("doc:users:alice", DataClass::Profile, CacheOptions::default(), || {
          count_fetcher(&calls, 1)
        })
        .await
        .unwrap();
      assert_eq!(v, 1);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn expired_entry_refetches() {
    let cache = RequestCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let options = CacheOptions {
      ttl_override: Some(chrono::Duration::zero()),
      ..Default::default()
    };

    for _ in 0..2 {
      let _: u32 = cache
        .get("doc:users:alice", DataClass::Profile, options, || count_fetcher(&calls, 1))
        .await
        .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn failure_propagates_to_all_waiters_and_is_not_cached() {
    let cache = RequestCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = |calls: &Arc<AtomicUsize>| {
      let calls = Arc::clone(calls);
      || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<u32, _>(SyncError::Transient("connection reset".into()))
      }
    };

    let a = cache.get::<u32, _, _>("k", DataClass::Realtime, CacheOptions::default(), failing(&calls));
    let b = cache.get::<u32, _, _>("k", DataClass::Realtime, CacheOptions::default(), failing(&calls));
    let (a, b) = tokio::join!(a, b);

    assert!(matches!(a, Err(SyncError::Transient(_))));
    assert!(matches!(b, Err(SyncError::Transient(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // No negative caching: the next call retries.
    let v = cache
      .get::<u32, _, _>("k", DataClass::Realtime, CacheOptions::default(), || async { Ok(9) })
      .await
      .unwrap();
    assert_eq!(v, 9);
    assert_eq!(cache.stats().entries, 1);
  }

  #[tokio::test]
  async fn pattern_invalidation_forces_refetch() {
    let cache = RequestCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let _: u32 = cache
      .get("flashcard-sets-42:recent", DataClass::Progress, CacheOptions::default(), || {
        count_fetcher(&calls, 5)
      })
      .await
      .unwrap();

    cache.invalidate_pattern("flashcard-sets-42");

    let _: u32 = cache
      .get("flashcard-sets-42:recent", DataClass::Progress, CacheOptions::default(), || {
        count_fetcher(&calls, 5)
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn compressed_entries_round_trip() {
    let cache = RequestCache::new(CacheConfig::default());
    let options = CacheOptions {
      compress: true,
      ..Default::default()
    };
    let payload: Vec<String> = (0..100).map(|i| format!("card-{i}")).collect();
    let expected = payload.clone();

    let v: Vec<String> = cache
      .get("blob:decks/alice.json", DataClass::Static, options, move || async move {
        Ok(payload)
      })
      .await
      .unwrap();
    assert_eq!(v, expected);

    // Second read decodes from the compressed entry.
    let v: Vec<String> = cache
      .get("blob:decks/alice.json", DataClass::Static, options, || async {
        panic!("fetcher must not run on a fresh entry")
      })
      .await
      .unwrap();
    assert_eq!(v, expected);
  }

  #[tokio::test]
  async fn capacity_eviction_prefers_low_priority() {
    let config = CacheConfig {
      max_entries: 2,
      ..Default::default()
    };
    let cache = RequestCache::new(config);

    let low = CacheOptions {
      priority: Priority::Low,
      ..Default::default()
    };
    let high = CacheOptions {
      priority: Priority::High,
      ..Default::default()
    };

    let _: u32 = cache.get("a", DataClass::Profile, low, || async { Ok(1) }).await.unwrap();
    let _: u32 = cache.get("b", DataClass::Profile, high, || async { Ok(2) }).await.unwrap();
    let _: u32 = cache.get("c", DataClass::Profile, high, || async { Ok(3) }).await.unwrap();

    assert!(cache.stats().entries <= 2);
    // The high-priority entry survives; "b" is served without a refetch.
    let v: u32 = cache
      .get("b", DataClass::Profile, high, || async {
        panic!("high-priority entry was evicted")
      })
      .await
      .unwrap();
    assert_eq!(v, 2);
  }
}
