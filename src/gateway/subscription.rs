//! Registry of live subscriptions, one per collection/document key.

use super::backend::SubscriptionHandle;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Holds at most one live subscription per key. Inserting under an existing
/// key tears the prior handle down first, so re-subscribing replaces rather
/// than leaks.
#[derive(Default)]
pub struct SubscriptionRegistry {
  subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl SubscriptionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, key: String, handle: SubscriptionHandle) {
    let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(prior) = subs.insert(key.clone(), handle) {
      debug!(key = %key, "replacing live subscription");
      prior.cancel();
    }
  }

  pub fn remove(&self, key: &str) {
    let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = subs.remove(key) {
      handle.cancel();
    }
  }

  /// Tear down every live subscription. Called on process teardown.
  pub fn clear(&self) {
    let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
    for (_, handle) in subs.drain() {
      handle.cancel();
    }
  }

  pub fn len(&self) -> usize {
    self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn counting_handle(canceled: &Arc<AtomicUsize>) -> SubscriptionHandle {
    let canceled = Arc::clone(canceled);
    SubscriptionHandle::new(move || {
      canceled.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn reinsert_cancels_prior_handle() {
    let registry = SubscriptionRegistry::new();
    let canceled = Arc::new(AtomicUsize::new(0));

    registry.insert("doc:decks:a".into(), counting_handle(&canceled));
    registry.insert("doc:decks:a".into(), counting_handle(&canceled));

    assert_eq!(registry.len(), 1);
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn clear_cancels_everything() {
    let registry = SubscriptionRegistry::new();
    let canceled = Arc::new(AtomicUsize::new(0));

    registry.insert("a".into(), counting_handle(&canceled));
    registry.insert("b".into(), counting_handle(&canceled));
    registry.clear();

    assert!(registry.is_empty());
    assert_eq!(canceled.load(Ordering::SeqCst), 2);
  }
}
