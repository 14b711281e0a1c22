//! Offline write queue and the platform connectivity signal.
//!
//! Writes captured while connectivity is down are held in FIFO order and
//! replayed on reconnect through the gateway's normal batch-write path.
//! The queue is in-memory only: a full reload while offline drops queued
//! writes. Delivery is at-least-once: replay can re-send state the backend
//! already saw, which is safe for full-document sets but not for increments.

use crate::cache::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

/// A single document mutation, the unit of batched writes and offline replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
  pub kind: OpKind,
  pub collection: String,
  pub id: String,
  /// `None` for deletes.
  pub payload: Option<serde_json::Value>,
  #[serde(skip)]
  pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
  /// Replace the full document.
  Set,
  /// Merge fields into the document.
  Update,
  Delete,
}

impl PendingOperation {
  pub fn set(collection: &str, id: &str, payload: serde_json::Value) -> Self {
    Self {
      kind: OpKind::Set,
      collection: collection.to_string(),
      id: id.to_string(),
      payload: Some(payload),
      priority: Priority::Normal,
    }
  }

  pub fn update(collection: &str, id: &str, payload: serde_json::Value) -> Self {
    Self {
      kind: OpKind::Update,
      collection: collection.to_string(),
      id: id.to_string(),
      payload: Some(payload),
      priority: Priority::Normal,
    }
  }

  pub fn delete(collection: &str, id: &str) -> Self {
    Self {
      kind: OpKind::Delete,
      collection: collection.to_string(),
      id: id.to_string(),
      payload: None,
      priority: Priority::Normal,
    }
  }
}

/// An operation captured while offline, with its capture timestamp.
#[derive(Debug, Clone)]
pub struct QueuedItem {
  pub op: PendingOperation,
  pub enqueued_at: DateTime<Utc>,
}

/// FIFO queue of writes awaiting connectivity. Clones share state.
#[derive(Clone, Default)]
pub struct OfflineQueue {
  items: Arc<Mutex<VecDeque<QueuedItem>>>,
}

impl OfflineQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enqueue(&self, ops: Vec<PendingOperation>) {
    let now = Utc::now();
    let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
    for op in ops {
      items.push_back(QueuedItem {
        op,
        enqueued_at: now,
      });
    }
    debug!(depth = items.len(), "offline queue enqueue");
  }

  /// Take everything currently queued, preserving order. Replay failures
  /// must go back through [`requeue`](Self::requeue), not be dropped.
  pub fn drain(&self) -> Vec<QueuedItem> {
    let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
    items.drain(..).collect()
  }

  /// Re-append a failed replay to the tail.
  pub fn requeue(&self, item: QueuedItem) {
    let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
    items.push_back(item);
  }

  pub fn len(&self) -> usize {
    self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Current online/offline status plus a subscription to transitions.
///
/// The embedding platform drives this from its own connectivity events; the
/// gateway watches for the offline-to-online edge to trigger replay.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity transition");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn drain_preserves_fifo_order() {
    let queue = OfflineQueue::new();
    queue.enqueue(vec![
      PendingOperation::set("decks", "a", serde_json::json!({"n": 1})),
      PendingOperation::update("decks", "a", serde_json::json!({"n": 2})),
      PendingOperation::delete("decks", "b"),
    ]);

    let drained = queue.drain();
    assert_eq!(drained.len(), 3);
    assert_eq!(drained[0].op.kind, OpKind::Set);
    assert_eq!(drained[1].op.kind, OpKind::Update);
    assert_eq!(drained[2].op.kind, OpKind::Delete);
    assert!(queue.is_empty());
  }

  #[test]
  fn requeue_appends_to_tail() {
    let queue = OfflineQueue::new();
    queue.enqueue(vec![
      PendingOperation::set("decks", "a", serde_json::json!({})),
      PendingOperation::set("decks", "b", serde_json::json!({})),
    ]);

    let mut drained = queue.drain();
    let failed = drained.remove(0);
    queue.requeue(failed);

    let remaining = queue.drain();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].op.id, "a");
  }

  #[tokio::test]
  async fn connectivity_signals_transitions() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();
    assert!(!connectivity.is_online());

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow());

    // Setting the same state again is not a transition.
    connectivity.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }
}
