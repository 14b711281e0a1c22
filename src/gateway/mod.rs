//! Remote data gateway: the single entry point feature code uses to talk to
//! the remote backend.
//!
//! Reads go through the tiered request cache; writes commit atomically when
//! online and are hard-routed to the offline queue when not. The gateway owns
//! the live-subscription registry and the reconnect replay task.

pub mod backend;
mod subscription;

pub use backend::{
  BlobBackend, ChangeCallback, Comparator, Document, DocumentBackend, Filter, MemoryBackend,
  QuerySpec, SortDirection, SubscriptionHandle,
};

use crate::cache::{key, CacheOptions, DataClass, Priority, RequestCache};
use crate::error::Result;
use crate::queue::{Connectivity, OfflineQueue, PendingOperation};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use subscription::SubscriptionRegistry;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Options for cached reads.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
  pub cache: bool,
  pub class: DataClass,
  pub priority: Priority,
}

impl ReadOptions {
  pub fn class(class: DataClass) -> Self {
    Self {
      cache: true,
      class,
      priority: Priority::Normal,
    }
  }

  pub fn uncached() -> Self {
    Self {
      cache: false,
      ..Self::class(DataClass::Realtime)
    }
  }
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self::class(DataClass::Progress)
  }
}

/// Options for collection queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
  pub read: ReadOptions,
  /// Explicit TTL for this query's cache entry, overriding the class table.
  pub cache_ttl: Option<chrono::Duration>,
}

/// One page of query results. `last` feeds the next page's `start_after`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueryPage {
  pub items: Vec<Document>,
  pub last: Option<Document>,
}

impl QueryPage {
  fn from_items(items: Vec<Document>) -> Self {
    let last = items.last().cloned();
    Self { items, last }
  }
}

/// A read to warm up ahead of navigation.
pub enum PreloadRead {
  Document {
    collection: String,
    id: String,
    class: DataClass,
  },
  Query {
    collection: String,
    spec: QuerySpec,
    class: DataClass,
  },
}

/// One step of a blob batch.
pub enum BlobOperation {
  Upload { path: String, bytes: Vec<u8> },
  Delete { path: String },
  GetUrl { path: String },
}

struct GatewayInner {
  documents: Arc<dyn DocumentBackend>,
  blobs: Arc<dyn BlobBackend>,
  cache: RequestCache,
  queue: OfflineQueue,
  connectivity: Connectivity,
  subscriptions: SubscriptionRegistry,
  replay_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share cache, queue and subscriptions.
#[derive(Clone)]
pub struct Gateway {
  inner: Arc<GatewayInner>,
}

impl Gateway {
  pub fn new(
    documents: Arc<dyn DocumentBackend>,
    blobs: Arc<dyn BlobBackend>,
    cache: RequestCache,
    queue: OfflineQueue,
    connectivity: Connectivity,
  ) -> Self {
    let gateway = Self {
      inner: Arc::new(GatewayInner {
        documents,
        blobs,
        cache,
        queue,
        connectivity,
        subscriptions: SubscriptionRegistry::new(),
        replay_task: Mutex::new(None),
      }),
    };
    gateway.spawn_replay_task();
    gateway
  }

  /// Read one document. `Ok(None)` when it does not exist.
  pub async fn get_document(
    &self,
    collection: &str,
    id: &str,
    options: ReadOptions,
  ) -> Result<Option<Value>> {
    if !options.cache {
      let doc = self.inner.documents.get_document(collection, id).await?;
      return Ok(doc.map(|d| d.data));
    }

    let cache_key = key::document_key(collection, id);
    let documents = Arc::clone(&self.inner.documents);
    let collection = collection.to_string();
    let id = id.to_string();

    let doc: Option<Document> = self
      .inner
      .cache
      .get(
        &cache_key,
        options.class,
        CacheOptions {
          priority: options.priority,
          ..Default::default()
        },
        move || async move { documents.get_document(&collection, &id).await },
      )
      .await?;

    Ok(doc.map(|d| d.data))
  }

  /// Realtime read: bypasses the cache and installs a live subscription that
  /// delivers on every remote change. Only one subscription per key is kept
  /// alive; subscribing again replaces the prior one.
  pub fn watch_document(
    &self,
    collection: &str,
    id: &str,
    on_change: ChangeCallback,
  ) -> Result<()> {
    let handle = self.inner.documents.subscribe(collection, id, on_change)?;
    self
      .inner
      .subscriptions
      .insert(key::document_key(collection, id), handle);
    Ok(())
  }

  pub fn unwatch_document(&self, collection: &str, id: &str) {
    self
      .inner
      .subscriptions
      .remove(&key::document_key(collection, id));
  }

  /// Filtered/ordered/paginated query. First-page queries are cached keyed
  /// by the full filter/sort/limit signature; paginated queries (`start_after`
  /// set) are never cached, since each page is a distinct request.
  pub async fn query_collection(
    &self,
    collection: &str,
    spec: QuerySpec,
    options: QueryOptions,
  ) -> Result<QueryPage> {
    if spec.is_paginated() || !options.read.cache {
      let items = self.inner.documents.query(collection, &spec).await?;
      return Ok(QueryPage::from_items(items));
    }

    let cache_key = key::query_key(collection, &spec.signature());
    let documents = Arc::clone(&self.inner.documents);
    let collection = collection.to_string();

    let items: Vec<Document> = self
      .inner
      .cache
      .get(
        &cache_key,
        options.read.class,
        CacheOptions {
          priority: options.read.priority,
          ttl_override: options.cache_ttl,
          ..Default::default()
        },
        move || async move { documents.query(&collection, &spec).await },
      )
      .await?;

    Ok(QueryPage::from_items(items))
  }

  /// Commit a batch of document mutations.
  ///
  /// Online: all operations commit as one atomic unit, then every cache
  /// entry for the touched collections/documents is invalidated. Offline:
  /// operations are routed to the offline queue and this returns
  /// immediately, fire-and-forget, delivered at-least-once on reconnect
  /// (safe for full-document sets, not guaranteed safe for increments).
  /// A transient commit failure while online is absorbed by the queue the
  /// same way; non-transient failures surface to the caller.
  pub async fn batch_write(&self, ops: Vec<PendingOperation>) -> Result<()> {
    if !self.inner.connectivity.is_online() {
      debug!(count = ops.len(), "offline, routing batch to queue");
      self.inner.queue.enqueue(ops);
      return Ok(());
    }

    if let Err(e) = self.inner.documents.commit_batch(&ops).await {
      if e.is_transient() {
        warn!(count = ops.len(), error = %e, "commit failed transiently, routing batch to queue");
        self.inner.queue.enqueue(ops);
        return Ok(());
      }
      return Err(e);
    }
    for op in &ops {
      invalidate_for(&self.inner.cache, op);
    }
    Ok(())
  }

  /// Resolve a retrieval URL for a stored object, cached like a document read.
  pub async fn get_blob_url(&self, path: &str, options: ReadOptions) -> Result<String> {
    if !options.cache {
      return self.inner.blobs.download_url(path).await;
    }

    let cache_key = key::blob_key(path);
    let blobs = Arc::clone(&self.inner.blobs);
    let path = path.to_string();

    self
      .inner
      .cache
      .get(
        &cache_key,
        options.class,
        CacheOptions {
          priority: options.priority,
          ..Default::default()
        },
        move || async move { blobs.download_url(&path).await },
      )
      .await
  }

  /// Upload/delete/get-url in one call. Returns one slot per operation:
  /// `Some(url)` for `GetUrl`, `None` otherwise. Cache entries for uploaded
  /// or deleted paths are invalidated.
  pub async fn batch_blob_operations(
    &self,
    ops: Vec<BlobOperation>,
  ) -> Result<Vec<Option<String>>> {
    let mut results = Vec::with_capacity(ops.len());
    for op in ops {
      match op {
        BlobOperation::Upload { path, bytes } => {
          self.inner.blobs.upload(&path, &bytes).await?;
          self.inner.cache.invalidate(&key::blob_key(&path));
          results.push(None);
        }
        BlobOperation::Delete { path } => {
          self.inner.blobs.delete(&path).await?;
          self.inner.cache.invalidate(&key::blob_key(&path));
          results.push(None);
        }
        BlobOperation::GetUrl { path } => {
          let url = self.get_blob_url(&path, ReadOptions::class(DataClass::Static)).await?;
          results.push(Some(url));
        }
      }
    }
    Ok(results)
  }

  /// Best-effort cache warm-up for a known set of upcoming reads. Failures
  /// are swallowed and logged, never surfaced.
  pub fn preload(&self, reads: Vec<PreloadRead>) {
    let gateway = self.clone();
    tokio::spawn(async move {
      for read in reads {
        let outcome = match read {
          PreloadRead::Document {
            collection,
            id,
            class,
          } => gateway
            .get_document(&collection, &id, ReadOptions::class(class))
            .await
            .map(|_| ()),
          PreloadRead::Query {
            collection,
            spec,
            class,
          } => gateway
            .query_collection(
              &collection,
              spec,
              QueryOptions {
                read: ReadOptions::class(class),
                cache_ttl: None,
              },
            )
            .await
            .map(|_| ()),
        };
        if let Err(e) = outcome {
          debug!(error = %e, "preload read failed");
        }
      }
    });
  }

  /// Replay everything in the offline queue in FIFO order. A failed replay
  /// goes back to the tail and is logged; it does not block later items
  /// unless they target the same document, which are requeued behind it so
  /// the retried older write can never land after a newer one.
  pub async fn flush_offline_queue(&self) {
    flush_queue(&self.inner).await;
  }

  pub fn cache_stats(&self) -> crate::cache::CacheStats {
    self.inner.cache.stats()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.inner.connectivity
  }

  /// Tear down every live subscription and the replay task. Must be called
  /// on process teardown; subscriptions are not garbage collected.
  pub fn cleanup(&self) {
    if !self.inner.subscriptions.is_empty() {
      debug!(
        count = self.inner.subscriptions.len(),
        "tearing down live subscriptions"
      );
    }
    self.inner.subscriptions.clear();
    let mut task = self
      .inner
      .replay_task
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = task.take() {
      handle.abort();
    }
  }

  fn spawn_replay_task(&self) {
    let mut rx = self.inner.connectivity.subscribe();
    let weak = Arc::downgrade(&self.inner);

    let handle = tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if !online {
          continue;
        }
        let Some(inner) = Weak::upgrade(&weak) else {
          break;
        };
        flush_queue(&inner).await;
      }
    });

    let mut task = self
      .inner
      .replay_task
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    *task = Some(handle);
  }
}

async fn flush_queue(inner: &GatewayInner) {
  let items = inner.queue.drain();
  if items.is_empty() {
    return;
  }
  info!(count = items.len(), "replaying offline queue");

  // Relative order per target document must survive a failed replay: once a
  // write to a document fails, every later drained write to that document is
  // requeued behind it without being attempted.
  let mut failed_targets: HashSet<(String, String)> = HashSet::new();
  for item in items {
    let target = (item.op.collection.clone(), item.op.id.clone());
    if failed_targets.contains(&target) {
      inner.queue.requeue(item);
      continue;
    }
    match inner.documents.commit_batch(std::slice::from_ref(&item.op)).await {
      Ok(()) => invalidate_for(&inner.cache, &item.op),
      Err(e) => {
        warn!(
          collection = %item.op.collection,
          id = %item.op.id,
          error = %e,
          "offline replay failed, requeueing"
        );
        failed_targets.insert(target);
        inner.queue.requeue(item);
      }
    }
  }
}

/// Drop the exact document entry plus every cached query over its collection.
fn invalidate_for(cache: &RequestCache, op: &PendingOperation) {
  cache.invalidate(&key::document_key(&op.collection, &op.id));
  cache.invalidate_pattern(&key::collection_pattern(&op.collection));
}
