//! Collaborator traits for the remote document and blob backends, plus an
//! in-memory implementation used by tests and local-only sessions.
//!
//! The gateway is protocol-agnostic: anything that can get/query/commit/
//! subscribe over structured documents keyed by collection+id can sit behind
//! [`DocumentBackend`].

use crate::error::{Result, SyncError};
use crate::queue::{OpKind, PendingOperation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A structured document keyed by collection + id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub data: Value,
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
  Eq,
  Lt,
  Le,
  Gt,
  Ge,
}

impl Comparator {
  fn as_str(self) -> &'static str {
    match self {
      Comparator::Eq => "==",
      Comparator::Lt => "<",
      Comparator::Le => "<=",
      Comparator::Gt => ">",
      Comparator::Ge => ">=",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Filter {
  pub field: String,
  pub comparator: Comparator,
  pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
  Asc,
  Desc,
}

/// A filtered/ordered/paginated collection query.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
  pub filters: Vec<Filter>,
  pub order_by: Option<(String, SortDirection)>,
  pub limit: Option<u32>,
  /// Id of the last document of the previous page. Paginated queries are
  /// never cached.
  pub start_after: Option<String>,
}

impl QuerySpec {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn where_field(mut self, field: &str, comparator: Comparator, value: Value) -> Self {
    self.filters.push(Filter {
      field: field.to_string(),
      comparator,
      value,
    });
    self
  }

  pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
    self.order_by = Some((field.to_string(), direction));
    self
  }

  pub fn limit(mut self, limit: u32) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn start_after(mut self, last_id: &str) -> Self {
    self.start_after = Some(last_id.to_string());
    self
  }

  pub fn is_paginated(&self) -> bool {
    self.start_after.is_some()
  }

  /// Canonical string form of the filter/sort/limit signature. Two queries
  /// differing in any parameter produce different signatures.
  pub fn signature(&self) -> String {
    let mut parts: Vec<String> = self
      .filters
      .iter()
      .map(|f| format!("{}{}{}", f.field, f.comparator.as_str(), f.value))
      .collect();
    if let Some((field, direction)) = &self.order_by {
      let dir = match direction {
        SortDirection::Asc => "asc",
        SortDirection::Desc => "desc",
      };
      parts.push(format!("order={field}:{dir}"));
    }
    if let Some(limit) = self.limit {
      parts.push(format!("limit={limit}"));
    }
    parts.join("|")
  }
}

/// Callback delivering the current document state on every remote change.
pub type ChangeCallback = Box<dyn Fn(Option<Document>) + Send + Sync>;

/// Handle for a live subscription; dropping it tears the subscription down.
pub struct SubscriptionHandle {
  cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
  pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
    Self {
      cancel: Some(Box::new(cancel)),
    }
  }

  pub fn cancel(mut self) {
    if let Some(f) = self.cancel.take() {
      f();
    }
  }
}

impl Drop for SubscriptionHandle {
  fn drop(&mut self) {
    if let Some(f) = self.cancel.take() {
      f();
    }
  }
}

#[async_trait]
pub trait DocumentBackend: Send + Sync {
  /// `Ok(None)` when the document does not exist.
  async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>>;

  async fn query(&self, collection: &str, spec: &QuerySpec) -> Result<Vec<Document>>;

  /// Commit all operations as one atomic unit.
  async fn commit_batch(&self, ops: &[PendingOperation]) -> Result<()>;

  /// Deliver the current state immediately and on every subsequent change,
  /// until the returned handle is dropped or canceled.
  fn subscribe(&self, collection: &str, id: &str, on_change: ChangeCallback)
    -> Result<SubscriptionHandle>;
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
  async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()>;

  /// Resolve a retrieval URL for a stored object.
  async fn download_url(&self, path: &str) -> Result<String>;

  async fn delete(&self, path: &str) -> Result<()>;
}

// ============================================================================
// In-memory backend
// ============================================================================

type Subscriber = (u64, Arc<ChangeCallback>);

#[derive(Default)]
struct MemoryBackendState {
  documents: HashMap<(String, String), Document>,
  subscribers: HashMap<(String, String), Vec<Subscriber>>,
  next_subscriber_id: u64,
}

/// Document + blob backend over process memory. Useful for tests and for
/// running fully local without a remote.
#[derive(Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<MemoryBackendState>>,
  blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of live subscriptions, for assertions in tests.
  pub fn subscriber_count(&self) -> usize {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.subscribers.values().map(Vec::len).sum()
  }

  fn apply(&self, op: &PendingOperation) -> Vec<(Vec<Arc<ChangeCallback>>, Option<Document>)> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let key = (op.collection.clone(), op.id.clone());
    let current = match op.kind {
      OpKind::Set => {
        let doc = Document {
          id: op.id.clone(),
          data: op.payload.clone().unwrap_or(Value::Null),
          updated_at: Some(Utc::now()),
        };
        state.documents.insert(key.clone(), doc.clone());
        Some(doc)
      }
      OpKind::Update => {
        let doc = state.documents.entry(key.clone()).or_insert_with(|| Document {
          id: op.id.clone(),
          data: Value::Object(Default::default()),
          updated_at: None,
        });
        if let (Value::Object(target), Some(Value::Object(patch))) =
          (&mut doc.data, op.payload.as_ref())
        {
          for (k, v) in patch {
            target.insert(k.clone(), v.clone());
          }
        }
        doc.updated_at = Some(Utc::now());
        Some(doc.clone())
      }
      OpKind::Delete => {
        state.documents.remove(&key);
        None
      }
    };

    let callbacks = state
      .subscribers
      .get(&key)
      .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
      .unwrap_or_default();
    vec![(callbacks, current)]
  }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
  async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    Ok(
      state
        .documents
        .get(&(collection.to_string(), id.to_string()))
        .cloned(),
    )
  }

  async fn query(&self, collection: &str, spec: &QuerySpec) -> Result<Vec<Document>> {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let mut docs: Vec<Document> = state
      .documents
      .iter()
      .filter(|((c, _), _)| c == collection)
      .map(|(_, d)| d.clone())
      .filter(|d| spec.filters.iter().all(|f| matches_filter(d, f)))
      .collect();

    match &spec.order_by {
      Some((field, direction)) => {
        docs.sort_by(|a, b| {
          let ord = compare_values(field_of(a, field), field_of(b, field));
          match direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
          }
        });
      }
      None => docs.sort_by(|a, b| a.id.cmp(&b.id)),
    }

    if let Some(last_id) = &spec.start_after {
      if let Some(pos) = docs.iter().position(|d| &d.id == last_id) {
        docs.drain(..=pos);
      }
    }

    if let Some(limit) = spec.limit {
      docs.truncate(limit as usize);
    }

    Ok(docs)
  }

  async fn commit_batch(&self, ops: &[PendingOperation]) -> Result<()> {
    // Single lock scope per op keeps the whole batch atomic under the
    // single-threaded cooperative model; callbacks fire outside the lock.
    let mut notifications = Vec::new();
    for op in ops {
      notifications.extend(self.apply(op));
    }
    for (callbacks, doc) in notifications {
      for cb in callbacks {
        cb(doc.clone());
      }
    }
    Ok(())
  }

  fn subscribe(
    &self,
    collection: &str,
    id: &str,
    on_change: ChangeCallback,
  ) -> Result<SubscriptionHandle> {
    let key = (collection.to_string(), id.to_string());
    let callback = Arc::new(on_change);

    let (subscriber_id, initial) = {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      state.next_subscriber_id += 1;
      let subscriber_id = state.next_subscriber_id;
      state
        .subscribers
        .entry(key.clone())
        .or_default()
        .push((subscriber_id, Arc::clone(&callback)));
      (subscriber_id, state.documents.get(&key).cloned())
    };

    // Initial delivery outside the lock.
    callback(initial);

    let state = Arc::clone(&self.state);
    Ok(SubscriptionHandle::new(move || {
      let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
      if let Some(subs) = state.subscribers.get_mut(&key) {
        subs.retain(|(sid, _)| *sid != subscriber_id);
      }
    }))
  }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
  async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
    let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    blobs.insert(path.to_string(), bytes.to_vec());
    Ok(())
  }

  async fn download_url(&self, path: &str) -> Result<String> {
    let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    if blobs.contains_key(path) {
      Ok(format!("memory://{path}"))
    } else {
      Err(SyncError::Backend(format!("no blob at {path}")))
    }
  }

  async fn delete(&self, path: &str) -> Result<()> {
    let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    blobs.remove(path);
    Ok(())
  }
}

fn field_of<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
  doc.data.get(field)
}

fn matches_filter(doc: &Document, filter: &Filter) -> bool {
  let Some(actual) = field_of(doc, &filter.field) else {
    return false;
  };
  let ord = compare_values(Some(actual), Some(&filter.value));
  match filter.comparator {
    Comparator::Eq => ord == Ordering::Equal,
    Comparator::Lt => ord == Ordering::Less,
    Comparator::Le => ord != Ordering::Greater,
    Comparator::Gt => ord == Ordering::Greater,
    Comparator::Ge => ord != Ordering::Less,
  }
}

/// Total order over JSON scalars: null < numbers < strings < everything else.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  fn rank(v: Option<&Value>) -> u8 {
    match v {
      None | Some(Value::Null) => 0,
      Some(Value::Number(_)) => 1,
      Some(Value::String(_)) => 2,
      Some(_) => 3,
    }
  }

  match (a, b) {
    (Some(Value::Number(x)), Some(Value::Number(y))) => x
      .as_f64()
      .partial_cmp(&y.as_f64())
      .unwrap_or(Ordering::Equal),
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    _ => rank(a).cmp(&rank(b)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn query_filters_orders_and_limits() {
    let backend = MemoryBackend::new();
    backend
      .commit_batch(&[
        PendingOperation::set("decks", "a", json!({"owner": "alice", "cards": 10})),
        PendingOperation::set("decks", "b", json!({"owner": "alice", "cards": 30})),
        PendingOperation::set("decks", "c", json!({"owner": "bob", "cards": 20})),
      ])
      .await
      .unwrap();

    let spec = QuerySpec::new()
      .where_field("owner", Comparator::Eq, json!("alice"))
      .order_by("cards", SortDirection::Desc)
      .limit(1);
    let docs = backend.query("decks", &spec).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, "b");
  }

  #[tokio::test]
  async fn start_after_pages_past_the_given_id() {
    let backend = MemoryBackend::new();
    backend
      .commit_batch(&[
        PendingOperation::set("cards", "1", json!({"n": 1})),
        PendingOperation::set("cards", "2", json!({"n": 2})),
        PendingOperation::set("cards", "3", json!({"n": 3})),
      ])
      .await
      .unwrap();

    let spec = QuerySpec::new().start_after("1").limit(1);
    let docs = backend.query("cards", &spec).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, "2");
  }

  #[tokio::test]
  async fn subscribe_delivers_initial_and_changes() {
    let backend = MemoryBackend::new();
    let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let handle = backend
      .subscribe(
        "decks",
        "a",
        Box::new(move |doc| {
          sink.lock().unwrap().push(doc.map(|d| d.data));
        }),
      )
      .unwrap();

    backend
      .commit_batch(&[PendingOperation::set("decks", "a", json!({"v": 1}))])
      .await
      .unwrap();
    backend
      .commit_batch(&[PendingOperation::delete("decks", "a")])
      .await
      .unwrap();

    handle.cancel();
    assert_eq!(backend.subscriber_count(), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[None, Some(json!({"v": 1})), None]);
  }

  #[test]
  fn signature_reflects_every_parameter() {
    let base = QuerySpec::new().where_field("owner", Comparator::Eq, json!("alice"));
    let limited = base.clone().limit(20);
    assert_ne!(base.signature(), limited.signature());
    assert_ne!(
      limited.signature(),
      base.clone().limit(21).signature()
    );
  }
}
