//! Session time accumulator.
//!
//! Tracks user activity and maintains a monotonically growing time-spent
//! counter, local-first: every flush persists to the local store
//! synchronously, and a debounced remote sync pushes the latest snapshot
//! through the gateway's batch-write path. On login the local and remote
//! snapshots are reconciled (the larger lifetime total wins) and the
//! winner is mirrored to both stores.

mod snapshot;

pub use snapshot::{reconcile, TimeSnapshot};

use crate::config::SessionConfig;
use crate::debounce::Debouncer;
use crate::error::SyncError;
use crate::gateway::{Gateway, ReadOptions};
use crate::queue::PendingOperation;
use crate::store::LocalStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COLLECTION: &str = "time_tracking";

fn snapshot_key(user_id: &str) -> String {
  format!("time_tracking:{user_id}")
}

#[derive(Default)]
struct TrackerState {
  user_id: Option<String>,
  tracking: bool,
  session_start: Option<DateTime<Utc>>,
  last_activity: Option<DateTime<Utc>>,
  /// Session seconds already credited to the snapshot.
  last_flushed_offset: u64,
  snapshot: Option<TimeSnapshot>,
  /// Set when the backend denies writes; accounting continues locally.
  local_only: bool,
}

struct TrackerInner {
  store: Arc<dyn LocalStore>,
  gateway: Gateway,
  config: SessionConfig,
  sync_debounce: Debouncer,
  state: Mutex<TrackerState>,
  ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share tracker state.
#[derive(Clone)]
pub struct TimeTracker {
  inner: Arc<TrackerInner>,
}

impl TimeTracker {
  pub fn new(store: Arc<dyn LocalStore>, gateway: Gateway, config: SessionConfig) -> Self {
    let sync_debounce = Debouncer::new(config.sync_debounce());
    Self {
      inner: Arc::new(TrackerInner {
        store,
        gateway,
        config,
        sync_debounce,
        state: Mutex::new(TrackerState::default()),
        ticker: Mutex::new(None),
      }),
    }
  }

  /// React to an authentication transition. Login loads and reconciles the
  /// snapshots, mirrors the winner to both stores and starts tracking;
  /// logout flushes and clears session state.
  pub async fn set_authenticated(&self, user_id: Option<String>) {
    self.set_authenticated_at(user_id, Utc::now()).await;
  }

  pub async fn set_authenticated_at(&self, user_id: Option<String>, now: DateTime<Utc>) {
    let Some(user) = user_id else {
      self.stop_at(now);
      let mut state = lock_state(&self.inner);
      state.user_id = None;
      state.snapshot = None;
      return;
    };

    // The auth provider can re-fire for an already-authenticated user (token
    // refresh). Flush the in-progress session first so its unflushed seconds
    // are credited before the offsets reset.
    self.stop_at(now);

    let today = now.date_naive();
    let raw = match self.inner.store.get(&snapshot_key(&user)) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(error = %e, "failed to read local time snapshot");
        None
      }
    };
    let local = TimeSnapshot::parse_or_default(raw.as_deref(), today);

    let mut local_only = false;
    let remote = match self
      .inner
      .gateway
      .get_document(COLLECTION, &user, ReadOptions::uncached())
      .await
    {
      Ok(Some(value)) => serde_json::from_value(value).ok(),
      Ok(None) => None,
      Err(SyncError::PermissionDenied(reason)) => {
        warn!(reason = %reason, "time tracking degrading to local-only accounting");
        local_only = true;
        None
      }
      Err(e) => {
        debug!(error = %e, "remote snapshot unavailable, using local");
        None
      }
    };

    let winner = reconcile(local, remote);
    info!(
      user = %user,
      accumulated = winner.accumulated_seconds,
      "time tracking session starting"
    );

    // Mirror the winner to both stores.
    match serde_json::to_string(&winner) {
      Ok(json) => {
        if let Err(e) = self.inner.store.set(&snapshot_key(&user), &json) {
          warn!(error = %e, "failed to persist reconciled snapshot");
        }
      }
      Err(e) => warn!(error = %e, "failed to serialize snapshot"),
    }
    if !local_only {
      if let Ok(payload) = serde_json::to_value(&winner) {
        match self
          .inner
          .gateway
          .batch_write(vec![PendingOperation::set(COLLECTION, &user, payload)])
          .await
        {
          Ok(()) => {}
          Err(SyncError::PermissionDenied(reason)) => {
            warn!(reason = %reason, "time tracking degrading to local-only accounting");
            local_only = true;
          }
          Err(e) => debug!(error = %e, "snapshot mirror failed"),
        }
      }
    }

    // Tracking starts automatically on authentication.
    let mut state = lock_state(&self.inner);
    state.user_id = Some(user);
    state.snapshot = Some(winner);
    state.tracking = true;
    state.session_start = Some(now);
    state.last_activity = Some(now);
    state.last_flushed_offset = 0;
    state.local_only = local_only;
  }

  /// An activity signal (pointer, key, scroll, touch). Starts tracking when
  /// idle and authenticated, otherwise just refreshes the inactivity timer.
  pub fn record_activity(&self) {
    self.record_activity_at(Utc::now());
  }

  pub fn record_activity_at(&self, now: DateTime<Utc>) {
    let mut state = lock_state(&self.inner);
    if state.user_id.is_none() {
      return;
    }
    if !state.tracking {
      state.tracking = true;
      state.session_start = Some(now);
      state.last_flushed_offset = 0;
      debug!("tracking resumed on activity");
    }
    state.last_activity = Some(now);
  }

  /// Derived display value, recomputed per tick and never persisted as-is.
  pub fn current_session_seconds(&self) -> u64 {
    self.current_session_seconds_at(Utc::now())
  }

  pub fn current_session_seconds_at(&self, now: DateTime<Utc>) -> u64 {
    let state = lock_state(&self.inner);
    match (state.tracking, state.session_start) {
      (true, Some(start)) => (now - start).num_seconds().max(0) as u64,
      _ => 0,
    }
  }

  /// Credit un-flushed session time to the snapshot and persist it to the
  /// local store synchronously. Returns the credited delta. A debounced
  /// remote sync is scheduled separately, not on every flush.
  pub fn flush(&self) -> u64 {
    self.flush_at(Utc::now())
  }

  pub fn flush_at(&self, now: DateTime<Utc>) -> u64 {
    let (delta, user, json) = {
      let mut state = lock_state(&self.inner);
      let start = match (state.tracking, state.session_start) {
        (true, Some(start)) => start,
        _ => return 0,
      };
      let current = (now - start).num_seconds().max(0) as u64;
      let delta = current.saturating_sub(state.last_flushed_offset);
      if delta < 1 {
        return 0;
      }
      state.last_flushed_offset = current;

      let today = now.date_naive();
      let snapshot = state
        .snapshot
        .get_or_insert_with(|| TimeSnapshot::empty(today));
      snapshot.credit(delta, today);
      let json = serde_json::to_string(snapshot);
      (delta, state.user_id.clone(), json)
    };

    if let Some(user) = &user {
      match json {
        Ok(json) => {
          if let Err(e) = self.inner.store.set(&snapshot_key(user), &json) {
            warn!(error = %e, "failed to persist time snapshot");
          }
        }
        Err(e) => warn!(error = %e, "failed to serialize time snapshot"),
      }
    }

    self.schedule_remote_sync();
    delta
  }

  /// Once-per-second driver: auto-pauses after the inactivity window and
  /// performs the periodic flush.
  pub fn tick(&self) {
    self.tick_at(Utc::now());
  }

  pub fn tick_at(&self, now: DateTime<Utc>) {
    let (tracking, last_activity, session_start, offset) = {
      let state = lock_state(&self.inner);
      (
        state.tracking,
        state.last_activity,
        state.session_start,
        state.last_flushed_offset,
      )
    };
    if !tracking {
      return;
    }

    let inactivity = Duration::seconds(self.inner.config.inactivity_secs as i64);
    if let Some(last) = last_activity {
      if now - last >= inactivity {
        info!("auto-pausing after inactivity");
        self.stop_at(now);
        return;
      }
    }

    if let Some(start) = session_start {
      let current = (now - start).num_seconds().max(0) as u64;
      if current.saturating_sub(offset) >= self.inner.config.flush_interval_secs {
        self.flush_at(now);
      }
    }
  }

  /// Forced flush on page-hide/unload; the local persist is synchronous and
  /// survives a tab close.
  pub fn on_page_hide(&self) {
    self.flush();
  }

  /// Stop tracking, flushing first. Used by auto-pause and explicit stops
  /// (e.g. logout).
  pub fn stop(&self) {
    self.stop_at(Utc::now());
  }

  pub fn stop_at(&self, now: DateTime<Utc>) {
    self.flush_at(now);
    let mut state = lock_state(&self.inner);
    state.tracking = false;
    state.session_start = None;
    state.last_activity = None;
    state.last_flushed_offset = 0;
  }

  /// Current snapshot, for display.
  pub fn snapshot(&self) -> Option<TimeSnapshot> {
    lock_state(&self.inner).snapshot.clone()
  }

  pub fn is_tracking(&self) -> bool {
    lock_state(&self.inner).tracking
  }

  /// Run the 1 Hz driver until [`cleanup`](Self::cleanup).
  pub fn spawn_ticker(&self) {
    let weak = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
      loop {
        interval.tick().await;
        let Some(inner) = Weak::upgrade(&weak) else {
          break;
        };
        TimeTracker { inner }.tick();
      }
    });

    let mut ticker = self.inner.ticker.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(prev) = ticker.replace(handle) {
      prev.abort();
    }
  }

  /// Flush outstanding time and cancel timers. Call on process teardown.
  pub fn cleanup(&self) {
    self.flush();
    self.inner.sync_debounce.cancel();
    let mut ticker = self.inner.ticker.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = ticker.take() {
      handle.abort();
    }
  }

  fn schedule_remote_sync(&self) {
    let skip = {
      let state = lock_state(&self.inner);
      state.local_only || state.user_id.is_none()
    };
    if skip {
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    self.inner.sync_debounce.call(move || async move {
      let Some(inner) = Weak::upgrade(&weak) else {
        return;
      };
      let (user, snapshot) = {
        let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.user_id.clone(), state.snapshot.clone())
      };
      let (Some(user), Some(snapshot)) = (user, snapshot) else {
        return;
      };
      let Ok(payload) = serde_json::to_value(&snapshot) else {
        return;
      };

      match inner
        .gateway
        .batch_write(vec![PendingOperation::set(COLLECTION, &user, payload)])
        .await
      {
        Ok(()) => debug!(user = %user, "time snapshot synced"),
        Err(SyncError::PermissionDenied(reason)) => {
          warn!(reason = %reason, "time tracking degrading to local-only accounting");
          let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
          state.local_only = true;
        }
        Err(e) => debug!(error = %e, "time snapshot sync failed"),
      }
    });
  }
}

fn lock_state(inner: &TrackerInner) -> MutexGuard<'_, TrackerState> {
  inner.state.lock().unwrap_or_else(|e| e.into_inner())
}
