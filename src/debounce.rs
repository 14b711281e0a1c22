//! Trailing-edge debouncer built on tokio timers.
//!
//! Each `call` replaces any pending task and restarts the quiet-interval
//! timer; only the last submitted task runs, and only after the interval
//! elapses with no further calls. Owners must call `cancel` on teardown so a
//! pending task cannot fire after the owning component is gone.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Debouncer {
  wait: Duration,
  pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
  pub fn new(wait: Duration) -> Self {
    Self {
      wait,
      pending: Mutex::new(None),
    }
  }

  /// Schedule `task` to run after the quiet interval, replacing any
  /// previously scheduled task.
  pub fn call<F, Fut>(&self, task: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    let wait = self.wait;
    let handle = tokio::spawn(async move {
      tokio::time::sleep(wait).await;
      task().await;
    });

    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(prev) = pending.replace(handle) {
      prev.abort();
    }
  }

  /// Drop any pending task without running it.
  pub fn cancel(&self) {
    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(prev) = pending.take() {
      prev.abort();
    }
  }

  /// True if a task is scheduled and has not yet fired or been canceled.
  pub fn is_pending(&self) -> bool {
    let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    pending.as_ref().is_some_and(|h| !h.is_finished())
  }
}

impl Drop for Debouncer {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[tokio::test]
  async fn fires_once_with_last_call() {
    let debouncer = Debouncer::new(Duration::from_millis(20));
    let fired = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
      let fired = Arc::clone(&fired);
      debouncer.call(move || async move {
        fired.store(i, Ordering::SeqCst);
      });
      tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Only the third call survives the restarts.
    assert_eq!(fired.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn restart_delays_firing() {
    let debouncer = Debouncer::new(Duration::from_millis(30));
    let fired = Arc::new(AtomicUsize::new(0));

    let f = Arc::clone(&fired);
    debouncer.call(move || async move {
      f.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let f = Arc::clone(&fired);
    debouncer.call(move || async move {
      f.fetch_add(1, Ordering::SeqCst);
    });

    // 40ms after the first call the restarted timer has not expired yet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancel_prevents_firing() {
    let debouncer = Debouncer::new(Duration::from_millis(10));
    let fired = Arc::new(AtomicUsize::new(0));

    let f = Arc::clone(&fired);
    debouncer.call(move || async move {
      f.fetch_add(1, Ordering::SeqCst);
    });
    debouncer.cancel();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!debouncer.is_pending());
  }
}
