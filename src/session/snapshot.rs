//! Persisted time-tracking snapshot and cross-store reconciliation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The durable record of credited study time. Mirrored between the local
/// store and the remote backend as a full-document set, so a replayed write
/// is idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSnapshot {
  /// Lifetime total. Monotonically non-decreasing except on explicit reset.
  pub accumulated_seconds: u64,
  /// Per-day sub-counter; resets on date rollover, never the lifetime total.
  #[serde(default)]
  pub today_seconds: u64,
  pub last_active_date: NaiveDate,
  pub session_start: Option<DateTime<Utc>>,
}

impl TimeSnapshot {
  pub fn empty(today: NaiveDate) -> Self {
    Self {
      accumulated_seconds: 0,
      today_seconds: 0,
      last_active_date: today,
      session_start: None,
    }
  }

  /// Parse a persisted snapshot, falling back to the empty state on
  /// malformed data rather than failing the session.
  pub fn parse_or_default(raw: Option<&str>, today: NaiveDate) -> Self {
    match raw {
      Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
        warn!(error = %e, "malformed time snapshot, starting fresh");
        Self::empty(today)
      }),
      None => Self::empty(today),
    }
  }

  /// Reset the daily sub-counter when the calendar date has moved on.
  pub fn roll_over(&mut self, today: NaiveDate) {
    if self.last_active_date != today {
      self.today_seconds = 0;
      self.last_active_date = today;
    }
  }

  /// Credit `delta` seconds to both the lifetime total and today's counter.
  pub fn credit(&mut self, delta: u64, today: NaiveDate) {
    self.roll_over(today);
    self.accumulated_seconds += delta;
    self.today_seconds += delta;
  }
}

/// Merge the local and remote snapshots: the larger lifetime total wins, by
/// magnitude rather than by timestamp. This favors never losing
/// already-credited time over perfect cross-device accuracy; a
/// timestamp-based merge or delta summing would change observable behavior.
pub fn reconcile(local: TimeSnapshot, remote: Option<TimeSnapshot>) -> TimeSnapshot {
  match remote {
    Some(remote) if remote.accumulated_seconds > local.accumulated_seconds => {
      debug!(
        local = local.accumulated_seconds,
        remote = remote.accumulated_seconds,
        "remote snapshot wins reconciliation"
      );
      remote
    }
    _ => local,
  }
}
