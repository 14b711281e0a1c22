//! Cache entry representation and the data-class TTL mapping.

use crate::config::CacheConfig;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Semantic tag describing how quickly a class of data goes stale.
///
/// Callers pass the tag; the cache resolves the TTL from configuration, so
/// feature code never picks durations directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataClass {
  /// Immutable once written (generated decks, extracted text).
  Static,
  /// Rarely-changing reference data.
  Reference,
  /// User profile data.
  Profile,
  /// Frequently-mutated progress data.
  Progress,
  /// Near-real-time data.
  Realtime,
}

impl DataClass {
  pub fn ttl(self, config: &CacheConfig) -> Duration {
    let secs = match self {
      DataClass::Static => config.static_ttl_secs,
      DataClass::Reference => config.reference_ttl_secs,
      DataClass::Profile => config.profile_ttl_secs,
      DataClass::Progress => config.progress_ttl_secs,
      DataClass::Realtime => config.realtime_ttl_secs,
    };
    Duration::seconds(secs as i64)
  }
}

/// Eviction priority when the cache is over capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
}

/// Per-call options for [`RequestCache::get`](super::RequestCache::get).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
  /// Compress the stored bytes. Worth it for large payloads only.
  pub compress: bool,
  pub priority: Priority,
  /// Explicit TTL, overriding the data-class table.
  pub ttl_override: Option<Duration>,
}

const ZSTD_LEVEL: i32 = 3;

/// A resident cache entry: serialized JSON bytes plus expiry metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  bytes: Vec<u8>,
  compressed: bool,
  pub expires_at: DateTime<Utc>,
  pub priority: Priority,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn encode(
    json: &[u8],
    compress: bool,
    expires_at: DateTime<Utc>,
    priority: Priority,
  ) -> Result<Self> {
    let bytes = if compress {
      zstd::encode_all(json, ZSTD_LEVEL)
        .map_err(|e| SyncError::Serialization(format!("zstd encode: {e}")))?
    } else {
      json.to_vec()
    };

    Ok(Self {
      bytes,
      compressed: compress,
      expires_at,
      priority,
      stored_at: Utc::now(),
    })
  }

  /// The serialized JSON bytes, decompressed if needed.
  pub fn decode(&self) -> Result<Vec<u8>> {
    if self.compressed {
      zstd::decode_all(self.bytes.as_slice())
        .map_err(|e| SyncError::Serialization(format!("zstd decode: {e}")))
    } else {
      Ok(self.bytes.clone())
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn compressed_entry_round_trips() {
    let json = br#"{"cards":["alpha","beta","gamma"]}"#;
    let entry = CacheEntry::encode(json, true, Utc::now() + Duration::minutes(5), Priority::Normal)
      .unwrap();
    assert_eq!(entry.decode().unwrap(), json.to_vec());
  }

  #[test]
  fn expiry_is_inclusive_at_boundary() {
    let now = Utc::now();
    let entry = CacheEntry::encode(b"{}", false, now, Priority::Normal).unwrap();
    assert!(entry.is_expired(now));
    assert!(!entry.is_expired(now - Duration::seconds(1)));
  }

  #[test]
  fn ttl_table_resolves_per_class() {
    let config = CacheConfig::default();
    assert!(DataClass::Static.ttl(&config) > DataClass::Progress.ttl(&config));
    assert_eq!(DataClass::Realtime.ttl(&config), Duration::seconds(30));
  }
}
