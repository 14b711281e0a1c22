//! Tunables for the cache, queue and session tracker.
//!
//! Callers tag reads with a semantic [`DataClass`](crate::cache::DataClass)
//! and the TTL table here resolves the actual lifetime, so feature code never
//! hardcodes durations.

use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// TTL for immutable content (generated decks, extracted text).
  #[serde(default = "default_static_ttl_secs")]
  pub static_ttl_secs: u64,
  /// TTL for rarely-changing reference data.
  #[serde(default = "default_reference_ttl_secs")]
  pub reference_ttl_secs: u64,
  /// TTL for user profile data.
  #[serde(default = "default_profile_ttl_secs")]
  pub profile_ttl_secs: u64,
  /// TTL for frequently-mutated progress data.
  #[serde(default = "default_progress_ttl_secs")]
  pub progress_ttl_secs: u64,
  /// TTL for near-real-time data.
  #[serde(default = "default_realtime_ttl_secs")]
  pub realtime_ttl_secs: u64,
  /// Upper bound on resident entries before eviction kicks in.
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
  /// How often accumulated time is flushed to the local store.
  #[serde(default = "default_flush_interval_secs")]
  pub flush_interval_secs: u64,
  /// Quiet period after which tracking auto-pauses.
  #[serde(default = "default_inactivity_secs")]
  pub inactivity_secs: u64,
  /// Debounce window for pushing the snapshot to the remote backend.
  #[serde(default = "default_sync_debounce_ms")]
  pub sync_debounce_ms: u64,
}

fn default_static_ttl_secs() -> u64 {
  24 * 60 * 60
}
fn default_reference_ttl_secs() -> u64 {
  6 * 60 * 60
}
fn default_profile_ttl_secs() -> u64 {
  30 * 60
}
fn default_progress_ttl_secs() -> u64 {
  5 * 60
}
fn default_realtime_ttl_secs() -> u64 {
  30
}
fn default_max_entries() -> usize {
  4096
}
fn default_flush_interval_secs() -> u64 {
  60
}
fn default_inactivity_secs() -> u64 {
  180
}
fn default_sync_debounce_ms() -> u64 {
  5_000
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_ttl_secs: default_static_ttl_secs(),
      reference_ttl_secs: default_reference_ttl_secs(),
      profile_ttl_secs: default_profile_ttl_secs(),
      progress_ttl_secs: default_progress_ttl_secs(),
      realtime_ttl_secs: default_realtime_ttl_secs(),
      max_entries: default_max_entries(),
    }
  }
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      flush_interval_secs: default_flush_interval_secs(),
      inactivity_secs: default_inactivity_secs(),
      sync_debounce_ms: default_sync_debounce_ms(),
    }
  }
}

impl SessionConfig {
  pub fn flush_interval(&self) -> Duration {
    Duration::from_secs(self.flush_interval_secs)
  }

  pub fn inactivity_window(&self) -> Duration {
    Duration::from_secs(self.inactivity_secs)
  }

  pub fn sync_debounce(&self) -> Duration {
    Duration::from_millis(self.sync_debounce_ms)
  }
}

impl SyncConfig {
  /// Load configuration from a YAML file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| SyncError::Config(format!("failed to read {}: {e}", path.display())))?;

    serde_yaml::from_str(&contents)
      .map_err(|e| SyncError::Config(format!("failed to parse {}: {e}", path.display())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_tiered() {
    let config = SyncConfig::default();
    assert!(config.cache.static_ttl_secs > config.cache.reference_ttl_secs);
    assert!(config.cache.reference_ttl_secs > config.cache.progress_ttl_secs);
    assert!(config.cache.progress_ttl_secs > config.cache.realtime_ttl_secs);
  }

  #[test]
  fn partial_yaml_fills_defaults() {
    let config: SyncConfig = serde_yaml::from_str("cache:\n  progress_ttl_secs: 120\n").unwrap();
    assert_eq!(config.cache.progress_ttl_secs, 120);
    assert_eq!(config.cache.realtime_ttl_secs, default_realtime_ttl_secs());
    assert_eq!(config.session.flush_interval_secs, 60);
  }
}
