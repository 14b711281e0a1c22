//! Client-side data synchronization and caching layer.
//!
//! Mediates between transient UI state, a local persistent key-value store
//! and a remote document/blob backend under unreliable connectivity:
//!
//! - [`cache::RequestCache`]: tiered TTL cache with per-data-class
//!   lifetimes, request deduplication and pattern invalidation;
//! - [`queue::OfflineQueue`] + [`queue::Connectivity`]: durable-in-memory
//!   FIFO of writes captured while offline, replayed on reconnect;
//! - [`gateway::Gateway`]: the single entry point for document reads,
//!   collection queries, live subscriptions, batched writes and blob
//!   operations;
//! - [`session::TimeTracker`]: activity-driven time accounting with
//!   local-first persistence and debounced remote sync;
//! - [`debounce::Debouncer`]: the trailing-edge timer everything above
//!   coalesces work with.
//!
//! Everything is an explicitly constructed service object; there are no
//! module-level globals. The remote backends, the authentication signal and
//! the local store are collaborator traits supplied by the embedder.

pub mod cache;
pub mod config;
pub mod debounce;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod session;
pub mod store;

pub use cache::{CacheOptions, CacheStats, DataClass, Priority, RequestCache};
pub use config::{CacheConfig, SessionConfig, SyncConfig};
pub use debounce::Debouncer;
pub use error::{Result, SyncError};
pub use gateway::{
  BlobBackend, BlobOperation, Comparator, Document, DocumentBackend, Filter, Gateway,
  MemoryBackend, PreloadRead, QueryOptions, QueryPage, QuerySpec, ReadOptions, SortDirection,
};
pub use queue::{Connectivity, OfflineQueue, OpKind, PendingOperation};
pub use session::{TimeSnapshot, TimeTracker};
pub use store::{LocalStore, MemoryStore, SqliteStore};
