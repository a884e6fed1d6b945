//! rendercache storage engine
//!
//! Disk-backed cache for rendered responses:
//! - Sharded on-disk layout with a durable metadata log per shard
//! - In-memory folder index with drift detection
//! - Write-behind queue bounded by a memory budget
//! - Least-recently-used eviction with a minimum entry age
//! - Per-key build coalescing

pub mod blob;
pub mod cache;
pub mod coordinator;
pub mod eviction;
pub mod index;
pub mod issues;
pub mod layout;
pub mod meta_log;
pub mod meta_store;
pub mod shard;
pub mod stats;
pub mod write_queue;

pub use cache::{CacheBackend, DiskCache};
pub use coordinator::{BuildCoordinator, BuildState, CacheResponse, ProducerError, ResponseSource};
pub use eviction::{EvictionManager, SweepReport};
pub use index::{DriftEvent, DriftKind, FolderIndex, Lookup, PopulateReport, StatOutcome};
pub use issues::IssueSink;
pub use meta_store::MetaStore;
pub use shard::{Shard, ShardStats, VerifyReport};
pub use stats::{CacheStats, StatsSnapshot};
pub use write_queue::{StopReport, WriteBehindQueue, WriteTicket};

pub use rendercache_common::{CacheEntry, CacheKey, CacheOptions, CachedBlob, Error, Issue, Result};
