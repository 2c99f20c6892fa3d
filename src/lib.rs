#![doc = r#"
skarda: Per-Shard Storage Engine for a Sharded Time-Series Database

A database is partitioned into namespaces, each namespace hashed across a
fixed number of shards. This crate is the runtime of one such shard: it owns
a set of series and mediates every operation touching their in-memory
representation or their on-disk fileset files. It provides:
- Series lookup and lifecycle (insert, expire, reference-count)
- An asynchronous, batching insert pipeline with backpressure
- A periodic tick that ages data and garbage-collects empty series
- The warm-flush / snapshot / cold-flush state machine over monotonically
  versioned immutable fileset files, with lease notification to readers
- A paginated metadata scan used by peer bootstrap and repair

The per-series encoder, the reverse index, the block retriever and the
fileset reader/writer/merger are collaborators behind small capability
traits; in-memory doubles for all of them live in [`testing`].
"#]
// Declare modules
pub mod entry;
pub mod error;
pub mod fileset;
pub mod flush;
pub mod flush_state;
mod insert_queue;
pub mod lease;
mod map;
pub mod metadata;
pub mod series;
pub mod shard;
pub mod telemetry;
pub mod testing;
pub mod types;

/// Main entry point: one shard of a namespace.
pub use crate::shard::Shard;
/// Static configuration of a shard.
pub use crate::shard::ShardConfig;
/// The external engines a shard drives.
pub use crate::shard::ShardCollaborators;
/// Hot-swappable pacing and admission knobs.
pub use crate::shard::ShardRuntimeOptions;
/// Caching policy for series evicted from memory.
pub use crate::shard::SeriesCachePolicy;
/// Cooperative cancellation for ticks and other long scans.
pub use crate::shard::Cancellable;
/// Lazy handle to a series admitted through the insert queue.
pub use crate::shard::SeriesRefResolver;
/// Error type for shard operations.
pub use crate::error::{Result, ShardError};
/// Batching insert queue configuration.
pub use crate::insert_queue::InsertQueueOptions;
/// Completion handle for a cold flush.
pub use crate::flush::{ShardColdFlush, ShardSnapshotResult};
/// Metadata pager token and options.
pub use crate::metadata::{FetchBlocksMetadataOptions, FetchBlocksMetadataResult, PageToken};
/// Structured event hook for observability.
pub use crate::telemetry::{ShardEvent, ShardEventListener};
/// Core identifiers and time types.
pub use crate::types::{
    BlockState, BlockStateSnapshot, BootstrapState, RetentionOptions, SeriesId, SeriesMetadata,
    SeriesWrite, TickResult, TimeUnit, Timestamp, Value, WriteType,
};
