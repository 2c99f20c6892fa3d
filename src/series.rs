//! Contracts for the collaborators the shard coordinates: the per-series
//! engine, its factory, the reverse index, the block retriever, fileset
//! preparers and the cold-flush merger. The shard owns none of their
//! internals; it only drives them through these capability traits.

use crate::entry::Entry;
use crate::error::Result;
use crate::types::{
    BlockStateSnapshot, SeriesId, SeriesMetadata, Timestamp, TimeUnit, Value, WriteType,
};
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An encoded block handed back by the read path. The segment bytes are
/// opaque to the shard; decoding belongs to the query layer.
#[derive(Debug, Clone)]
pub struct BlockReader {
    pub start: Timestamp,
    pub segment: Bytes,
}

/// Result of fetching the blocks of one series for a set of block starts.
#[derive(Debug, Clone)]
pub struct FetchBlockResult {
    pub start: Timestamp,
    pub segments: Vec<Bytes>,
}

/// Metadata of a single block of a series.
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    pub start: Timestamp,
    pub size: i64,
    pub checksum: Option<u32>,
}

/// Metadata of all blocks of one series inside a queried range.
#[derive(Debug, Clone)]
pub struct SeriesBlocksMetadata {
    pub id: SeriesId,
    pub tags: Vec<(Bytes, Bytes)>,
    pub blocks: Vec<BlockMetadata>,
}

/// Counters and expiry outcome of ticking one series.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesTickResult {
    /// Every datapoint of the series has fallen out of retention; the entry
    /// becomes a purge candidate.
    pub all_expired: bool,
    pub active_blocks: u64,
    pub wired_blocks: u64,
    pub unwired_blocks: u64,
    pub made_expired_blocks: u64,
    pub made_unwired_blocks: u64,
    pub merged_out_of_order_blocks: u64,
    pub evicted_buckets: u64,
}

/// Outcome of warm-flushing one series into a prepared fileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    FlushedToDisk,
    BlockDoesNotExist,
}

/// Outcome of snapshotting one series.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOutcome {
    pub persisted: bool,
}

/// A block of encoded data produced by a bootstrap or repair source,
/// destined for `Series::load_block`.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub start: Timestamp,
    pub segment: Bytes,
}

impl BlockData {
    /// Best-effort byte footprint, used by the shard's load budget.
    pub fn estimated_size(&self) -> u64 {
        self.segment.len() as u64
    }
}

/// The per-series storage engine. One instance per live series; the entry is
/// its only owner. Implementations must be internally synchronized: the
/// shard calls them outside its own lock.
pub trait Series: Send + Sync + fmt::Debug {
    fn metadata(&self) -> &SeriesMetadata;

    fn id(&self) -> &SeriesId {
        &self.metadata().id
    }

    /// Writes one datapoint. Returns whether the datapoint mutated state
    /// (duplicates of an identical write report `false`).
    fn write(
        &self,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        write_type: WriteType,
    ) -> Result<bool>;

    fn read_encoded(&self, start: Timestamp, end: Timestamp) -> Result<Vec<BlockReader>>;

    fn fetch_blocks(&self, starts: &[Timestamp]) -> Result<Vec<FetchBlockResult>>;

    fn fetch_blocks_for_cold_flush(
        &self,
        start: Timestamp,
        version: i32,
    ) -> Result<FetchBlockResult>;

    /// Metadata for the series' blocks inside `[start, end)`. An empty block
    /// list means the series has no data in range and is skipped by pagers.
    fn fetch_blocks_metadata(&self, start: Timestamp, end: Timestamp)
        -> Result<SeriesBlocksMetadata>;

    /// Ages the series against the given block states, evicting what the
    /// snapshot proves is safely on disk.
    fn tick(&self, block_states: &BlockStateSnapshot) -> Result<SeriesTickResult>;

    /// True when the series holds no buffered or cached data. Consulted
    /// under the shard write lock immediately before a purge.
    fn is_empty(&self) -> bool;

    fn warm_flush(
        &self,
        block_start: Timestamp,
        persist: &mut dyn PreparedPersist,
    ) -> Result<FlushOutcome>;

    fn snapshot(
        &self,
        block_start: Timestamp,
        persist: &mut dyn PreparedPersist,
    ) -> Result<SnapshotOutcome>;

    /// Block starts whose cold buffers hold unflushed data, per the given
    /// snapshot of flush states.
    fn cold_flush_block_starts(&self, block_states: &BlockStateSnapshot) -> Vec<Timestamp>;

    /// Adds every block start holding any data to `out`.
    fn mark_non_empty_blocks(&self, out: &mut HashSet<Timestamp>);

    /// Moves bootstrap buffers into queryable position.
    fn bootstrap(&self) -> Result<()>;

    fn load_block(&self, block: BlockData, write_type: WriteType) -> Result<()>;

    /// Installs a block retrieved from disk into the series cache.
    fn on_retrieve_block(&self, id: &SeriesId, start: Timestamp, segment: Bytes);

    /// The wired list may call back for a block the series has already
    /// dropped; implementations tolerate that and no-op.
    fn on_evicted_from_wired_list(&self, id: &SeriesId, block_start: Timestamp);

    /// Releases resources. Called under the shard write lock during purge,
    /// after the shard has proven no other holder exists.
    fn close(&self);
}

/// Creates series engines for entries the shard admits.
pub trait SeriesFactory: Send + Sync {
    fn create(&self, metadata: SeriesMetadata, unique_index: u64) -> Arc<dyn Series>;
}

/// One deferred reverse-index insert, batched on the queue drain.
#[derive(Debug, Clone)]
pub struct IndexWriteBatchEntry {
    pub entry: Arc<Entry>,
    pub timestamp: Timestamp,
    pub enqueued_at: Timestamp,
}

/// The namespace's secondary inverted index.
pub trait ReverseIndex: Send + Sync {
    /// Writes a batch of pending index inserts. Implementations call
    /// `Entry::on_index_success` per entry that lands and
    /// `Entry::on_index_finalize` for ones that do not.
    fn write_batch(&self, batch: Vec<IndexWriteBatchEntry>) -> Result<()>;

    /// Index block start owning a write at `timestamp`.
    fn block_start_for_write_time(&self, timestamp: Timestamp) -> Timestamp;

    /// Index block starts that have been warm flushed, consulted when
    /// reconstructing flush states at bootstrap.
    fn warm_flush_block_starts(&self) -> Vec<Timestamp>;
}

/// Serves encoded blocks from the shard's fileset files.
pub trait BlockRetriever: Send + Sync {
    fn stream(
        &self,
        shard: u32,
        id: &SeriesId,
        block_start: Timestamp,
    ) -> Result<Option<BlockReader>>;

    /// Warms the seeker indices for the given shards after bootstrap.
    fn cache_shard_indices(&self, shards: &[u32]) -> Result<()>;
}

/// Fileset type being prepared for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesetType {
    Flush,
    Snapshot,
}

/// Options for preparing one fileset writer.
#[derive(Debug, Clone)]
pub struct DataPrepareOptions {
    pub namespace: String,
    pub shard: u32,
    pub block_start: Timestamp,
    pub volume_index: i32,
    /// Warm flushes never overwrite: bootstrap already told us which
    /// filesets exist, so a collision is a bug upstream.
    pub delete_if_exists: bool,
    pub fileset_type: FilesetType,
    pub snapshot_time: Option<Timestamp>,
    pub snapshot_index: Option<u64>,
}

/// An open fileset writer for one (shard, blockStart, volume).
pub trait PreparedPersist: Send {
    fn persist(&mut self, metadata: &SeriesMetadata, segment: Bytes, checksum: u32) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Prepares warm-flush fileset writers.
pub trait FlushPreparer: Send + Sync {
    fn prepare_data(&self, opts: DataPrepareOptions) -> Result<Box<dyn PreparedPersist>>;
}

/// Prepares snapshot fileset writers. Separate from [`FlushPreparer`]
/// because snapshot filesets are numbered by their own monotonic index.
pub trait SnapshotPreparer: Send + Sync {
    fn prepare_data(&self, opts: DataPrepareOptions) -> Result<Box<dyn PreparedPersist>>;
}

/// A cold-flush merge request for one block start: read `cold_version`,
/// merge the named series' in-memory cold data, and write `next_version`
/// through a writer prepared from `flush_preparer`.
pub struct MergeRequest<'a> {
    pub namespace: &'a str,
    pub shard: u32,
    pub block_start: Timestamp,
    pub cold_version: i32,
    pub next_version: i32,
    pub dirty_series: &'a [SeriesMetadata],
    pub flush_preparer: &'a dyn FlushPreparer,
}

/// Completion handle for one merged block; closing commits the new volume's
/// files to disk.
pub trait MergeCloser: Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// Merges an existing fileset volume with in-memory cold data into the next
/// volume.
pub trait Merger: Send + Sync {
    fn merge(&self, request: MergeRequest<'_>) -> Result<Box<dyn MergeCloser>>;
}

/// Enforces the cumulative bytes budget for blocks loaded outside of
/// bootstrap. Loads that would exceed the budget are refused up front so no
/// partial state is admitted.
#[derive(Debug)]
pub struct MemoryTracker {
    limit: Option<u64>,
    loaded: AtomicU64,
}

impl MemoryTracker {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            loaded: AtomicU64::new(0),
        }
    }

    /// Reserves `n` bytes against the budget. Returns false (reserving
    /// nothing) when the budget would be exceeded.
    pub fn inc_num_loaded_bytes(&self, n: u64) -> bool {
        match self.limit {
            None => {
                self.loaded.fetch_add(n, Ordering::Relaxed);
                true
            }
            Some(limit) => {
                let mut current = self.loaded.load(Ordering::Relaxed);
                loop {
                    let next = current.saturating_add(n);
                    if next > limit {
                        return false;
                    }
                    match self.loaded.compare_exchange_weak(
                        current,
                        next,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return true,
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }

    pub fn num_loaded_bytes(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Releases bytes after the loaded data has been flushed or evicted.
    pub fn dec_num_loaded_bytes(&self, n: u64) {
        let mut current = self.loaded.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match self.loaded.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_tracker_enforces_limit() {
        let tracker = MemoryTracker::new(Some(100));
        assert!(tracker.inc_num_loaded_bytes(60));
        assert!(tracker.inc_num_loaded_bytes(40));
        assert!(!tracker.inc_num_loaded_bytes(1));
        assert_eq!(tracker.num_loaded_bytes(), 100);

        tracker.dec_num_loaded_bytes(50);
        assert!(tracker.inc_num_loaded_bytes(50));
        assert!(!tracker.inc_num_loaded_bytes(1));
    }

    #[test]
    fn memory_tracker_unlimited() {
        let tracker = MemoryTracker::new(None);
        assert!(tracker.inc_num_loaded_bytes(u64::MAX / 2));
        assert!(tracker.inc_num_loaded_bytes(u64::MAX / 2));
    }

    #[test]
    fn block_data_estimates_segment_size() {
        let block = BlockData {
            start: 0,
            segment: Bytes::from_static(b"0123456789"),
        };
        assert_eq!(block.estimated_size(), 10);
    }
}
