//! Deterministic in-memory doubles for the shard's collaborator traits,
//! plus a builder wiring them into a ready-to-use shard. Integration tests
//! (and downstream consumers' tests) drive the shard end-to-end against
//! these without touching real fileset I/O.

use crate::entry::Entry;
use crate::error::{Result, ShardError};
use crate::fileset::{self, MetadataEntry, MetadataReader, NamespaceReaderManager, ReaderPosition};
use crate::insert_queue::{InsertOp, InsertOpOptions, InsertQueueOptions, PendingRetrievedBlock};
use crate::lease::{BlockLeaseManager, BlockLeaser, LeaseDescriptor, LeaseState, UpdateLeaseResult};
use crate::series::{
    BlockData, BlockMetadata, BlockReader, DataPrepareOptions, FetchBlockResult, FilesetType,
    FlushOutcome, FlushPreparer, IndexWriteBatchEntry, MergeCloser, MergeRequest, Merger,
    PreparedPersist, ReverseIndex, Series, SeriesBlocksMetadata, SeriesFactory, SeriesTickResult,
    SnapshotOutcome, SnapshotPreparer,
};
use crate::shard::{Shard, ShardCollaborators, ShardConfig, ShardRuntimeOptions};
use crate::types::{
    BlockStateSnapshot, RetentionOptions, SeriesId, SeriesMetadata, Timestamp, TimeUnit, Value,
    WriteType,
};
use bytes::Bytes;
use crc32fast::Hasher as Crc32;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- series double ---

#[derive(Debug, Default)]
struct MemSeriesState {
    warm: Vec<(Timestamp, Value)>,
    cold: Vec<(Timestamp, Value)>,
    cold_dirty: HashSet<Timestamp>,
    cold_loaded_blocks: usize,
    hydrated: Vec<(Timestamp, Bytes)>,
    expired: bool,
    closed: bool,
    bootstrapped: bool,
    fail_next_flush: bool,
}

/// In-memory series engine. Warm and cold points are kept as plain sorted
/// vectors; segments are bincode-encoded point lists.
#[derive(Debug)]
pub struct MemSeries {
    metadata: SeriesMetadata,
    block_size_nanos: i64,
    state: Mutex<MemSeriesState>,
}

impl MemSeries {
    pub fn new(metadata: SeriesMetadata) -> Self {
        Self::with_block_size(metadata, RetentionOptions::default().block_size)
    }

    pub fn with_block_size(metadata: SeriesMetadata, block_size: Duration) -> Self {
        Self {
            metadata,
            block_size_nanos: block_size.as_nanos() as i64,
            state: Mutex::new(MemSeriesState::default()),
        }
    }

    fn block_start(&self, ts: Timestamp) -> Timestamp {
        ts.div_euclid(self.block_size_nanos) * self.block_size_nanos
    }

    fn points_in(&self, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, Value)> {
        let state = self.state.lock().unwrap();
        let mut points: Vec<_> = state
            .warm
            .iter()
            .chain(state.cold.iter())
            .copied()
            .filter(|(ts, _)| *ts >= start && *ts < end)
            .collect();
        points.sort_by_key(|&(ts, _)| ts);
        points
    }

    pub fn encode_points(points: &[(Timestamp, Value)]) -> Bytes {
        Bytes::from(bincode::serialize(points).expect("encode points"))
    }

    pub fn decode_points(segment: &[u8]) -> Vec<(Timestamp, Value)> {
        bincode::deserialize(segment).expect("decode points")
    }

    /// Flattens and sorts the points of a set of block readers.
    pub fn decode_blocks(blocks: &[BlockReader]) -> Vec<(Timestamp, Value)> {
        let mut points: Vec<(Timestamp, Value)> = blocks
            .iter()
            .flat_map(|b| Self::decode_points(&b.segment))
            .collect();
        points.sort_by_key(|&(ts, _)| ts);
        points
    }

    /// Marks every datapoint as expired and drains the buffers, making the
    /// series a purge candidate on the next tick.
    pub fn expire_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.expired = true;
        state.warm.clear();
        state.cold.clear();
        state.cold_dirty.clear();
        state.hydrated.clear();
    }

    /// Flags a block start as holding unflushed cold data.
    pub fn mark_cold_dirty(&self, block_start: Timestamp) {
        self.state.lock().unwrap().cold_dirty.insert(block_start);
    }

    /// Clears the dirty markers, as a real series would after the merger
    /// consumed its cold buffers.
    pub fn clear_cold_dirty(&self) {
        self.state.lock().unwrap().cold_dirty.clear();
    }

    pub fn fail_next_flush(&self) {
        self.state.lock().unwrap().fail_next_flush = true;
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn bootstrapped(&self) -> bool {
        self.state.lock().unwrap().bootstrapped
    }

    pub fn cold_loaded_blocks(&self) -> usize {
        self.state.lock().unwrap().cold_loaded_blocks
    }

    pub fn hydrated_blocks(&self) -> Vec<Timestamp> {
        self.state.lock().unwrap().hydrated.iter().map(|(t, _)| *t).collect()
    }
}

impl Series for MemSeries {
    fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    fn write(
        &self,
        timestamp: Timestamp,
        value: Value,
        _unit: TimeUnit,
        _annotation: Option<&[u8]>,
        write_type: WriteType,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match write_type {
            WriteType::WarmWrite => state.warm.push((timestamp, value)),
            WriteType::ColdWrite => {
                state.cold.push((timestamp, value));
                let block = self.block_start(timestamp);
                state.cold_dirty.insert(block);
            }
        }
        state.expired = false;
        Ok(true)
    }

    fn read_encoded(&self, start: Timestamp, end: Timestamp) -> Result<Vec<BlockReader>> {
        let points = self.points_in(start, end);
        let mut by_block: BTreeMap<Timestamp, Vec<(Timestamp, Value)>> = BTreeMap::new();
        for point in points {
            by_block.entry(self.block_start(point.0)).or_default().push(point);
        }
        Ok(by_block
            .into_iter()
            .map(|(block_start, points)| BlockReader {
                start: block_start,
                segment: Self::encode_points(&points),
            })
            .collect())
    }

    fn fetch_blocks(&self, starts: &[Timestamp]) -> Result<Vec<FetchBlockResult>> {
        Ok(starts
            .iter()
            .filter_map(|&start| {
                let points = self.points_in(start, start + self.block_size_nanos);
                if points.is_empty() {
                    return None;
                }
                Some(FetchBlockResult {
                    start,
                    segments: vec![Self::encode_points(&points)],
                })
            })
            .collect())
    }

    fn fetch_blocks_for_cold_flush(
        &self,
        start: Timestamp,
        _version: i32,
    ) -> Result<FetchBlockResult> {
        let state = self.state.lock().unwrap();
        let points: Vec<_> = state
            .cold
            .iter()
            .copied()
            .filter(|(ts, _)| self.block_start(*ts) == start)
            .collect();
        drop(state);
        Ok(FetchBlockResult {
            start,
            segments: vec![Self::encode_points(&points)],
        })
    }

    fn fetch_blocks_metadata(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<SeriesBlocksMetadata> {
        let points = self.points_in(start, end);
        let mut by_block: BTreeMap<Timestamp, usize> = BTreeMap::new();
        for (ts, _) in points {
            *by_block.entry(self.block_start(ts)).or_default() += 1;
        }
        Ok(SeriesBlocksMetadata {
            id: self.metadata.id.clone(),
            tags: self.metadata.tags.clone(),
            blocks: by_block
                .into_iter()
                .map(|(block_start, count)| BlockMetadata {
                    start: block_start,
                    size: (count * 16) as i64,
                    checksum: None,
                })
                .collect(),
        })
    }

    fn tick(&self, _block_states: &BlockStateSnapshot) -> Result<SeriesTickResult> {
        let state = self.state.lock().unwrap();
        if state.expired {
            return Ok(SeriesTickResult {
                all_expired: true,
                ..Default::default()
            });
        }
        let mut blocks: HashSet<Timestamp> = HashSet::new();
        for (ts, _) in state.warm.iter().chain(state.cold.iter()) {
            blocks.insert(self.block_start(*ts));
        }
        Ok(SeriesTickResult {
            all_expired: false,
            active_blocks: blocks.len() as u64,
            ..Default::default()
        })
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.warm.is_empty() && state.cold.is_empty() && state.hydrated.is_empty()
    }

    fn warm_flush(
        &self,
        block_start: Timestamp,
        persist: &mut dyn PreparedPersist,
    ) -> Result<FlushOutcome> {
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_flush {
                state.fail_next_flush = false;
                return Err(ShardError::internal("series flush failure injected"));
            }
        }
        let points = self.points_in(block_start, block_start + self.block_size_nanos);
        if points.is_empty() {
            return Ok(FlushOutcome::BlockDoesNotExist);
        }
        let segment = Self::encode_points(&points);
        let mut hasher = Crc32::new();
        hasher.update(&segment);
        let checksum = hasher.finalize();
        persist.persist(&self.metadata, segment, checksum)?;
        Ok(FlushOutcome::FlushedToDisk)
    }

    fn snapshot(
        &self,
        block_start: Timestamp,
        persist: &mut dyn PreparedPersist,
    ) -> Result<SnapshotOutcome> {
        let points = self.points_in(block_start, block_start + self.block_size_nanos);
        if points.is_empty() {
            return Ok(SnapshotOutcome { persisted: false });
        }
        let segment = Self::encode_points(&points);
        let mut hasher = Crc32::new();
        hasher.update(&segment);
        let checksum = hasher.finalize();
        persist.persist(&self.metadata, segment, checksum)?;
        Ok(SnapshotOutcome { persisted: true })
    }

    fn cold_flush_block_starts(&self, _block_states: &BlockStateSnapshot) -> Vec<Timestamp> {
        let state = self.state.lock().unwrap();
        let mut starts: Vec<_> = state.cold_dirty.iter().copied().collect();
        starts.sort_unstable();
        starts
    }

    fn mark_non_empty_blocks(&self, out: &mut HashSet<Timestamp>) {
        let state = self.state.lock().unwrap();
        for (ts, _) in state.warm.iter().chain(state.cold.iter()) {
            out.insert(self.block_start(*ts));
        }
    }

    fn bootstrap(&self) -> Result<()> {
        self.state.lock().unwrap().bootstrapped = true;
        Ok(())
    }

    fn load_block(&self, block: BlockData, write_type: WriteType) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let points = Self::decode_points(&block.segment);
        match write_type {
            WriteType::ColdWrite => {
                state.cold.extend(points);
                state.cold_dirty.insert(block.start);
                state.cold_loaded_blocks += 1;
            }
            WriteType::WarmWrite => state.warm.extend(points),
        }
        Ok(())
    }

    fn on_retrieve_block(&self, _id: &SeriesId, start: Timestamp, segment: Bytes) {
        self.state.lock().unwrap().hydrated.push((start, segment));
    }

    fn on_evicted_from_wired_list(&self, _id: &SeriesId, _block_start: Timestamp) {}

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Factory that hands out [`MemSeries`] and remembers them by id so tests
/// can reach into any created series.
#[derive(Debug)]
pub struct MemSeriesFactory {
    block_size: Duration,
    created: Mutex<Vec<Arc<MemSeries>>>,
}

impl MemSeriesFactory {
    pub fn new(block_size: Duration) -> Self {
        Self {
            block_size,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn series(&self, id: &[u8]) -> Option<Arc<MemSeries>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.metadata.id.as_ref() == id)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl SeriesFactory for MemSeriesFactory {
    fn create(&self, metadata: SeriesMetadata, _unique_index: u64) -> Arc<dyn Series> {
        let series = Arc::new(MemSeries::with_block_size(metadata, self.block_size));
        self.created.lock().unwrap().push(series.clone());
        series
    }
}

// --- reverse index double ---

/// Reverse index double: acknowledges every batched insert and records it.
#[derive(Debug)]
pub struct MockReverseIndex {
    index_block_size_nanos: i64,
    written: Mutex<Vec<(SeriesId, Timestamp)>>,
    warm_starts: Mutex<Vec<Timestamp>>,
}

impl MockReverseIndex {
    pub fn new(index_block_size: Duration) -> Self {
        Self {
            index_block_size_nanos: index_block_size.as_nanos() as i64,
            written: Mutex::new(Vec::new()),
            warm_starts: Mutex::new(Vec::new()),
        }
    }

    pub fn written(&self) -> Vec<(SeriesId, Timestamp)> {
        self.written.lock().unwrap().clone()
    }

    pub fn set_warm_flush_block_starts(&self, starts: Vec<Timestamp>) {
        *self.warm_starts.lock().unwrap() = starts;
    }
}

impl ReverseIndex for MockReverseIndex {
    fn write_batch(&self, batch: Vec<IndexWriteBatchEntry>) -> Result<()> {
        let mut written = self.written.lock().unwrap();
        for item in batch {
            let block_start = self.block_start_for_write_time(item.timestamp);
            item.entry.on_index_success(block_start);
            written.push((item.entry.id().clone(), item.timestamp));
        }
        Ok(())
    }

    fn block_start_for_write_time(&self, timestamp: Timestamp) -> Timestamp {
        timestamp.div_euclid(self.index_block_size_nanos) * self.index_block_size_nanos
    }

    fn warm_flush_block_starts(&self) -> Vec<Timestamp> {
        self.warm_starts.lock().unwrap().clone()
    }
}

// --- in-memory fileset surface ---

#[derive(Debug, Clone)]
pub struct PersistedSeries {
    pub metadata: SeriesMetadata,
    pub segment: Bytes,
    pub checksum: u32,
}

#[derive(Debug, Default)]
struct FsState {
    volumes: BTreeMap<(Timestamp, i32), Vec<PersistedSeries>>,
    snapshots: BTreeMap<(Timestamp, u64), Vec<PersistedSeries>>,
}

/// Shared in-memory stand-in for the fileset filesystem, backing the flush
/// preparers, the reader manager and the merger so they observe each
/// other's writes the way the real collaborators do through disk. Clones
/// share the same state.
#[derive(Debug, Default, Clone)]
pub struct MemFilesystem {
    state: Arc<Mutex<FsState>>,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_preparer(&self) -> Arc<MemPreparer> {
        Arc::new(MemPreparer { fs: self.clone() })
    }

    pub fn snapshot_preparer(&self) -> Arc<MemPreparer> {
        Arc::new(MemPreparer { fs: self.clone() })
    }

    pub fn reader_manager(&self) -> Arc<MemReaderManager> {
        Arc::new(MemReaderManager { fs: self.clone() })
    }

    pub fn merger(&self) -> Arc<MemMerger> {
        Arc::new(MemMerger { fs: self.clone() })
    }

    pub fn volume_exists(&self, block_start: Timestamp, volume: i32) -> bool {
        self.state
            .lock()
            .unwrap()
            .volumes
            .contains_key(&(block_start, volume))
    }

    /// Ids persisted into one volume, sorted.
    pub fn volume_series(&self, block_start: Timestamp, volume: i32) -> Vec<SeriesId> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<_> = state
            .volumes
            .get(&(block_start, volume))
            .map(|entries| entries.iter().map(|e| e.metadata.id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Snapshot indices written for one block, sorted.
    pub fn snapshot_indices(&self, block_start: Timestamp) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .snapshots
            .keys()
            .filter(|(b, _)| *b == block_start)
            .map(|(_, idx)| *idx)
            .collect()
    }

    /// Duplicates a volume under a new volume index, simulating a cold
    /// flush performed out-of-band.
    pub fn copy_volume(&self, block_start: Timestamp, from: i32, to: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(entries) = state.volumes.get(&(block_start, from)).cloned() {
            state.volumes.insert((block_start, to), entries);
        }
    }
}

enum PersistTarget {
    Volume(Timestamp, i32),
    Snapshot(Timestamp, u64),
}

/// Implements both preparer traits over [`MemFilesystem`].
#[derive(Debug)]
pub struct MemPreparer {
    fs: MemFilesystem,
}

struct MemPersist {
    fs: MemFilesystem,
    target: PersistTarget,
    buffer: Vec<PersistedSeries>,
}

impl MemPreparer {
    fn prepare(&self, opts: DataPrepareOptions) -> Result<Box<dyn PreparedPersist>> {
        let target = match opts.fileset_type {
            FilesetType::Flush => {
                if !opts.delete_if_exists
                    && self.fs.volume_exists(opts.block_start, opts.volume_index)
                {
                    return Err(ShardError::invalid_params(format!(
                        "fileset already exists for block {} volume {}",
                        opts.block_start, opts.volume_index
                    )));
                }
                PersistTarget::Volume(opts.block_start, opts.volume_index)
            }
            FilesetType::Snapshot => PersistTarget::Snapshot(
                opts.block_start,
                opts.snapshot_index.unwrap_or_default(),
            ),
        };
        Ok(Box::new(MemPersist {
            fs: self.fs.clone(),
            target,
            buffer: Vec::new(),
        }))
    }
}

impl FlushPreparer for MemPreparer {
    fn prepare_data(&self, opts: DataPrepareOptions) -> Result<Box<dyn PreparedPersist>> {
        self.prepare(opts)
    }
}

impl SnapshotPreparer for MemPreparer {
    fn prepare_data(&self, opts: DataPrepareOptions) -> Result<Box<dyn PreparedPersist>> {
        self.prepare(opts)
    }
}

impl PreparedPersist for MemPersist {
    fn persist(&mut self, metadata: &SeriesMetadata, segment: Bytes, checksum: u32) -> Result<()> {
        self.buffer.push(PersistedSeries {
            metadata: metadata.clone(),
            segment,
            checksum,
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.fs.state.lock().unwrap();
        match self.target {
            PersistTarget::Volume(block, volume) => {
                state.volumes.insert((block, volume), self.buffer);
            }
            PersistTarget::Snapshot(block, index) => {
                state.snapshots.insert((block, index), self.buffer);
            }
        }
        Ok(())
    }
}

/// Reader manager double serving metadata straight from [`MemFilesystem`],
/// always from the latest volume of a block.
#[derive(Debug)]
pub struct MemReaderManager {
    fs: MemFilesystem,
}

struct MemMetadataReader {
    entries: Vec<MetadataEntry>,
    consumed: i64,
    volume: i32,
}

impl MetadataReader for MemMetadataReader {
    fn read_metadata(&mut self) -> Result<Option<MetadataEntry>> {
        if (self.consumed as usize) < self.entries.len() {
            let entry = self.entries[self.consumed as usize].clone();
            self.consumed += 1;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    fn metadata_read(&self) -> i64 {
        self.consumed
    }

    fn volume(&self) -> i32 {
        self.volume
    }
}

impl NamespaceReaderManager for MemReaderManager {
    fn fileset_exists_at(&self, _shard: u32, block_start: Timestamp) -> Result<bool> {
        let state = self.fs.state.lock().unwrap();
        Ok(state.volumes.keys().any(|(b, _)| *b == block_start))
    }

    fn get(
        &self,
        _shard: u32,
        block_start: Timestamp,
        position: ReaderPosition,
    ) -> Result<Box<dyn MetadataReader>> {
        let state = self.fs.state.lock().unwrap();
        let volume = state
            .volumes
            .keys()
            .filter(|(b, _)| *b == block_start)
            .map(|(_, v)| *v)
            .max()
            .ok_or_else(|| ShardError::internal("no fileset volumes for block"))?;
        let entries = state
            .volumes
            .get(&(block_start, volume))
            .map(|persisted| {
                persisted
                    .iter()
                    .map(|p| MetadataEntry {
                        id: p.metadata.id.clone(),
                        tags: p.metadata.tags.clone(),
                        size: p.segment.len() as i64,
                        checksum: Some(p.checksum),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(MemMetadataReader {
            entries,
            consumed: position.metadata_idx,
            volume,
        }))
    }

    fn put(&self, _reader: Box<dyn MetadataReader>) -> Result<()> {
        Ok(())
    }

    fn latest_volume(&self, _shard: u32, block_start: Timestamp) -> Result<i32> {
        let state = self.fs.state.lock().unwrap();
        state
            .volumes
            .keys()
            .filter(|(b, _)| *b == block_start)
            .map(|(_, v)| *v)
            .max()
            .ok_or_else(|| ShardError::invalid_params("no fileset volumes for block"))
    }
}

/// Merger double: copies the previous volume's contents and stamps in the
/// dirty series, committing the new volume when the closer is closed.
#[derive(Debug)]
pub struct MemMerger {
    fs: MemFilesystem,
}

struct MemMergeCloser {
    fs: MemFilesystem,
    block_start: Timestamp,
    next_version: i32,
    merged: Vec<PersistedSeries>,
}

impl MergeCloser for MemMergeCloser {
    fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.fs.state.lock().unwrap();
        state
            .volumes
            .insert((self.block_start, self.next_version), self.merged);
        Ok(())
    }
}

impl Merger for MemMerger {
    fn merge(&self, request: MergeRequest<'_>) -> Result<Box<dyn MergeCloser>> {
        let state = self.fs.state.lock().unwrap();
        let mut merged = state
            .volumes
            .get(&(request.block_start, request.cold_version))
            .cloned()
            .unwrap_or_default();
        for dirty in request.dirty_series {
            if !merged.iter().any(|p| p.metadata.id == dirty.id) {
                merged.push(PersistedSeries {
                    metadata: dirty.clone(),
                    segment: Bytes::new(),
                    checksum: 0,
                });
            }
        }
        Ok(Box::new(MemMergeCloser {
            fs: self.fs.clone(),
            block_start: request.block_start,
            next_version: request.next_version,
            merged,
        }))
    }
}

// --- lease double ---

/// Records every lease update. Optionally observes the shard's flush state
/// at notification time, to assert the flushed/retrievable ordering.
#[derive(Default)]
pub struct TestLeaser {
    updates: Mutex<Vec<(Timestamp, i32)>>,
    observed: Mutex<Vec<(i32, i32)>>,
    shard: Mutex<Option<Arc<Shard>>>,
    fail_next: AtomicBool,
}

impl TestLeaser {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn updates(&self) -> Vec<(Timestamp, i32)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn fail_next_update(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Capture `(cold_version_flushed, cold_version_retrievable)` of the
    /// notified block at each update.
    pub fn observe_flush_states(&self, shard: Arc<Shard>) {
        *self.shard.lock().unwrap() = Some(shard);
    }

    pub fn observed_states(&self) -> Vec<(i32, i32)> {
        self.observed.lock().unwrap().clone()
    }
}

impl BlockLeaser for TestLeaser {
    fn update_open_lease(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<UpdateLeaseResult> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ShardError::internal("lease update failure injected"));
        }
        if let Some(shard) = self.shard.lock().unwrap().as_ref() {
            let flush = shard.flush_state.state_no_init_check(descriptor.block_start);
            self.observed
                .lock()
                .unwrap()
                .push((flush.cold_version_flushed, flush.cold_version_retrievable));
        }
        self.updates
            .lock()
            .unwrap()
            .push((descriptor.block_start, state.volume));
        Ok(UpdateLeaseResult::UpdatedLease)
    }
}

// --- harness ---

static TEMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique on-disk scratch directory, removed on drop. Kept std-only so the
/// testing module works outside dev-dependencies.
#[derive(Debug)]
pub struct TempShardDir {
    path: PathBuf,
}

impl TempShardDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!(
            "skarda-test-{}-{}",
            std::process::id(),
            TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path).expect("create temp shard dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for TempShardDir {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempShardDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Builder for a fully wired test shard.
pub struct HarnessBuilder {
    needs_bootstrap: bool,
    runtime: ShardRuntimeOptions,
    retention: RetentionOptions,
    load_limit: Option<u64>,
    rate_limit: Option<u64>,
    index_enabled: bool,
}

/// A shard wired to in-memory collaborators, plus handles to every double.
pub struct Harness {
    pub shard: Arc<Shard>,
    pub factory: Arc<MemSeriesFactory>,
    pub fs: MemFilesystem,
    pub leaser: Arc<TestLeaser>,
    pub index: Option<Arc<MockReverseIndex>>,
    dir: TempShardDir,
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        needs_bootstrap: false,
        runtime: ShardRuntimeOptions::default(),
        // Tests address blocks near the epoch; stretch retention so the
        // horizon never swallows them.
        retention: RetentionOptions {
            retention_period: Duration::from_secs(60 * 365 * 24 * 3600),
            ..Default::default()
        },
        load_limit: None,
        rate_limit: None,
        index_enabled: false,
    }
}

impl HarnessBuilder {
    pub fn needs_bootstrap(mut self, needs: bool) -> Self {
        self.needs_bootstrap = needs;
        self
    }

    pub fn runtime(mut self, runtime: ShardRuntimeOptions) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn retention(mut self, retention: RetentionOptions) -> Self {
        self.retention = retention;
        self
    }

    pub fn load_limit(mut self, limit: Option<u64>) -> Self {
        self.load_limit = limit;
        self
    }

    pub fn rate_limit(mut self, limit: Option<u64>) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn index_enabled(mut self, enabled: bool) -> Self {
        self.index_enabled = enabled;
        self
    }

    pub fn build(self) -> Harness {
        let dir = TempShardDir::new();
        let fs = MemFilesystem::new();
        let factory = Arc::new(MemSeriesFactory::new(self.retention.block_size));
        let leaser = TestLeaser::new();
        let lease_manager = Arc::new(BlockLeaseManager::new());
        lease_manager.register_leaser(leaser.clone());
        let index = self
            .index_enabled
            .then(|| Arc::new(MockReverseIndex::new(self.retention.index_block_size)));

        let config = ShardConfig {
            namespace: "testns".to_string(),
            shard_id: 0,
            data_dir: dir.path().to_path_buf(),
            retention: self.retention,
            index_enabled: self.index_enabled,
            needs_bootstrap: self.needs_bootstrap,
            insert_queue: InsertQueueOptions {
                insert_per_interval_limit: self.rate_limit,
                rate_limit_interval: Duration::from_secs(3600),
            },
            load_limit_bytes: self.load_limit,
            runtime: self.runtime,
            ..Default::default()
        };
        let collab = ShardCollaborators {
            series_factory: factory.clone(),
            reverse_index: index.clone().map(|i| i as Arc<dyn ReverseIndex>),
            block_retriever: None,
            reader_manager: fs.reader_manager(),
            merger: fs.merger(),
            lease_manager,
            streaming_readers: None,
            tile_aggregator: None,
        };

        let shard = Shard::new(config, collab);
        if !self.needs_bootstrap {
            // Mirrors production: prepare-bootstrap always runs before any
            // flush touches the shard.
            shard.prepare_bootstrap().expect("prepare bootstrap");
        }

        Harness {
            shard,
            factory,
            fs,
            leaser,
            index,
            dir,
        }
    }
}

impl Harness {
    /// Blocks until every op enqueued before this call has been drained.
    /// Implemented as a barrier op that joins the current batch without
    /// touching the shard map.
    pub fn drain_inserts(&self) {
        let metadata = SeriesMetadata::untagged(Bytes::from_static(b"__drain_barrier__"));
        let entry = Arc::new(Entry::new(Arc::new(MemSeries::new(metadata)), u64::MAX));
        entry.increment_reader_writer_count();
        let wait = self
            .shard
            .enqueue_insert_op(InsertOp {
                entry,
                opts: InsertOpOptions {
                    skip_rate_limit: true,
                    release_entry_ref: true,
                    pending_retrieved_block: Some(PendingRetrievedBlock {
                        id: Bytes::from_static(b"__drain_barrier__"),
                        start: 0,
                        segment: Bytes::new(),
                    }),
                    ..Default::default()
                },
            })
            .expect("enqueue drain barrier");
        wait.wait().expect("drain barrier wait");
    }

    pub fn block_size_nanos(&self) -> i64 {
        self.shard.config.retention.block_size.as_nanos() as i64
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Writes a real fileset (info + data file) into the shard's data dir.
    pub fn write_fileset(&self, block_start: Timestamp, volume: i32) {
        fileset::write_info_file(
            self.dir.path(),
            &fileset::FilesetInfo {
                block_start,
                volume_index: volume,
                snapshot_time: None,
                num_series: 1,
            },
        )
        .expect("write info file");
        std::fs::write(
            fileset::data_file_path(self.dir.path(), block_start, volume),
            b"data",
        )
        .expect("write data file");
    }
}
