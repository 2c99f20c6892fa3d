//! The shard runtime: series lookup and lifecycle, the write and read paths,
//! the asynchronous insert pipeline, the periodic tick, and bootstrap.
//!
//! A single reader-writer lock guards the map, list, shard state, ticking
//! flag and runtime options. It is held only for map/list operations and
//! short bookkeeping, never across I/O, series operations or queue enqueues.

use crate::entry::Entry;
use crate::error::{MultiError, Result, ShardError};
use crate::fileset::{self, NamespaceReaderManager, StreamingReader, StreamingReaderFactory};
use crate::flush_state::{ShardFlushState, WarmStatus};
use crate::insert_queue::{
    InsertOp, InsertOpOptions, InsertQueue, InsertQueueOptions, InsertWait, PendingIndex,
    PendingRetrievedBlock, PendingWrite,
};
use crate::lease::BlockLeaseManager;
use crate::map::{iterate_batch_size, EntryList, EntryMap, NodeId};
use crate::series::{
    BlockData, BlockReader, FetchBlockResult, IndexWriteBatchEntry, MemoryTracker, Merger,
    ReverseIndex, SeriesFactory, SeriesTickResult,
};
use crate::telemetry::{noop_event_listener, shard_metrics, ShardEvent, ShardEventListener};
use crate::types::{
    BlockStateSnapshot, BootstrapState, RetentionOptions, SeriesId, SeriesMetadata, SeriesWrite,
    TickResult, TimeUnit, Timestamp, Value, WriteType,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

pub(crate) fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as Timestamp
}

/// Caching policy for series evicted from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesCachePolicy {
    /// Every live series stays in memory; absence from the map is
    /// authoritative and reads for unknown ids return empty.
    CacheAll,
    /// Series may be evicted; reads for unknown ids fall through to the
    /// block retriever.
    CacheRecentlyRead,
}

/// Hot-swappable pacing and admission knobs, updated via
/// [`Shard::set_runtime_options`]. Guarded by the shard lock rather than a
/// lock of their own because every write already holds it.
#[derive(Debug, Clone, Copy)]
pub struct ShardRuntimeOptions {
    /// Admit new series through the insert queue instead of synchronously.
    pub write_new_series_async: bool,
    /// How many series the tick visits between cancellation polls/sleeps.
    pub tick_series_batch_size: usize,
    /// Sleep per series, applied as `batch * sleep` at batch boundaries.
    pub tick_per_series_sleep: Duration,
}

impl Default for ShardRuntimeOptions {
    fn default() -> Self {
        Self {
            write_new_series_async: true,
            tick_series_batch_size: 512,
            tick_per_series_sleep: Duration::ZERO,
        }
    }
}

/// Static configuration of one shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub namespace: String,
    pub shard_id: u32,
    /// Directory holding this shard's fileset files.
    pub data_dir: PathBuf,
    pub retention: RetentionOptions,
    pub index_enabled: bool,
    /// When false the shard starts out bootstrapped (for namespaces that
    /// never replay from peers or disk).
    pub needs_bootstrap: bool,
    pub series_cache_policy: SeriesCachePolicy,
    pub insert_queue: InsertQueueOptions,
    /// Bytes budget for `load_blocks`; `None` disables the limit.
    pub load_limit_bytes: Option<u64>,
    pub runtime: ShardRuntimeOptions,
    pub event_listener: Arc<dyn ShardEventListener>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            shard_id: 0,
            data_dir: PathBuf::from("./data"),
            retention: RetentionOptions::default(),
            index_enabled: false,
            needs_bootstrap: true,
            series_cache_policy: SeriesCachePolicy::CacheAll,
            insert_queue: InsertQueueOptions::default(),
            load_limit_bytes: None,
            runtime: ShardRuntimeOptions::default(),
            event_listener: noop_event_listener(),
        }
    }
}

/// The external engines the shard drives. Only `series_factory`,
/// `reader_manager`, `merger` and `lease_manager` are required on every
/// deployment; the rest depend on namespace features.
#[derive(Clone)]
pub struct ShardCollaborators {
    pub series_factory: Arc<dyn SeriesFactory>,
    pub reverse_index: Option<Arc<dyn ReverseIndex>>,
    pub block_retriever: Option<Arc<dyn crate::series::BlockRetriever>>,
    pub reader_manager: Arc<dyn NamespaceReaderManager>,
    pub merger: Arc<dyn Merger>,
    pub lease_manager: Arc<BlockLeaseManager>,
    pub streaming_readers: Option<Arc<dyn StreamingReaderFactory>>,
    pub tile_aggregator: Option<Arc<dyn TileAggregator>>,
}

/// Aggregates larger-resolution tiles out of this shard's blocks into a new
/// fileset volume.
pub trait TileAggregator: Send + Sync {
    /// Returns the number of processed tiles and the volume written.
    fn aggregate_tiles(&self, shard: u32, opts: &AggregateTilesOptions) -> Result<(i64, i32)>;
}

#[derive(Debug, Clone)]
pub struct AggregateTilesOptions {
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: Duration,
}

/// Compares this shard's metadata against peers and loads differing blocks.
pub trait ShardRepairer: Send + Sync {
    fn repair(&self, shard: &Shard, start: Timestamp, end: Timestamp) -> Result<RepairResult>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairResult {
    pub compared_series: u64,
    pub compared_blocks: u64,
    pub size_differences: u64,
    pub checksum_differences: u64,
}

/// Cooperative cancellation token polled by long-running scans.
#[derive(Debug, Clone, Default)]
pub struct Cancellable {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickPolicy {
    Regular,
    /// The final tick issued during close: every series is treated as
    /// expired so resources are released.
    CloseShard,
}

pub(crate) struct ShardInner {
    state: ShardState,
    pub(crate) bootstrap_state: BootstrapState,
    lookup: EntryMap,
    list: EntryList,
    ticking: bool,
    runtime: ShardRuntimeOptions,
}

/// Counts in-flight ticks so close can wait for them to drain.
#[derive(Debug, Default)]
struct TickWaitGroup {
    count: Mutex<usize>,
    cv: Condvar,
}

impl TickWaitGroup {
    fn add(&self) {
        *self.count.lock().expect("tick wait lock") += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().expect("tick wait lock");
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().expect("tick wait lock");
        while *count > 0 {
            count = self.cv.wait(count).expect("tick wait cv");
        }
    }
}

/// One shard of a namespace: owns a set of series and mediates every
/// operation touching their in-memory representation or their fileset files.
pub struct Shard {
    pub(crate) config: ShardConfig,
    pub(crate) collab: ShardCollaborators,
    pub(crate) inner: RwLock<ShardInner>,
    pub(crate) flush_state: ShardFlushState,
    insert_queue: InsertQueue,
    next_index: AtomicU64,
    pub(crate) next_snapshot_index: AtomicU64,
    mem_tracker: MemoryTracker,
    tick_wait: TickWaitGroup,
    pub(crate) events: Arc<dyn ShardEventListener>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("namespace", &self.config.namespace)
            .field("shard_id", &self.config.shard_id)
            .field("num_series", &self.num_series())
            .finish_non_exhaustive()
    }
}

struct InsertAsyncResult {
    wait: InsertWait,
    copied_id: SeriesId,
    entry: Arc<Entry>,
}

impl Shard {
    pub fn new(config: ShardConfig, collab: ShardCollaborators) -> Arc<Self> {
        let events = config.event_listener.clone();
        let bootstrap_state = if config.needs_bootstrap {
            BootstrapState::NotBootstrapped
        } else {
            BootstrapState::Bootstrapped
        };
        let runtime = config.runtime;
        let load_limit = config.load_limit_bytes;
        let insert_queue = InsertQueue::new(config.insert_queue.clone());

        let shard = Arc::new(Self {
            config,
            collab,
            inner: RwLock::new(ShardInner {
                state: ShardState::Open,
                bootstrap_state,
                lookup: EntryMap::new(),
                list: EntryList::new(),
                ticking: false,
                runtime,
            }),
            flush_state: ShardFlushState::new(),
            insert_queue,
            next_index: AtomicU64::new(0),
            next_snapshot_index: AtomicU64::new(0),
            mem_tracker: MemoryTracker::new(load_limit),
            tick_wait: TickWaitGroup::default(),
            events,
        });

        let weak = Arc::downgrade(&shard);
        shard.insert_queue.start(Box::new(move |ops| match weak.upgrade() {
            Some(shard) => shard.insert_series_batch(ops),
            None => Err(ShardError::QueueClosed),
        }));
        shard.events.on_event(ShardEvent::InsertQueueStarted);
        shard_metrics::record_shard_create();

        shard
    }

    pub fn id(&self) -> u32 {
        self.config.shard_id
    }

    pub fn num_series(&self) -> usize {
        self.inner.read().expect("shard lock").list.len()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrap_state() == BootstrapState::Bootstrapped
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.inner.read().expect("shard lock").bootstrap_state
    }

    pub fn set_runtime_options(&self, runtime: ShardRuntimeOptions) {
        self.inner.write().expect("shard lock").runtime = runtime;
    }

    /// Updates the insert queue's new-series admission limit.
    pub fn set_insert_rate_limit(&self, limit: Option<u64>) {
        self.insert_queue.set_insert_per_interval_limit(limit);
    }

    pub fn is_closing(&self) -> bool {
        self.inner.read().expect("shard lock").state == ShardState::Closing
    }

    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, ShardInner> {
        self.inner.read().expect("shard lock")
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ShardInner> {
        self.inner.write().expect("shard lock")
    }

    // --- lookups ---

    fn lookup_entry_with_lock(&self, inner: &ShardInner, id: &[u8]) -> Result<Arc<Entry>> {
        if inner.state != ShardState::Open {
            // Invalid params so upstream callers do not retry.
            return Err(ShardError::ShardNotOpen);
        }
        let node = inner.lookup.get(id).ok_or(ShardError::EntryNotFound)?;
        Ok(inner
            .list
            .entry(node)
            .cloned()
            .ok_or(ShardError::EntryNotFound)?)
    }

    /// Attempts to retrieve a writable series, incrementing its
    /// reader/writer count on success. Callers must decrement when done.
    pub fn try_retrieve_writable_series(
        &self,
        id: &[u8],
    ) -> Result<(Option<Arc<Entry>>, bool)> {
        let inner = self.read_lock();
        let write_new_series_async = inner.runtime.write_new_series_async;
        match self.lookup_entry_with_lock(&inner, id) {
            Ok(entry) => {
                entry.increment_reader_writer_count();
                Ok((Some(entry), write_new_series_async))
            }
            Err(ShardError::EntryNotFound) => Ok((None, write_new_series_async)),
            Err(err) => Err(err),
        }
    }

    /// Lookup handle for the read path; `None` when absent.
    fn retrieve_for_read(&self, id: &[u8]) -> Result<Option<Arc<Entry>>> {
        let inner = self.read_lock();
        match self.lookup_entry_with_lock(&inner, id) {
            Ok(entry) => {
                entry.increment_reader_writer_count();
                Ok(Some(entry))
            }
            Err(ShardError::EntryNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Series metadata for an id, if the series is live on this shard.
    pub fn doc_ref(&self, id: &[u8]) -> Result<Option<SeriesMetadata>> {
        let inner = self.read_lock();
        match self.lookup_entry_with_lock(&inner, id) {
            Ok(entry) => Ok(Some(entry.series().metadata().clone())),
            Err(ShardError::EntryNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // --- entry construction and inserts ---

    fn new_shard_entry(&self, metadata: SeriesMetadata) -> Arc<Entry> {
        let unique_index = self.next_index.fetch_add(1, Ordering::Relaxed) + 1;
        let series = self.collab.series_factory.create(metadata, unique_index);
        Arc::new(Entry::new(series, unique_index))
    }

    fn insert_new_shard_entry_with_lock(&self, inner: &mut ShardInner, entry: Arc<Entry>) {
        // The map key shares the entry's id allocation; no copy, and the
        // bytes outlive the map because the series metadata owns them.
        let id = entry.id().clone();
        entry.set_insert_time(now_nanos());
        let node = inner.list.push_back(entry);
        inner.lookup.insert(id, node);
    }

    /// Direct access to the insert queue for crate-internal plumbing (the
    /// test harness uses it to insert drain barriers).
    pub(crate) fn enqueue_insert_op(&self, op: InsertOp) -> Result<InsertWait> {
        self.insert_queue.insert(op, Instant::now())
    }

    fn insert_series_async_batched(
        &self,
        metadata: SeriesMetadata,
        opts: InsertOpOptions,
    ) -> Result<InsertAsyncResult> {
        let entry = self.new_shard_entry(metadata);
        let copied_id = entry.id().clone();
        let wait = self.insert_queue.insert(
            InsertOp {
                entry: entry.clone(),
                opts,
            },
            Instant::now(),
        )?;
        Ok(InsertAsyncResult {
            wait,
            copied_id,
            entry,
        })
    }

    /// Synchronously installs an entry, used by loads that must not wait on
    /// the queue. The refcount is incremented while the write lock is held
    /// so the new entry cannot be purged before the caller uses it.
    fn insert_series_sync(
        &self,
        metadata: SeriesMetadata,
        pending_index: Option<PendingIndex>,
    ) -> Result<Arc<Entry>> {
        // Build outside the write lock to keep the critical section short.
        let new_entry = self.new_shard_entry(metadata);

        let (entry, newly_inserted) = {
            let mut inner = self.write_lock();
            match self.lookup_entry_with_lock(&inner, new_entry.id()) {
                Ok(existing) => {
                    existing.increment_reader_writer_count();
                    (existing, false)
                }
                Err(ShardError::EntryNotFound) => {
                    new_entry.increment_reader_writer_count();
                    self.insert_new_shard_entry_with_lock(&mut inner, new_entry.clone());
                    (new_entry, true)
                }
                Err(err) => return Err(err),
            }
        };

        if newly_inserted {
            if let Some(pending) = pending_index {
                if let Some(index) = &self.collab.reverse_index {
                    // Reserve the index slot now so concurrent writers do not
                    // enqueue duplicates before the queue drains.
                    entry.on_index_prepare(index.block_start_for_write_time(pending.timestamp));
                }
                if let Err(err) = self.insert_queue.insert(
                    InsertOp {
                        entry: entry.clone(),
                        opts: InsertOpOptions {
                            skip_rate_limit: true,
                            pending_index: Some(pending),
                            ..Default::default()
                        },
                    },
                    Instant::now(),
                ) {
                    entry.decrement_reader_writer_count();
                    return Err(err);
                }
            }
        }

        Ok(entry)
    }

    /// Retrieves the entry for an id, admitting it through the insert queue
    /// if missing. Returns with the reader/writer count incremented.
    fn writable_series(&self, metadata: &SeriesMetadata) -> Result<Arc<Entry>> {
        loop {
            let (entry, _) = self.try_retrieve_writable_series(&metadata.id)?;
            if let Some(entry) = entry {
                return Ok(entry);
            }
            let result =
                self.insert_series_async_batched(metadata.clone(), InsertOpOptions::default())?;
            result.wait.wait()?;
        }
    }

    /// Enqueues an indexing-only insert for an existing entry.
    fn insert_series_for_indexing_async_batched(
        &self,
        entry: &Arc<Entry>,
        timestamp: Timestamp,
    ) -> Result<()> {
        let index = match &self.collab.reverse_index {
            Some(index) => index,
            None => return Ok(()),
        };
        let index_block_start = index.block_start_for_write_time(timestamp);
        entry.on_index_prepare(index_block_start);
        entry.increment_reader_writer_count();
        let result = self.insert_queue.insert(
            InsertOp {
                entry: entry.clone(),
                opts: InsertOpOptions {
                    // Just indexing; not considered for new-series rate
                    // limiting.
                    skip_rate_limit: true,
                    pending_index: Some(PendingIndex {
                        timestamp,
                        enqueued_at: now_nanos(),
                    }),
                    release_entry_ref: true,
                    ..Default::default()
                },
            },
            Instant::now(),
        );
        if let Err(err) = result {
            entry.decrement_reader_writer_count();
            entry.on_index_finalize(index_block_start);
            return Err(err);
        }
        Ok(())
    }

    // --- batch handler (runs on the insert queue's drain thread) ---

    pub(crate) fn insert_series_batch(&self, mut ops: Vec<InsertOp>) -> Result<()> {
        let mut any_pending_action = false;

        {
            let mut inner = self.write_lock();
            if inner.state != ShardState::Open {
                shard_metrics::record_insert_async_error(
                    shard_metrics::INSERT_ERROR_KIND_INSERT,
                    ops.len() as u64,
                );
                return Err(ShardError::ShardNotOpen);
            }

            for op in ops.iter_mut() {
                let has_pending_action = op.has_pending_action();
                any_pending_action = any_pending_action || has_pending_action;

                if op.opts.release_entry_ref {
                    // The producer handed us a writable entry with a ref
                    // already held.
                    continue;
                }

                let id = op.entry.id().clone();
                let mut already_inserted = false;
                match inner.lookup.get(&id).and_then(|node| inner.list.entry(node)) {
                    Some(existing) => {
                        // A racing insert won; repoint at the entry that is
                        // actually in the shard and discard the tentative one.
                        op.entry = existing.clone();
                        already_inserted = true;
                    }
                    None => {}
                }

                if has_pending_action {
                    // Ensure the pending action is visible before we release
                    // the write lock, so a concurrent tick cannot purge the
                    // entry as empty.
                    op.entry.increment_reader_writer_count();
                    op.opts.release_entry_ref = true;
                }

                if !already_inserted {
                    self.insert_new_shard_entry_with_lock(&mut inner, op.entry.clone());
                }
            }
        }

        if !any_pending_action {
            return Ok(());
        }

        // Pending writes, index inserts and retrieved-block hydrates all run
        // outside the lock; index inserts are submitted as one batch.
        let mut index_batch: Vec<IndexWriteBatchEntry> = Vec::new();
        for op in ops.iter() {
            let mut entry_ref_released = false;

            if let Some(write) = &op.opts.pending_write {
                let write_result = op.entry.series().write(
                    write.timestamp,
                    write.value,
                    write.unit,
                    write.annotation.as_deref(),
                    WriteType::WarmWrite,
                );
                if let Err(err) = write_result {
                    if err.is_invalid_params() {
                        shard_metrics::record_insert_async_error(
                            shard_metrics::INSERT_ERROR_KIND_WRITE_INVALID_PARAMS,
                            1,
                        );
                    } else {
                        shard_metrics::record_insert_async_error(
                            shard_metrics::INSERT_ERROR_KIND_WRITE_INTERNAL,
                            1,
                        );
                        error!(error = %err, "error with async insert write");
                    }
                }
                // The annotation clone is dropped with the op, releasing the
                // pooled buffer now that the series has copied what it needs.
            }

            if let Some(pending) = &op.opts.pending_index {
                if let Some(index) = &self.collab.reverse_index {
                    let index_block_start = index.block_start_for_write_time(pending.timestamp);
                    // A racing op may have indexed this entry for the block
                    // between enqueue and drain; mark success and drop this
                    // op's reference in one step instead of re-indexing.
                    if op.opts.release_entry_ref
                        && op
                            .entry
                            .if_already_indexed_mark_indexed_successfully(index_block_start)
                    {
                        entry_ref_released = true;
                    } else {
                        op.entry.on_index_prepare(index_block_start);
                        index_batch.push(IndexWriteBatchEntry {
                            entry: op.entry.clone(),
                            timestamp: pending.timestamp,
                            enqueued_at: pending.enqueued_at,
                        });
                    }
                }
            }

            if let Some(block) = &op.opts.pending_retrieved_block {
                op.entry
                    .series()
                    .on_retrieve_block(&block.id, block.start, block.segment.clone());
            }

            if op.opts.release_entry_ref && !entry_ref_released {
                op.entry.decrement_reader_writer_count();
            }
        }

        if !index_batch.is_empty() {
            if let Some(index) = &self.collab.reverse_index {
                let n = index_batch.len() as u64;
                if let Err(err) = index.write_batch(index_batch) {
                    shard_metrics::record_insert_async_error(
                        shard_metrics::INSERT_ERROR_KIND_INDEX,
                        n,
                    );
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    // --- write path ---

    /// Writes one datapoint to an untagged series.
    pub fn write(
        &self,
        id: SeriesId,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<SeriesWrite> {
        self.write_and_index(
            SeriesMetadata::untagged(id),
            timestamp,
            value,
            unit,
            annotation,
            false,
        )
    }

    /// Writes one datapoint and ensures the series is visible in the reverse
    /// index for the write's index block.
    pub fn write_tagged(
        &self,
        metadata: SeriesMetadata,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<SeriesWrite> {
        self.write_and_index(metadata, timestamp, value, unit, annotation, true)
    }

    fn write_and_index(
        &self,
        metadata: SeriesMetadata,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        should_index: bool,
    ) -> Result<SeriesWrite> {
        let (mut entry, write_new_series_async) =
            self.try_retrieve_writable_series(&metadata.id)?;
        let mut should_index = should_index;

        if entry.is_none() && !write_new_series_async {
            // Synchronous new-series admission: enqueue the insert (with the
            // index piggybacked so it is not lost), wait for the batch, then
            // write against the installed entry.
            let pending_index = should_index.then(|| PendingIndex {
                timestamp,
                enqueued_at: now_nanos(),
            });
            let result = self.insert_series_async_batched(
                metadata.clone(),
                InsertOpOptions {
                    pending_index,
                    ..Default::default()
                },
            )?;
            result.wait.wait()?;
            entry = Some(self.writable_series(&metadata)?);
            // Indexing was piggybacked on the insert.
            should_index = false;
        }

        match entry {
            Some(entry) => {
                // No need to clone the annotation: the write is synchronous
                // and everything downstream copies what it keeps.
                let write_result =
                    entry
                        .series()
                        .write(timestamp, value, unit, annotation, WriteType::WarmWrite);
                let id = entry.id().clone();
                let unique_index = entry.unique_index();

                let was_written = match write_result {
                    Ok(was_written) => was_written,
                    Err(err) => {
                        entry.decrement_reader_writer_count();
                        return Err(err);
                    }
                };

                let mut needs_index = false;
                if should_index {
                    if let Some(index) = &self.collab.reverse_index {
                        if entry.needs_index_update(index.block_start_for_write_time(timestamp)) {
                            if !write_new_series_async {
                                entry.decrement_reader_writer_count();
                                return Err(ShardError::invalid_params(
                                    "to index async requires write new series async enabled",
                                ));
                            }
                            needs_index = true;
                            let index_result =
                                self.insert_series_for_indexing_async_batched(&entry, timestamp);
                            if let Err(err) = index_result {
                                entry.decrement_reader_writer_count();
                                return Err(err);
                            }
                        }
                    }
                }
                entry.decrement_reader_writer_count();
                Ok(SeriesWrite {
                    id,
                    unique_index,
                    was_written,
                    needs_index,
                })
            }
            None => {
                // Asynchronous admission: the annotation's lifetime is tied
                // to the caller's request, so transfer a refcounted clone to
                // the queue.
                if should_index && !write_new_series_async {
                    return Err(ShardError::invalid_params(
                        "to index async requires write new series async enabled",
                    ));
                }
                let annotation_clone = annotation.map(Bytes::copy_from_slice);
                let pending_index = should_index.then(|| PendingIndex {
                    timestamp,
                    enqueued_at: now_nanos(),
                });
                let result = self.insert_series_async_batched(
                    metadata,
                    InsertOpOptions {
                        pending_write: Some(PendingWrite {
                            timestamp,
                            value,
                            unit,
                            annotation: annotation_clone,
                        }),
                        pending_index,
                        ..Default::default()
                    },
                )?;

                // The true outcome is unknown until the queue drains; report
                // written so the commit log errs on the side of recording.
                Ok(SeriesWrite {
                    id: result.copied_id,
                    unique_index: result.entry.unique_index(),
                    was_written: true,
                    needs_index: should_index,
                })
            }
        }
    }

    // --- read path ---

    pub fn read_encoded(
        &self,
        id: &[u8],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BlockReader>> {
        match self.retrieve_for_read(id)? {
            Some(entry) => {
                let result = entry.series().read_encoded(start, end);
                entry.decrement_reader_writer_count();
                result
            }
            None => match self.config.series_cache_policy {
                // Absence is authoritative when everything is cached.
                SeriesCachePolicy::CacheAll => Ok(Vec::new()),
                SeriesCachePolicy::CacheRecentlyRead => self.read_from_retriever(id, start, end),
            },
        }
    }

    fn read_from_retriever(
        &self,
        id: &[u8],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BlockReader>> {
        let retriever = match &self.collab.block_retriever {
            Some(retriever) => retriever,
            None => return Ok(Vec::new()),
        };
        let id = Bytes::copy_from_slice(id);
        let block_size = self.config.retention.block_size.as_nanos() as i64;
        let mut readers = Vec::new();
        let mut block_start = self.config.retention.block_start(start);
        while block_start < end {
            if let Some(reader) = retriever.stream(self.config.shard_id, &id, block_start)? {
                readers.push(reader);
            }
            block_start += block_size;
        }
        Ok(readers)
    }

    pub fn fetch_blocks(
        &self,
        id: &[u8],
        starts: &[Timestamp],
    ) -> Result<Vec<FetchBlockResult>> {
        match self.retrieve_for_read(id)? {
            Some(entry) => {
                let result = entry.series().fetch_blocks(starts);
                entry.decrement_reader_writer_count();
                result
            }
            None => match self.config.series_cache_policy {
                SeriesCachePolicy::CacheAll => Ok(Vec::new()),
                SeriesCachePolicy::CacheRecentlyRead => {
                    let retriever = match &self.collab.block_retriever {
                        Some(retriever) => retriever,
                        None => return Ok(Vec::new()),
                    };
                    let id = Bytes::copy_from_slice(id);
                    let mut results = Vec::new();
                    for &start in starts {
                        if let Some(reader) =
                            retriever.stream(self.config.shard_id, &id, start)?
                        {
                            results.push(FetchBlockResult {
                                start,
                                segments: vec![reader.segment],
                            });
                        }
                    }
                    Ok(results)
                }
            },
        }
    }

    pub fn fetch_blocks_for_cold_flush(
        &self,
        id: &[u8],
        start: Timestamp,
        version: i32,
    ) -> Result<FetchBlockResult> {
        let entry = {
            let inner = self.read_lock();
            self.lookup_entry_with_lock(&inner, id)?
        };
        entry.series().fetch_blocks_for_cold_flush(start, version)
    }

    // --- retrieved-block and wired-list callbacks ---

    /// Installs a block loaded from disk into the owning series, admitting
    /// the series first if it has been purged since the read began.
    pub fn on_retrieve_block(
        &self,
        metadata: SeriesMetadata,
        start: Timestamp,
        segment: Bytes,
    ) {
        let existing = {
            let inner = self.read_lock();
            match self.lookup_entry_with_lock(&inner, &metadata.id) {
                Ok(entry) => {
                    entry.increment_reader_writer_count();
                    Some(entry)
                }
                Err(ShardError::EntryNotFound) => None,
                // Likely closing.
                Err(_) => return,
            }
        };

        if let Some(entry) = existing {
            entry.series().on_retrieve_block(&metadata.id, start, segment);
            entry.decrement_reader_writer_count();
            return;
        }

        // No need to request indexing: the series was indexed when written.
        let id = metadata.id.clone();
        let entry = self.new_shard_entry(metadata);
        let insert_result = self.insert_queue.insert(
            InsertOp {
                entry,
                opts: InsertOpOptions {
                    // Cache hydration is not a new-series admission.
                    skip_rate_limit: true,
                    pending_retrieved_block: Some(PendingRetrievedBlock { id, start, segment }),
                    ..Default::default()
                },
            },
            Instant::now(),
        );
        if let Err(err) = insert_result {
            debug!(error = %err, "dropping retrieved block, insert queue unavailable");
        }
    }

    /// The wired list may hold callbacks for series already purged when
    /// their blocks fell out of retention; a missing entry is a no-op.
    pub fn on_evicted_from_wired_list(&self, id: &[u8], block_start: Timestamp) {
        let entry = {
            let inner = self.read_lock();
            match self.lookup_entry_with_lock(&inner, id) {
                Ok(entry) => {
                    entry.increment_reader_writer_count();
                    entry
                }
                Err(_) => return,
            }
        };
        entry.series().on_evicted_from_wired_list(&Bytes::copy_from_slice(id), block_start);
        entry.decrement_reader_writer_count();
    }

    // --- batched list iteration ---

    /// Visits every entry in insertion order, in batches sized
    /// `max(16, ceil(0.01 * len))`, without holding the shard lock across
    /// the callback. Batch entries carry a reference count for the duration
    /// of the callback, and one extra reference pins the next cursor
    /// position across the unlocked gap.
    pub(crate) fn for_each_entry_batch(
        &self,
        mut batch_fn: impl FnMut(&[Arc<Entry>]) -> bool,
    ) {
        let batch_size = {
            let inner = self.read_lock();
            iterate_batch_size(inner.list.len())
        };

        let mut batch: Vec<Arc<Entry>> = Vec::with_capacity(batch_size);
        let mut first = true;
        let mut cursor: Option<NodeId> = None;

        while cursor.is_some() || first {
            {
                let inner = self.read_lock();
                // Release the reference held across the unlocked gap now
                // that the lock guarantees the cursor cannot move.
                if let Some(node) = cursor {
                    if let Some(entry) = inner.list.entry(node) {
                        entry.decrement_reader_writer_count();
                    }
                }
                if first {
                    cursor = inner.list.front();
                    first = false;
                }

                let mut elem = cursor;
                for _ in 0..batch_size {
                    let node = match elem {
                        Some(node) => node,
                        None => break,
                    };
                    let next = inner.list.next(node);
                    if let Some(entry) = inner.list.entry(node) {
                        entry.increment_reader_writer_count();
                        batch.push(entry.clone());
                    }
                    elem = next;
                }
                cursor = elem;

                // Pin the next position so concurrent purges skip it.
                if let Some(node) = cursor {
                    if let Some(entry) = inner.list.entry(node) {
                        entry.increment_reader_writer_count();
                    }
                }
            }

            let continue_execution = batch_fn(&batch);
            for entry in batch.drain(..) {
                entry.decrement_reader_writer_count();
            }
            if !continue_execution {
                if let Some(node) = cursor {
                    let inner = self.read_lock();
                    if let Some(entry) = inner.list.entry(node) {
                        entry.decrement_reader_writer_count();
                    }
                }
                return;
            }
        }
    }

    /// Single-entry convenience wrapper over the batched iteration.
    pub(crate) fn for_each_entry(&self, mut entry_fn: impl FnMut(&Arc<Entry>) -> bool) {
        self.for_each_entry_batch(|entries| {
            for entry in entries {
                if !entry_fn(entry) {
                    return false;
                }
            }
            true
        });
    }

    // --- block state snapshots ---

    pub(crate) fn warm_status_is_retrievable(&self, status: WarmStatus) -> bool {
        if !status.data_flushed.is_retrievable() {
            return false;
        }
        // Without an index only data flushing is tracked; with one, warm
        // status requires both data and index flushed.
        !self.config.index_enabled || status.index_flushed.is_retrievable()
    }

    /// Snapshot of every block's flush visibility.
    pub fn block_states_snapshot(&self) -> BlockStateSnapshot {
        let inner = self.read_lock();
        self.block_states_snapshot_with_lock(&inner)
    }

    /// Variant for callers already holding the shard lock. The flush-state
    /// lock nests inside the shard lock here and nowhere else, which keeps
    /// the two locks cycle-free.
    pub(crate) fn block_states_snapshot_with_lock(
        &self,
        inner: &ShardInner,
    ) -> BlockStateSnapshot {
        if inner.bootstrap_state != BootstrapState::Bootstrapped {
            return BlockStateSnapshot::not_bootstrapped();
        }
        self.flush_state
            .block_state_snapshot(|status| self.warm_status_is_retrievable(status))
    }

    pub fn flush_state(&self, block_start: Timestamp) -> Result<crate::flush_state::FileOpState> {
        self.flush_state.state(block_start)
    }

    // --- tick ---

    pub fn tick(&self, cancellable: &Cancellable, start_time: Timestamp) -> Result<TickResult> {
        self.flush_state
            .remove_states_before(self.config.retention.flush_time_start(start_time));
        self.tick_and_expire(cancellable, TickPolicy::Regular)
    }

    pub(crate) fn tick_and_expire(
        &self,
        cancellable: &Cancellable,
        policy: TickPolicy,
    ) -> Result<TickResult> {
        let (tick_batch_size, tick_per_series_sleep, block_states) = {
            let mut inner = self.write_lock();
            // Only one tick may run at a time.
            if inner.ticking {
                return Err(ShardError::AlreadyTicking);
            }
            // Bail out early when closing, unless this is the final tick
            // issued during close, which must run to release resources.
            if policy != TickPolicy::CloseShard && inner.state == ShardState::Closing {
                return Err(ShardError::ClosingTickTerminated);
            }
            inner.ticking = true;
            self.tick_wait.add();
            let batch = inner.runtime.tick_series_batch_size.max(1);
            let sleep = inner.runtime.tick_per_series_sleep;
            let states = self.block_states_snapshot_with_lock(&inner);
            (batch, sleep, states)
        };

        struct TickingGuard<'a>(&'a Shard);
        impl Drop for TickingGuard<'_> {
            fn drop(&mut self) {
                self.0.write_lock().ticking = false;
                self.0.tick_wait.done();
                shard_metrics::record_series_ticked(0);
            }
        }
        let _guard = TickingGuard(self);

        let mut result = TickResult::default();
        let mut terminated_due_to_closing = false;
        let mut i: u64 = 0;
        let mut expired: Vec<Arc<Entry>> = Vec::new();

        self.for_each_entry_batch(|entries| {
            expired.clear();
            for entry in entries {
                if i > 0 && i % tick_batch_size as u64 == 0 {
                    // Cancellation is polled per pacing batch, not per
                    // series, to keep the fast path cheap.
                    if cancellable.is_cancelled() {
                        return false;
                    }
                    if policy != TickPolicy::CloseShard && self.is_closing() {
                        terminated_due_to_closing = true;
                        return false;
                    }
                    shard_metrics::record_series_ticked(i);
                    thread::sleep(tick_per_series_sleep * tick_batch_size as u32);
                }

                let tick_outcome = match policy {
                    TickPolicy::Regular => entry.series().tick(&block_states),
                    TickPolicy::CloseShard => Ok(SeriesTickResult {
                        all_expired: true,
                        ..Default::default()
                    }),
                };
                match tick_outcome {
                    Ok(outcome) if outcome.all_expired => {
                        expired.push(entry.clone());
                        result.expired_series += 1;
                        result.active_blocks += outcome.active_blocks;
                        result.wired_blocks += outcome.wired_blocks;
                    }
                    Ok(outcome) => {
                        result.active_series += 1;
                        result.active_blocks += outcome.active_blocks;
                        result.wired_blocks += outcome.wired_blocks;
                        result.unwired_blocks += outcome.unwired_blocks;
                        result.made_expired_blocks += outcome.made_expired_blocks;
                        result.made_unwired_blocks += outcome.made_unwired_blocks;
                        result.merged_out_of_order_blocks += outcome.merged_out_of_order_blocks;
                        result.evicted_buckets += outcome.evicted_buckets;
                    }
                    Err(_) => {
                        result.active_series += 1;
                        result.errors += 1;
                    }
                }
                i += 1;
            }

            if !expired.is_empty() {
                result.purged_series += self.purge_expired_series(&expired);
                expired.clear();
            }
            true
        });

        if terminated_due_to_closing {
            debug!("returning empty tick result due to closing");
            return Err(ShardError::ClosingTickTerminated);
        }

        Ok(result)
    }

    /// Purges expired entries under the write lock. Every entry passed in
    /// carries at least the iteration's reference, so a count below one is
    /// an invariant violation: it is reported and the entry skipped.
    fn purge_expired_series(&self, expired: &[Arc<Entry>]) -> u64 {
        let mut purged = 0;
        let mut inner = self.write_lock();
        for entry in expired {
            // Only purge series the index has GC'd, so index eviction and
            // memory eviction stay ordered.
            if self.config.index_enabled && !entry.index_garbage_collected() {
                continue;
            }

            let node = match inner.lookup.get(entry.id()) {
                Some(node) => node,
                None => continue,
            };
            match inner.list.entry(node) {
                Some(current) if Arc::ptr_eq(current, entry) => {}
                _ => continue,
            }

            let count = entry.reader_writer_count();
            if count < 1 {
                shard_metrics::record_purge_unexpected_ref_count();
                let series_label = String::from_utf8_lossy(entry.id()).into_owned();
                error!(
                    namespace = %self.config.namespace,
                    shard = self.config.shard_id,
                    series = %series_label,
                    reader_writer_count = count,
                    "purge encountered invalid series read/write count"
                );
                self.events.on_event(ShardEvent::PurgeRefCountViolation {
                    series: series_label,
                    count,
                });
                continue;
            }
            // Someone is reading or writing; keep the entry for a consistent
            // view.
            if count > 1 {
                continue;
            }
            // Datapoints arrived since the last empty check.
            if !entry.series().is_empty() {
                continue;
            }

            entry.series().close();
            let id = entry.id().clone();
            inner.list.remove(node);
            inner.lookup.remove(&id);
            purged += 1;
        }
        drop(inner);
        debug!(purged, "purged expired series");
        purged
    }

    // --- bootstrap and loads ---

    /// Reconstructs flush states from the info files on disk. Idempotent;
    /// must run before series load blocks so warm-flush checks see disk
    /// truth.
    pub fn prepare_bootstrap(&self) -> Result<()> {
        if self.flush_state.initialized() {
            return Ok(());
        }
        self.update_flush_states();
        self.flush_state.set_initialized();
        Ok(())
    }

    pub(crate) fn update_flush_states(&self) {
        let results = fileset::read_info_files(&self.config.data_dir);
        for result in results {
            let info = match result.info {
                Ok(info) => info,
                Err(err) => {
                    error!(
                        shard = self.config.shard_id,
                        namespace = %self.config.namespace,
                        filepath = %result.path.display(),
                        error = %err,
                        "unable to read info files in shard bootstrap"
                    );
                    continue;
                }
            };
            // Snapshot filesets do not participate in flush state.
            if info.snapshot_time.is_some() {
                continue;
            }
            let at = info.block_start;
            let current = self.flush_state.state_no_init_check(at);
            if !current.warm_status.data_flushed.is_retrievable() {
                self.flush_state.mark_warm_data_flush_success(at);
            }

            // The 1:1 mapping between volume number and cold version must be
            // rebuilt so versions keep increasing monotonically. There can
            // be several info files per block if compacted filesets were not
            // cleaned up before shutdown.
            if current.cold_version_retrievable < info.volume_index {
                self.flush_state
                    .set_cold_version_retrievable(at, info.volume_index);
                self.flush_state
                    .set_cold_version_flushed(at, info.volume_index);
            }
        }

        if !self.config.index_enabled {
            return;
        }
        let index = match &self.collab.reverse_index {
            Some(index) => index,
            None => return,
        };

        let block_size = self.config.retention.block_size.as_nanos() as i64;
        let index_block_size = self.config.retention.index_block_size.as_nanos() as i64;
        for index_block_start in index.warm_flush_block_starts() {
            // The index block is wider than the data block: mark every data
            // block start inside it.
            let block_end = index_block_start + index_block_size;
            let mut at = index_block_start;
            while at < block_end {
                let current = self.flush_state.state_no_init_check(at);
                if !current.warm_status.index_flushed.is_retrievable() {
                    self.flush_state.mark_warm_index_flush_success(at);
                }
                at += block_size;
            }
        }
    }

    /// Transitions the shard to bootstrapped, moving per-series bootstrap
    /// buffers into queryable position and warming the block retriever's
    /// seeker indices.
    pub fn bootstrap(&self) -> Result<()> {
        {
            let mut inner = self.write_lock();
            match inner.bootstrap_state {
                BootstrapState::Bootstrapped => return Err(ShardError::AlreadyBootstrapped),
                BootstrapState::Bootstrapping => return Err(ShardError::Bootstrapping),
                BootstrapState::NotBootstrapped => {
                    inner.bootstrap_state = BootstrapState::Bootstrapping;
                }
            }
        }

        let mut multi = MultiError::new();

        if let Err(err) = self.prepare_bootstrap() {
            multi.add(err);
        }

        // Seeker caching can only happen once flush states are known,
        // otherwise lease verification would reject every open.
        if let Err(err) = self.cache_shard_indices() {
            multi.add(err);
        }

        self.for_each_entry(|entry| {
            if let Err(err) = entry.series().bootstrap() {
                multi.add(err);
            }
            true
        });

        self.write_lock().bootstrap_state = BootstrapState::Bootstrapped;
        multi.final_result()
    }

    fn cache_shard_indices(&self) -> Result<()> {
        let retriever = match &self.collab.block_retriever {
            Some(retriever) => retriever,
            None => return Ok(()),
        };
        debug!(shard = self.config.shard_id, "caching shard indices");
        if let Err(err) = retriever.cache_shard_indices(&[self.config.shard_id]) {
            error!(shard = self.config.shard_id, error = %err, "caching shard indices error");
            return Err(err);
        }
        debug!(
            shard = self.config.shard_id,
            "caching shard indices completed successfully"
        );
        Ok(())
    }

    /// Loads blocks produced by a bootstrap or repair source into their
    /// series. Loads always target the cold buffer: they run concurrently
    /// with live writes and flushes, and the cold path is the only one
    /// guaranteed to reconcile with on-disk data.
    pub fn load_blocks(
        &self,
        blocks: Vec<(SeriesMetadata, Vec<BlockData>)>,
    ) -> Result<()> {
        {
            let inner = self.read_lock();
            // Flush states must be known before a load so warm-flush checks
            // are meaningful.
            if inner.bootstrap_state != BootstrapState::Bootstrapped {
                return Err(ShardError::NotBootstrapped);
            }
        }

        let estimated_size: u64 = blocks
            .iter()
            .flat_map(|(_, series_blocks)| series_blocks.iter())
            .map(BlockData::estimated_size)
            .sum();
        if !self.mem_tracker.inc_num_loaded_bytes(estimated_size) {
            return Err(ShardError::LoadLimitHit);
        }

        let mut multi = MultiError::new();
        for (metadata, series_blocks) in blocks {
            for block in series_blocks {
                if let Err(err) = self.load_block(&metadata, block) {
                    multi.add(err);
                }
            }
        }
        multi.final_result()
    }

    fn load_block(&self, metadata: &SeriesMetadata, block: BlockData) -> Result<()> {
        let timestamp = block.start;
        let (existing, _) = self.try_retrieve_writable_series(&metadata.id)?;
        let (entry, was_existing) = match existing {
            Some(entry) => (entry, true),
            None => {
                // Insert synchronously so the load does not stall behind the
                // queue; the refcount is taken under the insert lock.
                let pending_index = self.config.index_enabled.then(|| PendingIndex {
                    timestamp,
                    enqueued_at: now_nanos(),
                });
                (self.insert_series_sync(metadata.clone(), pending_index)?, false)
            }
        };

        let result = (|| {
            entry.series().load_block(block, WriteType::ColdWrite)?;

            if was_existing && self.config.index_enabled {
                if let Some(index) = &self.collab.reverse_index {
                    if entry.needs_index_update(index.block_start_for_write_time(timestamp)) {
                        self.insert_series_for_indexing_async_batched(&entry, timestamp)?;
                    }
                }
            }
            Ok(())
        })();

        entry.decrement_reader_writer_count();
        result
    }

    // --- resolver ---

    /// Returns a lazy handle to a writable series, admitting it if missing.
    pub fn series_ref_resolver(
        &self,
        metadata: SeriesMetadata,
    ) -> Result<SeriesRefResolver<'_>> {
        let (existing, _) = self.try_retrieve_writable_series(&metadata.id)?;
        if let Some(entry) = existing {
            // The reader/writer ref is already incremented.
            return Ok(SeriesRefResolver {
                shard: self,
                state: Mutex::new(ResolverState {
                    entry,
                    wait: None,
                    released: false,
                }),
            });
        }

        let entry = self.new_shard_entry(metadata);
        // Hold a ref so the new entry cannot expire while it waits in the
        // queue. This exact entry may lose the insert race; the resolver is
        // responsible for releasing whichever entry it ends up holding.
        entry.increment_reader_writer_count();
        let wait = self.insert_queue.insert(
            InsertOp {
                entry: entry.clone(),
                opts: InsertOpOptions {
                    // Used by bootstrapping; not rate limited.
                    skip_rate_limit: true,
                    ..Default::default()
                },
            },
            Instant::now(),
        );
        let wait = match wait {
            Ok(wait) => wait,
            Err(err) => {
                entry.decrement_reader_writer_count();
                return Err(err);
            }
        };

        Ok(SeriesRefResolver {
            shard: self,
            state: Mutex::new(ResolverState {
                entry,
                wait: Some(wait),
                released: false,
            }),
        })
    }

    // --- close ---

    /// Closes the shard: refuses further operations, stops the insert
    /// queue, waits for in-flight ticks, then runs the final close-tick that
    /// expires every series and releases resources.
    pub fn close(&self) -> Result<()> {
        {
            let mut inner = self.write_lock();
            if inner.state != ShardState::Open {
                return Err(ShardError::ShardNotOpen);
            }
            inner.state = ShardState::Closing;
        }

        self.events.on_event(ShardEvent::InsertQueueStopping);
        self.insert_queue.stop();

        let started = Instant::now();

        // Wait for any running tick; setting the state to Closing above
        // makes its cancellation poll terminate early.
        self.tick_wait.wait();

        let cancellable = Cancellable::new();
        let result = self
            .tick_and_expire(&cancellable, TickPolicy::CloseShard)
            .map(|_| ());
        shard_metrics::record_shard_close(started.elapsed());
        result
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        // A closed shard already stopped the queue; this is the backstop for
        // shards dropped without a close, so the drain thread never leaks.
        self.insert_queue.stop();
    }
}

struct ResolverState {
    entry: Arc<Entry>,
    wait: Option<InsertWait>,
    released: bool,
}

/// Lazy handle to a series admitted through the insert queue. The
/// underlying reference is dropped by [`SeriesRefResolver::release_ref`], or
/// on drop as a backstop.
pub struct SeriesRefResolver<'a> {
    shard: &'a Shard,
    state: Mutex<ResolverState>,
}

impl SeriesRefResolver<'_> {
    /// The resolved entry, waiting for the insert to drain on first call.
    pub fn series_ref(&self) -> Result<Arc<Entry>> {
        let mut state = self.state.lock().expect("resolver lock");
        if let Some(wait) = state.wait.take() {
            wait.wait()?;
            // The tentative entry may have lost the race; resolve whatever
            // is in the shard now, swapping the held reference over.
            let (resolved, _) = self.shard.try_retrieve_writable_series(state.entry.id())?;
            let resolved = resolved.ok_or_else(|| {
                ShardError::internal("series missing after insert queue drain")
            })?;
            state.entry.decrement_reader_writer_count();
            state.entry = resolved;
        }
        Ok(state.entry.clone())
    }

    /// Releases the held reference.
    pub fn release_ref(&self) {
        let mut state = self.state.lock().expect("resolver lock");
        if !state.released {
            state.entry.decrement_reader_writer_count();
            state.released = true;
        }
    }
}

impl Drop for SeriesRefResolver<'_> {
    fn drop(&mut self) {
        self.release_ref();
    }
}

impl Shard {
    /// Latest volume on disk for a block start, per the reader manager.
    pub fn latest_volume(&self, block_start: Timestamp) -> Result<i32> {
        self.collab
            .reader_manager
            .latest_volume(self.config.shard_id, block_start)
    }

    /// Opens a streaming reader over the latest volume of a block.
    pub fn open_streaming_reader(
        &self,
        block_start: Timestamp,
    ) -> Result<Box<dyn StreamingReader>> {
        let latest_volume = self.latest_volume(block_start)?;
        let factory = self
            .collab
            .streaming_readers
            .as_ref()
            .ok_or_else(|| ShardError::invalid_params("no streaming reader factory configured"))?;
        factory.open_reader(self.config.shard_id, block_start, latest_volume)
    }

    /// Delegates a repair run to the provided repairer, scoped to this shard.
    pub fn repair(
        &self,
        start: Timestamp,
        end: Timestamp,
        repairer: &dyn ShardRepairer,
    ) -> Result<RepairResult> {
        repairer.repair(self, start, end)
    }

    /// Aggregates tiles into a new volume and publishes it through the
    /// normal finish-writing sequence, marking warm state successful since
    /// no flush participates in this flow.
    pub fn aggregate_tiles(&self, opts: &AggregateTilesOptions) -> Result<i64> {
        let aggregator = self
            .collab
            .tile_aggregator
            .as_ref()
            .ok_or_else(|| ShardError::invalid_params("no tile aggregator configured"))?;

        let mut multi = MultiError::new();
        let mut processed = 0;
        match aggregator.aggregate_tiles(self.config.shard_id, opts) {
            Ok((count, next_volume)) => {
                processed = count;
                if let Err(err) = self.finish_writing(opts.start, next_volume, true) {
                    multi.add(err);
                }
            }
            // Cannot return yet; the aggregate outcome must be recorded.
            Err(err) => multi.add(err),
        }
        multi.final_result()?;

        debug!(
            shard = self.config.shard_id,
            processed_tiles = processed,
            "finished aggregating tiles"
        );
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, MemSeries};

    fn id(s: &str) -> SeriesId {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn write_then_read_round_trips() {
        let h = harness().build();
        let write = h
            .shard
            .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        assert!(write.was_written);
        assert_eq!(write.unique_index, 1);
        h.drain_inserts();

        let blocks = h.shard.read_encoded(b"cpu", 0, 20).unwrap();
        let points = MemSeries::decode_blocks(&blocks);
        assert_eq!(points, vec![(10, 1.0)]);
        assert_eq!(h.shard.num_series(), 1);
    }

    #[test]
    fn unique_indices_strictly_increase_with_insert_order() {
        let h = harness().build();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let write = h
                .shard
                .write(id(name), 10, 1.0, TimeUnit::Nanoseconds, None)
                .unwrap();
            assert_eq!(write.unique_index, i as u64 + 1);
        }
        h.drain_inserts();
        assert_eq!(h.shard.num_series(), 3);
    }

    #[test]
    fn duplicate_insert_is_a_map_no_op() {
        let h = harness().build();
        h.shard
            .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        h.shard
            .write(id("cpu"), 11, 2.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        h.drain_inserts();
        assert_eq!(h.shard.num_series(), 1);

        let blocks = h.shard.read_encoded(b"cpu", 0, 20).unwrap();
        let points = MemSeries::decode_blocks(&blocks);
        assert_eq!(points, vec![(10, 1.0), (11, 2.0)]);
    }

    #[test]
    fn synchronous_insert_path_writes_through() {
        let h = harness()
            .runtime(ShardRuntimeOptions {
                write_new_series_async: false,
                ..Default::default()
            })
            .build();
        let write = h
            .shard
            .write(id("cpu"), 10, 3.5, TimeUnit::Nanoseconds, None)
            .unwrap();
        assert!(write.was_written);

        // The sync path waits on the queue, so the datapoint is visible
        // without an explicit drain.
        let blocks = h.shard.read_encoded(b"cpu", 0, 20).unwrap();
        assert_eq!(MemSeries::decode_blocks(&blocks), vec![(10, 3.5)]);
    }

    #[test]
    fn read_of_unknown_series_is_empty_under_cache_all() {
        let h = harness().build();
        let blocks = h.shard.read_encoded(b"nope", 0, 100).unwrap();
        assert!(blocks.is_empty());
        assert!(h.shard.fetch_blocks(b"nope", &[0]).unwrap().is_empty());
    }

    #[test]
    fn write_after_close_fails_with_invalid_params() {
        let h = harness().build();
        h.shard.close().unwrap();
        match h
            .shard
            .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        {
            Err(err) => assert!(err.is_invalid_params(), "{:?}", err),
            Ok(_) => panic!("write should fail on closed shard"),
        }
        // Double close errors.
        assert!(matches!(h.shard.close(), Err(ShardError::ShardNotOpen)));
    }

    #[test]
    fn tick_purges_expired_empty_series() {
        let h = harness().build();
        h.shard
            .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        h.drain_inserts();
        assert_eq!(h.shard.num_series(), 1);

        // Mark the series as fully expired; its buffers drain on tick.
        h.factory.series(b"cpu").unwrap().expire_all();

        let result = h.shard.tick(&Cancellable::new(), now_nanos()).unwrap();
        assert_eq!(result.expired_series, 1);
        assert_eq!(result.purged_series, 1);
        assert_eq!(h.shard.num_series(), 0);
    }

    #[test]
    fn tick_skips_purge_while_reader_holds_ref() {
        let h = harness().build();
        h.shard
            .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        h.drain_inserts();
        h.factory.series(b"cpu").unwrap().expire_all();

        let (held, _) = h.shard.try_retrieve_writable_series(b"cpu").unwrap();
        let held = held.unwrap();

        let result = h.shard.tick(&Cancellable::new(), now_nanos()).unwrap();
        assert_eq!(result.expired_series, 1);
        assert_eq!(result.purged_series, 0);
        assert_eq!(h.shard.num_series(), 1);

        held.decrement_reader_writer_count();
        let result = h.shard.tick(&Cancellable::new(), now_nanos()).unwrap();
        assert_eq!(result.purged_series, 1);
        assert_eq!(h.shard.num_series(), 0);
    }

    #[test]
    fn concurrent_tick_is_rejected() {
        let h = harness().build();
        {
            h.shard.write_lock().ticking = true;
        }
        assert!(matches!(
            h.shard.tick(&Cancellable::new(), now_nanos()),
            Err(ShardError::AlreadyTicking)
        ));
        {
            h.shard.write_lock().ticking = false;
        }
        h.shard.tick(&Cancellable::new(), now_nanos()).unwrap();
    }

    #[test]
    fn cancelled_tick_returns_partial_result_and_can_rerun() {
        let h = harness()
            .runtime(ShardRuntimeOptions {
                write_new_series_async: true,
                tick_series_batch_size: 4,
                tick_per_series_sleep: Duration::from_millis(1),
            })
            .build();
        for i in 0..10 {
            h.shard
                .write(
                    id(&format!("series-{}", i)),
                    10,
                    1.0,
                    TimeUnit::Nanoseconds,
                    None,
                )
                .unwrap();
        }
        h.drain_inserts();

        let cancellable = Cancellable::new();
        let cancel_clone = cancellable.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            cancel_clone.cancel();
        });

        let result = h.shard.tick(&cancellable, now_nanos()).unwrap();
        canceller.join().unwrap();
        assert!(result.active_series + result.expired_series <= 10);

        // A fresh tick completes normally.
        let result = h.shard.tick(&Cancellable::new(), now_nanos()).unwrap();
        assert_eq!(result.active_series + result.expired_series, 10);
    }

    #[test]
    fn close_runs_final_tick_and_releases_series() {
        let h = harness().build();
        for name in ["a", "b"] {
            h.shard
                .write(id(name), 10, 1.0, TimeUnit::Nanoseconds, None)
                .unwrap();
        }
        h.drain_inserts();
        assert_eq!(h.shard.num_series(), 2);
        for name in [b"a".as_ref(), b"b".as_ref()] {
            h.factory.series(name).unwrap().expire_all();
        }

        h.shard.close().unwrap();
        // The close-tick treats everything as expired and purges it.
        assert_eq!(h.shard.num_series(), 0);
        assert!(h.factory.series(b"a").unwrap().closed());
    }

    #[test]
    fn bootstrap_transitions_and_rejects_duplicates() {
        let h = harness().needs_bootstrap(true).build();
        assert!(!h.shard.is_bootstrapped());
        assert_eq!(h.shard.bootstrap_state(), BootstrapState::NotBootstrapped);

        h.shard.prepare_bootstrap().unwrap();
        h.shard.bootstrap().unwrap();
        assert!(h.shard.is_bootstrapped());

        assert!(matches!(
            h.shard.bootstrap(),
            Err(ShardError::AlreadyBootstrapped)
        ));
    }

    #[test]
    fn load_blocks_respects_budget() {
        let h = harness().load_limit(Some(8)).build();

        let metadata = SeriesMetadata::untagged(id("cpu"));
        let blocks = vec![(
            metadata,
            vec![BlockData {
                start: 0,
                segment: Bytes::from_static(&[0u8; 16]),
            }],
        )];
        match h.shard.load_blocks(blocks) {
            Err(ShardError::LoadLimitHit) => {}
            other => panic!("expected load limit hit, got {:?}", other),
        }
        // Nothing was admitted.
        assert_eq!(h.shard.num_series(), 0);
    }

    #[test]
    fn load_blocks_inserts_synchronously_as_cold_writes() {
        let h = harness().build();
        let metadata = SeriesMetadata::untagged(id("cpu"));
        h.shard
            .load_blocks(vec![(
                metadata,
                vec![BlockData {
                    start: 0,
                    segment: MemSeries::encode_points(&[(5, 2.5)]),
                }],
            )])
            .unwrap();

        assert_eq!(h.shard.num_series(), 1);
        let series = h.factory.series(b"cpu").unwrap();
        assert_eq!(series.cold_loaded_blocks(), 1);
    }

    #[test]
    fn series_ref_resolver_resolves_and_releases() {
        let h = harness().build();
        let resolver = h
            .shard
            .series_ref_resolver(SeriesMetadata::untagged(id("cpu")))
            .unwrap();
        let entry = resolver.series_ref().unwrap();
        assert!(entry.reader_writer_count() >= 1);
        assert_eq!(h.shard.num_series(), 1);

        resolver.release_ref();
        assert_eq!(entry.reader_writer_count(), 0);

        // Resolving an existing series reuses the entry.
        let resolver2 = h
            .shard
            .series_ref_resolver(SeriesMetadata::untagged(id("cpu")))
            .unwrap();
        let entry2 = resolver2.series_ref().unwrap();
        assert!(Arc::ptr_eq(&entry, &entry2));
    }

    #[test]
    fn doc_ref_returns_live_series_metadata() {
        let h = harness().build();
        assert!(h.shard.doc_ref(b"cpu").unwrap().is_none());
        h.shard
            .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        h.drain_inserts();
        let metadata = h.shard.doc_ref(b"cpu").unwrap().unwrap();
        assert_eq!(metadata.id.as_ref(), b"cpu");
    }

    #[test]
    fn drained_index_op_for_already_indexed_entry_releases_without_reinserting() {
        let h = harness().index_enabled(true).build();
        h.shard
            .write_tagged(
                SeriesMetadata::untagged(id("cpu")),
                10,
                1.0,
                TimeUnit::Nanoseconds,
                None,
            )
            .unwrap();
        h.drain_inserts();
        assert_eq!(h.index.as_ref().unwrap().written().len(), 1);

        // A second index op for the same block was already in flight when
        // the first one landed.
        let (entry, _) = h.shard.try_retrieve_writable_series(b"cpu").unwrap();
        let entry = entry.unwrap();
        let wait = h
            .shard
            .enqueue_insert_op(InsertOp {
                entry: entry.clone(),
                opts: InsertOpOptions {
                    skip_rate_limit: true,
                    pending_index: Some(PendingIndex {
                        timestamp: 10,
                        enqueued_at: now_nanos(),
                    }),
                    release_entry_ref: true,
                    ..Default::default()
                },
            })
            .unwrap();
        wait.wait().unwrap();

        // Not re-indexed, and the op's reference was dropped with the mark.
        assert_eq!(h.index.as_ref().unwrap().written().len(), 1);
        assert_eq!(entry.reader_writer_count(), 0);
    }

    #[test]
    fn throttled_insert_surfaces_to_writer() {
        let h = harness().rate_limit(Some(1)).build();
        h.shard
            .write(id("a"), 10, 1.0, TimeUnit::Nanoseconds, None)
            .unwrap();
        match h.shard.write(id("b"), 10, 1.0, TimeUnit::Nanoseconds, None) {
            Err(ShardError::Throttled) => {}
            other => panic!("expected throttled, got {:?}", other),
        }
    }
}
