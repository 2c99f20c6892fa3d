//! Batching, backpressure-aware insert queue.
//!
//! Many producers enqueue insert operations; a single background drain
//! thread pulls everything currently queued as one batch, hands it to the
//! shard's batch handler, then signals the batch's wait handle. Admitting
//! new series this way keeps producers off the shard write lock: the lock is
//! taken once per batch instead of once per insert.

use crate::entry::Entry;
use crate::error::{Result, ShardError};
use crate::types::{SeriesId, Timestamp, TimeUnit, Value};
use bytes::Bytes;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A deferred datapoint write carried by an insert op. The annotation bytes
/// are cloned into a refcounted buffer by the producer because their
/// original lifetime is tied to the caller's request context; the queue owns
/// the clone until the write completes.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub timestamp: Timestamp,
    pub value: Value,
    pub unit: TimeUnit,
    pub annotation: Option<Bytes>,
}

/// A deferred reverse-index insert carried by an insert op.
#[derive(Debug, Clone, Copy)]
pub struct PendingIndex {
    pub timestamp: Timestamp,
    pub enqueued_at: Timestamp,
}

/// A block retrieved from disk waiting to be installed into the series
/// cache.
#[derive(Debug, Clone)]
pub struct PendingRetrievedBlock {
    pub id: SeriesId,
    pub start: Timestamp,
    pub segment: Bytes,
}

/// Flags and deferred actions attached to one insert op.
#[derive(Debug, Default, Clone)]
pub struct InsertOpOptions {
    /// Retrieval hydrates, indexing-only inserts and bootstrap inserts skip
    /// the new-series rate limit.
    pub skip_rate_limit: bool,
    pub pending_write: Option<PendingWrite>,
    pub pending_index: Option<PendingIndex>,
    pub pending_retrieved_block: Option<PendingRetrievedBlock>,
    /// The producer already holds a reference on the entry; the batch
    /// handler must drop it once the op's actions have run.
    pub release_entry_ref: bool,
}

/// One queued insert: a tentative entry plus any deferred actions. The entry
/// may be discarded in favour of an existing one when the batch handler
/// finds the id already present.
#[derive(Debug)]
pub struct InsertOp {
    pub entry: Arc<Entry>,
    pub opts: InsertOpOptions,
}

impl InsertOp {
    pub fn has_pending_action(&self) -> bool {
        self.opts.pending_write.is_some()
            || self.opts.pending_index.is_some()
            || self.opts.pending_retrieved_block.is_some()
    }
}

/// How the batch containing a producer's op concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    /// The batch was drained through the handler.
    Done,
    /// The queue was stopped before the batch ran.
    Aborted,
}

#[derive(Debug, Default)]
struct WaitState {
    outcome: Option<BatchOutcome>,
}

/// Completion handle for the batch an op was coalesced into. Completes when
/// the batch has been drained (or the queue shut down underneath it).
#[derive(Debug, Clone)]
pub struct InsertWait {
    inner: Arc<(Mutex<WaitState>, Condvar)>,
}

impl InsertWait {
    fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(WaitState::default()), Condvar::new())),
        }
    }

    /// Blocks until the batch has been drained. Returns `QueueClosed` when
    /// the queue was stopped before the batch ran.
    pub fn wait(&self) -> Result<()> {
        let (lock, cv) = &*self.inner;
        let mut state = lock.lock()?;
        while state.outcome.is_none() {
            state = cv.wait(state)?;
        }
        match state.outcome {
            Some(BatchOutcome::Done) => Ok(()),
            _ => Err(ShardError::QueueClosed),
        }
    }

    fn complete(&self, outcome: BatchOutcome) {
        let (lock, cv) = &*self.inner;
        let mut state = lock.lock().expect("insert wait lock");
        state.outcome = Some(outcome);
        cv.notify_all();
    }
}

/// Configuration for the insert queue.
#[derive(Debug, Clone)]
pub struct InsertQueueOptions {
    /// Maximum number of rate-limited (new-series) inserts admitted per
    /// window; `None` disables the limit.
    pub insert_per_interval_limit: Option<u64>,
    /// Width of the rate-limit window.
    pub rate_limit_interval: Duration,
}

impl Default for InsertQueueOptions {
    fn default() -> Self {
        Self {
            insert_per_interval_limit: None,
            rate_limit_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueRunState {
    NotStarted,
    Open,
    Closed,
}

struct QueueInner {
    state: QueueRunState,
    ops: Vec<InsertOp>,
    wait: InsertWait,
    limit: Option<u64>,
    window_start: Instant,
    window_count: u64,
}

/// Handler invoked with each drained batch. Runs on the queue's thread.
pub(crate) type BatchHandler = Box<dyn Fn(Vec<InsertOp>) -> Result<()> + Send + Sync>;

/// The single-consumer, many-producer batching queue.
pub(crate) struct InsertQueue {
    inner: Arc<(Mutex<QueueInner>, Condvar)>,
    rate_limit_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InsertQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertQueue").finish_non_exhaustive()
    }
}

impl InsertQueue {
    pub fn new(opts: InsertQueueOptions) -> Self {
        let inner = QueueInner {
            state: QueueRunState::NotStarted,
            ops: Vec::new(),
            wait: InsertWait::new(),
            limit: opts.insert_per_interval_limit,
            window_start: Instant::now(),
            window_count: 0,
        };
        Self {
            inner: Arc::new((Mutex::new(inner), Condvar::new())),
            rate_limit_interval: opts.rate_limit_interval,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the drain thread. Must be called exactly once before the first
    /// insert.
    pub fn start(&self, handler: BatchHandler) {
        {
            let (lock, _) = &*self.inner;
            let mut inner = lock.lock().expect("insert queue lock");
            assert_eq!(inner.state, QueueRunState::NotStarted, "queue started twice");
            inner.state = QueueRunState::Open;
        }

        let shared = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("skarda-shard-insert".to_string())
            .spawn(move || drain_loop(shared, handler))
            .expect("spawn insert queue thread");
        *self.handle.lock().expect("insert queue handle lock") = Some(handle);
    }

    /// Enqueues one op, returning the wait handle of the batch it joined.
    pub fn insert(&self, op: InsertOp, now: Instant) -> Result<InsertWait> {
        let (lock, cv) = &*self.inner;
        let mut inner = lock.lock()?;
        if inner.state != QueueRunState::Open {
            return Err(ShardError::QueueClosed);
        }

        if !op.opts.skip_rate_limit {
            if let Some(limit) = inner.limit {
                if now.duration_since(inner.window_start) >= self.rate_limit_interval {
                    inner.window_start = now;
                    inner.window_count = 0;
                }
                if inner.window_count >= limit {
                    return Err(ShardError::Throttled);
                }
                inner.window_count += 1;
            }
        }

        inner.ops.push(op);
        let wait = inner.wait.clone();
        cv.notify_one();
        Ok(wait)
    }

    /// Updates the new-series rate limit; takes effect on the next window.
    pub fn set_insert_per_interval_limit(&self, limit: Option<u64>) {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().expect("insert queue lock");
        inner.limit = limit;
    }

    /// Stops the queue: pending ops are drained with an error so producers
    /// unblock, further inserts are refused, and the drain thread is joined.
    pub fn stop(&self) {
        let aborted = {
            let (lock, cv) = &*self.inner;
            let mut inner = lock.lock().expect("insert queue lock");
            if inner.state == QueueRunState::Closed {
                None
            } else {
                inner.state = QueueRunState::Closed;
                let pending = !inner.ops.is_empty();
                inner.ops.clear();
                let wait = std::mem::replace(&mut inner.wait, InsertWait::new());
                cv.notify_all();
                pending.then_some(wait)
            }
        };

        if let Some(wait) = aborted {
            wait.complete(BatchOutcome::Aborted);
        }

        if let Some(handle) = self.handle.lock().expect("insert queue handle lock").take() {
            // Stop may run on the drain thread itself when the last shard
            // handle is dropped by a batch; a thread cannot join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn drain_loop(shared: Arc<(Mutex<QueueInner>, Condvar)>, handler: BatchHandler) {
    debug!("shard insert queue drain thread started");
    loop {
        let (batch, wait) = {
            let (lock, cv) = &*shared;
            let mut inner = lock.lock().expect("insert queue lock");
            while inner.ops.is_empty() && inner.state == QueueRunState::Open {
                inner = cv.wait(inner).expect("insert queue cv");
            }
            if inner.ops.is_empty() {
                // Closed with nothing queued.
                break;
            }
            let batch = std::mem::take(&mut inner.ops);
            let wait = std::mem::replace(&mut inner.wait, InsertWait::new());
            (batch, wait)
        };

        if let Err(err) = handler(batch) {
            // The handler accounts for per-op failures itself; a batch-level
            // error still completes the waiters so producers never hang.
            error!(error = %err, "shard insert queue batch handler failed");
        }
        wait.complete(BatchOutcome::Done);
    }
    debug!("shard insert queue drain thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Series;
    use crate::testing::MemSeries;
    use crate::types::SeriesMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn op(id: &str) -> InsertOp {
        let metadata = SeriesMetadata::untagged(Bytes::copy_from_slice(id.as_bytes()));
        let series: Arc<dyn Series> = Arc::new(MemSeries::new(metadata));
        InsertOp {
            entry: Arc::new(Entry::new(series, 1)),
            opts: InsertOpOptions::default(),
        }
    }

    #[test]
    fn insert_batches_and_signals() {
        let queue = InsertQueue::new(InsertQueueOptions::default());
        let drained = Arc::new(AtomicUsize::new(0));
        let drained_clone = drained.clone();
        queue.start(Box::new(move |batch| {
            drained_clone.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }));

        let w1 = queue.insert(op("a"), Instant::now()).unwrap();
        let w2 = queue.insert(op("b"), Instant::now()).unwrap();
        w1.wait().unwrap();
        w2.wait().unwrap();
        assert!(drained.load(Ordering::SeqCst) >= 2);

        queue.stop();
    }

    #[test]
    fn stop_refuses_new_inserts() {
        let queue = InsertQueue::new(InsertQueueOptions::default());
        queue.start(Box::new(|_| Ok(())));
        queue.stop();

        match queue.insert(op("a"), Instant::now()) {
            Err(ShardError::QueueClosed) => {}
            other => panic!("expected queue closed, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_throttles_new_series_only() {
        let queue = InsertQueue::new(InsertQueueOptions {
            insert_per_interval_limit: Some(2),
            rate_limit_interval: Duration::from_secs(3600),
        });
        queue.start(Box::new(|_| Ok(())));

        let now = Instant::now();
        queue.insert(op("a"), now).unwrap();
        queue.insert(op("b"), now).unwrap();
        match queue.insert(op("c"), now) {
            Err(ShardError::Throttled) => {}
            other => panic!("expected throttled, got {:?}", other),
        }

        // Ops marked skip_rate_limit bypass the window entirely.
        let mut skip = op("d");
        skip.opts.skip_rate_limit = true;
        queue.insert(skip, now).unwrap();

        queue.stop();
    }

    #[test]
    fn rate_limit_window_resets() {
        let queue = InsertQueue::new(InsertQueueOptions {
            insert_per_interval_limit: Some(1),
            rate_limit_interval: Duration::from_nanos(1),
        });
        queue.start(Box::new(|_| Ok(())));

        let start = Instant::now();
        queue.insert(op("a"), start).unwrap();
        // A later window admits inserts again.
        let later = start + Duration::from_millis(10);
        queue.insert(op("b"), later).unwrap();

        queue.stop();
    }

    #[test]
    fn handler_error_still_unblocks_producers() {
        let queue = InsertQueue::new(InsertQueueOptions::default());
        queue.start(Box::new(|_| Err(ShardError::internal("boom"))));

        let wait = queue.insert(op("a"), Instant::now()).unwrap();
        // Batch-level handler errors are logged and counted by the handler;
        // the producer's wait still completes successfully.
        wait.wait().unwrap();
        queue.stop();
    }

    #[test]
    fn stop_aborts_pending_waiters() {
        // Never started: ops queue but nothing drains them.
        let queue = InsertQueue::new(InsertQueueOptions::default());
        {
            let (lock, _) = &*queue.inner;
            lock.lock().unwrap().state = QueueRunState::Open;
        }
        let wait = queue.insert(op("a"), Instant::now()).unwrap();
        queue.stop();
        match wait.wait() {
            Err(ShardError::QueueClosed) => {}
            other => panic!("expected queue closed, got {:?}", other),
        }
    }
}
