//! The refcounted wrapper around one live series on the shard.

use crate::series::Series;
use crate::types::{SeriesId, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Visibility of this entry in the reverse index, per index block start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexBlockState {
    /// An index insert for this block start has been enqueued but not yet
    /// acknowledged by the index.
    InFlight,
    /// The index has acknowledged the insert.
    Indexed,
}

/// One live series on this shard.
///
/// The entry owns the series; everything else holds the entry through the
/// shard map or a temporary reference counted by `reader_writer_count`. The
/// count is the sole safety mechanism against a concurrent tick purging the
/// series out from under a reader or writer: purge only removes an entry
/// whose count is exactly 1 (the map's own implicit reference).
pub struct Entry {
    series: Arc<dyn Series>,
    id: SeriesId,
    unique_index: u64,
    reader_writer_count: AtomicI32,
    insert_time: AtomicI64,
    index_states: Mutex<HashMap<Timestamp, IndexBlockState>>,
    index_garbage_collected: AtomicBool,
}

impl Entry {
    pub fn new(series: Arc<dyn Series>, unique_index: u64) -> Self {
        // The id shares the series metadata's allocation; it outlives the
        // shard map so the map key never needs a copy.
        let id = series.metadata().id.clone();
        Self {
            series,
            id,
            unique_index,
            reader_writer_count: AtomicI32::new(0),
            insert_time: AtomicI64::new(0),
            index_states: Mutex::new(HashMap::new()),
            index_garbage_collected: AtomicBool::new(false),
        }
    }

    pub fn series(&self) -> &Arc<dyn Series> {
        &self.series
    }

    pub fn id(&self) -> &SeriesId {
        &self.id
    }

    /// Stable identifier for the commit log; unique for the shard's lifetime
    /// and strictly increasing with insert order.
    pub fn unique_index(&self) -> u64 {
        self.unique_index
    }

    pub fn increment_reader_writer_count(&self) {
        self.reader_writer_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_reader_writer_count(&self) {
        self.reader_writer_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn reader_writer_count(&self) -> i32 {
        self.reader_writer_count.load(Ordering::Acquire)
    }

    pub fn set_insert_time(&self, at: Timestamp) {
        self.insert_time.store(at, Ordering::Release);
    }

    pub fn insert_time(&self) -> Timestamp {
        self.insert_time.load(Ordering::Acquire)
    }

    /// Whether a write at the given index block start still requires an
    /// index insert. False once an insert is in flight or acknowledged.
    pub fn needs_index_update(&self, index_block_start: Timestamp) -> bool {
        let states = self.index_states.lock().expect("entry index state lock");
        !states.contains_key(&index_block_start)
    }

    /// Marks an index insert for the block start as in flight. Called before
    /// the op is handed to the insert queue so concurrent writers do not
    /// enqueue duplicates.
    pub fn on_index_prepare(&self, index_block_start: Timestamp) {
        let mut states = self.index_states.lock().expect("entry index state lock");
        states.entry(index_block_start).or_insert(IndexBlockState::InFlight);
    }

    /// Acknowledges that the index has accepted the entry for the block start.
    pub fn on_index_success(&self, index_block_start: Timestamp) {
        let mut states = self.index_states.lock().expect("entry index state lock");
        states.insert(index_block_start, IndexBlockState::Indexed);
    }

    /// If the block start is already acknowledged, re-marks it successful
    /// and releases the caller's reader/writer reference in one step,
    /// returning true. Covers the race where indexing completes between an
    /// op being enqueued with a held reference and the queue draining it:
    /// the drain must neither re-index nor leak the reference, and the two
    /// must not be separable by a concurrent purge check.
    pub fn if_already_indexed_mark_indexed_successfully(
        &self,
        index_block_start: Timestamp,
    ) -> bool {
        let mut states = self.index_states.lock().expect("entry index state lock");
        if states.get(&index_block_start) != Some(&IndexBlockState::Indexed) {
            return false;
        }
        states.insert(index_block_start, IndexBlockState::Indexed);
        drop(states);
        self.decrement_reader_writer_count();
        true
    }

    /// Releases an in-flight reservation that did not land, so a later write
    /// can retry the index insert.
    pub fn on_index_finalize(&self, index_block_start: Timestamp) {
        let mut states = self.index_states.lock().expect("entry index state lock");
        if states.get(&index_block_start) == Some(&IndexBlockState::InFlight) {
            states.remove(&index_block_start);
        }
    }

    pub fn indexed_for_block_start(&self, index_block_start: Timestamp) -> bool {
        let states = self.index_states.lock().expect("entry index state lock");
        states.get(&index_block_start) == Some(&IndexBlockState::Indexed)
    }

    /// Set by the reverse index once it evicts this entry; a precondition
    /// for purging when indexing is enabled.
    pub fn set_index_garbage_collected(&self) {
        self.index_garbage_collected.store(true, Ordering::Release);
    }

    pub fn index_garbage_collected(&self) -> bool {
        self.index_garbage_collected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("unique_index", &self.unique_index)
            .field("reader_writer_count", &self.reader_writer_count())
            .field("index_garbage_collected", &self.index_garbage_collected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemSeries;
    use crate::types::SeriesMetadata;
    use bytes::Bytes;

    fn entry(id: &'static [u8], index: u64) -> Entry {
        let metadata = SeriesMetadata::untagged(Bytes::from_static(id));
        Entry::new(Arc::new(MemSeries::new(metadata)), index)
    }

    #[test]
    fn refcount_round_trip() {
        let e = entry(b"cpu", 1);
        assert_eq!(e.reader_writer_count(), 0);
        e.increment_reader_writer_count();
        e.increment_reader_writer_count();
        assert_eq!(e.reader_writer_count(), 2);
        e.decrement_reader_writer_count();
        assert_eq!(e.reader_writer_count(), 1);
    }

    #[test]
    fn index_state_transitions() {
        let e = entry(b"cpu", 1);
        assert!(e.needs_index_update(100));

        e.on_index_prepare(100);
        assert!(!e.needs_index_update(100));
        assert!(!e.indexed_for_block_start(100));
        // A different block start is unaffected.
        assert!(e.needs_index_update(200));

        e.on_index_success(100);
        assert!(e.indexed_for_block_start(100));

        // Finalize does not demote an acknowledged insert.
        e.on_index_finalize(100);
        assert!(e.indexed_for_block_start(100));
    }

    #[test]
    fn index_finalize_releases_reservation() {
        let e = entry(b"cpu", 1);
        e.on_index_prepare(100);
        e.on_index_finalize(100);
        assert!(e.needs_index_update(100));
    }

    #[test]
    fn already_indexed_marks_and_releases_in_one_step() {
        let e = entry(b"cpu", 1);
        e.increment_reader_writer_count();

        // Not indexed yet: the reference stays with the caller.
        assert!(!e.if_already_indexed_mark_indexed_successfully(100));
        assert_eq!(e.reader_writer_count(), 1);

        // In flight is not indexed either.
        e.on_index_prepare(100);
        assert!(!e.if_already_indexed_mark_indexed_successfully(100));
        assert_eq!(e.reader_writer_count(), 1);

        e.on_index_success(100);
        assert!(e.if_already_indexed_mark_indexed_successfully(100));
        assert_eq!(e.reader_writer_count(), 0);
        assert!(e.indexed_for_block_start(100));
    }

    #[test]
    fn id_shares_series_metadata_allocation() {
        let e = entry(b"mem", 7);
        assert_eq!(e.id().as_ref(), b"mem");
        assert_eq!(e.unique_index(), 7);
        assert!(!e.index_garbage_collected());
        e.set_index_garbage_collected();
        assert!(e.index_garbage_collected());
    }
}
