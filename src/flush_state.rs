//! Per-block-start flush bookkeeping: warm data/index status and the pair of
//! cold version counters that gate eviction.
//!
//! Guarded by its own reader-writer lock, separate from the shard lock. The
//! flush-state lock is never held while acquiring the shard lock; the tick
//! snapshots block states through a helper that only takes this lock inside
//! the already-held shard lock, for the duration of the copy.

use crate::error::{Result, ShardError};
use crate::types::{BlockState, BlockStateSnapshot, Timestamp};
use std::collections::HashMap;
use std::sync::RwLock;

/// Status of one file operation (warm data flush or warm index flush).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpStatus {
    NotStarted,
    InProgress,
    Success,
    Failed,
}

impl FileOpStatus {
    /// Only a completed operation makes the file readable.
    pub fn is_retrievable(self) -> bool {
        matches!(self, FileOpStatus::Success)
    }
}

/// Warm flush progress for one block start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmStatus {
    pub data_flushed: FileOpStatus,
    pub index_flushed: FileOpStatus,
}

impl Default for WarmStatus {
    fn default() -> Self {
        Self {
            data_flushed: FileOpStatus::NotStarted,
            index_flushed: FileOpStatus::NotStarted,
        }
    }
}

/// Complete flush state of one block start.
///
/// Invariants: `cold_version_retrievable <= cold_version_flushed`, and both
/// are monotonically non-decreasing. The flushed version advances when a new
/// volume hits disk; the retrievable version only advances after every
/// leaseholder has switched to it, which is what makes it safe for ticks to
/// evict the in-memory copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOpState {
    pub warm_status: WarmStatus,
    pub cold_version_retrievable: i32,
    pub cold_version_flushed: i32,
    pub num_failures: u64,
}

#[derive(Debug, Default)]
struct FlushStateInner {
    states_by_time: HashMap<Timestamp, FileOpState>,
    initialized: bool,
}

/// All per-block flush states of one shard.
#[derive(Debug, Default)]
pub(crate) struct ShardFlushState {
    inner: RwLock<FlushStateInner>,
}

impl ShardFlushState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialized(&self) -> bool {
        self.inner.read().expect("flush state lock").initialized
    }

    pub fn set_initialized(&self) {
        self.inner.write().expect("flush state lock").initialized = true;
    }

    /// State for a block start regardless of initialization; defaults to
    /// all-NotStarted for blocks never flushed.
    pub fn state_no_init_check(&self, block_start: Timestamp) -> FileOpState {
        let inner = self.inner.read().expect("flush state lock");
        inner
            .states_by_time
            .get(&block_start)
            .copied()
            .unwrap_or_default()
    }

    /// State for a block start, failing when flush states were never
    /// initialized from disk.
    pub fn state(&self, block_start: Timestamp) -> Result<FileOpState> {
        let inner = self.inner.read().expect("flush state lock");
        if !inner.initialized {
            return Err(ShardError::FlushStateNotInitialized);
        }
        Ok(inner
            .states_by_time
            .get(&block_start)
            .copied()
            .unwrap_or_default())
    }

    pub fn mark_warm_data_flush_success(&self, block_start: Timestamp) {
        self.update(block_start, |state| {
            state.warm_status.data_flushed = FileOpStatus::Success;
        });
    }

    pub fn mark_warm_data_flush_fail(&self, block_start: Timestamp) {
        self.update(block_start, |state| {
            state.warm_status.data_flushed = FileOpStatus::Failed;
            state.num_failures += 1;
        });
    }

    pub fn mark_warm_index_flush_success(&self, block_start: Timestamp) {
        self.update(block_start, |state| {
            state.warm_status.index_flushed = FileOpStatus::Success;
        });
    }

    pub fn mark_warm_index_flush_fail(&self, block_start: Timestamp) {
        self.update(block_start, |state| {
            state.warm_status.index_flushed = FileOpStatus::Failed;
            state.num_failures += 1;
        });
    }

    pub fn set_cold_version_flushed(&self, block_start: Timestamp, version: i32) {
        self.update(block_start, |state| {
            debug_assert!(version >= state.cold_version_flushed);
            state.cold_version_flushed = version;
        });
    }

    pub fn set_cold_version_retrievable(&self, block_start: Timestamp, version: i32) {
        self.update(block_start, |state| {
            debug_assert!(version >= state.cold_version_retrievable);
            state.cold_version_retrievable = version;
        });
    }

    /// Drops state for blocks entirely before the retention horizon.
    pub fn remove_states_before(&self, earliest: Timestamp) {
        let mut inner = self.inner.write().expect("flush state lock");
        inner.states_by_time.retain(|&t, _| t >= earliest);
    }

    /// Immutable copy of every block's externally visible state.
    ///
    /// `warm_retrievable` is computed by the caller-supplied predicate so the
    /// shard can fold in whether indexing is enabled; `cold_version` exposes
    /// the retrievable version, never the flushed one, because the snapshot
    /// feeds eviction decisions.
    pub fn snapshot(
        &self,
        warm_retrievable: impl Fn(WarmStatus) -> bool,
    ) -> Option<HashMap<Timestamp, BlockState>> {
        let inner = self.inner.read().expect("flush state lock");
        if !inner.initialized {
            return None;
        }
        Some(
            inner
                .states_by_time
                .iter()
                .map(|(&t, state)| {
                    (
                        t,
                        BlockState {
                            warm_retrievable: warm_retrievable(state.warm_status),
                            cold_version: state.cold_version_retrievable,
                        },
                    )
                })
                .collect(),
        )
    }

    /// Convenience wrapper building a [`BlockStateSnapshot`].
    pub fn block_state_snapshot(
        &self,
        warm_retrievable: impl Fn(WarmStatus) -> bool,
    ) -> BlockStateSnapshot {
        match self.snapshot(warm_retrievable) {
            Some(states) => BlockStateSnapshot::bootstrapped(states),
            None => BlockStateSnapshot::not_bootstrapped(),
        }
    }

    fn update(&self, block_start: Timestamp, f: impl FnOnce(&mut FileOpState)) {
        let mut inner = self.inner.write().expect("flush state lock");
        let state = inner.states_by_time.entry(block_start).or_default();
        f(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warm_data_only(status: WarmStatus) -> bool {
        status.data_flushed.is_retrievable()
    }

    #[test]
    fn default_state_is_not_started() {
        let fs = ShardFlushState::new();
        let state = fs.state_no_init_check(0);
        assert_eq!(state.warm_status.data_flushed, FileOpStatus::NotStarted);
        assert_eq!(state.warm_status.index_flushed, FileOpStatus::NotStarted);
        assert_eq!(state.cold_version_flushed, 0);
        assert_eq!(state.cold_version_retrievable, 0);
    }

    #[test]
    fn state_requires_initialization() {
        let fs = ShardFlushState::new();
        assert!(matches!(
            fs.state(0),
            Err(ShardError::FlushStateNotInitialized)
        ));
        fs.set_initialized();
        assert!(fs.state(0).is_ok());
    }

    #[test]
    fn failure_increments_counter() {
        let fs = ShardFlushState::new();
        fs.mark_warm_data_flush_fail(100);
        fs.mark_warm_data_flush_fail(100);
        fs.mark_warm_index_flush_fail(100);
        let state = fs.state_no_init_check(100);
        assert_eq!(state.warm_status.data_flushed, FileOpStatus::Failed);
        assert_eq!(state.num_failures, 3);

        fs.mark_warm_data_flush_success(100);
        let state = fs.state_no_init_check(100);
        assert_eq!(state.warm_status.data_flushed, FileOpStatus::Success);
        // Failures are a history, not reset by success.
        assert_eq!(state.num_failures, 3);
    }

    #[test]
    fn cold_versions_advance_monotonically() {
        let fs = ShardFlushState::new();
        fs.set_cold_version_flushed(0, 1);
        let state = fs.state_no_init_check(0);
        assert_eq!(state.cold_version_flushed, 1);
        assert_eq!(state.cold_version_retrievable, 0);
        assert!(state.cold_version_retrievable <= state.cold_version_flushed);

        fs.set_cold_version_retrievable(0, 1);
        let state = fs.state_no_init_check(0);
        assert_eq!(state.cold_version_retrievable, 1);
    }

    #[test]
    fn prune_drops_only_old_states() {
        let fs = ShardFlushState::new();
        fs.mark_warm_data_flush_success(100);
        fs.mark_warm_data_flush_success(200);
        fs.mark_warm_data_flush_success(300);
        fs.remove_states_before(200);

        fs.set_initialized();
        let snapshot = fs.snapshot(warm_data_only).unwrap();
        assert!(!snapshot.contains_key(&100));
        assert!(snapshot.contains_key(&200));
        assert!(snapshot.contains_key(&300));
    }

    #[test]
    fn snapshot_exposes_retrievable_cold_version() {
        let fs = ShardFlushState::new();
        fs.set_initialized();
        fs.mark_warm_data_flush_success(0);
        fs.set_cold_version_flushed(0, 2);
        fs.set_cold_version_retrievable(0, 1);

        let snapshot = fs.snapshot(warm_data_only).unwrap();
        let block = snapshot[&0];
        assert!(block.warm_retrievable);
        // Eviction must key off the retrievable version.
        assert_eq!(block.cold_version, 1);
    }

    #[test]
    fn snapshot_none_until_initialized() {
        let fs = ShardFlushState::new();
        assert!(fs.snapshot(warm_data_only).is_none());
        assert!(!fs.block_state_snapshot(warm_data_only).is_bootstrapped());
    }
}
