//! Block lease management: the notification channel between cold flushes and
//! the readers holding volumes open.
//!
//! A lease is a reader's claim on a specific fileset volume. When a cold
//! flush produces volume N+1, the shard calls `update_open_leases`, which
//! blocks until every registered leaser has either released or switched to
//! the new volume. Only then may the shard advance the retrievable cold
//! version and let ticks evict the in-memory copy; the old volume becomes a
//! cleanup target.

use crate::error::{Result, ShardError};
use crate::types::Timestamp;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Identifies the block a lease covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseDescriptor {
    pub namespace: String,
    pub shard: u32,
    pub block_start: Timestamp,
}

/// The volume a lease points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseState {
    pub volume: i32,
}

/// Outcome of asking one leaser to move to a new volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateLeaseResult {
    /// The leaser held a lease on the block and switched to the new volume.
    UpdatedLease,
    /// The leaser held no open lease for this block.
    NoOpenLease,
}

/// A holder of block leases, typically a seeker over fileset files.
/// `update_open_lease` must not return until the leaser has stopped relying
/// on any volume older than `state.volume`.
pub trait BlockLeaser: Send + Sync {
    fn update_open_lease(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<UpdateLeaseResult>;
}

/// Registry of leasers plus the latest volume published per block.
///
/// Volumes are strictly monotonic per (shard, blockStart); publishing an
/// older volume than previously seen is refused as an invariant violation.
#[derive(Default)]
pub struct BlockLeaseManager {
    inner: RwLock<LeaseManagerInner>,
}

#[derive(Default)]
struct LeaseManagerInner {
    leasers: Vec<Arc<dyn BlockLeaser>>,
    latest: HashMap<(u32, Timestamp), i32>,
}

impl std::fmt::Debug for BlockLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("lease manager lock");
        f.debug_struct("BlockLeaseManager")
            .field("leasers", &inner.leasers.len())
            .field("blocks", &inner.latest.len())
            .finish()
    }
}

impl BlockLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_leaser(&self, leaser: Arc<dyn BlockLeaser>) {
        self.inner
            .write()
            .expect("lease manager lock")
            .leasers
            .push(leaser);
    }

    /// Latest volume published for a block, if any.
    pub fn latest_state(&self, shard: u32, block_start: Timestamp) -> Option<LeaseState> {
        self.inner
            .read()
            .expect("lease manager lock")
            .latest
            .get(&(shard, block_start))
            .map(|&volume| LeaseState { volume })
    }

    /// Publishes a new volume to every registered leaser, blocking until all
    /// of them have released or switched. Returns the number of leasers that
    /// actually held a lease on the block.
    pub fn update_open_leases(
        &self,
        descriptor: LeaseDescriptor,
        state: LeaseState,
    ) -> Result<usize> {
        let leasers = {
            let mut inner = self.inner.write().expect("lease manager lock");
            let key = (descriptor.shard, descriptor.block_start);
            if let Some(&current) = inner.latest.get(&key) {
                if state.volume < current {
                    return Err(ShardError::InvariantViolation(format!(
                        "lease volume regressed for shard {} block {}: {} -> {}",
                        descriptor.shard, descriptor.block_start, current, state.volume
                    )));
                }
            }
            inner.latest.insert(key, state.volume);
            inner.leasers.clone()
        };

        let mut updated = 0;
        for leaser in leasers {
            match leaser.update_open_lease(&descriptor, state)? {
                UpdateLeaseResult::UpdatedLease => updated += 1,
                UpdateLeaseResult::NoOpenLease => {}
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLeaser {
        seen: Mutex<Vec<(LeaseDescriptor, LeaseState)>>,
        holds_lease: bool,
    }

    impl BlockLeaser for RecordingLeaser {
        fn update_open_lease(
            &self,
            descriptor: &LeaseDescriptor,
            state: LeaseState,
        ) -> Result<UpdateLeaseResult> {
            self.seen.lock().unwrap().push((descriptor.clone(), state));
            Ok(if self.holds_lease {
                UpdateLeaseResult::UpdatedLease
            } else {
                UpdateLeaseResult::NoOpenLease
            })
        }
    }

    fn descriptor(block_start: Timestamp) -> LeaseDescriptor {
        LeaseDescriptor {
            namespace: "metrics".to_string(),
            shard: 3,
            block_start,
        }
    }

    #[test]
    fn notifies_every_leaser() {
        let manager = BlockLeaseManager::new();
        let holder = Arc::new(RecordingLeaser {
            holds_lease: true,
            ..Default::default()
        });
        let bystander = Arc::new(RecordingLeaser::default());
        manager.register_leaser(holder.clone());
        manager.register_leaser(bystander.clone());

        let updated = manager
            .update_open_leases(descriptor(0), LeaseState { volume: 1 })
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(holder.seen.lock().unwrap().len(), 1);
        assert_eq!(bystander.seen.lock().unwrap().len(), 1);
        assert_eq!(
            manager.latest_state(3, 0),
            Some(LeaseState { volume: 1 })
        );
    }

    #[test]
    fn volume_regression_is_an_invariant_violation() {
        let manager = BlockLeaseManager::new();
        manager
            .update_open_leases(descriptor(0), LeaseState { volume: 2 })
            .unwrap();
        match manager.update_open_leases(descriptor(0), LeaseState { volume: 1 }) {
            Err(ShardError::InvariantViolation(msg)) => {
                assert!(msg.contains("regressed"), "{}", msg)
            }
            other => panic!("expected invariant violation, got {:?}", other),
        }
        // Re-publishing the same volume is allowed (retry after failure).
        manager
            .update_open_leases(descriptor(0), LeaseState { volume: 2 })
            .unwrap();
    }

    #[test]
    fn blocks_are_tracked_independently() {
        let manager = BlockLeaseManager::new();
        manager
            .update_open_leases(descriptor(0), LeaseState { volume: 5 })
            .unwrap();
        manager
            .update_open_leases(descriptor(7200), LeaseState { volume: 1 })
            .unwrap();
        assert_eq!(manager.latest_state(3, 0), Some(LeaseState { volume: 5 }));
        assert_eq!(
            manager.latest_state(3, 7200),
            Some(LeaseState { volume: 1 })
        );
        assert_eq!(manager.latest_state(3, 14400), None);
    }
}
