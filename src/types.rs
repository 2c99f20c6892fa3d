use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// Series identifier: an opaque byte string. `Bytes` clones are refcounted,
/// so the map key, the entry, and the commit log can all share the same
/// allocation without copying.
pub type SeriesId = Bytes;

/// Resolution unit attached to a written value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::Nanoseconds
    }
}

/// Identity of a series: the id bytes plus its tag pairs. The id owns the
/// canonical allocation; everything else in the shard borrows it via
/// refcounted clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMetadata {
    pub id: SeriesId,
    pub tags: Vec<(Bytes, Bytes)>,
}

impl SeriesMetadata {
    pub fn new(id: SeriesId, tags: Vec<(Bytes, Bytes)>) -> Self {
        Self { id, tags }
    }

    /// Metadata with no tags, for untagged writes.
    pub fn untagged(id: SeriesId) -> Self {
        Self { id, tags: Vec::new() }
    }
}

/// Retention configuration for the namespace owning this shard.
#[derive(Debug, Clone)]
pub struct RetentionOptions {
    /// How far back data must be kept.
    pub retention_period: Duration,
    /// Width of one data block; every fileset covers exactly one block.
    pub block_size: Duration,
    /// Width of one reverse-index block; always >= `block_size`.
    pub index_block_size: Duration,
}

impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            retention_period: Duration::from_secs(2 * 24 * 3600),
            block_size: Duration::from_secs(2 * 3600),
            index_block_size: Duration::from_secs(4 * 3600),
        }
    }
}

impl RetentionOptions {
    /// Aligns a timestamp down to the start of its data block.
    pub fn block_start(&self, ts: Timestamp) -> Timestamp {
        truncate_to(ts, self.block_size)
    }

    /// Aligns a timestamp down to the start of its index block.
    pub fn index_block_start(&self, ts: Timestamp) -> Timestamp {
        truncate_to(ts, self.index_block_size)
    }

    /// Earliest block start that must still be retained as of `now`.
    /// Anything before this is a cleanup target.
    pub fn flush_time_start(&self, now: Timestamp) -> Timestamp {
        self.block_start(now.saturating_sub(self.retention_period.as_nanos() as i64))
    }
}

fn truncate_to(ts: Timestamp, window: Duration) -> Timestamp {
    let w = window.as_nanos() as i64;
    ts.div_euclid(w) * w
}

/// Whether a write lands in the warm (in-order) or cold (out-of-order /
/// loaded) buffer of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WarmWrite,
    ColdWrite,
}

/// Per-block flush visibility exposed to the tick and read paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockState {
    /// True once the warm fileset (and index, if enabled) for this block is
    /// readable from disk.
    pub warm_retrievable: bool,
    /// Highest cold volume readers may rely on. Eviction decisions use this,
    /// never the flushed version, so memory is only dropped once disk readers
    /// have switched over.
    pub cold_version: i32,
}

/// Point-in-time immutable copy of the shard's flush states.
///
/// `None` means the shard (or its flush states) were not bootstrapped at
/// snapshot time and no eviction decisions may be made from it.
#[derive(Debug, Clone, Default)]
pub struct BlockStateSnapshot {
    states: Option<HashMap<Timestamp, BlockState>>,
}

impl BlockStateSnapshot {
    pub fn bootstrapped(states: HashMap<Timestamp, BlockState>) -> Self {
        Self { states: Some(states) }
    }

    pub fn not_bootstrapped() -> Self {
        Self { states: None }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.states.is_some()
    }

    pub fn value(&self) -> Option<&HashMap<Timestamp, BlockState>> {
        self.states.as_ref()
    }

    /// State for a block start; defaults when the block was never flushed.
    pub fn block_state(&self, block_start: Timestamp) -> BlockState {
        self.states
            .as_ref()
            .and_then(|s| s.get(&block_start).copied())
            .unwrap_or_default()
    }
}

/// Bootstrap lifecycle of the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotBootstrapped,
    Bootstrapping,
    Bootstrapped,
}

/// Aggregate counters produced by one shard tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickResult {
    pub active_series: u64,
    pub expired_series: u64,
    pub purged_series: u64,
    pub errors: u64,
    pub active_blocks: u64,
    pub wired_blocks: u64,
    pub unwired_blocks: u64,
    pub made_expired_blocks: u64,
    pub made_unwired_blocks: u64,
    pub merged_out_of_order_blocks: u64,
    pub evicted_buckets: u64,
}

/// Metadata returned to the caller of a write so it can feed the commit log
/// and (when requested) the reverse index.
#[derive(Debug, Clone)]
pub struct SeriesWrite {
    pub id: SeriesId,
    pub unique_index: u64,
    /// On the asynchronous insert branch this is reported `true` before the
    /// queue drains; the commit log records the write either way.
    pub was_written: bool,
    pub needs_index: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_start_alignment() {
        let ropts = RetentionOptions {
            block_size: Duration::from_nanos(100),
            index_block_size: Duration::from_nanos(200),
            ..Default::default()
        };
        assert_eq!(ropts.block_start(0), 0);
        assert_eq!(ropts.block_start(99), 0);
        assert_eq!(ropts.block_start(100), 100);
        assert_eq!(ropts.block_start(250), 200);
        assert_eq!(ropts.index_block_start(250), 200);
        assert_eq!(ropts.index_block_start(399), 200);
    }

    #[test]
    fn flush_time_start_respects_retention() {
        let ropts = RetentionOptions {
            retention_period: Duration::from_nanos(1000),
            block_size: Duration::from_nanos(100),
            index_block_size: Duration::from_nanos(100),
        };
        // 2350 - 1000 = 1350, aligned down to 1300.
        assert_eq!(ropts.flush_time_start(2350), 1300);
    }

    #[test]
    fn snapshot_defaults_for_unknown_blocks() {
        let snap = BlockStateSnapshot::bootstrapped(HashMap::new());
        assert!(snap.is_bootstrapped());
        let state = snap.block_state(42);
        assert!(!state.warm_retrievable);
        assert_eq!(state.cold_version, 0);

        let not = BlockStateSnapshot::not_bootstrapped();
        assert!(!not.is_bootstrapped());
        assert!(not.value().is_none());
    }
}
