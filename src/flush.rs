//! The flush, snapshot and cold-flush drivers plus fileset cleanup: the
//! state machine that moves in-memory blocks onto disk as monotonically
//! versioned fileset volumes and publishes them to lease holders.

use crate::error::{MultiError, Result, ShardError};
use crate::fileset;
use crate::lease::{LeaseDescriptor, LeaseState};
use crate::series::{
    DataPrepareOptions, FilesetType, FlushOutcome, FlushPreparer, MergeCloser, MergeRequest,
    SnapshotPreparer,
};
use crate::shard::Shard;
use crate::telemetry::{shard_metrics, ShardEvent};
use crate::types::{BootstrapState, SeriesMetadata, Timestamp};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, error};

/// Result of snapshotting one block of the shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardSnapshotResult {
    /// Number of series that persisted buffered data into the snapshot.
    pub series_persist: usize,
}

struct ColdFlushDone {
    block_start: Timestamp,
    next_version: i32,
    closer: Box<dyn MergeCloser>,
}

/// Completion handle for one shard cold flush. Closing each merged block's
/// writer and publishing the new volumes is deferred to [`done`] so the
/// caller can fan the merge work out first.
///
/// [`done`]: ShardColdFlush::done
pub struct ShardColdFlush<'a> {
    shard: &'a Shard,
    done_fns: Vec<ColdFlushDone>,
    merge_errors: MultiError,
}

impl ShardColdFlush<'_> {
    /// Closes each merged block's writer and, per block, runs the
    /// finish-writing sequence. Continues across per-block failures and
    /// aggregates them.
    pub fn done(self) -> Result<()> {
        let mut multi = self.merge_errors;
        for done in self.done_fns {
            if let Err(err) = done.closer.close() {
                self.shard.events.on_event(ShardEvent::ColdFlushFailed {
                    block_start: done.block_start,
                    error: err.to_string(),
                });
                multi.add(err);
                continue;
            }
            if let Err(err) =
                self.shard
                    .finish_writing(done.block_start, done.next_version, false)
            {
                multi.add(err);
            }
        }
        multi.final_result()
    }

    /// Number of blocks with merged data awaiting completion.
    pub fn num_blocks(&self) -> usize {
        self.done_fns.len()
    }
}

impl Shard {
    /// Persists the warm (in-order) data of every series for one block into
    /// the volume-0 fileset. A per-series failure halts iteration, since the
    /// file on disk may be partial, but the writer is still closed and the
    /// failure recorded.
    pub fn warm_flush(
        &self,
        block_start: Timestamp,
        flush_preparer: &dyn FlushPreparer,
    ) -> Result<()> {
        if !self.is_bootstrapped() {
            return Err(ShardError::NotBootstrapped);
        }
        let started = Instant::now();

        let prepare_opts = DataPrepareOptions {
            namespace: self.config.namespace.clone(),
            shard: self.config.shard_id,
            block_start,
            // Volume index is always 0 for warm flushes: a warm flush must
            // happen before any cold flush of the block.
            volume_index: 0,
            // Bootstrap tracked which filesets exist; a collision here is a
            // bug upstream.
            delete_if_exists: false,
            fileset_type: FilesetType::Flush,
            snapshot_time: None,
            snapshot_index: None,
        };
        let mut persist = flush_preparer.prepare_data(prepare_opts)?;

        let mut multi = MultiError::new();
        let mut num_block_does_not_exist: u64 = 0;
        self.for_each_entry(|entry| {
            match entry.series().warm_flush(block_start, persist.as_mut()) {
                Ok(FlushOutcome::FlushedToDisk) => true,
                Ok(FlushOutcome::BlockDoesNotExist) => {
                    num_block_does_not_exist += 1;
                    true
                }
                Err(err) => {
                    multi.add(err);
                    // The on-disk file may be in a corrupt state; stop here.
                    false
                }
            }
        });

        debug!(
            shard = self.config.shard_id,
            num_block_does_not_exist, "shard flush outcome"
        );

        if let Err(err) = persist.close() {
            multi.add(err);
        }

        shard_metrics::record_flush(started.elapsed());
        let result = multi.final_result();
        match result {
            Ok(()) => {
                self.flush_state.mark_warm_data_flush_success(block_start);
                Ok(())
            }
            Err(err) => {
                self.flush_state.mark_warm_data_flush_fail(block_start);
                self.events.on_event(ShardEvent::WarmFlushFailed {
                    block_start,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Records the warm index flush outcome for a block, called by the
    /// namespace once the reverse index has flushed the covering index
    /// block.
    pub fn mark_warm_index_flush_state_success_or_error(
        &self,
        block_start: Timestamp,
        result: Result<()>,
    ) {
        match result {
            Ok(()) => self.flush_state.mark_warm_index_flush_success(block_start),
            Err(_) => self.flush_state.mark_warm_index_flush_fail(block_start),
        }
    }

    /// Writes the in-memory buffers of one block to a snapshot-type fileset
    /// for crash recovery. Snapshots are numbered by their own monotonic
    /// per-shard index.
    pub fn snapshot(
        &self,
        block_start: Timestamp,
        snapshot_time: Timestamp,
        snapshot_preparer: &dyn SnapshotPreparer,
    ) -> Result<ShardSnapshotResult> {
        if !self.is_bootstrapped() {
            return Err(ShardError::NotBootstrapped);
        }

        let total_started = Instant::now();
        let snapshot_index = self.next_snapshot_index.fetch_add(1, Ordering::Relaxed);

        let prepare_opts = DataPrepareOptions {
            namespace: self.config.namespace.clone(),
            shard: self.config.shard_id,
            block_start,
            volume_index: 0,
            // Snapshot files carry a monotonically increasing index, so a
            // collision would require a competing process.
            delete_if_exists: false,
            fileset_type: FilesetType::Snapshot,
            snapshot_time: Some(snapshot_time),
            snapshot_index: Some(snapshot_index),
        };
        let prepare_started = Instant::now();
        let mut persist = snapshot_preparer.prepare_data(prepare_opts)?;
        let prepare_elapsed = prepare_started.elapsed();

        let mut multi = MultiError::new();
        let mut series_persist = 0;
        self.for_each_entry(|entry| {
            match entry.series().snapshot(block_start, persist.as_mut()) {
                Ok(outcome) => {
                    if outcome.persisted {
                        series_persist += 1;
                    }
                    true
                }
                Err(err) => {
                    multi.add(err);
                    // Possible partial write; stop iterating this snapshot.
                    false
                }
            }
        });

        if let Err(err) = persist.close() {
            multi.add(err);
        }
        shard_metrics::record_snapshot(total_started.elapsed(), prepare_elapsed);

        match multi.final_result() {
            Ok(()) => Ok(ShardSnapshotResult { series_persist }),
            Err(err) => {
                self.events.on_event(ShardEvent::SnapshotFailed {
                    block_start,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Filters the given block starts down to those for which any series
    /// holds unflushed data, preserving the input order.
    pub fn filter_blocks_need_snapshot(&self, block_starts: &[Timestamp]) -> Vec<Timestamp> {
        if !self.is_bootstrapped() {
            return Vec::new();
        }

        let mut needs: HashSet<Timestamp> = HashSet::new();
        self.for_each_entry(|entry| {
            entry.series().mark_non_empty_blocks(&mut needs);
            if needs.len() < block_starts.len() {
                return true;
            }
            // A series may report blocks outside the requested set, so the
            // count alone cannot prove completion.
            block_starts.iter().any(|b| !needs.contains(b))
        });

        block_starts
            .iter()
            .copied()
            .filter(|b| needs.contains(b))
            .collect()
    }

    /// Merges dirty cold buffers into the next fileset volume per block.
    ///
    /// Pass one walks the series collecting, per block start, the series
    /// whose cold buffer is dirty and whose block has already been warm
    /// flushed (cold flushes never operate on never-warm-flushed blocks).
    /// Pass two merges each dirty block; completion is deferred to the
    /// returned handle's [`ShardColdFlush::done`].
    pub fn cold_flush(
        &self,
        flush_preparer: &dyn FlushPreparer,
    ) -> Result<ShardColdFlush<'_>> {
        let block_states = {
            let inner = self.read_lock();
            if inner.bootstrap_state != BootstrapState::Bootstrapped {
                return Err(ShardError::NotBootstrapped);
            }
            self.block_states_snapshot_with_lock(&inner)
        };
        if !block_states.is_bootstrapped() {
            return Err(ShardError::FlushStateNotInitialized);
        }

        let mut loop_err: Option<ShardError> = None;
        let mut dirty_series_to_write: BTreeMap<Timestamp, Vec<SeriesMetadata>> = BTreeMap::new();
        self.for_each_entry(|entry| {
            let metadata = entry.series().metadata().clone();
            for t in entry.series().cold_flush_block_starts(&block_states) {
                let state = match self.flush_state.state(t) {
                    Ok(state) => state,
                    Err(err) => {
                        loop_err = Some(err);
                        return false;
                    }
                };
                // Warm flush logic performs no merging, so only blocks that
                // already have a volume 0 are cold-flush candidates.
                if !self.warm_status_is_retrievable(state.warm_status) {
                    continue;
                }
                dirty_series_to_write
                    .entry(t)
                    .or_default()
                    .push(metadata.clone());
            }
            true
        });
        if let Some(err) = loop_err {
            return Err(err);
        }

        let mut flush = ShardColdFlush {
            shard: self,
            done_fns: Vec::with_capacity(dirty_series_to_write.len()),
            merge_errors: MultiError::new(),
        };
        if dirty_series_to_write.is_empty() {
            // Nothing dirty to merge; the merger short-circuits and no new
            // volume is produced.
            return Ok(flush);
        }

        // Each block has its own fileset: an error merging one block does
        // not stop the others.
        for (block_start, dirty_series) in &dirty_series_to_write {
            let cold_version = match self.flush_state.state(*block_start) {
                Ok(state) => state.cold_version_flushed,
                Err(err) => {
                    flush.merge_errors.add(err);
                    continue;
                }
            };
            let next_version = cold_version + 1;

            let merge = self.collab.merger.merge(MergeRequest {
                namespace: &self.config.namespace,
                shard: self.config.shard_id,
                block_start: *block_start,
                cold_version,
                next_version,
                dirty_series,
                flush_preparer,
            });
            match merge {
                Ok(closer) => flush.done_fns.push(ColdFlushDone {
                    block_start: *block_start,
                    next_version,
                    closer,
                }),
                Err(err) => {
                    self.events.on_event(ShardEvent::ColdFlushFailed {
                        block_start: *block_start,
                        error: err.to_string(),
                    });
                    flush.merge_errors.add(err);
                }
            }
        }

        Ok(flush)
    }

    /// Publishes a newly written volume.
    ///
    /// The ordering here is the central correctness property of the flush
    /// state machine: `cold_version_flushed` advances first, making the new
    /// fileset discoverable by lease verifiers; then every leaseholder is
    /// moved over; only then does `cold_version_retrievable` advance, which
    /// is what allows concurrent ticks to evict the in-memory copy.
    pub(crate) fn finish_writing(
        &self,
        block_start: Timestamp,
        next_version: i32,
        mark_warm_flush_state_success: bool,
    ) -> Result<()> {
        if mark_warm_flush_state_success {
            self.flush_state.mark_warm_data_flush_success(block_start);
            self.flush_state.mark_warm_index_flush_success(block_start);
        }

        self.flush_state
            .set_cold_version_flushed(block_start, next_version);

        // Blocks until all existing leaseholders of prior volumes have
        // released or switched.
        let lease_result = self.collab.lease_manager.update_open_leases(
            LeaseDescriptor {
                namespace: self.config.namespace.clone(),
                shard: self.config.shard_id,
                block_start,
            },
            LeaseState {
                volume: next_version,
            },
        );

        // Retrievable advances even on lease failure; the two versions must
        // never drift apart.
        self.flush_state
            .set_cold_version_retrievable(block_start, next_version);

        if let Err(err) = lease_result {
            error!(
                namespace = %self.config.namespace,
                shard = self.config.shard_id,
                block_start,
                next_version,
                error = %err,
                "failed to update open leases after updating flush state cold version"
            );
            self.events.on_event(ShardEvent::LeaseUpdateFailed {
                block_start,
                next_version,
                error: err.to_string(),
            });
            return Err(ShardError::InvariantViolation(format!(
                "failed to update open leases for block {}: {}",
                block_start, err
            )));
        }
        Ok(())
    }

    /// Deletes every fileset entirely before `earliest`.
    pub fn cleanup_expired_filesets(&self, earliest: Timestamp) -> Result<()> {
        let expired = fileset::fileset_paths_before(&self.config.data_dir, earliest)?;
        fileset::delete_files(&expired)
    }

    /// Deletes filesets superseded by a newer cold version.
    ///
    /// One block-state snapshot taken up front stays authoritative for the
    /// whole pass because cleanup and flush never run concurrently.
    pub fn cleanup_compacted_filesets(&self) -> Result<()> {
        let filesets = fileset::data_fileset_files(&self.config.data_dir)?;
        let block_states = self.block_states_snapshot();
        let states = match block_states.value() {
            Some(states) => states,
            None => return Err(ShardError::NotBootstrapped),
        };

        let mut to_delete = Vec::new();
        for fileset_file in filesets {
            let cold_version = states
                .get(&fileset_file.id.block_start)
                .map(|s| s.cold_version)
                .unwrap_or(0);
            if fileset_file.id.volume_index < cold_version {
                to_delete.extend(fileset_file.paths);
            }
        }
        fileset::delete_files(&to_delete)
    }
}
