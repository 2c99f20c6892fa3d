//! Integration tests for the flush, snapshot, cold-flush and cleanup
//! pipeline, including the lease-ordering contract.

use bytes::Bytes;
use skarda::fileset;
use skarda::lease::BlockLeaseManager;
use skarda::series::ReverseIndex;
use skarda::shard::{AggregateTilesOptions, RepairResult, Shard, ShardRepairer, TileAggregator};
use skarda::testing::{harness, MemSeriesFactory, TempShardDir, TestLeaser};
use skarda::{
    InsertQueueOptions, Result, RetentionOptions, ShardCollaborators, ShardConfig, ShardError,
    TimeUnit,
};
use std::sync::Arc;
use std::time::Duration;

fn id(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[test]
fn warm_flush_then_flushed_phase_metadata() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();

    h.shard.warm_flush(0, h.fs.flush_preparer().as_ref()).unwrap();
    let state = h.shard.flush_state(0).unwrap();
    assert!(state.warm_status.data_flushed.is_retrievable());

    // Disk-only paging returns the series written to that block.
    let page = h
        .shard
        .fetch_blocks_metadata_v2(
            0,
            h.block_size_nanos(),
            10,
            None,
            skarda::FetchBlocksMetadataOptions {
                only_disk: true,
                include_sizes: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(page.results.len(), 1);
    assert_eq!(page.results[0].id.as_ref(), b"cpu");
}

#[test]
fn cold_flush_publishes_volume_one() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();
    h.shard.warm_flush(0, h.fs.flush_preparer().as_ref()).unwrap();

    // A late write dirties the cold buffer of the warm-flushed block.
    h.factory.series(b"cpu").unwrap().mark_cold_dirty(0);

    let flush = h.shard.cold_flush(h.fs.flush_preparer().as_ref()).unwrap();
    flush.done().unwrap();

    assert!(h.fs.volume_exists(0, 1), "volume 1 must exist");
    let state = h.shard.flush_state(0).unwrap();
    assert_eq!(state.cold_version_flushed, 1);
    assert_eq!(state.cold_version_retrievable, 1);
    assert_eq!(h.leaser.updates(), vec![(0, 1)]);
}

#[test]
fn cold_flush_without_new_dirty_data_short_circuits() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();
    h.shard.warm_flush(0, h.fs.flush_preparer().as_ref()).unwrap();
    h.factory.series(b"cpu").unwrap().mark_cold_dirty(0);

    let flush = h.shard.cold_flush(h.fs.flush_preparer().as_ref()).unwrap();
    flush.done().unwrap();
    assert_eq!(h.shard.flush_state(0).unwrap().cold_version_flushed, 1);

    // The dirty marker was consumed by the first cold flush.
    h.factory.series(b"cpu").unwrap().clear_cold_dirty();
    let flush = h.shard.cold_flush(h.fs.flush_preparer().as_ref()).unwrap();
    assert_eq!(flush.num_blocks(), 0);
    flush.done().unwrap();

    // No new volume, no extra lease update.
    assert_eq!(h.shard.flush_state(0).unwrap().cold_version_flushed, 1);
    assert!(!h.fs.volume_exists(0, 2));
    assert_eq!(h.leaser.updates().len(), 1);
}

#[test]
fn snapshot_then_filter_blocks_need_snapshot() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();

    let filtered = h.shard.filter_blocks_need_snapshot(&[0, h.block_size_nanos()]);
    assert_eq!(filtered, vec![0]);

    let result = h
        .shard
        .snapshot(0, 42, h.fs.snapshot_preparer().as_ref())
        .unwrap();
    assert_eq!(result.series_persist, 1);
    assert_eq!(h.fs.snapshot_indices(0), vec![0]);
}

#[test]
fn latest_volume_tracks_cold_flushes() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();
    h.shard.warm_flush(0, h.fs.flush_preparer().as_ref()).unwrap();
    assert_eq!(h.shard.latest_volume(0).unwrap(), 0);

    h.factory.series(b"cpu").unwrap().mark_cold_dirty(0);
    let flush = h.shard.cold_flush(h.fs.flush_preparer().as_ref()).unwrap();
    flush.done().unwrap();
    assert_eq!(h.shard.latest_volume(0).unwrap(), 1);

    // No streaming reader factory configured in the harness.
    match h.shard.open_streaming_reader(0) {
        Err(err) => assert!(err.is_invalid_params()),
        Ok(_) => panic!("expected missing streaming reader factory"),
    }
}

#[test]
fn cleanup_pipeline_on_real_files() {
    let h = harness().build();
    let block = h.block_size_nanos();
    h.write_fileset(0, 0);
    h.write_fileset(0, 1);
    h.write_fileset(block, 0);
    h.write_fileset(2 * block, 0);

    // Advance block 0's cold version through a real cold flush so volume 0
    // becomes superseded.
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();
    h.shard.warm_flush(0, h.fs.flush_preparer().as_ref()).unwrap();
    h.factory.series(b"cpu").unwrap().mark_cold_dirty(0);
    let flush = h.shard.cold_flush(h.fs.flush_preparer().as_ref()).unwrap();
    flush.done().unwrap();

    h.shard.cleanup_compacted_filesets().unwrap();
    let ids: Vec<_> = fileset::data_fileset_files(&h.data_dir())
        .unwrap()
        .into_iter()
        .map(|f| (f.id.block_start, f.id.volume_index))
        .collect();
    assert_eq!(ids, vec![(0, 1), (block, 0), (2 * block, 0)]);

    // Everything before the horizon goes.
    h.shard.cleanup_expired_filesets(2 * block).unwrap();
    let ids: Vec<_> = fileset::data_fileset_files(&h.data_dir())
        .unwrap()
        .into_iter()
        .map(|f| f.id.block_start)
        .collect();
    assert_eq!(ids, vec![2 * block]);
}

struct FixedTileAggregator;

impl TileAggregator for FixedTileAggregator {
    fn aggregate_tiles(&self, _shard: u32, _opts: &AggregateTilesOptions) -> Result<(i64, i32)> {
        Ok((17, 1))
    }
}

struct CountingRepairer;

impl ShardRepairer for CountingRepairer {
    fn repair(&self, shard: &Shard, _start: i64, _end: i64) -> Result<RepairResult> {
        Ok(RepairResult {
            compared_series: shard.num_series() as u64,
            ..Default::default()
        })
    }
}

fn custom_shard(tile_aggregator: Option<Arc<dyn TileAggregator>>) -> (Arc<Shard>, Arc<TestLeaser>, TempShardDir) {
    let dir = TempShardDir::new();
    let fs = skarda::testing::MemFilesystem::new();
    let retention = RetentionOptions::default();
    let factory = Arc::new(MemSeriesFactory::new(retention.block_size));
    let leaser = TestLeaser::new();
    let lease_manager = Arc::new(BlockLeaseManager::new());
    lease_manager.register_leaser(leaser.clone());

    let config = ShardConfig {
        namespace: "testns".to_string(),
        shard_id: 7,
        data_dir: dir.path().to_path_buf(),
        retention,
        needs_bootstrap: false,
        insert_queue: InsertQueueOptions::default(),
        ..Default::default()
    };
    let collab = ShardCollaborators {
        series_factory: factory,
        reverse_index: None::<Arc<dyn ReverseIndex>>,
        block_retriever: None,
        reader_manager: fs.reader_manager(),
        merger: fs.merger(),
        lease_manager,
        streaming_readers: None,
        tile_aggregator,
    };
    (Shard::new(config, collab), leaser, dir)
}

#[test]
fn aggregate_tiles_finishes_writing_with_warm_success() {
    let (shard, leaser, _dir) = custom_shard(Some(Arc::new(FixedTileAggregator)));
    shard.prepare_bootstrap().unwrap();
    let processed = shard
        .aggregate_tiles(&AggregateTilesOptions {
            start: 0,
            end: 7_200_000_000_000,
            step: Duration::from_secs(60),
        })
        .unwrap();
    assert_eq!(processed, 17);
    // The new volume was published to leasers and warm state marked
    // successful so the blocks are readable.
    assert_eq!(leaser.updates(), vec![(0, 1)]);
    let state = shard.flush_state(0).unwrap();
    assert!(state.warm_status.data_flushed.is_retrievable());
    assert_eq!(state.cold_version_retrievable, 1);
}

#[test]
fn aggregate_tiles_requires_an_aggregator() {
    let (shard, _leaser, _dir) = custom_shard(None);
    let err = shard
        .aggregate_tiles(&AggregateTilesOptions {
            start: 0,
            end: 1,
            step: Duration::from_secs(60),
        })
        .unwrap_err();
    assert!(err.is_invalid_params());
}

#[test]
fn repair_delegates_with_shard_scope() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();

    let result = h.shard.repair(0, 100, &CountingRepairer).unwrap();
    assert_eq!(result.compared_series, 1);
}

#[test]
fn lease_failure_is_surfaced_and_versions_do_not_drift() {
    let h = harness().build();
    h.shard
        .write(id("cpu"), 10, 1.0, TimeUnit::Nanoseconds, None)
        .unwrap();
    h.drain_inserts();
    h.shard.warm_flush(0, h.fs.flush_preparer().as_ref()).unwrap();
    h.factory.series(b"cpu").unwrap().mark_cold_dirty(0);

    h.leaser.fail_next_update();
    let flush = h.shard.cold_flush(h.fs.flush_preparer().as_ref()).unwrap();
    match flush.done() {
        Err(ShardError::InvariantViolation(_)) => {}
        other => panic!("expected invariant violation, got {:?}", other),
    }

    let state = h.shard.flush_state(0).unwrap();
    assert_eq!(state.cold_version_flushed, 1);
    assert_eq!(state.cold_version_retrievable, 1);
}
