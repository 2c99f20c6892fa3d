use crate::types::Timestamp;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// The shard never prints; operationally significant moments are delivered
/// here as structured events for the host to forward to whatever sink it
/// runs. Invariant violations (the purge refcount check, lease-update
/// failures) always pass through this hook in addition to being logged and
/// counted.
pub trait ShardEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: ShardEvent);
}

/// Structured events emitted by the shard.
#[derive(Debug, Clone)]
pub enum ShardEvent {
    InsertQueueStarted,
    InsertQueueStopping,

    /// A purge candidate held fewer references than the iteration cursor
    /// guarantees. The entry is skipped, never removed.
    PurgeRefCountViolation { series: String, count: i32 },

    /// The lease manager failed while propagating a newly flushed volume.
    LeaseUpdateFailed {
        block_start: Timestamp,
        next_version: i32,
        error: String,
    },

    WarmFlushFailed { block_start: Timestamp, error: String },
    SnapshotFailed { block_start: Timestamp, error: String },
    ColdFlushFailed { block_start: Timestamp, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl ShardEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: ShardEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn ShardEventListener> {
    Arc::new(NoopEventListener)
}

/// Metric names and recording helpers for the shard.
///
/// Recording stays a no-op until a recorder is installed, so hosts that
/// bring their own metrics pipeline see nothing extra. With the
/// `prometheus` feature a process-wide recorder and scrape renderer is
/// available via `PrometheusScraper`.
pub mod shard_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Metric names. The Prometheus exposition suffixes these per kind
    // (`_total` for counters, `_bucket`/`_sum`/`_count` for histograms).

    pub const SHARD_CREATE: &str = "skarda_shard_create";
    pub const SHARD_CLOSE: &str = "skarda_shard_close";
    pub const SHARD_CLOSE_DURATION_SECONDS: &str = "skarda_shard_close_duration_seconds";

    pub const SERIES_TICKED: &str = "skarda_series_ticked";
    pub const PURGE_UNEXPECTED_REF_COUNT: &str = "skarda_purge_unexpected_ref_count";

    pub const INSERT_ASYNC_ERRORS: &str = "skarda_insert_async_errors";

    pub const SNAPSHOT_DURATION_SECONDS: &str = "skarda_snapshot_duration_seconds";
    pub const SNAPSHOT_PREPARE_DURATION_SECONDS: &str = "skarda_snapshot_prepare_duration_seconds";
    pub const FLUSH_DURATION_SECONDS: &str = "skarda_flush_duration_seconds";

    #[inline]
    pub fn record_shard_create() {
        ::metrics::counter!(SHARD_CREATE).increment(1);
    }

    #[inline]
    pub fn record_shard_close(duration: std::time::Duration) {
        ::metrics::counter!(SHARD_CLOSE).increment(1);
        ::metrics::histogram!(SHARD_CLOSE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_series_ticked(n: u64) {
        ::metrics::gauge!(SERIES_TICKED).set(n as f64);
    }

    #[inline]
    pub fn record_purge_unexpected_ref_count() {
        ::metrics::counter!(PURGE_UNEXPECTED_REF_COUNT).increment(1);
    }

    /// `kind` discriminates failures on the insert queue drain: the series
    /// insert itself, the deferred write (internal vs invalid-params), or the
    /// reverse-index batch.
    #[inline]
    pub fn record_insert_async_error(kind: &'static str, n: u64) {
        if n > 0 {
            ::metrics::counter!(INSERT_ASYNC_ERRORS, "error_type" => kind).increment(n);
        }
    }

    pub const INSERT_ERROR_KIND_INSERT: &str = "insert-series";
    pub const INSERT_ERROR_KIND_WRITE_INTERNAL: &str = "write-value-internal";
    pub const INSERT_ERROR_KIND_WRITE_INVALID_PARAMS: &str = "write-value-invalid-params";
    pub const INSERT_ERROR_KIND_INDEX: &str = "reverse-index";

    #[inline]
    pub fn record_snapshot(total: std::time::Duration, prepare: std::time::Duration) {
        ::metrics::histogram!(SNAPSHOT_DURATION_SECONDS).record(total.as_secs_f64());
        ::metrics::histogram!(SNAPSHOT_PREPARE_DURATION_SECONDS).record(prepare.as_secs_f64());
    }

    #[inline]
    pub fn record_flush(duration: std::time::Duration) {
        ::metrics::histogram!(FLUSH_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    fn describe_all() {
        describe_counter!(SHARD_CREATE, Unit::Count, "Shards created in this process.");
        describe_counter!(SHARD_CLOSE, Unit::Count, "Shards closed in this process.");
        describe_counter!(
            PURGE_UNEXPECTED_REF_COUNT,
            Unit::Count,
            "Purge candidates skipped because their reference count dropped below the iteration guarantee."
        );
        describe_counter!(
            INSERT_ASYNC_ERRORS,
            Unit::Count,
            "Failures while draining the shard insert queue, labelled by error_type."
        );

        describe_gauge!(
            SERIES_TICKED,
            Unit::Count,
            "Progress of the currently running shard tick (series visited so far)."
        );

        describe_histogram!(
            SHARD_CLOSE_DURATION_SECONDS,
            Unit::Seconds,
            "Time to close a shard, including the final close-tick."
        );
        describe_histogram!(
            SNAPSHOT_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end shard snapshot time."
        );
        describe_histogram!(
            SNAPSHOT_PREPARE_DURATION_SECONDS,
            Unit::Seconds,
            "Time to prepare the snapshot fileset writer."
        );
        describe_histogram!(
            FLUSH_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end warm flush time per block."
        );
    }

    /// In-process Prometheus scrape surface for the shard metric set.
    ///
    /// No HTTP server and no background maintenance: shards are scraped on
    /// a cadence anyway, so exporter internals are drained on the scrape
    /// path itself, immediately before rendering. Install once per process;
    /// a second install reports the recorder as taken.
    #[cfg(feature = "prometheus")]
    #[derive(Debug, Clone)]
    pub struct PrometheusScraper {
        handle: PrometheusHandle,
    }

    #[cfg(feature = "prometheus")]
    impl PrometheusScraper {
        pub fn install() -> crate::error::Result<Self> {
            describe_all();
            let handle = PrometheusBuilder::new().install_recorder().map_err(|e| match e {
                BuildError::FailedToSetGlobalRecorder(_) => {
                    crate::error::ShardError::invalid_params("metrics recorder already installed")
                }
                other => crate::error::ShardError::internal(format!(
                    "could not install prometheus recorder: {}",
                    other
                )),
            })?;
            Ok(Self { handle })
        }

        /// Renders the Prometheus text exposition format. Runs exporter
        /// upkeep first so histogram buckets stay bounded between scrapes.
        pub fn render(&self) -> String {
            self.handle.run_upkeep();
            self.handle.render()
        }
    }

    #[cfg(not(feature = "prometheus"))]
    #[allow(dead_code)]
    pub(crate) fn describe_for_tests() {
        describe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingListener {
        events: Mutex<Vec<ShardEvent>>,
    }

    impl ShardEventListener for RecordingListener {
        fn on_event(&self, event: ShardEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn listener_receives_events() {
        let listener = Arc::new(RecordingListener::default());
        let dyn_listener: Arc<dyn ShardEventListener> = listener.clone();
        dyn_listener.on_event(ShardEvent::PurgeRefCountViolation {
            series: "cpu".to_string(),
            count: 0,
        });
        let events = listener.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ShardEvent::PurgeRefCountViolation { series, count } => {
                assert_eq!(series, "cpu");
                assert_eq!(*count, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
