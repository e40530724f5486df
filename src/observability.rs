use std::net::SocketAddr;

use crate::engine::Outcome;

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: entries classified. Labels: outcome.
pub const ENTRIES_TOTAL: &str = "staysync_entries_total";

/// Counter: active records retired as Removed.
pub const REMOVED_TOTAL: &str = "staysync_removed_total";

/// Counter: absent records the removal scan kept. Labels: reason.
pub const REMOVAL_SKIPPED_TOTAL: &str = "staysync_removal_skipped_total";

/// Histogram: wall time of one reconciliation run in seconds.
pub const RUN_DURATION_SECONDS: &str = "staysync_run_duration_seconds";

// ── Feeds ───────────────────────────────────────────────────────

/// Counter: rows/events dropped by the parser. Labels: reason.
pub const FEED_ROWS_SKIPPED_TOTAL: &str = "staysync_feed_rows_skipped_total";

/// Counter: feeds rejected as a whole.
pub const FEEDS_FAILED_TOTAL: &str = "staysync_feeds_failed_total";

// ── Record store ────────────────────────────────────────────────

/// Counter: throttled store calls that were retried.
pub const STORE_RETRIES_TOTAL: &str = "staysync_store_retries_total";

/// Counter: write batches dropped after a non-throttle failure.
pub const STORE_BATCHES_FAILED_TOTAL: &str = "staysync_store_batches_failed_total";

/// Histogram: records per store write batch.
pub const STORE_FLUSH_BATCH_SIZE: &str = "staysync_store_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an Outcome to a short label for metrics.
pub fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::New => "new",
        Outcome::Modified => "modified",
        Outcome::Unchanged => "unchanged",
        Outcome::DuplicateIgnored => "duplicate_ignored",
    }
}
