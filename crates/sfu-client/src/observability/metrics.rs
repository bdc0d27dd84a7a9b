//! Metrics definitions for the SFU client.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_client_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `outcome`: bounded by `ClientError::metric_label` plus `success`
//! - `kind`: audio, video
//! - `state`: bounded by `SessionState`
//! - `event`: newProducer, producerClosed

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a finished join attempt.
///
/// Metrics: `sfu_client_joins_total`, `sfu_client_join_duration_seconds`
/// Labels: `outcome`
pub fn record_join(outcome: &str, duration: Duration) {
    counter!("sfu_client_joins_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("sfu_client_join_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record one produce attempt.
///
/// Metric: `sfu_client_produce_total`
/// Labels: `outcome` (success, failed, skipped), `kind`
pub fn record_produce(outcome: &str, kind: &str) {
    counter!(
        "sfu_client_produce_total",
        "outcome" => outcome.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record one consume attempt.
///
/// Metric: `sfu_client_consume_total`
/// Labels: `outcome` (subscribed, duplicate, filtered, discarded, failed)
pub fn record_consume(outcome: &str) {
    counter!("sfu_client_consume_total", "outcome" => outcome.to_string()).increment(1);
}

/// Set the number of remote peers with at least one subscribed track.
///
/// Metric: `sfu_client_peer_streams_active`
pub fn set_peer_streams_active(count: usize) {
    // usize to f64 conversion is safe for realistic room sizes (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_client_peer_streams_active").set(count as f64);
}

/// Record a session teardown and the state it started from.
///
/// Metric: `sfu_client_teardowns_total`
/// Labels: `state`
pub fn record_teardown(state: &str) {
    counter!("sfu_client_teardowns_total", "state" => state.to_string()).increment(1);
}

/// Record a decoded push event.
///
/// Metric: `sfu_client_push_events_total`
/// Labels: `event`
pub fn record_push_event(event: &str) {
    counter!("sfu_client_push_events_total", "event" => event.to_string()).increment(1);
}
