//! Metric names and recording helpers.
//!
//! Recorded through the `metrics` facade; the embedding process installs
//! whichever exporter it wants.

use metrics::{counter, gauge};

/// Connections admitted by the acceptor (counter).
pub const CONNECTIONS_ACCEPTED_TOTAL: &str = "listenwriter_connections_accepted_total";
/// Currently live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "listenwriter_connections_active";
/// Failed accept calls (counter).
pub const ACCEPT_ERRORS_TOTAL: &str = "listenwriter_accept_errors_total";
/// Connections evicted from the set (counter, labels: reason).
pub const EVICTIONS_TOTAL: &str = "listenwriter_evictions_total";
/// Non-timeout per-connection write failures (counter).
pub const WRITE_ERRORS_TOTAL: &str = "listenwriter_write_errors_total";
/// Bytes accepted across all connections (counter).
pub const BYTES_WRITTEN_TOTAL: &str = "listenwriter_bytes_written_total";

pub(crate) fn record_accepted() {
    counter!(CONNECTIONS_ACCEPTED_TOTAL).increment(1);
}

pub(crate) fn record_accept_error() {
    counter!(ACCEPT_ERRORS_TOTAL).increment(1);
}

pub(crate) fn record_eviction(reason: &'static str) {
    counter!(EVICTIONS_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn record_write_error() {
    counter!(WRITE_ERRORS_TOTAL).increment(1);
}

pub(crate) fn record_bytes_written(bytes: usize) {
    counter!(BYTES_WRITTEN_TOTAL).increment(bytes as u64);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn set_active_connections(count: usize) {
    gauge!(CONNECTIONS_ACTIVE).set(count as f64);
}
