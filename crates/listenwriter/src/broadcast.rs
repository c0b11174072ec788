//! Payload fan-out to every live connection.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::connection::{Connection, WriteOutcome};
use crate::errors::{ListenWriterError, Result, WriteErrors, WriteFailure};
use crate::metrics;
use crate::set::ConnectionSet;

/// Why a connection was dropped from the set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// A write did not finish before the deadline.
    Timeout,
    /// Too many consecutive non-timeout write failures.
    RepeatedErrors,
}

impl EvictionReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RepeatedErrors => "repeated_errors",
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Bytes accepted across all recipients, including partial writes.
    pub bytes_written: usize,
    /// Connections that were live when the broadcast started.
    pub recipients: usize,
    /// Connections removed by this broadcast.
    pub evicted: usize,
    /// Non-timeout failures, one per failing connection.
    pub failures: WriteErrors,
}

impl BroadcastReport {
    /// Collapse into the writer-level result: the byte count on success,
    /// or every failure joined into one error.
    pub fn into_result(self) -> Result<usize> {
        if self.failures.is_empty() {
            Ok(self.bytes_written)
        } else {
            Err(ListenWriterError::Write {
                written: self.bytes_written,
                failures: self.failures,
            })
        }
    }
}

/// Writes payloads to the members of a [`ConnectionSet`].
pub struct Broadcaster {
    set: Arc<ConnectionSet>,
    write_timeout: Duration,
    max_consecutive_errors: Option<u32>,
}

impl Broadcaster {
    /// Create a broadcaster over `set`.
    pub fn new(
        set: Arc<ConnectionSet>,
        write_timeout: Duration,
        max_consecutive_errors: Option<u32>,
    ) -> Self {
        Self {
            set,
            write_timeout,
            max_consecutive_errors,
        }
    }

    /// Deliver `payload` to every connection live at call time.
    ///
    /// Writes run concurrently, each bounded by the write timeout. Timed-out
    /// connections are evicted and closed; other failures are reported and
    /// the connection stays unless the consecutive-error limit is reached.
    pub async fn broadcast(&self, payload: &[u8]) -> BroadcastReport {
        let recipients = self.set.snapshot().await;
        let outcomes = join_all(
            recipients
                .iter()
                .map(|conn| conn.write(payload, self.write_timeout)),
        )
        .await;

        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..BroadcastReport::default()
        };

        for (conn, outcome) in recipients.iter().zip(outcomes) {
            match outcome {
                WriteOutcome::Delivered(n) => report.bytes_written += n,
                WriteOutcome::Failed { written, error } => {
                    report.bytes_written += written;
                    metrics::record_write_error();
                    warn!(conn_id = %conn.id(), peer = %conn.peer(), error = %error, "write to client failed");
                    report.failures.push(WriteFailure::new(conn, error));

                    let limit_reached = self
                        .max_consecutive_errors
                        .is_some_and(|limit| conn.consecutive_errors() >= limit);
                    if limit_reached && self.evict(conn, EvictionReason::RepeatedErrors).await {
                        report.evicted += 1;
                    }
                }
                WriteOutcome::TimedOut => {
                    if self.evict(conn, EvictionReason::Timeout).await {
                        report.evicted += 1;
                    }
                }
                // Closed by shutdown or evicted by an overlapping broadcast.
                WriteOutcome::Closed => {}
            }
        }

        metrics::record_bytes_written(report.bytes_written);
        debug!(
            bytes = payload.len(),
            recipients = report.recipients,
            written = report.bytes_written,
            evicted = report.evicted,
            failed = report.failures.len(),
            "broadcast complete"
        );
        report
    }

    /// Remove and close `conn`. Returns whether this call removed it.
    async fn evict(&self, conn: &Arc<Connection>, reason: EvictionReason) -> bool {
        let removed = self.set.remove(conn.id()).await.is_some();
        conn.close().await;
        if removed {
            metrics::record_eviction(reason.as_str());
            warn!(
                conn_id = %conn.id(),
                peer = %conn.peer(),
                reason = reason.as_str(),
                age_ms = u64::try_from(conn.age().as_millis()).unwrap_or(u64::MAX),
                "evicted client"
            );
        }
        removed
    }
}
