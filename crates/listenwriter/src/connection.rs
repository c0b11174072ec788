//! A single admitted client and its bounded write path.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::endpoint::BoxedWriter;

/// How long `close` waits for the stream shutdown before dropping it.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Unique connection identifier, used for logs and error reports.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of writing one payload to one connection.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The full payload was written and flushed.
    Delivered(usize),
    /// The write failed with a non-timeout error after `written` bytes.
    Failed {
        /// Bytes accepted before the error.
        written: usize,
        /// The I/O error.
        error: io::Error,
    },
    /// The write did not finish before the deadline.
    TimedOut,
    /// The connection was closed before or during the write.
    Closed,
}

/// An admitted client connection.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    /// `None` once the connection has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    cancel: CancellationToken,
    connected_at: Instant,
    bytes_written: AtomicU64,
    consecutive_errors: AtomicU32,
}

impl Connection {
    /// Wrap an accepted stream. Cancelling `cancel` closes the connection's
    /// in-flight and future writes.
    pub fn new(peer: String, writer: BoxedWriter, cancel: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            writer: Mutex::new(Some(writer)),
            cancel,
            connected_at: Instant::now(),
            bytes_written: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Printable peer address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Time since the connection was admitted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Total bytes accepted by this connection.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Non-timeout write failures since the last successful write.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Whether `close` has been called (or the parent token cancelled).
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write `payload` in full, bounded by `deadline`.
    ///
    /// Writes to the same connection are serialised. Closing the connection
    /// makes a pending write return [`WriteOutcome::Closed`] immediately.
    pub async fn write(&self, payload: &[u8], deadline: Duration) -> WriteOutcome {
        let mut guard = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return WriteOutcome::Closed,
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return WriteOutcome::Closed;
        };

        let mut written = 0;
        let bounded = tokio::time::timeout(deadline, write_counted(writer, payload, &mut written));
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = bounded => Some(result),
        };

        let _ = self
            .bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);

        match result {
            None => WriteOutcome::Closed,
            Some(Err(_elapsed)) => WriteOutcome::TimedOut,
            Some(Ok(Ok(()))) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                WriteOutcome::Delivered(written)
            }
            Some(Ok(Err(error))) => {
                let _ = self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                WriteOutcome::Failed { written, error }
            }
        }
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn_id = %self.id, error = %e, "stream shutdown failed"),
            Err(_) => debug!(conn_id = %self.id, "stream shutdown timed out"),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn write_counted(
    writer: &mut BoxedWriter,
    payload: &[u8],
    written: &mut usize,
) -> io::Result<()> {
    while *written < payload.len() {
        let n = writer.write(&payload[*written..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        *written += n;
    }
    writer.flush().await
}
