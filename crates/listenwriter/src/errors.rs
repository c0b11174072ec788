//! Error types for the listen writer and its configuration.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::connection::{Connection, ConnectionId};
use crate::endpoint::NetworkKind;

/// Errors surfaced by [`ListenWriter`](crate::ListenWriter) operations.
#[derive(Debug, Error)]
pub enum ListenWriterError {
    /// The listening endpoint could not be bound.
    #[error("failed to bind {network} listener on {address}: {source}")]
    Bind {
        /// Transport that was requested.
        network: NetworkKind,
        /// Address as given by the caller.
        address: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The network kind string is not recognised (or not available on this target).
    #[error("unsupported network kind: {0}")]
    UnsupportedNetwork(String),
    /// The address could not be resolved for the requested network kind.
    #[error("invalid {network} address {address:?}: {reason}")]
    InvalidAddress {
        /// Transport that was requested.
        network: NetworkKind,
        /// Address as given by the caller.
        address: String,
        /// Why the address was rejected.
        reason: String,
    },
    /// One or more connections failed a broadcast with a non-timeout error.
    #[error("{failures}")]
    Write {
        /// Bytes accepted across all connections during the failed call.
        written: usize,
        /// Per-connection failures.
        failures: WriteErrors,
    },
    /// Reading from a source stream failed while relaying it.
    #[error("failed to read from source: {0}")]
    Source(#[source] io::Error),
    /// Relaying a source stream stopped part-way.
    #[error("relay stopped after {copied} bytes: {source}")]
    Relay {
        /// Bytes read from the source and broadcast before the failure.
        copied: u64,
        /// What stopped the relay.
        #[source]
        source: Box<ListenWriterError>,
    },
    /// Closing the listening endpoint failed.
    #[error("failed to close listener: {0}")]
    Close(#[source] io::Error),
    /// The writer has been closed.
    #[error("listen writer is closed")]
    Closed,
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for listen writer operations.
pub type Result<T> = std::result::Result<T, ListenWriterError>;

/// A single connection's failed write.
#[derive(Debug)]
pub struct WriteFailure {
    /// Connection that failed.
    pub conn_id: ConnectionId,
    /// Peer address of the connection.
    pub peer: String,
    /// The I/O error reported by the write.
    pub error: io::Error,
}

impl WriteFailure {
    pub(crate) fn new(conn: &Connection, error: io::Error) -> Self {
        Self {
            conn_id: conn.id().clone(),
            peer: conn.peer().to_owned(),
            error,
        }
    }
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.conn_id, self.peer, self.error)
    }
}

/// Failures collected during one broadcast, displayed one per line.
#[derive(Debug, Default)]
pub struct WriteErrors(Vec<WriteFailure>);

impl WriteErrors {
    pub(crate) fn push(&mut self, failure: WriteFailure) {
        self.0.push(failure);
    }

    /// Number of failed connections.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no connection failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the individual failures.
    pub fn iter(&self) -> impl Iterator<Item = &WriteFailure> {
        self.0.iter()
    }
}

impl fmt::Display for WriteErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid (e.g., zero timeout).
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str, peer: &str, msg: &str) -> WriteFailure {
        WriteFailure {
            conn_id: ConnectionId::from(id),
            peer: peer.into(),
            error: io::Error::new(io::ErrorKind::BrokenPipe, msg.to_owned()),
        }
    }

    #[test]
    fn write_errors_join_with_newlines() {
        let mut errors = WriteErrors::default();
        errors.push(failure("conn_a", "127.0.0.1:1", "broken pipe"));
        errors.push(failure("conn_b", "127.0.0.1:2", "reset"));

        assert_eq!(
            errors.to_string(),
            "conn_a (127.0.0.1:1): broken pipe\nconn_b (127.0.0.1:2): reset"
        );
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn empty_write_errors_display_nothing() {
        let errors = WriteErrors::default();
        assert!(errors.is_empty());
        assert_eq!(errors.to_string(), "");
    }

    #[test]
    fn write_error_displays_failures() {
        let mut failures = WriteErrors::default();
        failures.push(failure("conn_a", "peer", "boom"));
        let err = ListenWriterError::Write {
            written: 3,
            failures,
        };
        assert_eq!(err.to_string(), "conn_a (peer): boom");
    }

    #[test]
    fn bind_error_display() {
        let err = ListenWriterError::Bind {
            network: NetworkKind::Tcp,
            address: "127.0.0.1:80".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind tcp listener on 127.0.0.1:80: denied"
        );
    }

    #[test]
    fn closed_display() {
        assert_eq!(ListenWriterError::Closed.to_string(), "listen writer is closed");
    }

    #[test]
    fn relay_error_reports_progress_and_cause() {
        let err = ListenWriterError::Relay {
            copied: 42,
            source: Box::new(ListenWriterError::Closed),
        };
        assert_eq!(err.to_string(), "relay stopped after 42 bytes: listen writer is closed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn config_error_converts() {
        let err: ListenWriterError = ConfigError::InvalidValue("bad".into()).into();
        assert!(matches!(err, ListenWriterError::Config(_)));
        assert_eq!(err.to_string(), "invalid config value: bad");
    }

    #[test]
    fn json_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: ConfigError = json_err.into();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
