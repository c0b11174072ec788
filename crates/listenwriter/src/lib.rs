//! # listenwriter
//!
//! A broadcast sink: bytes written on one side are relayed, verbatim, to
//! every client connected to a listening socket on the other.
//!
//! - Endpoint binding for `tcp`, `tcp4`, `tcp6` and `unix` networks
//! - Background acceptor with bounded backoff on accept failures
//! - Concurrent fan-out with a per-connection write deadline; clients that
//!   miss it are evicted
//! - Explicit `Open → Closing → Closed` lifecycle; writes after close fail

#![deny(unsafe_code)]

mod acceptor;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod errors;
pub mod metrics;
pub mod set;
mod writer;

pub use broadcast::{BroadcastReport, Broadcaster, EvictionReason};
pub use config::{ListenWriterConfig, load_config_from_path};
pub use connection::{Connection, ConnectionId, WriteOutcome};
pub use endpoint::{LocalAddr, NetworkKind};
pub use errors::{ConfigError, ListenWriterError, Result, WriteErrors, WriteFailure};
pub use set::ConnectionSet;
pub use writer::{LifecycleState, ListenWriter};
