//! `ListenWriter`: bind an endpoint, admit clients, broadcast writes.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acceptor::{self, Backoff};
use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::config::ListenWriterConfig;
use crate::endpoint::{Listener, LocalAddr, NetworkKind};
use crate::errors::{ListenWriterError, Result};
use crate::set::ConnectionSet;

/// Lifecycle of a [`ListenWriter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting clients and relaying writes.
    Open,
    /// `close` is in progress.
    Closing,
    /// Endpoint and every connection have been released.
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Broadcast sink backed by a listening socket.
///
/// Every byte written is relayed, unmodified, to each client connected at
/// the time of the write.
pub struct ListenWriter {
    network: NetworkKind,
    local_addr: LocalAddr,
    config: ListenWriterConfig,
    set: Arc<ConnectionSet>,
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
    state: Mutex<LifecycleState>,
    acceptor: Mutex<Option<JoinHandle<Listener>>>,
}

impl ListenWriter {
    /// Bind `address` on `network` with the default configuration and start
    /// accepting clients. Must be called from within a Tokio runtime.
    pub async fn open(network: &str, address: &str) -> Result<Self> {
        Self::open_with_config(network, address, ListenWriterConfig::default()).await
    }

    /// Like [`ListenWriter::open`] with an explicit configuration.
    pub async fn open_with_config(
        network: &str,
        address: &str,
        config: ListenWriterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let network: NetworkKind = network.parse()?;
        let listener = Listener::bind(network, address).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenWriterError::Bind {
                network,
                address: address.to_owned(),
                source,
            })?;

        let set = Arc::new(ConnectionSet::new());
        let shutdown = CancellationToken::new();
        let (backoff_initial, backoff_max) = config.accept_backoff();
        let acceptor = acceptor::spawn(
            listener,
            Arc::clone(&set),
            shutdown.clone(),
            Backoff::new(backoff_initial, backoff_max),
        );
        let broadcaster = Broadcaster::new(
            Arc::clone(&set),
            config.write_timeout(),
            config.max_consecutive_write_errors,
        );

        info!(%network, %local_addr, write_timeout_ms = config.write_timeout_ms, "listen writer open");

        Ok(Self {
            network,
            local_addr,
            config,
            set,
            broadcaster,
            shutdown,
            state: Mutex::new(LifecycleState::Open),
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Transport of the endpoint.
    pub fn network(&self) -> NetworkKind {
        self.network
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> &LocalAddr {
        &self.local_addr
    }

    /// Active configuration.
    pub fn config(&self) -> &ListenWriterConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.set.len().await
    }

    /// Write `payload` to every live connection.
    ///
    /// Returns the total bytes accepted across connections. Timed-out clients
    /// are evicted silently; any other per-connection failure makes the call
    /// return [`ListenWriterError::Write`], which still carries the byte count.
    pub async fn write(&self, payload: &[u8]) -> Result<usize> {
        self.broadcast(payload).await?.into_result()
    }

    /// Like [`ListenWriter::write`] but returns the full per-call report.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<BroadcastReport> {
        self.ensure_open()?;
        Ok(self.broadcaster.broadcast(payload).await)
    }

    /// Relay `reader` until EOF, broadcasting each chunk as it is read.
    ///
    /// Returns the number of bytes read. Stops at the first failed read or
    /// broadcast with [`ListenWriterError::Relay`], which records how many
    /// bytes were relayed before it.
    pub async fn copy_from<R>(&self, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_open()?;
        let mut buf = vec![0u8; self.config.copy_chunk_size];
        let mut total = 0u64;
        loop {
            let step = match reader.read(&mut buf).await {
                Ok(0) => return Ok(total),
                Ok(n) => self.write(&buf[..n]).await.map(|_| n),
                Err(e) => Err(ListenWriterError::Source(e)),
            };
            match step {
                Ok(n) => total += n as u64,
                Err(source) => {
                    return Err(ListenWriterError::Relay {
                        copied: total,
                        source: Box::new(source),
                    });
                }
            }
        }
    }

    /// Stop accepting, close every connection and release the endpoint.
    ///
    /// Only the endpoint's close error is reported; connection closes are
    /// best-effort. Calling this on a writer that is not open returns
    /// [`ListenWriterError::Closed`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Open {
                return Err(ListenWriterError::Closed);
            }
            *state = LifecycleState::Closing;
        }
        info!(network = %self.network, local_addr = %self.local_addr, "closing listen writer");

        self.shutdown.cancel();
        let drained = self.set.drain_and_seal().await;

        let handle = self.acceptor.lock().take();
        let endpoint_result = match handle {
            Some(handle) => match handle.await {
                Ok(listener) => listener.close(),
                Err(e) => Err(io::Error::other(e)),
            },
            None => Ok(()),
        };
        if let Err(e) = &endpoint_result {
            warn!(error = %e, "failed to close listener");
        }

        let closed = drained.len();
        let _ = join_all(drained.iter().map(|conn| conn.close())).await;

        *self.state.lock() = LifecycleState::Closed;
        info!(connections = closed, "listen writer closed");
        endpoint_result.map_err(ListenWriterError::Close)
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.lock() == LifecycleState::Open {
            Ok(())
        } else {
            Err(ListenWriterError::Closed)
        }
    }
}

impl fmt::Debug for ListenWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenWriter")
            .field("network", &self.network)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ListenWriter {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if *self.state.get_mut() != LifecycleState::Open {
            return;
        }
        #[cfg(unix)]
        if let LocalAddr::Unix(path) = &self.local_addr {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "failed to remove socket file on drop");
            }
        }
    }
}
