//! Listening endpoints and the client streams they produce.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::debug;

use crate::errors::{ListenWriterError, Result};

/// Write side of an accepted client stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport used by the listening endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkKind {
    /// TCP over whichever family the address resolves to.
    Tcp,
    /// TCP restricted to IPv4.
    Tcp4,
    /// TCP restricted to IPv6.
    Tcp6,
    /// Unix domain stream socket bound to a filesystem path.
    Unix,
}

impl NetworkKind {
    /// Canonical lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
            Self::Tcp | Self::Unix => true,
        }
    }

    /// Addresses tried, in order, when the address is just `:port`.
    ///
    /// Plain `tcp` prefers the IPv6 wildcard, which also admits IPv4 clients
    /// on dual-stack hosts, and falls back to `0.0.0.0` without IPv6.
    fn wildcard_addrs(self, port: u16) -> Vec<SocketAddr> {
        let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        match self {
            Self::Tcp4 => vec![v4],
            Self::Tcp6 => vec![v6],
            Self::Tcp | Self::Unix => vec![v6, v4],
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkKind {
    type Err = ListenWriterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            #[cfg(unix)]
            "unix" => Ok(Self::Unix),
            _ => Err(ListenWriterError::UnsupportedNetwork(s.to_owned())),
        }
    }
}

/// Address the endpoint is actually bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalAddr {
    /// Bound TCP socket address (with the assigned port when `0` was requested).
    Tcp(SocketAddr),
    /// Filesystem path of a unix socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl LocalAddr {
    /// The TCP socket address, if this is a TCP endpoint.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A bound listening endpoint.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// Bind a new endpoint for `network` on `address`.
    pub(crate) async fn bind(network: NetworkKind, address: &str) -> Result<Self> {
        match network {
            NetworkKind::Tcp | NetworkKind::Tcp4 | NetworkKind::Tcp6 => {
                bind_tcp(network, address).await
            }
            #[cfg(unix)]
            NetworkKind::Unix => {
                let path = PathBuf::from(address);
                let listener = UnixListener::bind(&path).map_err(|source| {
                    ListenWriterError::Bind {
                        network,
                        address: address.to_owned(),
                        source,
                    }
                })?;
                Ok(Self::Unix { listener, path })
            }
            #[cfg(not(unix))]
            NetworkKind::Unix => Err(ListenWriterError::UnsupportedNetwork(
                network.as_str().to_owned(),
            )),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<LocalAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(LocalAddr::Tcp),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(LocalAddr::Unix(path.clone())),
        }
    }

    /// Wait for the next client. Returns its writer and a printable peer address.
    pub(crate) async fn accept(&self) -> io::Result<(BoxedWriter, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map_or_else(|| "unix:unnamed".to_owned(), |p| p.display().to_string());
                Ok((Box::new(stream), peer))
            }
        }
    }

    /// Release the endpoint. Unix endpoints also remove their socket file.
    pub(crate) fn close(self) -> io::Result<()> {
        match self {
            Self::Tcp(listener) => {
                drop(listener);
                Ok(())
            }
            #[cfg(unix)]
            Self::Unix { listener, path } => {
                drop(listener);
                std::fs::remove_file(&path)
            }
        }
    }
}

async fn bind_tcp(network: NetworkKind, address: &str) -> Result<Listener> {
    let invalid = |reason: String| ListenWriterError::InvalidAddress {
        network,
        address: address.to_owned(),
        reason,
    };

    let candidates: Vec<SocketAddr> = if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| invalid(format!("bad port: {e}")))?;
        network.wildcard_addrs(port)
    } else {
        tokio::net::lookup_host(address)
            .await
            .map_err(|e| invalid(e.to_string()))?
            .filter(|addr| network.accepts(addr))
            .collect()
    };
    if candidates.is_empty() {
        return Err(invalid(format!("no {network} address found")));
    }

    let mut last_error = None;
    for candidate in candidates {
        match TcpListener::bind(candidate).await {
            Ok(listener) => {
                debug!(%network, %candidate, "bound tcp listener");
                return Ok(Listener::Tcp(listener));
            }
            Err(e) => {
                debug!(%network, %candidate, error = %e, "bind attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(ListenWriterError::Bind {
        network,
        address: address.to_owned(),
        source: last_error.unwrap_or_else(|| io::Error::other("no candidate address")),
    })
}
