//! Background task that admits new clients into the connection set.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::endpoint::{BoxedWriter, Listener};
use crate::metrics;
use crate::set::ConnectionSet;

/// Exponential delay between failed accepts, reset by a successful one.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = self
            .current
            .map_or(self.initial, |d| d.saturating_mul(2))
            .min(self.max);
        self.current = Some(next);
        next
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Source of new client streams.
pub(crate) trait Accept {
    /// Wait for the next client: its writer and a printable peer address.
    fn accept(&self) -> impl Future<Output = io::Result<(BoxedWriter, String)>> + Send;
}

impl Accept for Listener {
    fn accept(&self) -> impl Future<Output = io::Result<(BoxedWriter, String)>> + Send {
        Listener::accept(self)
    }
}

/// Spawn the accept loop. The task hands the listener back when it stops so
/// the caller can release the endpoint.
pub(crate) fn spawn<L>(
    listener: L,
    set: Arc<ConnectionSet>,
    shutdown: CancellationToken,
    backoff: Backoff,
) -> JoinHandle<L>
where
    L: Accept + Send + Sync + 'static,
{
    tokio::spawn(run(listener, set, shutdown, backoff))
}

async fn run<L: Accept>(
    listener: L,
    set: Arc<ConnectionSet>,
    shutdown: CancellationToken,
    mut backoff: Backoff,
) -> L {
    let mut consecutive_failures: u64 = 0;

    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((writer, peer)) => {
                consecutive_failures = 0;
                backoff.reset();

                let conn = Arc::new(Connection::new(peer, writer, shutdown.child_token()));
                let conn_id = conn.id().clone();
                let peer = conn.peer().to_owned();
                match set.insert(conn).await {
                    Ok(()) => {
                        metrics::record_accepted();
                        debug!(%conn_id, %peer, "client connected");
                    }
                    Err(rejected) => {
                        rejected.close().await;
                        break;
                    }
                }
            }
            Err(error) => {
                consecutive_failures += 1;
                let delay = backoff.next_delay();
                metrics::record_accept_error();
                warn!(
                    error = %error,
                    consecutive_failures,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "accept failed"
                );
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("acceptor stopped");
    listener
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::net::TcpStream;

    use super::*;
    use crate::endpoint::NetworkKind;

    type Accepted = io::Result<(BoxedWriter, String)>;

    /// Hands out queued results, then waits forever.
    #[derive(Clone, Default)]
    struct ScriptedAccept {
        queue: Arc<parking_lot::Mutex<VecDeque<Accepted>>>,
    }

    impl ScriptedAccept {
        fn push_failures(&self, n: usize) {
            let mut queue = self.queue.lock();
            for _ in 0..n {
                queue.push_back(Err(io::Error::other("too many open files")));
            }
        }

        fn push_client(&self, peer: &str) {
            let (client, _server) = duplex(64);
            self.queue
                .lock()
                .push_back(Ok((Box::new(client), peer.to_owned())));
        }

        fn is_drained(&self) -> bool {
            self.queue.lock().is_empty()
        }
    }

    impl Accept for ScriptedAccept {
        fn accept(&self) -> impl Future<Output = Accepted> + Send {
            let queue = Arc::clone(&self.queue);
            async move {
                let next = queue.lock().pop_front();
                match next {
                    Some(accepted) => accepted,
                    None => std::future::pending().await,
                }
            }
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(30));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(30));
        assert_eq!(backoff.next_delay(), Duration::from_millis(30));
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    async fn start() -> (
        std::net::SocketAddr,
        Arc<ConnectionSet>,
        CancellationToken,
        JoinHandle<Listener>,
    ) {
        let listener = Listener::bind(NetworkKind::Tcp, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().as_socket_addr().unwrap();
        let set = Arc::new(ConnectionSet::new());
        let shutdown = CancellationToken::new();
        let handle = spawn(
            listener,
            Arc::clone(&set),
            shutdown.clone(),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(10)),
        );
        (addr, set, shutdown, handle)
    }

    async fn wait_for_len(set: &ConnectionSet, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while set.len().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection set never reached expected size");
    }

    #[tokio::test]
    async fn admits_connecting_clients() {
        let (addr, set, shutdown, handle) = start().await;

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_for_len(&set, 2).await;

        shutdown.cancel();
        let listener = handle.await.unwrap();
        listener.close().unwrap();
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let (addr, set, shutdown, handle) = start().await;
        shutdown.cancel();
        let listener = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        listener.close().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
        assert!(set.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_accepting_after_failures() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _local = ::metrics::set_default_local_recorder(&recorder);

        let source = ScriptedAccept::default();
        source.push_failures(3);
        source.push_client("after-failures");

        let set = Arc::new(ConnectionSet::new());
        let shutdown = CancellationToken::new();
        let task = spawn(
            source.clone(),
            Arc::clone(&set),
            shutdown.clone(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(50)),
        );

        wait_for_len(&set, 1).await;
        let admitted = set.snapshot().await;
        assert_eq!(admitted[0].peer(), "after-failures");
        assert!(source.is_drained());

        shutdown.cancel();
        let _ = task.await.unwrap();

        let output = handle.render();
        assert!(output.contains("listenwriter_accept_errors_total 3"));
        assert!(output.contains("listenwriter_connections_accepted_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let source = ScriptedAccept::default();
        source.push_failures(1);

        let set = Arc::new(ConnectionSet::new());
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let task = spawn(
            source.clone(),
            Arc::clone(&set),
            shutdown.clone(),
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
        );

        while !source.is_drained() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        let _ = task.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn sealed_set_rejects_and_closes_late_client() {
        let (addr, set, _shutdown, handle) = start().await;
        let _ = set.drain_and_seal().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let listener = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        listener.close().unwrap();

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(set.is_empty().await);
    }
}
