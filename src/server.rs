//! TCP acceptor.
//!
//! Owns the listening socket, hands every accepted connection to the
//! [`WorkerManager`] and returns once shutdown is requested and in-flight
//! workers have been dealt with according to the shutdown policy.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ShutdownPolicy};
use crate::handler::HandlerSettings;
use crate::shutdown::Shutdown;
use crate::worker::{Reaper, WorkerManager};

/// Fatal startup errors.
#[derive(Debug)]
pub enum ServerError {
    Socket(io::Error),
    SocketOption(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "socket creation failed: {e}"),
            ServerError::SocketOption(e) => write!(f, "setting socket options failed: {e}"),
            ServerError::Bind(addr, e) => write!(f, "bind to {addr} failed: {e}"),
            ServerError::Listen(addr, e) => write!(f, "listen on {addr} failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket(e)
            | ServerError::SocketOption(e)
            | ServerError::Bind(_, e)
            | ServerError::Listen(_, e) => Some(e),
        }
    }
}

/// Source of accepted connections for the accept loop.
trait Accept {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    workers: WorkerManager,
    reaper: Reaper,
    /// Present when `max_workers` is configured.
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let listener = create_listener(config.listen, config.backlog)?;
        let (workers, reaper) = WorkerManager::new(HandlerSettings::from_config(&config));
        let connection_limit = config.max_workers.map(|n| Arc::new(Semaphore::new(n)));

        Ok(Server {
            config,
            listener,
            workers,
            reaper,
            connection_limit,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the worker registry, for inspection.
    #[cfg(test)]
    pub fn workers(&self) -> WorkerManager {
        self.workers.clone()
    }

    /// Accept connections until `shutdown` is requested.
    ///
    /// The listener is closed as soon as the accept loop exits; this then
    /// returns once every worker has been reaped.
    pub async fn run(self, shutdown: Shutdown) {
        let Server {
            config,
            listener,
            workers,
            reaper,
            connection_limit,
        } = self;

        let reaper_task = tokio::spawn(reaper.run());

        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, backlog = config.backlog, "Server listening"),
            Err(e) => warn!(error = %e, "Server listening on unknown address"),
        }

        accept_loop(&listener, &workers, connection_limit.as_ref(), &shutdown).await;

        drop(listener);
        workers.close();
        info!(outstanding = workers.outstanding(), "Stopped accepting connections");

        drain(&workers, config.shutdown_policy, config.drain_timeout).await;

        reaper_task.abort();
        info!("Shutdown complete");
    }
}

/// Accept until shutdown. Accept errors never end the loop unless shutdown
/// was requested meanwhile.
async fn accept_loop<L: Accept>(
    listener: &L,
    workers: &WorkerManager,
    connection_limit: Option<&Arc<Semaphore>>,
    shutdown: &Shutdown,
) {
    loop {
        // Wait for a connection slot; meanwhile clients queue in the backlog.
        let permit = match connection_limit {
            Some(limit) => tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                permit = Arc::clone(limit).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
            },
            None => None,
        };

        tokio::select! {
            biased;
            _ = shutdown.wait() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => dispatch(workers, stream, peer, permit),
                Err(e) => {
                    if shutdown.is_requested() {
                        return;
                    }
                    if is_transient(&e) {
                        warn!(error = %e, "Transient accept failure");
                    } else {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            },
        }
    }
}

fn dispatch<S>(
    workers: &WorkerManager,
    stream: S,
    peer: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(peer = %peer, "Client connected");

    match workers.spawn(stream, peer, permit) {
        Ok(id) => debug!(peer = %peer, worker = %id, "Worker spawned"),
        Err(e) => warn!(peer = %peer, error = %e, "Failed to spawn worker, connection closed"),
    }
}

/// Apply the shutdown policy, then wait until every worker is reaped.
async fn drain(workers: &WorkerManager, policy: ShutdownPolicy, timeout: Option<Duration>) {
    match policy {
        ShutdownPolicy::Abort => {
            let aborted = workers.abort_all();
            if aborted > 0 {
                info!(aborted, "Aborting in-flight connections");
            }
        }
        ShutdownPolicy::Drain => {
            let outstanding = workers.outstanding();
            if outstanding > 0 {
                info!(outstanding, timeout = ?timeout, "Waiting for in-flight connections");
            }

            if let Some(limit) = timeout {
                if tokio::time::timeout(limit, workers.wait_idle()).await.is_err() {
                    let aborted = workers.abort_all();
                    warn!(aborted, "Drain timeout elapsed, aborting remaining connections");
                }
            }
        }
    }

    workers.wait_idle().await;
}

/// Accept errors caused by a single connection attempt or momentary
/// resource exhaustion.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        if let Some(code) = e.raw_os_error() {
            return matches!(
                code,
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO
            );
        }
    }

    false
}

/// Create the listening socket with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(ServerError::SocketOption)?;
    socket
        .set_nonblocking(true)
        .map_err(ServerError::SocketOption)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(|e| ServerError::Listen(addr, e))?;

    TcpListener::from_std(socket.into()).map_err(|e| ServerError::Listen(addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    const ACK: &[u8] = b"Message received.\n";
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            drain_timeout: Some(TIMEOUT),
            ..Config::default()
        }
    }

    struct Running {
        addr: SocketAddr,
        workers: WorkerManager,
        shutdown: Shutdown,
        task: JoinHandle<()>,
    }

    fn start(config: Config) -> Running {
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let workers = server.workers();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        Running {
            addr,
            workers,
            shutdown,
            task,
        }
    }

    async fn ping(client: &mut TcpStream) {
        client.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; ACK.len()];
        tokio::time::timeout(TIMEOUT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], ACK);
    }

    async fn wait_idle(workers: &WorkerManager) {
        tokio::time::timeout(TIMEOUT, workers.wait_idle())
            .await
            .expect("workers were not reaped");
    }

    async fn wait_refused(addr: SocketAddr) {
        tokio::time::timeout(TIMEOUT, async {
            while TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener still accepting");
    }

    #[tokio::test]
    async fn test_ping_scenario() {
        let server = start(test_config());

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut client).await;
        assert_eq!(server.workers.outstanding(), 1);

        drop(client);
        wait_idle(&server.workers).await;
        assert_eq!(server.workers.outstanding(), 0);

        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_client_does_not_affect_others() {
        let server = start(test_config());

        let mut healthy = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(server.addr).await.unwrap();
            ping(&mut client).await;
            healthy.push(client);
        }

        let mut failing = TcpStream::connect(server.addr).await.unwrap();
        failing.write_all(b"half a mess").await.unwrap();
        drop(failing);

        for _ in 0..3 {
            for client in healthy.iter_mut() {
                ping(client).await;
            }
        }

        drop(healthy);
        wait_idle(&server.workers).await;
        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_leaked_workers() {
        let server = start(test_config());

        for _ in 0..25 {
            let mut client = TcpStream::connect(server.addr).await.unwrap();
            ping(&mut client).await;
        }

        wait_idle(&server.workers).await;
        assert_eq!(server.workers.outstanding(), 0);

        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight() {
        let server = start(test_config());

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut client).await;

        assert!(server.shutdown.request());
        wait_refused(server.addr).await;

        // The existing connection keeps being served.
        ping(&mut client).await;
        assert!(!server.task.is_finished());

        drop(client);
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
        assert_eq!(server.workers.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight() {
        let config = Config {
            shutdown_policy: ShutdownPolicy::Abort,
            ..test_config()
        };
        let server = start(config);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut client).await;

        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
        assert_eq!(server.workers.outstanding(), 0);

        let mut buf = [0u8; 16];
        let closed = matches!(client.read(&mut buf).await, Ok(0) | Err(_));
        assert!(closed);
    }

    #[tokio::test]
    async fn test_drain_timeout_aborts_stragglers() {
        let config = Config {
            drain_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let server = start(config);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut client).await;

        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
        assert_eq!(server.workers.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_backlog_overflow_while_not_accepting() {
        let config = Config {
            max_workers: Some(1),
            ..test_config()
        };
        let server = start(config);

        // The only slot is taken, so the acceptor stops calling accept and
        // every further client lands in (or overflows) the backlog.
        let mut served = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut served).await;

        let mut pending = Vec::new();
        for _ in 0..30 {
            let connect = TcpStream::connect(server.addr);
            if let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(100), connect).await {
                pending.push(stream);
            }
        }
        assert!(!pending.is_empty());
        assert_eq!(server.workers.outstanding(), 1);

        drop(pending);
        drop(served);

        // Queued connections are drained and a new client is still served.
        let mut fresh = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut fresh).await;
        drop(fresh);

        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
        assert_eq!(server.workers.outstanding(), 0);
    }

    /// Hands out scripted accept results, then never completes.
    struct ScriptedAcceptor {
        results: Mutex<VecDeque<io::Result<(DuplexStream, SocketAddr)>>>,
    }

    impl Accept for ScriptedAcceptor {
        type Stream = DuplexStream;

        fn accept(&self) -> impl Future<Output = io::Result<(DuplexStream, SocketAddr)>> + Send {
            let next = self.results.lock().unwrap().pop_front();
            async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_loop() {
        let (mut client, server_end) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let acceptor = ScriptedAcceptor {
            results: Mutex::new(VecDeque::from([
                Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                Err(io::Error::from(io::ErrorKind::Interrupted)),
                Err(io::Error::from(io::ErrorKind::PermissionDenied)),
                Ok((server_end, peer)),
            ])),
        };

        let (workers, reaper) = WorkerManager::new(HandlerSettings::from_config(&test_config()));
        let reaper_task = tokio::spawn(reaper.run());
        let shutdown = Shutdown::new();
        let accepting = {
            let workers = workers.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { accept_loop(&acceptor, &workers, None, &shutdown).await })
        };

        // The connection behind three failed accepts is still served.
        client.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; ACK.len()];
        tokio::time::timeout(TIMEOUT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], ACK);
        assert_eq!(workers.outstanding(), 1);

        shutdown.request();
        tokio::time::timeout(TIMEOUT, accepting).await.unwrap().unwrap();

        drop(client);
        wait_idle(&workers).await;
        reaper_task.abort();
    }

    #[tokio::test]
    async fn test_max_workers_defers_accept() {
        let config = Config {
            max_workers: Some(1),
            ..test_config()
        };
        let server = start(config);

        let mut first = TcpStream::connect(server.addr).await.unwrap();
        ping(&mut first).await;

        // The second client completes the handshake in the backlog but is not
        // served until the first one leaves.
        let mut second = TcpStream::connect(server.addr).await.unwrap();
        second.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; ACK.len()];
        let early = tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut buf)).await;
        assert!(early.is_err());
        assert_eq!(server.workers.outstanding(), 1);

        drop(first);
        tokio::time::timeout(TIMEOUT, second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], ACK);

        drop(second);
        server.shutdown.request();
        tokio::time::timeout(TIMEOUT, server.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Server::bind(test_config()).unwrap();
        let config = Config {
            listen: first.local_addr().unwrap(),
            ..test_config()
        };

        assert!(matches!(Server::bind(config), Err(ServerError::Bind(_, _))));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));

        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
    }
}
