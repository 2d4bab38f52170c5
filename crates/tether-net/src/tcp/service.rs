//! Dual-mode TCP service: a listening server or an outbound client.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tether_core::logging::targets;
use tether_core::{CancellationToken, PoolConfig, PoolError, ShutdownPolicy, WorkerPool, panic_message};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;

use super::connection::{Connection, ConnectionInput, ConnectionOutput};
use super::state::ServiceState;
use crate::config::EndpointConfig;
use crate::error::{NetError, Result};
use crate::runtime;

/// Port used by a server configuration without one.
pub const DEFAULT_PORT: u16 = 8080;
/// Listen backlog used by a server configuration without one.
pub const DEFAULT_BACKLOG: u32 = 50;
/// Concurrent connection limit used by a server configuration without one.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Callback run for each accepted connection.
type ConnectionHandler = dyn Fn(ConnectionInput, ConnectionOutput) + Send + Sync;

/// A TCP endpoint in exactly one of two modes.
///
/// The mode is chosen from the [`EndpointConfig`] at construction:
///
/// 1. `backlog` or `max_concurrent` present: server.
/// 2. otherwise `host` present: client (a port is then required).
/// 3. otherwise `port` present: server with defaults.
/// 4. otherwise the service is [`ServiceState::Unset`].
///
/// In server mode [`accept`](Self::accept) runs the accept loop on the
/// calling thread and hands each connection to a bounded worker pool, so no
/// more than `max_concurrent` handlers ever run at once. In client mode
/// [`connect`](Self::connect) opens, and then reuses, one connection.
///
/// Failures never panic or return errors: operations report `false`/`None`
/// and record a message readable through
/// [`last_error_message`](Self::last_error_message).
///
/// # Server Example
///
/// ```no_run
/// use tether_net::{ConnectionService, EndpointConfig};
///
/// let server = ConnectionService::new(EndpointConfig::server(4446, 5, 4).local_only(true));
/// if server.is_ready() {
///     let clean = server.accept(|input, output| {
///         while let Some(line) = input.next_line() {
///             output.println(&line.to_uppercase());
///         }
///     });
///     if !clean {
///         eprintln!("accept loop failed: {server}");
///     }
/// }
/// ```
///
/// # Client Example
///
/// ```no_run
/// use tether_net::{ConnectionService, EndpointConfig};
///
/// let client = ConnectionService::new(EndpointConfig::client("localhost", 4446));
/// match client.connect() {
///     Some(connection) => {
///         connection.output().println("Short Message");
///         println!("received {:?}", connection.input().next_line());
///     }
///     None => eprintln!("failed to connect: {}", client.last_error_message()),
/// }
/// client.close();
/// ```
pub struct ConnectionService {
    config: EndpointConfig,
    local_addr: Option<SocketAddr>,
    state: Mutex<ServiceState>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    client: Mutex<Option<Connection>>,
    listening: AtomicBool,
    stop: Notify,
    last_error: Mutex<String>,
}

impl ConnectionService {
    /// Create a service from `config`, binding immediately in server mode.
    pub fn new(config: EndpointConfig) -> Self {
        Self::with_shutdown_policy(config, ShutdownPolicy::default())
    }

    /// Create a service whose worker pool closes with `policy`.
    pub fn with_shutdown_policy(config: EndpointConfig, policy: ShutdownPolicy) -> Self {
        let mut service = Self {
            config,
            local_addr: None,
            state: Mutex::new(ServiceState::Unset),
            listener: Mutex::new(None),
            pool: Mutex::new(None),
            client: Mutex::new(None),
            listening: AtomicBool::new(false),
            stop: Notify::new(),
            last_error: Mutex::new(String::new()),
        };

        let has_host = service.config.host.is_some();
        let has_port = service.config.port.is_some();
        let wants_server =
            service.config.backlog.is_some() || service.config.max_concurrent.is_some();

        let state = if wants_server || (!has_host && has_port) {
            match service.init_server(policy) {
                Ok(()) => ServiceState::ServerReady,
                Err(e) => {
                    service.record(format!("Failed to initialize TCP: {e}"));
                    ServiceState::Unset
                }
            }
        } else if has_host {
            if has_port {
                ServiceState::ClientReady
            } else {
                service.record("Client mode requires both host and port");
                ServiceState::Unset
            }
        } else {
            service.record(
                "NetworkProperties must specify either server (backlog/maxConcurrent) or client (host) configuration",
            );
            ServiceState::Unset
        };

        tracing::debug!(target: targets::TCP, %state, config = %service.config, "TCP service created");
        *service.state.get_mut() = state;
        service
    }

    fn init_server(&mut self, policy: ShutdownPolicy) -> Result<()> {
        let port = self.config.port.unwrap_or(DEFAULT_PORT);
        let backlog = self.config.backlog.unwrap_or(DEFAULT_BACKLOG);
        let max_concurrent = self.config.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
        let ip = if self.config.local_only == Some(true) {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        let pool = WorkerPool::with_config(
            PoolConfig::with_capacity(max_concurrent)
                .thread_name("tether-tcp")
                .shutdown_policy(policy),
        )
        .map_err(|e| NetError::Tcp(e.to_string()))?;

        let listener = runtime::block_on(bind_listener(SocketAddr::new(ip, port), backlog))?
            .map_err(|e| NetError::Tcp(e.to_string()))?;
        let local_addr = listener.local_addr()?;
        if port == 0 {
            self.config.port = Some(local_addr.port());
        }

        tracing::debug!(target: targets::TCP, %local_addr, backlog, max_concurrent, "TCP server bound");
        self.local_addr = Some(local_addr);
        *self.listener.get_mut() = Some(Arc::new(listener));
        *self.pool.get_mut() = Some(Arc::new(pool));
        Ok(())
    }

    /// Current mode and lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Whether the service is usable in its configured mode.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Whether the accept loop is currently running.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The effective configuration, with an OS-assigned port filled in.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Address the server is bound to (server mode only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The most recent diagnostic, or an empty string.
    pub fn last_error_message(&self) -> String {
        self.last_error.lock().clone()
    }

    /// Run the accept loop until [`close`](Self::close) is called.
    ///
    /// Each connection is served by `handler(input, output)` on the worker
    /// pool; the socket is closed when the handler returns or panics. While
    /// every pool slot is busy, accepting pauses.
    ///
    /// Returns `true` when the loop ended because of `close`, `false` on an
    /// unexpected socket error or when the service is not a ready server.
    pub fn accept<H>(&self, handler: H) -> bool
    where
        H: Fn(ConnectionInput, ConnectionOutput) + Send + Sync + 'static,
    {
        match self.state() {
            ServiceState::ServerReady => {}
            ServiceState::ClientReady => return self.fail("Cannot accept in client mode"),
            ServiceState::Closed => return self.fail("TCP service is closed"),
            ServiceState::Unset => return self.fail("TCP cannot be used as server in this mode."),
        }

        let listener = self.listener.lock().clone();
        let pool = self.pool.lock().clone();
        let (Some(listener), Some(pool)) = (listener, pool) else {
            return self.fail("TCP service is closed");
        };
        if self.listening.swap(true, Ordering::AcqRel) {
            return self.fail("Accept loop is already running");
        }

        tracing::debug!(target: targets::TCP, local_addr = ?self.local_addr, "accept loop started");
        let handler: Arc<ConnectionHandler> = Arc::new(handler);
        let clean = self.accept_loop(&listener, &pool, &handler);
        self.listening.store(false, Ordering::Release);
        tracing::debug!(target: targets::TCP, clean, "accept loop finished");
        clean
    }

    fn accept_loop(
        &self,
        listener: &TcpListener,
        pool: &WorkerPool,
        handler: &Arc<ConnectionHandler>,
    ) -> bool {
        while self.listening.load(Ordering::Acquire) {
            let accepted = runtime::block_on(async {
                tokio::select! {
                    _ = self.stop.notified() => None,
                    result = listener.accept() => Some(result),
                }
            });

            let (stream, peer) = match accepted {
                Ok(Some(Ok(pair))) => pair,
                Ok(Some(Err(e))) => {
                    if !self.listening.load(Ordering::Acquire) {
                        break;
                    }
                    return self.fail(format!("Server socket closed unexpectedly: {e}"));
                }
                Ok(None) => break,
                Err(e) => return self.fail(e.to_string()),
            };

            tracing::trace!(target: targets::TCP, %peer, "connection accepted");
            if !self.dispatch(pool, handler, stream) {
                return false;
            }
        }
        true
    }

    fn dispatch(&self, pool: &WorkerPool, handler: &Arc<ConnectionHandler>, stream: TcpStream) -> bool {
        let connection = match stream
            .into_std()
            .and_then(|stream| Connection::new(stream, self.config.timeout))
        {
            Ok(connection) => connection,
            Err(e) => {
                // The peer may already be gone; the server keeps accepting.
                tracing::debug!(target: targets::TCP, error = %e, "could not set up accepted connection");
                return true;
            }
        };

        let handler = handler.clone();
        match pool.submit_cancellable(move |token| serve(connection, handler, token)) {
            Ok(_) => true,
            Err(PoolError::Rejected) if !self.listening.load(Ordering::Acquire) => true,
            Err(e) => self.fail(format!("Failed to dispatch connection: {e}")),
        }
    }

    /// Open the client connection, or return the one already open.
    ///
    /// Returns `None` and records the reason when the service is not a
    /// ready client or the connection attempt fails. The configured timeout
    /// bounds the handshake and applies to reads.
    pub fn connect(&self) -> Option<Connection> {
        match self.state() {
            ServiceState::ClientReady => {}
            ServiceState::ServerReady => return self.fail_none("Cannot connect in server mode"),
            ServiceState::Closed => return self.fail_none("TCP service is closed"),
            ServiceState::Unset => {
                return self.fail_none("TCP cannot be used as client in this mode.");
            }
        }

        let mut client = self.client.lock();
        if let Some(connection) = client.as_ref().filter(|c| c.is_open()) {
            return Some(connection.clone());
        }

        match self.open_client() {
            Ok(connection) => {
                tracing::debug!(target: targets::TCP, %connection, "client connected");
                *client = Some(connection.clone());
                Some(connection)
            }
            Err(e) => self.fail_none(e.to_string()),
        }
    }

    fn open_client(&self) -> Result<Connection> {
        let host = self.config.host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = self.config.port.unwrap_or(DEFAULT_PORT);
        let timeout = self.config.timeout.filter(|t| !t.is_zero());

        let stream = runtime::block_on(async move {
            let connecting = TcpStream::connect((host.as_str(), port));
            match timeout {
                Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("Connection to {host}:{port} timed out"),
                    )
                })?,
                None => connecting.await,
            }
        })??;

        Ok(Connection::new(stream.into_std()?, timeout)?)
    }

    /// Stop listening, close any client connection, and close the worker
    /// pool (graceful, then forced). Idempotent.
    ///
    /// A pool that does not terminate in time leaves its diagnostic in
    /// [`last_error_message`](Self::last_error_message).
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if !state.is_ready() {
                return;
            }
            *state = ServiceState::Closed;
        }

        self.listening.store(false, Ordering::Release);
        self.stop.notify_one();

        if let Some(connection) = self.client.lock().take() {
            connection.close();
        }

        let pool = self.pool.lock().take();
        if let Some(diagnostic) = pool.and_then(|pool| pool.close()) {
            self.record(diagnostic);
        }

        self.listener.lock().take();
        tracing::debug!(target: targets::TCP, "TCP service closed");
    }

    fn record(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: targets::TCP, error = %message, "TCP error recorded");
        *self.last_error.lock() = message;
    }

    fn fail(&self, message: impl Into<String>) -> bool {
        self.record(message);
        false
    }

    fn fail_none<T>(&self, message: impl Into<String>) -> Option<T> {
        self.record(message);
        None
    }
}

async fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Body of a per-connection pool task.
fn serve(connection: Connection, handler: Arc<ConnectionHandler>, token: &CancellationToken) {
    let closer = connection.clone();
    let registration = token.on_cancel(move || closer.close());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler(connection.input(), connection.output())
    }));
    if let Err(payload) = outcome {
        tracing::debug!(
            target: targets::TCP,
            connection = %connection.id(),
            panic = %panic_message(&*payload),
            "connection handler panicked"
        );
    }

    token.remove(registration);
    connection.close();
}

impl Drop for ConnectionService {
    fn drop(&mut self) {
        // Don't block in drop; the pool shuts itself down when released.
        self.listening.store(false, Ordering::Release);
        self.stop.notify_one();
        if let Some(connection) = self.client.get_mut().take() {
            connection.close();
        }
    }
}

impl std::fmt::Display for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        if !state.is_ready() {
            return write!(f, "TCP[{state}]");
        }

        let status = if self.is_listening() { "listening" } else { "ready" };
        write!(f, "TCP{{{state}, {status}, {}", self.config)?;
        let error = self.last_error.lock();
        if !error.is_empty() {
            write!(f, ", error: {error}")?;
        }
        write!(f, "}}")
    }
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(ConnectionService: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_unset() {
        let service = ConnectionService::new(EndpointConfig::new());
        assert_eq!(service.state(), ServiceState::Unset);
        assert!(!service.is_ready());
        assert!(service.last_error_message().starts_with("NetworkProperties must specify"));
        assert_eq!(service.to_string(), "TCP[unset]");
    }

    #[test]
    fn test_host_without_port_is_unset() {
        let service = ConnectionService::new(EndpointConfig::new().host("localhost"));
        assert_eq!(service.state(), ServiceState::Unset);
        assert_eq!(service.last_error_message(), "Client mode requires both host and port");
    }

    #[test]
    fn test_host_and_port_select_client_mode() {
        let service = ConnectionService::new(EndpointConfig::client("127.0.0.1", 9));
        assert_eq!(service.state(), ServiceState::ClientReady);
        assert!(service.local_addr().is_none());
        assert_eq!(
            service.to_string(),
            "TCP{client, ready, NetworkProperties{host: 127.0.0.1, port: 9}}"
        );
    }

    #[test]
    fn test_port_only_selects_server_mode() {
        let service = ConnectionService::new(EndpointConfig::new().port(0).local_only(true));
        assert_eq!(service.state(), ServiceState::ServerReady);
        let assigned = service.config().port.unwrap();
        assert_ne!(assigned, 0);
        assert_eq!(service.local_addr().map(|a| a.port()), Some(assigned));
        service.close();
    }

    #[test]
    fn test_server_properties_win_over_host() {
        let config = EndpointConfig::new()
            .host("example.com")
            .port(0)
            .max_concurrent(1)
            .local_only(true);
        let service = ConnectionService::new(config);
        assert_eq!(service.state(), ServiceState::ServerReady);
        service.close();
    }

    #[test]
    fn test_zero_concurrency_is_unset() {
        let service = ConnectionService::new(EndpointConfig::server(0, 5, 0).local_only(true));
        assert_eq!(service.state(), ServiceState::Unset);
        assert!(service.last_error_message().starts_with("Failed to initialize TCP"));
    }

    #[test]
    fn test_bind_conflict_is_unset() {
        let first = ConnectionService::new(EndpointConfig::new().port(0).local_only(true));
        let port = first.config().port.unwrap();
        // Listening sockets can't share a port even with SO_REUSEADDR.
        let second = ConnectionService::new(EndpointConfig::new().port(port).local_only(true));
        assert_eq!(second.state(), ServiceState::Unset);
        assert!(!second.last_error_message().is_empty());
        first.close();
    }

    #[test]
    fn test_close_moves_to_closed_once() {
        let service = ConnectionService::new(EndpointConfig::new().port(0).local_only(true));
        service.close();
        assert_eq!(service.state(), ServiceState::Closed);
        assert_eq!(service.to_string(), "TCP[closed]");
        service.close();
        assert_eq!(service.state(), ServiceState::Closed);
        assert!(!service.accept(|_, _| {}));
        assert_eq!(service.last_error_message(), "TCP service is closed");
    }
}
