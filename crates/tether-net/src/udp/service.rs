//! UDP service with a background receive loop and a bounded packet queue.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tether_core::logging::targets;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::packet::Packet;
use super::state::DatagramState;
use crate::config::EndpointConfig;
use crate::error::{NetError, Result};
use crate::runtime;

/// Receive buffer size used when the config has no packet size.
pub const DEFAULT_PACKET_SIZE: usize = 1024;
/// Wait used by `receive` and the socket read loop when no timeout is set.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Number of received packets held before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long `close` waits for the receive loop before aborting it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared with the receive loop.
struct Shared {
    last_error: Mutex<String>,
    receiving: AtomicBool,
    stop: Notify,
}

impl Shared {
    fn record(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: targets::UDP, error = %message, "UDP error recorded");
        *self.last_error.lock() = message;
    }
}

/// A bound UDP socket exchanging text datagrams.
///
/// Sending is fire-and-forget. Incoming datagrams are read by a background
/// loop, started on the first call to [`has_next`](Self::has_next),
/// [`next`](Self::next) or [`receive`](Self::receive), and buffered in a
/// bounded FIFO queue. When the queue is full new packets are dropped and
/// the drop is recorded; the loop itself never blocks on the queue.
///
/// # Example
///
/// ```no_run
/// use tether_net::udp::{DatagramService, Packet};
/// use tether_net::EndpointConfig;
///
/// let receiver = DatagramService::new(EndpointConfig::new().port(0).local_only(true));
/// let sender = DatagramService::new(EndpointConfig::new().port(0).local_only(true));
///
/// let port = receiver.config().port.unwrap();
/// sender.send(&Packet::to("127.0.0.1", port, "ping"));
///
/// if let Some(packet) = receiver.receive() {
///     println!("{} from {:?}:{:?}", packet.content(), packet.host(), packet.port());
/// }
/// ```
pub struct DatagramService {
    config: EndpointConfig,
    local_addr: Option<SocketAddr>,
    state: Mutex<DatagramState>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
    queue_tx: Sender<Packet>,
    queue_rx: Receiver<Packet>,
    shared: Arc<Shared>,
}

impl DatagramService {
    /// Create a service from `config`; a port is required.
    pub fn new(config: EndpointConfig) -> Self {
        Self::with_queue_capacity(config, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a service holding at most `capacity` unread packets.
    pub fn with_queue_capacity(config: EndpointConfig, capacity: usize) -> Self {
        let (queue_tx, queue_rx) = bounded(capacity.max(1));
        let mut service = Self {
            config,
            local_addr: None,
            state: Mutex::new(DatagramState::Unset),
            socket: Mutex::new(None),
            receiver_task: Mutex::new(None),
            queue_tx,
            queue_rx,
            shared: Arc::new(Shared {
                last_error: Mutex::new(String::new()),
                receiving: AtomicBool::new(false),
                stop: Notify::new(),
            }),
        };

        let state = if service.config.port.is_none() {
            service.shared.record("Port is required for UDP socket creation");
            DatagramState::Unset
        } else {
            match service.bind() {
                Ok(()) => DatagramState::Ready,
                Err(e) => {
                    service.shared.record(format!("Failed to create UDP socket: {e}"));
                    DatagramState::Unset
                }
            }
        };

        tracing::debug!(target: targets::UDP, %state, config = %service.config, "UDP service created");
        *service.state.get_mut() = state;
        service
    }

    fn bind(&mut self) -> Result<()> {
        let port = self.config.port.unwrap_or(0);
        let ip = if self.config.local_only == Some(true) {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        let socket = runtime::block_on(UdpSocket::bind(SocketAddr::new(ip, port)))?
            .map_err(|e| NetError::Udp(e.to_string()))?;
        let local_addr = socket.local_addr()?;
        if port == 0 {
            self.config.port = Some(local_addr.port());
        }

        tracing::debug!(target: targets::UDP, %local_addr, "UDP socket bound");
        self.local_addr = Some(local_addr);
        *self.socket.get_mut() = Some(Arc::new(socket));
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DatagramState {
        *self.state.lock()
    }

    /// Whether the socket is bound and usable.
    pub fn is_ready(&self) -> bool {
        self.state() == DatagramState::Ready
    }

    /// The effective configuration, with an OS-assigned port filled in.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of received packets waiting to be read.
    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    /// The most recent diagnostic, or an empty string.
    pub fn last_error_message(&self) -> String {
        self.shared.last_error.lock().clone()
    }

    /// Send `packet` to the host and port in its config.
    ///
    /// Returns whether the datagram was handed to the OS. A successful send
    /// clears the last error.
    pub fn send(&self, packet: &Packet) -> bool {
        let Some(socket) = self.ready_socket() else {
            return self.fail("UDP socket is not available for sending");
        };
        let (Some(host), Some(port)) = (packet.host(), packet.port()) else {
            return self.fail("Packet must have destination host and port");
        };

        match runtime::block_on(socket.send_to(packet.content().as_bytes(), (host, port))) {
            Ok(Ok(sent)) => {
                tracing::trace!(target: targets::UDP, host, port, bytes = sent, "packet sent");
                self.shared.last_error.lock().clear();
                true
            }
            Ok(Err(e)) => self.fail(format!("Failed to send packet: {e}")),
            Err(e) => self.fail(format!("Failed to send packet: {e}")),
        }
    }

    /// Whether a received packet is waiting. Never blocks.
    pub fn has_next(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.ensure_receiving();
        !self.queue_rx.is_empty()
    }

    /// Take the next received packet, if one is waiting. Never blocks.
    pub fn next(&self) -> Option<Packet> {
        if !self.is_ready() {
            self.shared.record("UDP socket is not available");
            return None;
        }
        self.ensure_receiving();
        self.queue_rx.try_recv().ok()
    }

    /// Wait up to the configured timeout (default 5 s) for a packet.
    pub fn receive(&self) -> Option<Packet> {
        if !self.is_ready() {
            self.shared.record("UDP socket is not available for receiving");
            return None;
        }
        self.ensure_receiving();
        self.queue_rx.recv_timeout(self.read_timeout()).ok()
    }

    /// Stop the receive loop, close the socket and discard queued packets.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != DatagramState::Ready {
                return;
            }
            *state = DatagramState::Closed;
        }

        self.shared.receiving.store(false, Ordering::Release);
        self.shared.stop.notify_one();

        if let Some(mut task) = self.receiver_task.lock().take() {
            let joined = runtime::block_on(async {
                tokio::time::timeout(JOIN_TIMEOUT, &mut task).await.is_ok()
            });
            if !matches!(joined, Ok(true)) {
                tracing::debug!(target: targets::UDP, "receive loop did not stop in time, aborting");
                task.abort();
            }
        }

        self.socket.lock().take();
        let discarded = self.queue_rx.try_iter().count();
        tracing::debug!(target: targets::UDP, discarded, "UDP service closed");
    }

    fn ready_socket(&self) -> Option<Arc<UdpSocket>> {
        if !self.is_ready() {
            return None;
        }
        self.socket.lock().clone()
    }

    fn read_timeout(&self) -> Duration {
        self.config
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    fn ensure_receiving(&self) {
        let mut task = self.receiver_task.lock();
        if self.shared.receiving.load(Ordering::Acquire) {
            return;
        }
        let Some(socket) = self.ready_socket() else {
            return;
        };

        let handle = match runtime::runtime() {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.record(e.to_string());
                return;
            }
        };

        self.shared.receiving.store(true, Ordering::Release);
        *task = Some(handle.spawn(receive_loop(
            socket,
            self.queue_tx.clone(),
            self.shared.clone(),
            self.config.packet_size.unwrap_or(DEFAULT_PACKET_SIZE),
            self.read_timeout(),
        )));
        tracing::debug!(target: targets::UDP, "receive loop started");
    }

    fn fail(&self, message: impl Into<String>) -> bool {
        self.shared.record(message);
        false
    }
}

/// Read datagrams until stopped or the socket fails.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    queue: Sender<Packet>,
    shared: Arc<Shared>,
    packet_size: usize,
    read_timeout: Duration,
) {
    let mut buffer = vec![0u8; packet_size.max(1)];

    while shared.receiving.load(Ordering::Acquire) {
        let received = tokio::select! {
            _ = shared.stop.notified() => break,
            result = tokio::time::timeout(read_timeout, socket.recv_from(&mut buffer)) => result,
        };

        let (len, source) = match received {
            Ok(Ok(datagram)) => datagram,
            // Read timeouts are routine; keep listening.
            Err(_) => continue,
            Ok(Err(e)) => {
                if shared.receiving.load(Ordering::Acquire) {
                    shared.record(format!("Error receiving packet: {e}"));
                }
                break;
            }
        };

        let packet = Packet::new(
            EndpointConfig::client(source.ip().to_string(), source.port()),
            String::from_utf8_lossy(&buffer[..len]),
        );
        tracing::trace!(target: targets::UDP, %source, bytes = len, "packet received");

        match queue.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(target: targets::UDP, %source, "packet queue full");
                shared.record("Packet queue is full, dropping packet");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    shared.receiving.store(false, Ordering::Release);
}

impl Drop for DatagramService {
    fn drop(&mut self) {
        self.shared.receiving.store(false, Ordering::Release);
        self.shared.stop.notify_one();
        if let Some(task) = self.receiver_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Display for DatagramService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_ready() {
            return write!(f, "UDP{{}}");
        }

        match self.local_addr {
            Some(addr) => write!(f, "UDP{{bound to {}", addr.port())?,
            None => write!(f, "UDP{{unbound")?,
        }
        write!(f, ", queue: {}, {}", self.queued(), self.config)?;
        let error = self.shared.last_error.lock();
        if !error.is_empty() {
            write!(f, ", error: {error}")?;
        }
        write!(f, "}}")
    }
}

impl std::fmt::Debug for DatagramService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramService")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(DatagramService: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> DatagramService {
        DatagramService::new(
            EndpointConfig::new()
                .port(0)
                .local_only(true)
                .timeout(Duration::from_millis(200)),
        )
    }

    #[test]
    fn test_port_is_required() {
        let service = DatagramService::new(EndpointConfig::new().host("localhost"));
        assert_eq!(service.state(), DatagramState::Unset);
        assert_eq!(service.last_error_message(), "Port is required for UDP socket creation");
        assert_eq!(service.to_string(), "UDP{}");
        assert!(!service.has_next());
        assert!(service.next().is_none());
    }

    #[test]
    fn test_port_zero_is_resolved() {
        let service = local();
        assert!(service.is_ready());
        let port = service.config().port.unwrap();
        assert_ne!(port, 0);
        assert_eq!(service.local_addr().map(|a| a.port()), Some(port));
        assert!(service.to_string().starts_with(&format!("UDP{{bound to {port}, queue: 0, ")));
    }

    #[test]
    fn test_send_requires_destination() {
        let service = local();
        let packet = Packet::new(EndpointConfig::new().port(9), "no host");
        assert!(!service.send(&packet));
        assert_eq!(service.last_error_message(), "Packet must have destination host and port");
    }

    #[test]
    fn test_full_queue_drops_packets() {
        let receiver = DatagramService::with_queue_capacity(
            EndpointConfig::new().port(0).local_only(true),
            1,
        );
        let sender = local();
        let port = receiver.config().port.unwrap();

        assert!(!receiver.has_next());
        for i in 0..3 {
            assert!(sender.send(&Packet::to("127.0.0.1", port, format!("packet {i}"))));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while receiver.last_error_message().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(receiver.last_error_message(), "Packet queue is full, dropping packet");
        assert_eq!(receiver.queued(), 1);
        assert_eq!(receiver.next().map(Packet::into_content).as_deref(), Some("packet 0"));
    }

    #[test]
    fn test_close_clears_queue_and_is_idempotent() {
        let service = local();
        assert!(!service.has_next());
        service.close();
        assert_eq!(service.state(), DatagramState::Closed);
        assert_eq!(service.queued(), 0);
        service.close();
        assert!(!service.send(&Packet::to("127.0.0.1", 9, "late")));
        assert!(service.receive().is_none());
    }
}
