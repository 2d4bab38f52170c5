//! Line-oriented TCP connection handed to handlers and clients.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::logging::targets;

/// Unique identifier for a TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionInner {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    /// Used only for shutdown, and never locked.
    control: TcpStream,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Shutdown unblocks a reader or writer parked in another thread.
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            tracing::trace!(target: targets::TCP, connection = %self.id, error = %e, "shutdown after peer close");
        }
        tracing::trace!(target: targets::TCP, connection = %self.id, "connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// An open TCP connection carrying newline-delimited text.
///
/// Cloning is cheap: clones, [`ConnectionInput`] and [`ConnectionOutput`]
/// all share one socket, and closing any of them closes it for all.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a connected blocking stream, applying an optional read timeout.
    pub(crate) fn new(stream: TcpStream, read_timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        // A zero duration is rejected by the platform; treat it as "no timeout".
        stream.set_read_timeout(read_timeout.filter(|t| !t.is_zero()))?;

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let control = stream.try_clone()?;
        let id = ConnectionId::new();

        tracing::trace!(target: targets::TCP, connection = %id, %local_addr, %peer_addr, "connection opened");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id,
                local_addr,
                peer_addr,
                reader: Mutex::new(reader),
                writer: Mutex::new(stream),
                control,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The connection's unique ID.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// The reading half.
    pub fn input(&self) -> ConnectionInput {
        ConnectionInput {
            inner: self.inner.clone(),
        }
    }

    /// The writing half.
    pub fn output(&self) -> ConnectionOutput {
        ConnectionOutput {
            inner: self.inner.clone(),
        }
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.inner.is_closed() {
            write!(f, "SocketConnection[closed]")
        } else {
            write!(
                f,
                "SocketConnection{{{} -> {}}}",
                self.inner.local_addr, self.inner.peer_addr
            )
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Reading half of a [`Connection`]; yields one line per message.
pub struct ConnectionInput {
    inner: Arc<ConnectionInner>,
}

impl ConnectionInput {
    /// Whether another line can be read.
    ///
    /// Blocks until data arrives, the peer closes, or the read timeout
    /// elapses. Returns `false` after close, at end of stream and on timeout.
    pub fn has_next(&self) -> bool {
        if self.inner.is_closed() {
            return false;
        }
        match self.inner.reader.lock().fill_buf() {
            Ok(buf) => !buf.is_empty(),
            Err(e) => {
                tracing::trace!(target: targets::TCP, connection = %self.inner.id, error = %e, "read unavailable");
                false
            }
        }
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `None` after close, at end of stream, on timeout, or when the
    /// bytes received are not valid UTF-8.
    pub fn next_line(&self) -> Option<String> {
        if self.inner.is_closed() {
            return None;
        }
        let mut line = String::new();
        match self.inner.reader.lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Some(line)
            }
            Err(e) => {
                tracing::trace!(target: targets::TCP, connection = %self.inner.id, error = %e, "read failed");
                None
            }
        }
    }

    /// Whether the underlying connection is still open.
    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Close the whole connection.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Iterator for ConnectionInput {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_line()
    }
}

/// Writing half of a [`Connection`].
pub struct ConnectionOutput {
    inner: Arc<ConnectionInner>,
}

impl ConnectionOutput {
    /// Write `text` followed by a line break.
    ///
    /// Returns whether the write succeeded; writes after close are ignored.
    pub fn println(&self, text: &str) -> bool {
        self.write(text, true)
    }

    /// Write `text` without a line break.
    pub fn print(&self, text: &str) -> bool {
        self.write(text, false)
    }

    /// Whether the underlying connection is still open.
    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Close the whole connection.
    pub fn close(&self) {
        self.inner.close();
    }

    fn write(&self, text: &str, newline: bool) -> bool {
        if self.inner.is_closed() {
            return false;
        }
        let mut writer = self.inner.writer.lock();
        match write_text(&mut writer, text, newline) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(target: targets::TCP, connection = %self.inner.id, error = %e, "write failed");
                false
            }
        }
    }
}

fn write_text(writer: &mut TcpStream, text: &str, newline: bool) -> io::Result<()> {
    writer.write_all(text.as_bytes())?;
    if newline {
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

static_assertions::assert_impl_all!(Connection: Send, Sync);
static_assertions::assert_impl_all!(ConnectionInput: Send);
static_assertions::assert_impl_all!(ConnectionOutput: Send);
