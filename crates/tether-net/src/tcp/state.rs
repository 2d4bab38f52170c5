//! State enum for the TCP connection service.

/// Mode and lifecycle of a [`ConnectionService`](super::ConnectionService).
///
/// The mode is fixed at construction; `close()` moves a ready service to
/// `Closed`, which is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServiceState {
    /// Bound and listening socket ready for `accept`.
    ServerReady,
    /// Configured for outbound `connect`.
    ClientReady,
    /// Configuration was incomplete or binding failed.
    #[default]
    Unset,
    /// Closed; no further use is possible.
    Closed,
}

impl ServiceState {
    /// Whether the service is usable in either mode.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::ServerReady | Self::ClientReady)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerReady => write!(f, "server"),
            Self::ClientReady => write!(f, "client"),
            Self::Unset => write!(f, "unset"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
