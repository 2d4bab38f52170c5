//! State enum for the UDP datagram service.

/// Lifecycle of a [`DatagramService`](super::DatagramService).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DatagramState {
    /// Socket bound and usable.
    Ready,
    /// No port configured, or binding failed.
    #[default]
    Unset,
    /// Closed; no further use is possible.
    Closed,
}

impl std::fmt::Display for DatagramState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Unset => write!(f, "unset"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(DatagramState::Ready.to_string(), "ready");
        assert_eq!(DatagramState::Unset.to_string(), "unset");
        assert_eq!(DatagramState::Closed.to_string(), "closed");
    }
}
