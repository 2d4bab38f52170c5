//! Error types for Tether core.

/// Errors raised by the bounded worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool was constructed with a capacity of zero.
    #[error("worker pool capacity must be greater than zero")]
    InvalidCapacity,
    /// The pool has been shut down and no longer admits tasks.
    #[error("worker pool has been shut down; task rejected")]
    Rejected,
    /// The underlying worker threads could not be created.
    #[error("failed to create worker threads: {0}")]
    CreationFailed(String),
}

/// Failure of a single task, reported only through its own handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was dropped before producing a result.
    #[error("task was abandoned before completing")]
    Abandoned,
}

/// Errors raised while registering OS signal handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// The signal name is not one of the supported signals.
    #[error("unsupported signal: {0}")]
    Unsupported(String),
    /// The native handler could not be installed.
    #[error("failed to bind native handler for {signal}: {message}")]
    BindFailed {
        /// The signal name.
        signal: String,
        /// Why the platform refused the binding.
        message: String,
    },
}

impl SignalError {
    /// Create a bind failure for the given signal.
    pub fn bind_failed(signal: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BindFailed {
            signal: signal.into(),
            message: message.into(),
        }
    }
}

/// A specialized Result type for worker pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
