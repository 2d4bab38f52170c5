//! Prelude module for Tether.
//!
//! ```ignore
//! use tether::prelude::*;
//! ```

// ============================================================================
// Concurrency
// ============================================================================

pub use crate::{CancellationToken, ExclusiveGate, PoolConfig, ShutdownPolicy, TaskHandle, WorkerPool};

// ============================================================================
// Signals
// ============================================================================

pub use crate::{SignalDispatcher, SignalKind};

// ============================================================================
// Networking
// ============================================================================

#[cfg(feature = "networking")]
pub use crate::net::{ConnectionService, DatagramService, EndpointConfig, Packet};
