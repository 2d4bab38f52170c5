//! Core systems for Tether.
//!
//! This crate provides the concurrency primitives the networking layer and
//! host applications build on:
//!
//! - **Worker Pool**: capacity-bounded execution with blocking backpressure
//! - **Exclusive Gate**: a value that is only reachable from inside its lock
//! - **Signal Dispatch**: process-wide OS signal handlers with exit codes
//!
//! # Worker Pool Example
//!
//! ```no_run
//! use tether_core::{PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::with_config(PoolConfig::with_capacity(4).thread_name("jobs"))?;
//!
//! let handles: Vec<_> = (0..8)
//!     .map(|i| pool.submit(move || i * i))
//!     .collect::<Result<_, _>>()?;
//!
//! let total: i32 = handles.into_iter().filter_map(|h| h.wait().ok()).sum();
//! assert_eq!(total, 140);
//!
//! pool.close();
//! # Ok::<(), tether_core::PoolError>(())
//! ```
//!
//! # Signal Example
//!
//! ```no_run
//! use tether_core::SignalDispatcher;
//!
//! SignalDispatcher::global().register("TERM", |name| {
//!     eprintln!("received {name}, shutting down");
//!     Some(0)
//! });
//! ```

pub mod error;
pub mod gate;
pub mod logging;
pub mod pool;
pub mod signals;

pub use error::{PoolError, Result, SignalError, TaskError, panic_message};
pub use gate::ExclusiveGate;
pub use pool::{
    CancelRegistration, CancellationToken, PoolConfig, PoolState, ShutdownPolicy, TaskHandle,
    WorkerPool,
};
#[cfg(unix)]
pub use signals::SignalHookBridge;
pub use signals::{
    DeliveryFn, NativeSignalBridge, ProcessExit, SignalDispatcher, SignalHandler, SignalKind,
    StdProcessExit, UnsupportedBridge,
};
