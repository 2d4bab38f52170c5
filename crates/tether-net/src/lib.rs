//! Networking module for Tether.
//!
//! This crate provides blocking network services for Tether applications:
//!
//! - **TCP**: [`ConnectionService`], a server whose accept loop serves each
//!   connection on a bounded worker pool, or a client with one cached
//!   connection
//! - **UDP**: [`DatagramService`], fire-and-forget sends plus a background
//!   receive loop feeding a bounded queue
//! - **Configuration**: [`EndpointConfig`], one optional-field bag read by
//!   both services, loadable from JSON
//!
//! Socket I/O runs on a shared Tokio runtime (see [`runtime`]); the public
//! API blocks the calling thread and must not be used from inside an async
//! context.
//!
//! # Error Reporting
//!
//! Operational failures (bad configuration, refused connections, timeouts,
//! closed sockets) never panic. Operations return `false` or `None` and the
//! service records a message readable via `last_error_message()`:
//!
//! ```no_run
//! use tether_net::{ConnectionService, EndpointConfig};
//!
//! let client = ConnectionService::new(EndpointConfig::client("localhost", 1));
//! if client.connect().is_none() {
//!     eprintln!("{}", client.last_error_message());
//! }
//! ```
//!
//! # Loading Configuration
//!
//! ```
//! use tether_net::EndpointConfig;
//!
//! let config = EndpointConfig::from_json(r#"{"port": 4446, "backlog": 5, "maxConcurrent": 4}"#)?;
//! assert_eq!(config.max_concurrent, Some(4));
//! # Ok::<(), tether_net::NetError>(())
//! ```

mod config;
mod error;
pub mod runtime;
pub mod tcp;
pub mod udp;

pub use config::EndpointConfig;
pub use error::{NetError, Result};

// Re-export commonly used types at the crate root
pub use tcp::{Connection, ConnectionInput, ConnectionOutput, ConnectionService, ServiceState};
pub use udp::{DatagramService, DatagramState, Packet};
