//! Dual-mode TCP service carrying newline-delimited text.
//!
//! This module provides TCP networking capabilities:
//! - **ConnectionService**: a server accept loop or an outbound client,
//!   selected by the [`EndpointConfig`](crate::EndpointConfig) it is built from
//! - **Connection**: one open socket, split into line-oriented
//!   [`ConnectionInput`] and [`ConnectionOutput`] halves
//!
//! # Echo Server Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::thread;
//! use tether_net::tcp::ConnectionService;
//! use tether_net::EndpointConfig;
//!
//! let server = Arc::new(ConnectionService::new(
//!     EndpointConfig::server(0, 16, 4).local_only(true),
//! ));
//!
//! let accept_loop = {
//!     let server = server.clone();
//!     thread::spawn(move || {
//!         server.accept(|input, output| {
//!             for line in input {
//!                 output.println(&line);
//!             }
//!         })
//!     })
//! };
//!
//! // ... later, from any thread:
//! server.close();
//! assert!(accept_loop.join().unwrap());
//! ```

mod connection;
mod service;
mod state;

pub use connection::{Connection, ConnectionId, ConnectionInput, ConnectionOutput};
pub use service::{ConnectionService, DEFAULT_BACKLOG, DEFAULT_MAX_CONCURRENT, DEFAULT_PORT};
pub use state::ServiceState;
