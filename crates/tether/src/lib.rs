//! Tether - concurrency and networking primitives for host runtimes.
//!
//! This is the main umbrella crate that re-exports all public APIs.
//!
//! # Example
//!
//! ```no_run
//! use tether::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     SignalDispatcher::global().register("TERM", |_| Some(0));
//!
//!     let server = ConnectionService::new(EndpointConfig::server(4446, 5, 4));
//!     if !server.is_ready() {
//!         return Err(server.last_error_message().into());
//!     }
//!     server.accept(|input, output| {
//!         while let Some(line) = input.next_line() {
//!             output.println(&line);
//!         }
//!     });
//!     Ok(())
//! }
//! ```

pub use tether_core::*;

pub mod prelude;

/// Networking module (requires `networking` feature).
#[cfg(feature = "networking")]
pub mod net {
    pub use tether_net::*;
}
