//! Queued UDP service carrying text datagrams.
//!
//! This module provides UDP networking capabilities:
//! - **DatagramService**: a bound socket with fire-and-forget sends and a
//!   background receive loop feeding a bounded queue
//! - **Packet**: an endpoint plus UTF-8 text content
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_net::udp::{DatagramService, Packet};
//! use tether_net::EndpointConfig;
//!
//! let service = DatagramService::new(
//!     EndpointConfig::new().port(4445).timeout(Duration::from_millis(500)),
//! );
//!
//! // Broadcast a discovery message.
//! service.send(&Packet::to("255.255.255.255", 4446, "discover"));
//!
//! // Drain whatever has arrived so far without blocking.
//! while let Some(packet) = service.next() {
//!     println!("{packet}");
//! }
//!
//! service.close();
//! ```

mod packet;
mod service;
mod state;

pub use packet::Packet;
pub use service::{DatagramService, DEFAULT_PACKET_SIZE, DEFAULT_QUEUE_CAPACITY, DEFAULT_TIMEOUT};
pub use state::DatagramState;
