//! Logging facilities for Tether.
//!
//! Tether uses the `tracing` crate for instrumentation. Nothing is printed
//! unless the host application installs a subscriber:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("tether::pool=debug,tether::tcp=trace")
//!         .init();
//! }
//! ```
//!
//! Lifecycle transitions are logged at `debug`, per-task and per-packet
//! events at `trace`. Failures that are swallowed at a callback boundary
//! (a panicking signal handler or connection handler) are logged at `debug`
//! so they stay observable without changing the non-throwing contract.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Bounded worker pool target.
    pub const POOL: &str = "tether::pool";
    /// Exclusive access gate target.
    pub const GATE: &str = "tether::gate";
    /// OS signal dispatch target.
    pub const SIGNALS: &str = "tether::signals";
    /// TCP connection service target.
    pub const TCP: &str = "tether::tcp";
    /// UDP datagram service target.
    pub const UDP: &str = "tether::udp";
}
