//! Endpoint configuration shared by the TCP and UDP services.
//!
//! An [`EndpointConfig`] is a bag of optional settings. Which fields matter
//! depends on the consumer: the TCP service picks server or client mode from
//! the fields present, the UDP service only needs a port. Unused fields are
//! ignored.
//!
//! ```
//! use std::time::Duration;
//! use tether_net::EndpointConfig;
//!
//! let server = EndpointConfig::new().port(0).backlog(5).max_concurrent(2).local_only(true);
//! let client = EndpointConfig::client("127.0.0.1", 8080).timeout(Duration::from_secs(2));
//!
//! assert_eq!(
//!     client.to_string(),
//!     "NetworkProperties{host: 127.0.0.1, port: 8080, timeout: 2000ms}"
//! );
//! # let _ = server;
//! ```
//!
//! The config (de)serializes with camelCase keys and the timeout in
//! milliseconds; unset fields are omitted:
//!
//! ```json
//! {"port": 9000, "packetSize": 512, "timeout": 250, "localOnly": true}
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Optional network settings for a TCP or UDP endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Remote host (client mode, packet destination/source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Local port to bind or remote port to reach. `0` asks the OS to pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Maximum datagram payload size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_size: Option<usize>,
    /// Connect/read timeout.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_ms")]
    pub timeout: Option<Duration>,
    /// Listen backlog (server mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<u32>,
    /// Maximum concurrently handled connections (server mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    /// Bind to the loopback interface only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_only: Option<bool>,
}

impl EndpointConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client configuration for `host:port`.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self::new().host(host).port(port)
    }

    /// Create a server configuration with explicit backlog and concurrency.
    pub fn server(port: u16, backlog: u32, max_concurrent: usize) -> Self {
        Self::new()
            .port(port)
            .backlog(backlog)
            .max_concurrent(max_concurrent)
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the maximum datagram payload size.
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = Some(size);
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the listen backlog.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Set the maximum number of concurrently handled connections.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Bind to loopback only.
    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = Some(local_only);
        self
    }

    /// Whether any field is present.
    pub fn is_set(&self) -> bool {
        self.host.is_some()
            || self.port.is_some()
            || self.packet_size.is_some()
            || self.timeout.is_some()
            || self.backlog.is_some()
            || self.max_concurrent.is_some()
            || self.local_only.is_some()
    }

    /// Whether both a host and a port are present.
    pub fn has_endpoint(&self) -> bool {
        self.host.is_some() && self.port.is_some()
    }

    /// Fill every unset field from `other`; fields already set are kept.
    pub fn merge(&mut self, other: &EndpointConfig) {
        fn fill<T: Clone>(mine: &mut Option<T>, theirs: &Option<T>) {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }

        fill(&mut self.host, &other.host);
        fill(&mut self.port, &other.port);
        fill(&mut self.packet_size, &other.packet_size);
        fill(&mut self.timeout, &other.timeout);
        fill(&mut self.backlog, &other.backlog);
        fill(&mut self.max_concurrent, &other.max_concurrent);
        fill(&mut self.local_only, &other.local_only);
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON, omitting unset fields.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<String> = Vec::new();
        if let Some(host) = &self.host {
            fields.push(format!("host: {host}"));
        }
        if let Some(port) = self.port {
            fields.push(format!("port: {port}"));
        }
        if let Some(size) = self.packet_size {
            fields.push(format!("packetSize: {size}"));
        }
        if let Some(timeout) = self.timeout {
            fields.push(format!("timeout: {}ms", timeout.as_millis()));
        }
        if let Some(backlog) = self.backlog {
            fields.push(format!("backlog: {backlog}"));
        }
        if let Some(max) = self.max_concurrent {
            fields.push(format!("maxConcurrent: {max}"));
        }
        if let Some(local_only) = self.local_only {
            fields.push(format!("localOnly: {local_only}"));
        }
        write!(f, "NetworkProperties{{{}}}", fields.join(", "))
    }
}

/// Serde adapter storing `Option<Duration>` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = EndpointConfig::new();
        assert!(!config.is_set());
        assert_eq!(config.to_string(), "NetworkProperties{}");
        assert_eq!(config.to_json().unwrap(), "{}");
    }

    #[test]
    fn test_display_lists_only_set_fields() {
        let config = EndpointConfig::server(9000, 5, 2).local_only(true);
        assert_eq!(
            config.to_string(),
            "NetworkProperties{port: 9000, backlog: 5, maxConcurrent: 2, localOnly: true}"
        );
    }

    #[test]
    fn test_json_uses_camel_case_and_millis() {
        let config = EndpointConfig::new()
            .port(4000)
            .packet_size(512)
            .timeout(Duration::from_millis(250))
            .max_concurrent(3);
        let json = config.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"port":4000,"packetSize":512,"timeout":250,"maxConcurrent":3}"#
        );
        assert_eq!(EndpointConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_from_json_partial() {
        let config = EndpointConfig::from_json(r#"{"host": "example.com", "localOnly": false}"#).unwrap();
        assert_eq!(config.host.as_deref(), Some("example.com"));
        assert_eq!(config.local_only, Some(false));
        assert!(config.port.is_none());
        assert!(!config.has_endpoint());
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(EndpointConfig::from_json(r#"{"port": "not a number"}"#).is_err());
        assert!(EndpointConfig::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_merge_fills_only_unset_fields() {
        let mut config = EndpointConfig::new().port(1234);
        config.merge(&EndpointConfig::client("localhost", 9999).packet_size(64));
        assert_eq!(config.port, Some(1234));
        assert_eq!(config.host.as_deref(), Some("localhost"));
        assert_eq!(config.packet_size, Some(64));
        assert!(config.timeout.is_none());
    }
}
