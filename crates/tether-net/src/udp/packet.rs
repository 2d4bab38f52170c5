//! Text datagram paired with its endpoint.

use std::fmt;

use crate::config::EndpointConfig;

/// One datagram: an endpoint plus UTF-8 text content.
///
/// When sending, the endpoint is the destination and must carry a host and a
/// port. Received packets carry the sender's address as host and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Packet {
    config: EndpointConfig,
    content: String,
}

impl Packet {
    /// Create a packet for `config` carrying `content`.
    pub fn new(config: EndpointConfig, content: impl Into<String>) -> Self {
        Self {
            config,
            content: content.into(),
        }
    }

    /// Create a packet addressed to `host:port`.
    pub fn to(host: impl Into<String>, port: u16, content: impl Into<String>) -> Self {
        Self::new(EndpointConfig::client(host, port), content)
    }

    /// The packet's endpoint.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The text payload.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Host of the endpoint, if set.
    pub fn host(&self) -> Option<&str> {
        self.config.host.as_deref()
    }

    /// Port of the endpoint, if set.
    pub fn port(&self) -> Option<u16> {
        self.config.port
    }

    /// Consume the packet, returning its payload.
    pub fn into_content(self) -> String {
        self.content
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UDPPacket{{properties={}, content={}}}",
            self.config, self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_accessors() {
        let packet = Packet::to("127.0.0.1", 5000, "hello");
        assert_eq!(packet.host(), Some("127.0.0.1"));
        assert_eq!(packet.port(), Some(5000));
        assert_eq!(packet.content(), "hello");
        assert_eq!(
            packet.to_string(),
            "UDPPacket{properties=NetworkProperties{host: 127.0.0.1, port: 5000}, content=hello}"
        );
        assert_eq!(packet.into_content(), "hello");
    }
}
