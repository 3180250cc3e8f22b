//! Identity generation for peers and objects.
//!
//! Routing-ids and object ids are random UUID strings. Peers may also supply
//! their own routing-id; any non-empty string is accepted.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fresh routing-id for a peer or server.
pub fn new_routing_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh object id.
pub fn new_object_id() -> String {
    Uuid::new_v4().to_string()
}

/// Transport-local handle of a connection, assigned by whoever accepts or
/// dials it. Unlike routing-ids these never leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw number.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of a server this node dials, kept for reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Endpoint for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }

        let port = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(port.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// Error parsing a `host:port` endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointParseError {
    #[error("endpoint must be host:port, got: {0}")]
    MissingPort(String),
    #[error("endpoint host cannot be empty")]
    EmptyHost,
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_uuids() {
        let a = new_routing_id();
        let b = new_routing_id();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
        assert_ne!(new_object_id(), new_object_id());
    }

    #[test]
    fn parse_endpoint() {
        let ep: Endpoint = "localhost:7890".parse().unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 7890);
        assert_eq!(ep.to_string(), "localhost:7890");
    }

    #[test]
    fn parse_endpoint_errors() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!(":7890".parse::<Endpoint>().is_err());
        assert!("host:http".parse::<Endpoint>().is_err());
    }
}
