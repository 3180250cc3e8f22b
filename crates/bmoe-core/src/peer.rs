//! Connected peers.

use crate::error::{LinkError, SendError};
use crate::frame::encode_frame;
use crate::identity::{ConnectionId, new_object_id, new_routing_id};
use crate::message::{EventKind, Metadata, keys};
use crate::subscription::Subscriptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::Span;

/// Outbound half of a connection.
///
/// `send` queues bytes for the remote side; `close` shuts the connection down
/// once everything already queued has been written.
pub trait Link: Send {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), LinkError>;
    fn close(&mut self);
}

/// What a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    #[default]
    Client,
    Service,
}

impl Role {
    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            "service" => Ok(Self::Service),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A `role` value that names no [`Role`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// A live connection and everything known about the remote side.
pub struct Peer {
    connection: ConnectionId,
    routing_id: String,
    /// Set once the remote side supplied (or accepted) a routing-id.
    routing_id_confirmed: bool,
    name: String,
    username: Option<String>,
    role: Role,
    /// `None` until the peer subscribes; until then it receives nothing.
    subscriptions: Option<Subscriptions>,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    link: Box<dyn Link>,
    span: Span,
}

impl Peer {
    /// A peer that has not subscribed yet, with a random provisional
    /// routing-id.
    pub fn new(connection: ConnectionId, name: impl Into<String>, link: Box<dyn Link>) -> Self {
        let name = name.into();
        let routing_id = new_routing_id();
        let span = tracing::info_span!("peer", %connection, %name, %routing_id);
        Self {
            connection,
            routing_id,
            routing_id_confirmed: false,
            name,
            username: None,
            role: Role::default(),
            subscriptions: None,
            last_sent: None,
            last_received: None,
            link,
            span,
        }
    }

    /// Local connection the peer is reached over.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Current routing-id. Provisional until [`Peer::set_routing_id`].
    pub fn routing_id(&self) -> &str {
        &self.routing_id
    }

    /// Whether the routing-id came from a subscribe request.
    pub fn has_confirmed_routing_id(&self) -> bool {
        self.routing_id_confirmed
    }

    /// Fix the routing-id and confirm it.
    pub fn set_routing_id(&mut self, routing_id: impl Into<String>) {
        self.routing_id = routing_id.into();
        self.routing_id_confirmed = true;
        self.span.record("routing_id", self.routing_id.as_str());
    }

    /// Display name, the socket address until the peer names itself.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the peer, for logs and client listings.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.span.record("name", self.name.as_str());
    }

    /// User name reported in the subscribe request.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Replace the reported user name.
    pub fn set_username(&mut self, username: Option<String>) {
        self.username = username;
    }

    /// Role declared in the subscribe request, [`Role::Client`] before one.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Change the declared role.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Whether the peer is another server of the mesh.
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Current rule set, `None` before the first subscribe.
    pub fn subscriptions(&self) -> Option<&Subscriptions> {
        self.subscriptions.as_ref()
    }

    /// Replace the rule set, returning the previous one.
    pub fn set_subscriptions(&mut self, subscriptions: Subscriptions) -> Option<Subscriptions> {
        self.subscriptions.replace(subscriptions)
    }

    /// Subscribed with at least one rule.
    pub fn has_subscriptions(&self) -> bool {
        self.subscriptions.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Whether the peer's rules accept an object with `metadata`.
    pub fn is_subscribed(&self, metadata: &Metadata) -> bool {
        self.subscriptions
            .as_ref()
            .is_some_and(|s| s.matches(metadata))
    }

    /// Seconds since the last object was sent, infinite if none was.
    pub fn seconds_since_sent(&self, now: Instant) -> f64 {
        seconds_since(self.last_sent, now)
    }

    /// Seconds since the last object was received, infinite if none was.
    pub fn seconds_since_received(&self, now: Instant) -> f64 {
        seconds_since(self.last_received, now)
    }

    /// Record activity from the remote side.
    pub fn mark_received(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    /// Encode and queue an object, filling in `size` from the payload.
    pub fn send_object(
        &mut self,
        mut metadata: Metadata,
        payload: Option<&[u8]>,
        now: Instant,
    ) -> Result<(), SendError> {
        let bytes = encode_frame(&mut metadata, payload)?;
        self.link.send(bytes)?;
        self.last_sent = Some(now);
        Ok(())
    }

    /// Send a `ping`, addressed to the peer's routing-id once it is known.
    pub fn ping(&mut self, now: Instant) -> Result<(), SendError> {
        let mut metadata = Metadata::event(EventKind::Ping);
        if self.routing_id_confirmed {
            metadata.insert(keys::TO, self.routing_id.clone());
        }
        metadata.insert(keys::ID, new_object_id());
        self.send_object(metadata, None, now)
    }

    /// Ask the link to flush and close.
    pub fn close(&mut self) {
        self.link.close();
    }

    /// Tracing span carrying the peer's connection, name and routing-id.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("connection", &self.connection)
            .field("routing_id", &self.routing_id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn seconds_since(at: Option<Instant>, now: Instant) -> f64 {
    at.map_or(f64::INFINITY, |at| now.saturating_duration_since(at).as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDecoder;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Link for Captured {
        fn send(&mut self, bytes: Vec<u8>) -> Result<(), LinkError> {
            self.0.lock().unwrap().extend(bytes);
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct Broken;

    impl Link for Broken {
        fn send(&mut self, _: Vec<u8>) -> Result<(), LinkError> {
            Err(LinkError::Closed)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn timestamps_start_infinite() {
        let peer = Peer::new(ConnectionId::new(1), "p", Box::new(Broken));
        let now = Instant::now();
        assert!(peer.seconds_since_sent(now).is_infinite());
        assert!(peer.seconds_since_received(now).is_infinite());
    }

    #[test]
    fn send_object_fills_size_and_stamps() {
        let captured = Captured::default();
        let mut peer = Peer::new(ConnectionId::new(1), "p", Box::new(captured.clone()));
        let start = Instant::now();
        peer.send_object(Metadata::data("text/plain"), Some(b"hello"), start)
            .unwrap();

        let frames = FrameDecoder::new()
            .decode(&captured.0.lock().unwrap())
            .unwrap();
        assert_eq!(frames[0].metadata.declared_size(), Some(5));
        assert_eq!(
            peer.seconds_since_sent(start + Duration::from_secs(3)),
            3.0
        );
    }

    #[test]
    fn failed_send_does_not_stamp() {
        let mut peer = Peer::new(ConnectionId::new(1), "p", Box::new(Broken));
        assert!(peer.ping(Instant::now()).is_err());
        assert!(peer.seconds_since_sent(Instant::now()).is_infinite());
    }

    #[test]
    fn ping_targets_confirmed_routing_id() {
        let captured = Captured::default();
        let mut peer = Peer::new(ConnectionId::new(1), "p", Box::new(captured.clone()));
        peer.ping(Instant::now()).unwrap();
        peer.set_routing_id("remote");
        peer.ping(Instant::now()).unwrap();

        let frames = FrameDecoder::new()
            .decode(&captured.0.lock().unwrap())
            .unwrap();
        assert_eq!(frames[0].metadata.kind(), crate::ObjectKind::Event(EventKind::Ping));
        assert_eq!(frames[0].metadata.recipients(), None);
        assert_eq!(frames[1].metadata.recipients(), Some(vec!["remote".to_string()]));
        assert!(frames[1].metadata.id().is_some());
    }

    #[test]
    fn unsubscribed_peer_matches_nothing() {
        let mut peer = Peer::new(ConnectionId::new(1), "p", Box::new(Broken));
        let metadata = Metadata::data("text/plain");
        assert!(!peer.is_subscribed(&metadata));
        assert_eq!(peer.set_subscriptions(Subscriptions::all()), None);
        assert!(peer.is_subscribed(&metadata));
    }
}
