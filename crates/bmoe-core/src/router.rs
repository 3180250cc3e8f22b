//! The routing engine.
//!
//! [`Server`] owns every connected [`Peer`] and decides, for each object, which
//! of them receive it. It performs no I/O of its own: bytes leave through each
//! peer's [`Link`](crate::Link) and the caller supplies the current time.
//! All methods take `&mut self`, so one owner serializes every routing
//! decision.

use crate::error::RoutingError;
use crate::frame::Frame;
use crate::identity::{ConnectionId, Endpoint, new_object_id, new_routing_id};
use crate::integrity::{self, Integrity};
use crate::message::{Addressing, EventKind, Metadata, ObjectKind, keys};
use crate::peer::Peer;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::Span;

/// Tunables for the routing engine.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ping a server peer after this long without sending to it.
    pub server_idle_ping: Duration,
    /// Ping a client peer after this long without hearing from it.
    pub client_idle_ping: Duration,
    /// Add `sha1` to data objects that arrive without one.
    pub annotate_checksums: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            server_idle_ping: Duration::from_secs(100),
            client_idle_ping: Duration::from_secs(170),
            annotate_checksums: true,
        }
    }
}

/// Routing authority for one process.
pub struct Server {
    pub(crate) routing_id: String,
    pub(crate) name: String,
    pub(crate) config: RouterConfig,
    pub(crate) peers: BTreeMap<ConnectionId, Peer>,
    /// Peers we dialed, with the address to redial when they drop.
    pub(crate) outgoing: HashMap<ConnectionId, Endpoint>,
    /// The neighbor set changed since the last announcement.
    pub(crate) neighbors_dirty: bool,
    pub(crate) span: Span,
}

impl Server {
    /// Server with a random routing-id.
    pub fn new(name: impl Into<String>, config: RouterConfig) -> Self {
        Self::with_routing_id(new_routing_id(), name, config)
    }

    /// Server with a fixed routing-id.
    pub fn with_routing_id(
        routing_id: impl Into<String>,
        name: impl Into<String>,
        config: RouterConfig,
    ) -> Self {
        let routing_id = routing_id.into();
        let name = name.into();
        let span = tracing::info_span!("server", %name, %routing_id);
        Self {
            routing_id,
            name,
            config,
            peers: BTreeMap::new(),
            outgoing: HashMap::new(),
            neighbors_dirty: false,
            span,
        }
    }

    pub fn routing_id(&self) -> &str {
        &self.routing_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Peer on `connection`.
    pub fn peer(&self, connection: ConnectionId) -> Option<&Peer> {
        self.peers.get(&connection)
    }

    /// First peer whose routing-id is `routing_id`.
    pub fn peer_by_routing_id(&self, routing_id: &str) -> Option<&Peer> {
        self.peers.values().find(|p| p.routing_id() == routing_id)
    }

    /// All peers in connection order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether the neighbor list changed since it was last announced.
    pub fn neighbors_dirty(&self) -> bool {
        self.neighbors_dirty
    }

    /// Endpoint we dialed to reach `connection`, if we dialed it.
    pub fn outgoing_endpoint(&self, connection: ConnectionId) -> Option<&Endpoint> {
        self.outgoing.get(&connection)
    }

    /// Register a peer accepted by the listener.
    pub fn accept(&mut self, peer: Peer) {
        let _enter = self.span.enter();
        tracing::info!(peer = %peer.name(), connection = %peer.connection(), "Connected");
        self.peers.insert(peer.connection(), peer);
    }

    /// Close every link after pending writes. Peers stay registered until
    /// the transport reports them disconnected.
    pub fn close_all(&mut self) {
        for peer in self.peers.values_mut() {
            peer.close();
        }
    }

    /// Handle one decoded object from `connection`.
    ///
    /// Returns the connections the object (or its consequences) were
    /// delivered to. Errors are local to this object.
    pub fn receive(
        &mut self,
        connection: ConnectionId,
        frame: Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionId>, RoutingError> {
        let peer = self
            .peers
            .get_mut(&connection)
            .ok_or(RoutingError::UnknownPeer(connection))?;
        peer.mark_received(now);
        let _enter = peer.span().clone().entered();

        let Frame {
            mut metadata,
            payload,
        } = frame;
        let payload = payload.as_deref();

        match metadata.kind() {
            ObjectKind::Event(EventKind::Subscribe) => {
                self.handle_subscribe(connection, &metadata, now)?;
                Ok(Vec::new())
            }
            ObjectKind::Event(EventKind::SubscribeReply) => {
                tracing::debug!(
                    routing_id = metadata.routing_id().unwrap_or_default(),
                    "Subscription acknowledged"
                );
                Ok(Vec::new())
            }
            ObjectKind::Event(EventKind::Ping) => {
                Ok(self.handle_ping(connection, metadata, payload, now))
            }
            ObjectKind::Event(EventKind::Pong) => {
                if metadata.addressing(&self.routing_id) == Addressing::Local {
                    tracing::debug!(in_reply_to = metadata.str(keys::IN_REPLY_TO), "Pong");
                    return Ok(Vec::new());
                }
                Ok(self.route_object(metadata, payload, Some(connection), false, now))
            }
            ObjectKind::Event(_) => {
                Ok(self.route_object(metadata, payload, Some(connection), false, now))
            }
            ObjectKind::Data => {
                tracing::debug!(
                    content_type = metadata.str(keys::TYPE).unwrap_or_default(),
                    size = payload.map_or(0, <[u8]>::len),
                    "Received object"
                );
                if let Some(payload) = payload {
                    self.check_integrity(&mut metadata, payload);
                }
                Ok(self.route_object(metadata, payload, Some(connection), false, now))
            }
        }
    }

    /// Mismatches are logged and the object is still routed.
    fn check_integrity(&self, metadata: &mut Metadata, payload: &[u8]) {
        match integrity::verify(metadata, payload) {
            Integrity::Mismatch { declared, actual } => {
                tracing::warn!(%declared, %actual, id = metadata.id(), "SHA-1 mismatch");
            }
            Integrity::Undeclared if self.config.annotate_checksums => {
                metadata.insert(keys::SHA1, integrity::checksum(payload));
            }
            _ => {}
        }
    }

    /// Deliver an object to every peer whose subscription accepts it.
    ///
    /// Annotates `id`, `routing-id` and `route`, never delivers to a peer
    /// already on the route, and with `servers_only` restricts delivery to
    /// server peers. When `to` names recipients that are not all directly
    /// connected, matching servers off the route get a copy so later hops
    /// can complete delivery.
    pub fn route_object(
        &mut self,
        mut metadata: Metadata,
        payload: Option<&[u8]>,
        from: Option<ConnectionId>,
        servers_only: bool,
        now: Instant,
    ) -> Vec<ConnectionId> {
        if metadata.id().is_none() {
            metadata.insert(keys::ID, new_object_id());
        }

        let from_id = from
            .and_then(|c| self.peers.get(&c))
            .map(|p| p.routing_id().to_string());
        if let Some(from_id) = &from_id {
            if metadata.routing_id().is_none() {
                metadata.insert(keys::ROUTING_ID, from_id.clone());
            }
        }

        let mut route = metadata.route();
        for hop in from_id.iter().chain(std::iter::once(&self.routing_id)) {
            if !route.contains(hop) {
                route.push(hop.clone());
            }
        }

        let recipients = metadata.recipients();
        let is_recipient = |peer: &Peer| {
            recipients
                .as_ref()
                .is_some_and(|to| contains(to, peer.routing_id()))
        };

        let mut reachable = 0;
        let mut targets = Vec::new();
        for (connection, peer) in &self.peers {
            if recipients.is_some() && !is_recipient(peer) {
                continue;
            }
            reachable += 1;
            if contains(&route, peer.routing_id()) || (servers_only && !peer.is_server()) {
                continue;
            }
            if peer.is_subscribed(&metadata) {
                targets.push(*connection);
            }
        }

        if let Some(to) = &recipients {
            if reachable < to.len() {
                for (connection, peer) in &self.peers {
                    if peer.is_server()
                        && !contains(&route, peer.routing_id())
                        && peer.is_subscribed(&metadata)
                    {
                        targets.push(*connection);
                    }
                }
            }
        }

        targets.sort_unstable();
        targets.dedup();

        for connection in &targets {
            let peer = &self.peers[connection];
            if (peer.is_server() || is_recipient(peer)) && !contains(&route, peer.routing_id()) {
                route.push(peer.routing_id().to_string());
            }
        }

        let mut delivered = Vec::with_capacity(targets.len());
        for connection in targets {
            let Some(peer) = self.peers.get_mut(&connection) else {
                continue;
            };
            let mut outgoing = metadata.clone();
            outgoing.set_route(
                route
                    .iter()
                    .filter(|r| *r != peer.routing_id())
                    .cloned()
                    .collect(),
            );
            match peer.send_object(outgoing, payload, now) {
                Ok(()) => {
                    tracing::debug!(to = %peer.name(), id = metadata.id(), "Routed");
                    delivered.push(connection);
                }
                Err(e) => tracing::warn!(to = %peer.name(), "Delivery failed: {}", e),
            }
        }
        delivered
    }
}

fn contains(ids: &[String], id: &str) -> bool {
    ids.iter().any(|i| i == id)
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("routing_id", &self.routing_id)
            .field("name", &self.name)
            .field("peers", &self.peers.len())
            .field("neighbors_dirty", &self.neighbors_dirty)
            .finish_non_exhaustive()
    }
}
