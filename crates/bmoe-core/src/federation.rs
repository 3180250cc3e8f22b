//! Subscription handshake, server federation and liveness.
//!
//! Servers link up by subscribing to each other with `["*"]`. Topology
//! changes are announced to neighboring servers periodically, idle peers are
//! pinged, and peers we dialed are handed back to the caller for redialing
//! when they drop.

use crate::error::RoutingError;
use crate::identity::{ConnectionId, Endpoint, new_object_id};
use crate::message::{Addressing, EventKind, Metadata, keys};
use crate::peer::{Peer, Role};
use crate::router::Server;
use crate::subscription::Subscriptions;
use serde_json::Value;
use std::time::Instant;

impl Server {
    /// The `routing/subscribe` request this server sends to other servers.
    pub fn subscription_request(&self) -> Metadata {
        let mut metadata = Metadata::event(EventKind::Subscribe);
        metadata.insert(keys::ID, new_object_id());
        metadata.insert(keys::ROLE, Role::Server.as_str());
        metadata.insert(keys::SUBSCRIPTIONS, vec!["*"]);
        metadata.insert(keys::ROUTING_ID, self.routing_id.clone());
        metadata.insert(keys::NAME, self.name.clone());
        metadata
    }

    /// Register a server we dialed and subscribe to it.
    pub fn connect(&mut self, mut peer: Peer, endpoint: Endpoint, now: Instant) {
        let _enter = self.span.clone().entered();
        peer.set_role(Role::Server);
        let request = self.subscription_request();
        if let Err(e) = peer.send_object(request, None, now) {
            tracing::warn!(%endpoint, "Failed to subscribe: {}", e);
        }
        tracing::info!(%endpoint, connection = %peer.connection(), "Connected to server");
        self.outgoing.insert(peer.connection(), endpoint);
        self.peers.insert(peer.connection(), peer);
    }

    /// Forget a disconnected peer.
    ///
    /// Returns the endpoint to redial if we had dialed it.
    pub fn disconnect(&mut self, connection: ConnectionId, now: Instant) -> Option<Endpoint> {
        let _enter = self.span.clone().entered();
        let endpoint = self.outgoing.remove(&connection);
        let Some(peer) = self.peers.remove(&connection) else {
            return endpoint;
        };
        tracing::info!(peer = %peer.name(), routing_id = peer.routing_id(), "Disconnected");

        if peer.subscriptions().is_some() {
            self.neighbors_dirty = true;
            let mut notification = Metadata::event(EventKind::Disconnect);
            notification.insert(keys::ROUTING_ID, peer.routing_id());
            notification.insert(keys::NAME, peer.name());
            self.route_object(notification, None, None, false, now);
        }
        endpoint
    }

    /// Apply a `routing/subscribe` request from `connection`.
    pub(crate) fn handle_subscribe(
        &mut self,
        connection: ConnectionId,
        metadata: &Metadata,
        now: Instant,
    ) -> Result<(), RoutingError> {
        let subscriptions = match metadata.get(keys::SUBSCRIPTIONS) {
            Some(value) => {
                Subscriptions::from_value(value).map_err(RoutingError::InvalidSubscriptions)?
            }
            None => Subscriptions::default(),
        };
        let role = metadata.str(keys::ROLE).and_then(|r| match r.parse::<Role>() {
            Ok(role) => Some(role),
            Err(e) => {
                tracing::warn!("Ignoring {}", e);
                None
            }
        });
        let requested_name = metadata.str(keys::NAME).filter(|n| !n.is_empty());
        let name_claimed = requested_name.is_some_and(|name| {
            self.peers
                .iter()
                .any(|(c, p)| *c != connection && p.name() == name)
        });
        let own_request = self.subscription_request();

        let peer = self
            .peers
            .get_mut(&connection)
            .ok_or(RoutingError::UnknownPeer(connection))?;
        let was_server = peer.is_server();
        if !was_server {
            if let Some(role) = role {
                peer.set_role(role);
            }
        }
        let first = peer.set_subscriptions(subscriptions).is_none();
        if let Some(routing_id) = metadata.routing_id() {
            peer.set_routing_id(routing_id);
        }
        match requested_name {
            Some(name) if name_claimed => tracing::warn!(name, "Name already in use"),
            Some(name) => peer.set_name(name),
            None => {}
        }
        if let Some(username) = metadata.str(keys::USERNAME) {
            peer.set_username(Some(username.to_string()));
        }
        tracing::info!(
            role = %peer.role(),
            subscriptions = ?peer.subscriptions(),
            "Subscribed"
        );

        let mut reply = Metadata::event(EventKind::SubscribeReply);
        reply.insert(keys::ROUTING_ID, peer.routing_id());
        if peer.role() != Role::default() {
            reply.insert(keys::ROLE, peer.role().as_str());
        }
        if let Some(id) = metadata.id() {
            reply.insert(keys::IN_REPLY_TO, id);
        }
        if let Err(e) = peer.send_object(reply, None, now) {
            tracing::warn!("Failed to reply to subscription: {}", e);
        }

        // A server we did not dial only hears from us once we subscribe back.
        if peer.is_server() && !was_server {
            if let Err(e) = peer.send_object(own_request, None, now) {
                tracing::warn!("Failed to subscribe back: {}", e);
            }
        }

        if first {
            self.neighbors_dirty = true;
            let mut notification = Metadata::event(EventKind::SubscribeNotification);
            notification.insert(keys::ROUTING_ID, peer.routing_id());
            notification.insert(keys::ROLE, peer.role().as_str());
            notification.insert(keys::NAME, peer.name());
            self.route_object(notification, None, Some(connection), false, now);
        }
        Ok(())
    }

    /// Answer a `ping` meant for us and forward one meant for others.
    pub(crate) fn handle_ping(
        &mut self,
        connection: ConnectionId,
        metadata: Metadata,
        payload: Option<&[u8]>,
        now: Instant,
    ) -> Vec<ConnectionId> {
        let addressing = metadata.addressing(&self.routing_id);
        let mut delivered = Vec::new();

        if addressing != Addressing::Elsewhere {
            if let Some(peer) = self.peers.get_mut(&connection) {
                let sender = peer.routing_id().to_string();
                let originator = metadata
                    .routing_id()
                    .map(str::to_owned)
                    .or_else(|| metadata.route().into_iter().next())
                    .unwrap_or_else(|| sender.clone());

                let mut pong = Metadata::event(EventKind::Pong);
                pong.insert(keys::ID, new_object_id());
                pong.insert(keys::TO, originator.clone());
                pong.insert(keys::ROUTING_ID, self.routing_id.clone());
                if let Some(id) = metadata.id() {
                    pong.insert(keys::IN_REPLY_TO, id);
                }

                if originator == sender {
                    match peer.send_object(pong, None, now) {
                        Ok(()) => delivered.push(connection),
                        Err(e) => tracing::warn!("Failed to answer ping: {}", e),
                    }
                } else {
                    delivered.extend(self.route_object(pong, None, None, false, now));
                }
            }
        }

        if addressing != Addressing::Local {
            delivered.extend(self.route_object(metadata, payload, Some(connection), false, now));
        }
        delivered
    }

    /// Announce the neighbor set to other servers if it changed.
    ///
    /// Returns `None` when there was nothing to announce.
    pub fn announce_neighbors(&mut self, now: Instant) -> Option<Vec<ConnectionId>> {
        if !self.neighbors_dirty {
            return None;
        }
        self.neighbors_dirty = false;

        let neighbors: Vec<Value> = self
            .peers
            .values()
            .filter(|p| p.has_subscriptions())
            .map(|p| Value::from(p.routing_id()))
            .collect();
        let _enter = self.span.clone().entered();
        tracing::debug!(count = neighbors.len(), "Announcing neighbors");

        let mut announcement = Metadata::event(EventKind::NeighborAnnouncement);
        announcement.insert(keys::ROUTING_ID, self.routing_id.clone());
        announcement.insert(keys::NEIGHBORS, neighbors);
        Some(self.route_object(announcement, None, None, true, now))
    }

    /// Ping peers that have been idle too long.
    ///
    /// Server peers are measured on time since we last sent to them, other
    /// peers on time since we last heard from them.
    pub fn keepalive(&mut self, now: Instant) -> Vec<ConnectionId> {
        let server_idle = self.config.server_idle_ping.as_secs_f64();
        let client_idle = self.config.client_idle_ping.as_secs_f64();
        let mut pinged = Vec::new();

        for (connection, peer) in &mut self.peers {
            let idle = if peer.is_server() {
                peer.seconds_since_sent(now) > server_idle
            } else {
                peer.seconds_since_received(now) > client_idle
            };
            if !idle {
                continue;
            }
            let _enter = peer.span().clone().entered();
            match peer.ping(now) {
                Ok(()) => {
                    tracing::debug!("Ping");
                    pinged.push(*connection);
                }
                Err(e) => tracing::warn!("Ping failed: {}", e),
            }
        }
        pinged
    }
}
