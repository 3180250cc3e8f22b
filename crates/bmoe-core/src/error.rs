//! Error types for routing and delivery.

use crate::frame::FrameError;
use crate::identity::ConnectionId;

/// The transport behind a peer is gone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
}

/// Failure to hand an object to a peer.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Failure handling one decoded object. The object is dropped; the
/// connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("unknown connection {0}")]
    UnknownPeer(ConnectionId),
    #[error("invalid subscriptions: {0}")]
    InvalidSubscriptions(#[source] serde_json::Error),
}
