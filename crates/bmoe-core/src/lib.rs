//! Core of the Biomine object exchange.
//!
//! Processes exchange self-describing objects (JSON metadata plus an optional
//! binary payload) over TCP. Servers forward each object to the peers whose
//! subscriptions match it and link up with other servers into a mesh.
//!
//! This crate is transport-agnostic: it turns bytes into objects, keeps the
//! peer table and makes routing decisions. Sockets and timers belong to the
//! caller, which hands outbound bytes over through [`Link`].

mod error;
mod federation;
mod frame;
mod identity;
mod integrity;
mod message;
mod peer;
mod router;
mod subscription;

pub use error::{LinkError, RoutingError, SendError};
pub use frame::{DELIMITER, Frame, FrameDecoder, FrameError, MAX_METADATA_LEN, encode_frame};
pub use identity::{ConnectionId, Endpoint, EndpointParseError, new_object_id, new_routing_id};
pub use integrity::{Integrity, checksum, verify};
pub use message::{Addressing, EventKind, Metadata, ObjectKind, keys};
pub use peer::{Link, Peer, Role, UnknownRole};
pub use router::{RouterConfig, Server};
pub use subscription::{Rule, Subscriptions, wildcard_matches};
