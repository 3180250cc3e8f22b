//! Object metadata and protocol events.
//!
//! Metadata is an open JSON object. A handful of keys have a defined meaning
//! (see [`keys`]); everything else travels through the mesh untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys with a defined meaning.
pub mod keys {
    pub const TYPE: &str = "type";
    pub const SIZE: &str = "size";
    pub const ID: &str = "id";
    pub const EVENT: &str = "event";
    pub const TO: &str = "to";
    pub const ROUTE: &str = "route";
    pub const ROUTING_ID: &str = "routing-id";
    pub const NATURES: &str = "natures";
    pub const SHA1: &str = "sha1";
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    pub const IN_REPLY_TO: &str = "in-reply-to";
    pub const NAME: &str = "name";
    pub const USERNAME: &str = "username";
    pub const ROLE: &str = "role";
    pub const NEIGHBORS: &str = "neighbors";
}

/// Metadata of a single object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Metadata for a data object with the given MIME type.
    pub fn data(content_type: impl Into<String>) -> Self {
        let mut metadata = Self::new();
        metadata.insert(keys::TYPE, content_type.into());
        metadata
    }

    /// Metadata for a control object.
    pub fn event(kind: EventKind) -> Self {
        let mut metadata = Self::new();
        metadata.insert(keys::EVENT, kind.name());
        metadata
    }

    /// Raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether `key` is present, whatever its value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set `key`, returning the value it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// The underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Unwrap into the underlying JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// String value of `key`, if present and a string.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Object identity, if set and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.str(keys::ID).filter(|id| !id.is_empty())
    }

    /// Routing-id of the original sender, if set and non-empty.
    pub fn routing_id(&self) -> Option<&str> {
        self.str(keys::ROUTING_ID).filter(|id| !id.is_empty())
    }

    /// Hex SHA-1 of the payload as declared by the sender.
    pub fn sha1(&self) -> Option<&str> {
        self.str(keys::SHA1)
    }

    /// MIME type without parameters: `type` truncated at the first space or
    /// semicolon.
    pub fn mime_type(&self) -> Option<&str> {
        self.str(keys::TYPE).map(strip_parameters)
    }

    /// Explicit recipients from `to`.
    ///
    /// `None` means broadcast. A string is a single recipient; non-string
    /// entries of a list are ignored.
    pub fn recipients(&self) -> Option<Vec<String>> {
        match self.0.get(keys::TO)? {
            Value::String(to) => Some(vec![to.clone()]),
            Value::Array(to) => Some(
                to.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Routing-ids already visited, oldest first. Missing or malformed routes
    /// are treated as empty.
    pub fn route(&self) -> Vec<String> {
        match self.0.get(keys::ROUTE) {
            Some(Value::Array(route)) => route
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Overwrite `route`.
    pub fn set_route(&mut self, route: Vec<String>) {
        self.insert(keys::ROUTE, route);
    }

    /// Tags matched by `#` subscription rules.
    pub fn natures(&self) -> Option<&[Value]> {
        self.0
            .get(keys::NATURES)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
    }

    /// Payload length declared by `size`, coerced to a non-negative integer.
    ///
    /// Returns `None` only when the key is absent; values that are not
    /// numbers (or numeric strings) count as zero.
    pub fn declared_size(&self) -> Option<usize> {
        self.0.get(keys::SIZE).map(coerce_size)
    }

    /// Data object or control event, decided by the presence of `event`.
    pub fn kind(&self) -> ObjectKind {
        match self.0.get(keys::EVENT) {
            None => ObjectKind::Data,
            Some(name) => ObjectKind::Event(EventKind::from(name.as_str().unwrap_or_default())),
        }
    }

    /// How this object is addressed relative to `own_id`.
    pub fn addressing(&self, own_id: &str) -> Addressing {
        let Some(recipients) = self.recipients() else {
            return Addressing::Local;
        };
        let ours = recipients.iter().filter(|r| *r == own_id).count();
        if ours == 0 {
            Addressing::Elsewhere
        } else if ours == recipients.len() {
            Addressing::Local
        } else {
            Addressing::Shared
        }
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn strip_parameters(content_type: &str) -> &str {
    content_type
        .split([' ', ';'])
        .next()
        .unwrap_or(content_type)
}

/// Leading-integer coercion: `"12abc"` is 12, negatives and non-numbers are 0.
fn coerce_size(value: &Value) -> usize {
    match value {
        Value::Number(n) => {
            if let Some(n) = n.as_u64() {
                n as usize
            } else {
                n.as_f64().filter(|f| *f > 0.0).map_or(0, |f| f as usize)
            }
        }
        Value::String(s) => {
            let s = s.trim_start();
            let s = s.strip_prefix('+').unwrap_or(s);
            let digits = s.bytes().take_while(u8::is_ascii_digit).count();
            s[..digits].parse().unwrap_or(0)
        }
        _ => 0,
    }
}

/// Whether an object carries content or controls the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Data,
    Event(EventKind),
}

/// Control events understood by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Ping,
    Pong,
    Subscribe,
    SubscribeReply,
    SubscribeNotification,
    Disconnect,
    NeighborAnnouncement,
    /// Any other event; routed like data.
    Other(String),
}

impl EventKind {
    /// Wire name carried in the `event` key.
    pub fn name(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "routing/subscribe",
            Self::SubscribeReply => "routing/subscribe/reply",
            Self::SubscribeNotification => "routing/subscribe/notification",
            Self::Disconnect => "routing/disconnect",
            Self::NeighborAnnouncement => "routing/announcement/neighbors",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "routing/subscribe" => Self::Subscribe,
            "routing/subscribe/reply" => Self::SubscribeReply,
            "routing/subscribe/notification" => Self::SubscribeNotification,
            "routing/disconnect" => Self::Disconnect,
            "routing/announcement/neighbors" => Self::NeighborAnnouncement,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Whether an object is meant for this node, for others, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// No `to`, or `to` names only us.
    Local,
    /// `to` names us among others: handle locally and forward.
    Shared,
    /// `to` does not name us.
    Elsewhere,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> Metadata {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn mime_type_drops_parameters() {
        let m = metadata(json!({"type": "text/plain; charset=UTF-8"}));
        assert_eq!(m.mime_type(), Some("text/plain"));
        let m = metadata(json!({"type": "text/html charset=latin1"}));
        assert_eq!(m.mime_type(), Some("text/html"));
    }

    #[test]
    fn size_coercion() {
        assert_eq!(metadata(json!({"size": 5})).declared_size(), Some(5));
        assert_eq!(metadata(json!({"size": "12abc"})).declared_size(), Some(12));
        assert_eq!(metadata(json!({"size": "abc"})).declared_size(), Some(0));
        assert_eq!(metadata(json!({"size": -3})).declared_size(), Some(0));
        assert_eq!(metadata(json!({"size": 2.9})).declared_size(), Some(2));
        assert_eq!(metadata(json!({"size": null})).declared_size(), Some(0));
        assert_eq!(metadata(json!({})).declared_size(), None);
    }

    #[test]
    fn recipients_accept_string_or_list() {
        assert_eq!(
            metadata(json!({"to": "a"})).recipients(),
            Some(vec!["a".to_string()])
        );
        assert_eq!(
            metadata(json!({"to": ["a", 1, "b"]})).recipients(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(metadata(json!({})).recipients(), None);
    }

    #[test]
    fn kind_from_event_key() {
        assert_eq!(metadata(json!({"type": "text/plain"})).kind(), ObjectKind::Data);
        assert_eq!(
            metadata(json!({"event": "routing/subscribe"})).kind(),
            ObjectKind::Event(EventKind::Subscribe)
        );
        assert_eq!(
            metadata(json!({"event": "custom"})).kind(),
            ObjectKind::Event(EventKind::Other("custom".into()))
        );
    }

    #[test]
    fn addressing_tri_state() {
        assert_eq!(metadata(json!({})).addressing("me"), Addressing::Local);
        assert_eq!(metadata(json!({"to": "me"})).addressing("me"), Addressing::Local);
        assert_eq!(
            metadata(json!({"to": ["me", "you"]})).addressing("me"),
            Addressing::Shared
        );
        assert_eq!(
            metadata(json!({"to": ["you"]})).addressing("me"),
            Addressing::Elsewhere
        );
    }
}
