//! Protocol vocabulary: the reserved handshake name, request-name mappings,
//! handshake payloads and the recorded peer connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::ExportedKey;

/// Wire name of the internal handshake request.
pub const HANDSHAKE_REQUEST_NAME: &str = "post-messenger-connect";
/// Logical key of the handshake request; callers may not declare it.
pub const HANDSHAKE_KEY: &str = "postMessengerConnect";

/// Per-attempt handshake timeout, independent of the instance's `max_response_time`.
pub const HANDSHAKE_ATTEMPT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Request names an instance accepts, fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestNames {
    /// Any request name is used verbatim as its wire name.
    #[default]
    Unconstrained,
    /// Logical name -> wire name. Only declared logical names may be used.
    Constrained(BTreeMap<String, String>),
}

impl RequestNames {
    pub fn constrained<K, V>(names: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        RequestNames::Constrained(
            names
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Wire name for a logical request name, or `None` if it is not declared.
    pub fn resolve<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        match self {
            RequestNames::Unconstrained => Some(name),
            RequestNames::Constrained(map) => map.get(name).map(String::as_str),
        }
    }

    /// The declared mapping, as advertised during the handshake.
    pub fn declared(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            RequestNames::Unconstrained => None,
            RequestNames::Constrained(map) => Some(map),
        }
    }

    /// First declared key or wire name that collides with the handshake.
    pub fn reserved_collision(&self) -> Option<&str> {
        let map = self.declared()?;
        map.iter().find_map(|(key, wire)| {
            if is_reserved(key) {
                Some(key.as_str())
            } else if is_reserved(wire) {
                Some(wire.as_str())
            } else {
                None
            }
        })
    }
}

pub fn is_reserved(name: &str) -> bool {
    name == HANDSHAKE_KEY || name == HANDSHAKE_REQUEST_NAME
}

/// Handshake request body, sent unencrypted by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMessage {
    pub client_name: String,
    #[serde(default)]
    pub iv: Option<Vec<u8>>,
    #[serde(default)]
    pub exported_key: Option<ExportedKey>,
    /// Origin of the sending context; the acceptor replies to it.
    pub origin: String,
    #[serde(default)]
    pub request_names: Option<BTreeMap<String, String>>,
    pub use_encryption: bool,
}

/// Handshake reply body: the acceptor's own identity and capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReply {
    pub client_name: String,
    #[serde(default)]
    pub request_names: Option<BTreeMap<String, String>>,
    pub use_encryption: bool,
}

/// Verified peer metadata, recorded when a handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnection {
    pub peer_client_name: String,
    pub peer_request_names: Option<BTreeMap<String, String>>,
    pub use_encryption: bool,
}

impl PeerConnection {
    /// Whether the peer can serve `name`. A peer without a declared set accepts anything.
    pub fn supports(&self, name: &str) -> bool {
        self.peer_request_names
            .as_ref()
            .map_or(true, |names| names.contains_key(name))
    }
}

impl From<ConnectReply> for PeerConnection {
    fn from(reply: ConnectReply) -> Self {
        Self {
            peer_client_name: reply.client_name,
            peer_request_names: reply.request_names,
            use_encryption: reply.use_encryption,
        }
    }
}

/// Handshake progress of one messenger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Listening,
    Handshaking,
    Connected,
    HandshakeFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_resolves_verbatim() {
        let names = RequestNames::Unconstrained;
        assert_eq!(names.resolve("anything"), Some("anything"));
        assert!(names.declared().is_none());
        assert!(names.reserved_collision().is_none());
    }

    #[test]
    fn constrained_maps_logical_to_wire() {
        let names = RequestNames::constrained([("one", "test:one")]);
        assert_eq!(names.resolve("one"), Some("test:one"));
        assert_eq!(names.resolve("test:one"), None);
        assert_eq!(names.resolve("two"), None);
    }

    #[test]
    fn reserved_collisions_detected() {
        let by_key = RequestNames::constrained([(HANDSHAKE_KEY, "x")]);
        assert_eq!(by_key.reserved_collision(), Some(HANDSHAKE_KEY));
        let by_wire = RequestNames::constrained([("connect", HANDSHAKE_REQUEST_NAME)]);
        assert_eq!(by_wire.reserved_collision(), Some(HANDSHAKE_REQUEST_NAME));
    }

    #[test]
    fn connection_supports() {
        let open = PeerConnection {
            peer_client_name: "p".into(),
            peer_request_names: None,
            use_encryption: false,
        };
        assert!(open.supports("x"));
        let closed = PeerConnection {
            peer_request_names: Some(BTreeMap::new()),
            ..open
        };
        assert!(!closed.supports("x"));
    }

    #[test]
    fn connect_message_json_shape() {
        let msg = ConnectMessage {
            client_name: "page".into(),
            iv: None,
            exported_key: None,
            origin: "https://a.test".into(),
            request_names: None,
            use_encryption: false,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["clientName"], "page");
        assert_eq!(value["useEncryption"], false);
        let back: ConnectMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
