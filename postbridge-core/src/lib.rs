//! Postbridge: request/response messaging between two isolated contexts over
//! an unordered, origin-tagged message transport.
//! Transport-agnostic: the host supplies a [`Host`] and [`Window`]s; the
//! messenger correlates requests, serves responders and negotiates sessions.

/// Tracing event tagged with the instance's client name, emitted only when
/// the instance has logging enabled.
macro_rules! trace_event {
    ($inner:expr, $level:ident, $($arg:tt)+) => {
        if $inner.config.enable_logging {
            let client = &$inner.config.client_name;
            tracing::$level!(client = %client, $($arg)+);
        }
    };
}

pub mod codec;
pub mod config;
pub mod crypto;
pub mod messenger;
pub mod negotiator;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigError, MessengerConfig};
pub use crypto::{CryptoError, CryptoSession, ExportedKey};
pub use messenger::{normalize_origin, Messenger, MessengerError, RequestOptions};
pub use negotiator::{AcceptArgs, ConnectArgs};
pub use protocol::{
    ConnectMessage, ConnectReply, NegotiationState, PeerConnection, RequestNames,
    HANDSHAKE_REQUEST_NAME,
};
pub use registry::{Listener, ListenerRegistry, OriginValidator, RemoveListener};
pub use responder::{Handler, Responders, UnbindResponders};
pub use transport::{EventHandler, Host, MessageEvent, SubscriptionId, TransportError, Window, ANY_ORIGIN};
pub use wire::WireMessage;
