//! Transport collaborator: how a messenger reaches the other context and how
//! inbound messages reach it. Supplied by the host environment; delivery may
//! be lossy and unordered.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Wildcard target origin: deliver regardless of the receiver's origin.
pub const ANY_ORIGIN: &str = "*";

/// A remote context that can be posted to.
pub trait Window: Send + Sync {
    /// Queue `message` for delivery. The receiving side drops it unless its
    /// origin matches `target_origin` (or `target_origin` is `*`).
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), TransportError>;
}

/// Inbound event as delivered by the transport.
#[derive(Clone)]
pub struct MessageEvent {
    pub data: Value,
    /// Origin of the sending context, tagged by the transport.
    pub origin: String,
    /// Handle for replying to the sender, when the transport knows it.
    pub source: Option<Arc<dyn Window>>,
}

impl fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("data", &self.data)
            .field("origin", &self.origin)
            .field("source", &self.source.is_some())
            .finish()
    }
}

pub type EventHandler = Arc<dyn Fn(MessageEvent) + Send + Sync>;

/// Opaque id returned by [`Host::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The local context: where inbound messages arrive.
pub trait Host: Send + Sync {
    /// Origin of this context, announced to peers during the handshake.
    fn origin(&self) -> String;
    fn subscribe(&self, handler: EventHandler) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("target context is closed")]
    Closed,
    #[error("transport error: {0}")]
    Other(String),
}
