//! In-crate fakes for the transport collaborator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::crypto::CryptoSession;
use crate::messenger::Messenger;
use crate::protocol::{NegotiationState, PeerConnection};
use crate::transport::{EventHandler, Host, MessageEvent, SubscriptionId, TransportError, Window};
use crate::wire::WireMessage;

pub const ORIGIN_PAGE: &str = "https://page.test";
pub const ORIGIN_FRAME: &str = "https://frame.test";

/// Host whose inbound events are pushed by the test with [`MockHost::deliver`].
pub struct MockHost {
    origin: String,
    handlers: Mutex<Vec<(SubscriptionId, EventHandler)>>,
    next_id: AtomicU64,
}

impl MockHost {
    pub fn new(origin: &str) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.to_string(),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn deliver(&self, event: MessageEvent) {
        let handlers: Vec<EventHandler> = self.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl Host for MockHost {
    fn origin(&self) -> String {
        self.origin.clone()
    }

    fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.lock().retain(|(existing, _)| *existing != id);
    }
}

type PostHook = Arc<dyn Fn(Value) + Send + Sync>;

/// Window that records every post and optionally reacts to it synchronously.
#[derive(Default)]
pub struct MockWindow {
    posted: Mutex<Vec<(Value, String)>>,
    on_post: Mutex<Option<PostHook>>,
    notify: Notify,
}

impl MockWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn posted(&self) -> Vec<(Value, String)> {
        self.posted.lock().clone()
    }

    pub fn respond_with(&self, hook: impl Fn(Value) + Send + Sync + 'static) {
        *self.on_post.lock() = Some(Arc::new(hook));
    }

    /// Wait until at least `count` messages were posted. Panics after a second.
    pub async fn wait_for_posts(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.posted.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("expected messages were not posted");
    }
}

impl Window for MockWindow {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), TransportError> {
        self.posted
            .lock()
            .push((message.clone(), target_origin.to_string()));
        self.notify.notify_waiters();
        let hook = self.on_post.lock().clone();
        if let Some(hook) = hook {
            hook(message);
        }
        Ok(())
    }
}

pub fn request_event(name: &str, id: &str, data: Value, origin: &str) -> MessageEvent {
    MessageEvent {
        data: WireMessage::new(name, id, data).to_value(),
        origin: origin.to_string(),
        source: None,
    }
}

/// Response to a posted request, correlated by its `requestName` and `requestId`.
pub fn reply_event(request: &Value, data: Value, error: Option<&str>, origin: &str) -> MessageEvent {
    let name = request["requestName"].as_str().unwrap_or_default();
    let id = request["requestId"].as_str().unwrap_or_default();
    let message = match error {
        Some(text) => WireMessage::error(name, id, text),
        None => WireMessage::new(name, id, data),
    };
    MessageEvent {
        data: message.to_value(),
        origin: origin.to_string(),
        source: None,
    }
}

/// Put `messenger` in the state a completed encrypted handshake with `peer`
/// leaves behind. Returns the shared session.
pub fn establish_session(messenger: &Messenger, peer: &str) -> CryptoSession {
    let session = CryptoSession::generate();
    *messenger.inner.crypto.write() = Some(session.clone());
    let mut state = messenger.inner.state.lock();
    state.connection = Some(PeerConnection {
        peer_client_name: peer.to_string(),
        peer_request_names: None,
        use_encryption: true,
    });
    state.negotiation = NegotiationState::Connected;
    session
}
