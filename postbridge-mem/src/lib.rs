//! postbridge-mem: in-process window bus for postbridge.
//!
//! Each [`MemoryWindow`] is one context with its own origin. A context reaches
//! another through a handle from [`MemoryWindow::handle_to`]; posting through
//! it delivers asynchronously, tags the event with the sender's origin and
//! hands the receiver a handle back to the sender, like a browser's
//! `postMessage`. Messages whose target origin does not match the receiver
//! are dropped silently.
//!
//! ```ignore
//! let page = MemoryWindow::new("https://page.test");
//! let frame = MemoryWindow::new("https://frame.test");
//! let messenger = Messenger::new(config, RequestNames::Unconstrained, page.host())?;
//! messenger.connect(ConnectArgs::new(page.handle_to(&frame), "https://frame.test")).await?;
//! ```

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use postbridge_core::{
    EventHandler, Host, MessageEvent, SubscriptionId, TransportError, Window, ANY_ORIGIN,
};
use serde_json::Value;

/// One in-process context. Clones share the same context.
#[derive(Clone)]
pub struct MemoryWindow {
    inner: Arc<WindowInner>,
}

struct WindowInner {
    origin: String,
    handlers: Mutex<Vec<(SubscriptionId, EventHandler)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    /// Deliveries still to be dropped.
    drop_next: AtomicUsize,
    /// Deliveries still to be held back, and for how long.
    delay_next: Mutex<(usize, Duration)>,
    /// Every message posted to this context, delivered or not.
    wiretap: Mutex<Vec<PostedMessage>>,
}

/// One wiretap record.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    /// Origin of the sending context.
    pub from: String,
    pub target_origin: String,
    pub data: Value,
    pub delivered: bool,
}

impl MemoryWindow {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                origin: origin.into(),
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                drop_next: AtomicUsize::new(0),
                delay_next: Mutex::new((0, Duration::ZERO)),
                wiretap: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// This context as a messenger host.
    pub fn host(&self) -> Arc<dyn Host> {
        Arc::new(self.clone())
    }

    /// Handle `self` uses to post to `target`.
    pub fn handle_to(&self, target: &MemoryWindow) -> Arc<dyn Window> {
        Arc::new(WindowHandle {
            target: Arc::downgrade(&target.inner),
            from: Arc::downgrade(&self.inner),
        })
    }

    /// Drop the next `count` messages posted to this context.
    pub fn drop_next_deliveries(&self, count: usize) {
        self.inner.drop_next.store(count, Ordering::SeqCst);
    }

    /// Hold back each of the next `count` messages posted to this context
    /// for `delay` before delivering it.
    pub fn delay_next_deliveries(&self, count: usize, delay: Duration) {
        *self.inner.delay_next.lock() = (count, delay);
    }

    /// Everything posted to this context so far.
    pub fn posted_messages(&self) -> Vec<PostedMessage> {
        self.inner.wiretap.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Close the context: subscribers are dropped and posting to it fails.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.handlers.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Host for MemoryWindow {
    fn origin(&self) -> String {
        self.inner.origin.clone()
    }

    fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.handlers.lock().push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.handlers.lock().retain(|(existing, _)| *existing != id);
    }
}

impl WindowInner {
    fn take_drop(&self) -> bool {
        self.drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_delay(&self) -> Option<Duration> {
        let mut delay_next = self.delay_next.lock();
        let (count, delay) = &mut *delay_next;
        if *count == 0 {
            return None;
        }
        *count -= 1;
        Some(*delay)
    }

    fn deliver(&self, event: MessageEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

/// `from`'s view of `target`.
struct WindowHandle {
    target: Weak<WindowInner>,
    from: Weak<WindowInner>,
}

impl Window for WindowHandle {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<(), TransportError> {
        let target = self.target.upgrade().ok_or(TransportError::Closed)?;
        let from = self.from.upgrade().ok_or(TransportError::Closed)?;
        if target.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Other(format!("no tokio runtime: {e}")))?;

        let origin_matches = target_origin == ANY_ORIGIN || target_origin == target.origin;
        let delivered = origin_matches && !target.take_drop();
        target.wiretap.lock().push(PostedMessage {
            from: from.origin.clone(),
            target_origin: target_origin.to_string(),
            data: message.clone(),
            delivered,
        });
        if !delivered {
            tracing::trace!(from = %from.origin, to = %target.origin, target_origin, "message dropped");
            return Ok(());
        }

        let event = MessageEvent {
            data: message,
            origin: from.origin.clone(),
            source: Some(Arc::new(WindowHandle {
                target: self.from.clone(),
                from: self.target.clone(),
            }) as Arc<dyn Window>),
        };
        let delay = target.take_delay();
        runtime.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            target.deliver(event);
        });
        Ok(())
    }
}
