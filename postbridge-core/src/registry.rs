//! Listener registry: request name -> ordered callbacks, with origin-gated dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::transport::MessageEvent;
use crate::wire;

/// Callback invoked with the raw inbound event. Must not block; async work is spawned.
pub type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Decides whether an inbound event's origin is acceptable.
pub type OriginValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` under `name`. The returned handle removes exactly this listener.
    pub fn add(self: &Arc<Self>, name: &str, listener: Listener) -> RemoveListener {
        self.listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(listener.clone());
        RemoveListener {
            registry: Arc::downgrade(self),
            name: name.to_string(),
            listener,
        }
    }

    /// Remove by identity. The name's entry stays, possibly empty.
    pub fn remove(&self, name: &str, listener: &Listener) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(name) else {
            return false;
        };
        match list.iter().position(|l| same_listener(l, listener)) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every registered name and its callbacks.
    pub fn listeners(&self) -> HashMap<String, Vec<Listener>> {
        self.listeners.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.listeners.lock().get(name).map_or(0, Vec::len)
    }

    /// Deliver `event` to every callback registered under its `requestName`,
    /// in registration order. Events without a name, without listeners, or
    /// rejected by `validate_origin` are dropped silently. Returns how many
    /// callbacks ran.
    pub fn dispatch(&self, event: &MessageEvent, validate_origin: Option<&OriginValidator>) -> usize {
        let Some(name) = wire::request_name_of(&event.data) else {
            return 0;
        };
        // Snapshot so callbacks may add/remove listeners while we iterate.
        let snapshot = match self.listeners.lock().get(name) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return 0,
        };
        if let Some(validate) = validate_origin {
            if !validate(&event.origin) {
                return 0;
            }
        }
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }
}

/// Handle returned by [`ListenerRegistry::add`].
pub struct RemoveListener {
    registry: Weak<ListenerRegistry>,
    name: String,
    listener: Listener,
}

impl RemoveListener {
    pub fn remove(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name, &self.listener);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(name: &str, origin: &str) -> MessageEvent {
        MessageEvent {
            data: json!({ "requestName": name }),
            origin: origin.to_string(),
            source: None,
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = counter.clone();
        Arc::new(move |_event: &MessageEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn add_and_remove_keeps_empty_entry() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let remove = registry.add("test:one", counting(&hits));
        let listeners = registry.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners["test:one"].len(), 1);
        remove.remove();
        let listeners = registry.listeners();
        assert_eq!(listeners.len(), 1);
        assert!(listeners["test:one"].is_empty());
    }

    #[test]
    fn remove_only_targets_identity() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let first = registry.add("n", counting(&hits));
        let _second = registry.add("n", counting(&hits));
        let _third = registry.add("n", counting(&hits));
        first.remove();
        assert_eq!(registry.count("n"), 2);
        assert_eq!(registry.dispatch(&event("n", "https://a.test"), None), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatch_in_registration_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            let _ = registry.add(
                "n",
                Arc::new(move |_event: &MessageEvent| order.lock().push(i)),
            );
        }
        registry.dispatch(&event("n", "o"), None);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn origin_validator_drops_event() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _r = registry.add("n", counting(&hits));
        let only_a: OriginValidator = Arc::new(|origin: &str| origin == "https://a.test");
        assert_eq!(registry.dispatch(&event("n", "https://evil.test"), Some(&only_a)), 0);
        assert_eq!(registry.dispatch(&event("n", "https://a.test"), Some(&only_a)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmatched_or_unnamed_events_ignored() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _r = registry.add("n", counting(&hits));
        assert_eq!(registry.dispatch(&event("other", "o"), None), 0);
        let unnamed = MessageEvent {
            data: json!({ "type": "n" }),
            origin: "o".into(),
            source: None,
        };
        assert_eq!(registry.dispatch(&unnamed, None), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_remove_itself_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<Mutex<Option<RemoveListener>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));
        let listener: Listener = {
            let slot = slot.clone();
            let hits = hits.clone();
            Arc::new(move |_event: &MessageEvent| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(remove) = slot.lock().take() {
                    remove.remove();
                }
            })
        };
        *slot.lock() = Some(registry.add("n", listener));
        let _other = registry.add("n", counting(&hits));
        assert_eq!(registry.dispatch(&event("n", "o"), None), 2);
        assert_eq!(registry.count("n"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
