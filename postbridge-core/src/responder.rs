//! Responder engine: serve inbound requests by name and reply with the
//! handler's result or its failure text.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::messenger::{spawn_detached, Inner, Messenger, MessengerError};
use crate::protocol::is_reserved;
use crate::registry::{Listener, RemoveListener};
use crate::transport::MessageEvent;
use crate::wire::WireMessage;

/// Reply text used when a handler fails without a message.
pub const GENERIC_RESPONDER_ERROR: &str = "responder failed without an error message";

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Type-erased request handler: request data plus the raw event in, response data out.
pub type Handler = Arc<dyn Fn(Value, MessageEvent) -> HandlerFuture + Send + Sync>;

/// Pre-admission check on a request's (still encrypted) data.
pub(crate) type RequestValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Logical request name -> handler, bound together by [`Messenger::bind_responders`].
#[derive(Clone, Default)]
pub struct Responders {
    handlers: Vec<(String, Handler)>,
}

impl Responders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `name`.
    ///
    /// ```ignore
    /// let responders = Responders::new().on("ping", |data, _event| async move {
    ///     let v = data["v"].as_u64().unwrap_or(0);
    ///     Ok(serde_json::json!({ "v": v + 1 }))
    /// });
    /// ```
    pub fn on<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, MessageEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |data: Value, event: MessageEvent| -> HandlerFuture {
            Box::pin(handler(data, event))
        });
        self.handlers.push((name.into(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Removes every listener installed by one `bind_responders` call.
pub struct UnbindResponders {
    removers: Vec<RemoveListener>,
}

impl UnbindResponders {
    pub fn unbind(self) {
        for remove in self.removers {
            remove.remove();
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.removers.iter().map(RemoveListener::name)
    }
}

impl Messenger {
    /// Install one listener per responder. Every name is checked first; a
    /// reserved or undeclared name fails the call with nothing installed.
    pub fn bind_responders(
        &self,
        responders: Responders,
    ) -> Result<UnbindResponders, MessengerError> {
        let mut resolved = Vec::with_capacity(responders.handlers.len());
        for (name, handler) in responders.handlers {
            if is_reserved(&name) {
                return Err(MessengerError::ReservedName(name));
            }
            let wire_name = self
                .inner
                .names
                .resolve(&name)
                .ok_or_else(|| MessengerError::UnknownRequestName(name.clone()))?
                .to_string();
            resolved.push((wire_name, handler));
        }
        Ok(self.inner.bind_resolved(resolved, None))
    }
}

impl Inner {
    /// Bind handlers keyed by wire name. `validate` runs synchronously on
    /// each parsed request before any work is scheduled.
    pub(crate) fn bind_resolved(
        self: &Arc<Self>,
        handlers: Vec<(String, Handler)>,
        validate: Option<RequestValidator>,
    ) -> UnbindResponders {
        let removers = handlers
            .into_iter()
            .map(|(wire_name, handler)| {
                let listener = self.responder_listener(wire_name.clone(), handler, validate.clone());
                trace_event!(self, debug, request = %wire_name, "responder bound");
                self.registry.add(&wire_name, listener)
            })
            .collect();
        UnbindResponders { removers }
    }

    fn responder_listener(
        self: &Arc<Self>,
        wire_name: String,
        handler: Handler,
        validate: Option<RequestValidator>,
    ) -> Listener {
        let weak = Arc::downgrade(self);
        Arc::new(move |event: &MessageEvent| {
            let Ok(request) = WireMessage::from_value(&event.data) else {
                return;
            };
            if let Some(validate) = &validate {
                if !validate(&request.data) {
                    return;
                }
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handler = handler.clone();
            let wire_name = wire_name.clone();
            let event = event.clone();
            spawn_detached(async move {
                inner.respond(wire_name, request, event, handler).await;
            });
        })
    }

    async fn respond(
        self: Arc<Self>,
        wire_name: String,
        request: WireMessage,
        event: MessageEvent,
        handler: Handler,
    ) {
        trace_event!(self, debug, request = %wire_name, id = %request.request_id, origin = %event.origin, "received request");
        let sent = match self.run_handler(&wire_name, request.data, event, handler).await {
            Ok(response) => self.send_wire(&wire_name, &request.request_id, response, None),
            Err(err) => {
                let mut text = err.to_string();
                if text.is_empty() {
                    text = GENERIC_RESPONDER_ERROR.to_string();
                }
                trace_event!(self, info, request = %wire_name, error = %text, "responder failed");
                self.send_wire(&wire_name, &request.request_id, json!({}), Some(text))
            }
        };
        if let Err(err) = sent {
            trace_event!(self, warn, request = %wire_name, error = %err, "could not send response");
        }
    }

    async fn run_handler(
        &self,
        wire_name: &str,
        data: Value,
        event: MessageEvent,
        handler: Handler,
    ) -> anyhow::Result<Value> {
        let data = if self.encryption_for(wire_name)? {
            match data {
                Value::String(ciphertext) => self.decrypt(&ciphertext)?,
                _ => {
                    return Err(MessengerError::ProtocolViolation(format!(
                        "encryption is required but a non string request arrived for {wire_name:?}"
                    ))
                    .into())
                }
            }
        } else {
            data
        };
        handler(data, event).await
    }
}
