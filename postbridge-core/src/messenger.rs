//! Messenger: one protocol instance. Owns the listener registry, the outbound
//! target, the peer connection and the crypto session, and runs the request
//! engine (correlated request -> response with deadline).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::MessengerConfig;
use crate::crypto::{CryptoError, CryptoSession};
use crate::protocol::{
    is_reserved, NegotiationState, PeerConnection, RequestNames, HANDSHAKE_REQUEST_NAME,
};
use crate::registry::{Listener, ListenerRegistry, OriginValidator, RemoveListener};
use crate::transport::{EventHandler, Host, MessageEvent, SubscriptionId, TransportError, Window};
use crate::wire::WireMessage;

/// Options for a single [`Messenger::request`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Overrides the instance's `max_response_time` for this request. Zero
    /// means the instance default.
    pub max_response_time: Option<Duration>,
}

impl RequestOptions {
    pub fn with_max_response_time(max: Duration) -> Self {
        Self {
            max_response_time: Some(max),
        }
    }
}

/// Cheap to clone; all clones drive the same instance.
#[derive(Clone)]
pub struct Messenger {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: MessengerConfig,
    pub(crate) names: RequestNames,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) state: Mutex<State>,
    pub(crate) crypto: RwLock<Option<CryptoSession>>,
}

pub(crate) struct State {
    pub(crate) target: Option<Target>,
    pub(crate) validate_origin: Option<OriginValidator>,
    pub(crate) subscription: Option<SubscriptionId>,
    pub(crate) connection: Option<PeerConnection>,
    pub(crate) negotiation: NegotiationState,
}

#[derive(Clone)]
pub(crate) struct Target {
    pub(crate) window: Arc<dyn Window>,
    pub(crate) origin: String,
}

impl Messenger {
    /// Build an instance. A request-name mapping that declares the reserved
    /// handshake name is rejected.
    pub fn new(
        config: MessengerConfig,
        names: RequestNames,
        host: Arc<dyn Host>,
    ) -> Result<Self, MessengerError> {
        if let Some(name) = names.reserved_collision() {
            return Err(MessengerError::ReservedName(name.to_string()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                names,
                host,
                registry: Arc::new(ListenerRegistry::new()),
                state: Mutex::new(State {
                    target: None,
                    validate_origin: None,
                    subscription: None,
                    connection: None,
                    negotiation: NegotiationState::Idle,
                }),
                crypto: RwLock::new(None),
            }),
        })
    }

    pub fn client_name(&self) -> &str {
        &self.inner.config.client_name
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    pub fn max_response_time(&self) -> Duration {
        self.inner.config.max_response_time()
    }

    pub fn connection(&self) -> Option<PeerConnection> {
        self.inner.state.lock().connection.clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.inner.state.lock().negotiation
    }

    pub fn target_origin(&self) -> Option<String> {
        self.inner.target_origin()
    }

    /// Short digest of the active session key, if a session exists.
    pub fn session_fingerprint(&self) -> Option<String> {
        self.inner.crypto.read().as_ref().map(CryptoSession::fingerprint)
    }

    pub fn add_listener(&self, request_name: &str, listener: Listener) -> RemoveListener {
        self.inner.registry.add(request_name, listener)
    }

    pub fn remove_listener(&self, request_name: &str, listener: &Listener) {
        self.inner.registry.remove(request_name, listener);
    }

    pub fn listeners(&self) -> HashMap<String, Vec<Listener>> {
        self.inner.registry.listeners()
    }

    /// Entry point for one inbound transport event.
    pub fn on_receive_message(&self, event: MessageEvent) {
        self.inner.on_receive_message(event);
    }

    /// Set where outbound messages go. `target_origin` is reduced to its
    /// serialized origin (`scheme://host[:port]`).
    pub fn set_target(
        &self,
        target_window: Arc<dyn Window>,
        target_origin: &str,
    ) -> Result<(), MessengerError> {
        self.inner.set_target(target_window, target_origin)
    }

    /// Subscribe to the host's inbound events, gated by `validate_origin`.
    /// Calling again replaces the validator without subscribing twice.
    pub fn begin_listening<F>(&self, validate_origin: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.inner.begin_listening(Arc::new(validate_origin));
    }

    pub fn stop_listening(&self) {
        let subscription = self.inner.state.lock().subscription.take();
        if let Some(id) = subscription {
            self.inner.host.unsubscribe(id);
            trace_event!(self.inner, debug, "stopped listening");
        }
    }

    pub fn encrypt(&self, data: &Value) -> Result<String, MessengerError> {
        self.inner.encrypt(data)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Value, MessengerError> {
        self.inner.decrypt(ciphertext)
    }

    /// Send `data` under the logical request `name` and wait for the
    /// correlated response.
    ///
    /// Name validation, the peer capability check and the connection check
    /// all fail before anything is sent. Remote failures, malformed responses
    /// and deadline expiry resolve this call only; other in-flight requests
    /// are unaffected.
    pub async fn request<D, R>(
        &self,
        name: &str,
        data: &D,
        options: RequestOptions,
    ) -> Result<R, MessengerError>
    where
        D: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if is_reserved(name) {
            return Err(MessengerError::ReservedName(name.to_string()));
        }
        let wire_name = self
            .inner
            .names
            .resolve(name)
            .ok_or_else(|| MessengerError::UnknownRequestName(name.to_string()))?
            .to_string();
        if let Some(connection) = self.connection() {
            if !connection.supports(name) {
                return Err(MessengerError::PeerCapabilityMismatch {
                    peer: connection.peer_client_name,
                    name: name.to_string(),
                });
            }
        }
        let data = serde_json::to_value(data)?;
        let deadline = options
            .max_response_time
            .filter(|max| !max.is_zero())
            .unwrap_or_else(|| self.max_response_time());
        let response = self.inner.send_request(&wire_name, data, deadline).await?;
        Ok(serde_json::from_value(response)?)
    }
}

impl Inner {
    pub(crate) fn target_origin(&self) -> Option<String> {
        self.state.lock().target.as_ref().map(|t| t.origin.clone())
    }

    pub(crate) fn set_negotiation(&self, negotiation: NegotiationState) {
        self.state.lock().negotiation = negotiation;
    }

    fn on_receive_message(&self, event: MessageEvent) {
        let validate = self.state.lock().validate_origin.clone();
        self.registry.dispatch(&event, validate.as_ref());
    }

    pub(crate) fn set_target(
        &self,
        window: Arc<dyn Window>,
        target_origin: &str,
    ) -> Result<(), MessengerError> {
        let origin = normalize_origin(target_origin)?;
        trace_event!(self, debug, peer_origin = %origin, "target set");
        self.state.lock().target = Some(Target { window, origin });
        Ok(())
    }

    pub(crate) fn begin_listening(self: &Arc<Self>, validate: OriginValidator) {
        let needs_subscription = {
            let mut state = self.state.lock();
            state.validate_origin = Some(validate);
            if state.negotiation == NegotiationState::Idle {
                state.negotiation = NegotiationState::Listening;
            }
            state.subscription.is_none()
        };
        if !needs_subscription {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: MessageEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_receive_message(event);
            }
        });
        let id = self.host.subscribe(handler);
        let duplicate = {
            let mut state = self.state.lock();
            match state.subscription {
                Some(_) => Some(id),
                None => {
                    state.subscription = Some(id);
                    None
                }
            }
        };
        if let Some(id) = duplicate {
            self.host.unsubscribe(id);
        }
        trace_event!(self, debug, "listening for messages");
    }

    /// Whether messages under `wire_name` are encrypted. Fails with
    /// `NoConnection` when they would be but no handshake has completed.
    pub(crate) fn encryption_for(&self, wire_name: &str) -> Result<bool, MessengerError> {
        let applies = self.config.use_encryption && wire_name != HANDSHAKE_REQUEST_NAME;
        if applies && self.state.lock().connection.is_none() {
            return Err(MessengerError::NoConnection(wire_name.to_string()));
        }
        Ok(applies)
    }

    pub(crate) fn encrypt(&self, data: &Value) -> Result<String, MessengerError> {
        let crypto = self.crypto.read();
        let session = crypto.as_ref().ok_or(MessengerError::SessionNotEstablished)?;
        Ok(session.encrypt(data)?)
    }

    pub(crate) fn decrypt(&self, ciphertext: &str) -> Result<Value, MessengerError> {
        let crypto = self.crypto.read();
        let session = crypto.as_ref().ok_or(MessengerError::SessionNotEstablished)?;
        Ok(session.decrypt(ciphertext)?)
    }

    fn post(&self, message: &WireMessage) -> Result<(), MessengerError> {
        let target = self
            .state
            .lock()
            .target
            .clone()
            .ok_or(MessengerError::TargetNotSet)?;
        target.window.post_message(message.to_value(), &target.origin)?;
        Ok(())
    }

    /// Build (encrypting if required) and post one wire message.
    pub(crate) fn send_wire(
        &self,
        wire_name: &str,
        request_id: &str,
        data: Value,
        error_message: Option<String>,
    ) -> Result<(), MessengerError> {
        let encrypted = self.encryption_for(wire_name)?;
        let message = self.seal_outbound(wire_name, request_id, data, error_message, encrypted)?;
        self.post(&message)
    }

    fn seal_outbound(
        &self,
        wire_name: &str,
        request_id: &str,
        data: Value,
        error_message: Option<String>,
        encrypted: bool,
    ) -> Result<WireMessage, MessengerError> {
        if !encrypted {
            return Ok(match error_message {
                Some(text) => WireMessage::error(wire_name, request_id, text),
                None => WireMessage::new(wire_name, request_id, data),
            });
        }
        let data = Value::String(self.encrypt(&data)?);
        let error_message = error_message
            .map(|text| self.encrypt(&Value::String(text)))
            .transpose()?;
        Ok(WireMessage {
            request_name: wire_name.to_string(),
            request_id: request_id.to_string(),
            data,
            is_error: error_message.is_some(),
            error_message,
        })
    }

    /// Register the one-shot response listener for `request_id`. Registered
    /// before anything is posted so a fast reply cannot be missed.
    fn open_pending(
        self: &Arc<Self>,
        wire_name: &str,
        request_id: &str,
        encrypted: bool,
    ) -> (Arc<PendingRequest>, oneshot::Receiver<Result<Value, MessengerError>>) {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(PendingRequest {
            settle: Mutex::new(Some(tx)),
            remove: Mutex::new(None),
        });

        let listener: Listener = {
            let weak = Arc::downgrade(self);
            let pending = pending.clone();
            let request_id = request_id.to_string();
            let wire_name = wire_name.to_string();
            Arc::new(move |event: &MessageEvent| {
                let Ok(response) = WireMessage::from_value(&event.data) else {
                    return;
                };
                if response.request_id != request_id || pending.is_settled() {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let result = inner.open_response(&wire_name, response, encrypted);
                pending.settle(result);
            })
        };
        *pending.remove.lock() = Some(self.registry.add(wire_name, listener));
        (pending, rx)
    }

    fn request_timeout(&self, wire_name: &str) -> MessengerError {
        MessengerError::RequestTimeout {
            name: wire_name.to_string(),
            target: self.target_origin().unwrap_or_default(),
        }
    }

    /// Core of the request engine.
    pub(crate) async fn send_request(
        self: &Arc<Self>,
        wire_name: &str,
        data: Value,
        deadline: Duration,
    ) -> Result<Value, MessengerError> {
        let runtime = current_runtime()?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let encrypted = self.encryption_for(wire_name)?;
        let message = self.seal_outbound(wire_name, &request_id, data, None, encrypted)?;
        let (pending, rx) = self.open_pending(wire_name, &request_id, encrypted);

        trace_event!(self, debug, request = wire_name, id = %request_id, peer_origin = ?self.target_origin(), "sending request");
        if let Err(err) = self.post(&message) {
            pending.cancel();
            return Err(err);
        }

        {
            let weak = Arc::downgrade(self);
            let pending = pending.clone();
            let wire_name = wire_name.to_string();
            runtime.spawn(async move {
                tokio::time::sleep(deadline).await;
                let Some(inner) = weak.upgrade() else {
                    pending.cancel();
                    return;
                };
                if pending.settle(Err(inner.request_timeout(&wire_name))) {
                    trace_event!(inner, warn, request = %wire_name, "request timed out");
                }
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.request_timeout(wire_name)),
        }
    }

    /// Post the same request up to `attempts` times, `interval` apart, under
    /// one correlation id. A reply to any attempt settles the call; silence
    /// through the last interval yields `RequestTimeout`.
    pub(crate) async fn send_request_repeating(
        self: &Arc<Self>,
        wire_name: &str,
        data: Value,
        interval: Duration,
        attempts: u32,
    ) -> Result<Value, MessengerError> {
        current_runtime()?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let encrypted = self.encryption_for(wire_name)?;
        let message = self.seal_outbound(wire_name, &request_id, data, None, encrypted)?;
        let (pending, mut rx) = self.open_pending(wire_name, &request_id, encrypted);
        let _cancel = CancelOnDrop(pending);

        for attempt in 1..=attempts {
            trace_event!(self, debug, request = wire_name, id = %request_id, attempt, "sending request");
            self.post(&message)?;
            match tokio::time::timeout(interval, &mut rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        if let Ok(result) = rx.try_recv() {
            return result;
        }
        Err(self.request_timeout(wire_name))
    }

    fn open_response(
        &self,
        wire_name: &str,
        response: WireMessage,
        encrypted: bool,
    ) -> Result<Value, MessengerError> {
        if response.is_error {
            let mut message = response.error_message.unwrap_or_default();
            if encrypted {
                message = match self.decrypt(&message)? {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
            }
            return Err(MessengerError::RemoteResponderError {
                name: wire_name.to_string(),
                message,
            });
        }
        if !encrypted {
            return Ok(response.data);
        }
        match &response.data {
            Value::String(ciphertext) => self.decrypt(ciphertext),
            _ => Err(MessengerError::ProtocolViolation(format!(
                "encryption is required but a non string data response arrived for {wire_name:?}"
            ))),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(id) = self.state.get_mut().subscription.take() {
            self.host.unsubscribe(id);
        }
    }
}

/// One in-flight request. Settles at most once: by the matching response or by the deadline.
struct PendingRequest {
    settle: Mutex<Option<oneshot::Sender<Result<Value, MessengerError>>>>,
    remove: Mutex<Option<RemoveListener>>,
}

impl PendingRequest {
    fn is_settled(&self) -> bool {
        self.settle.lock().is_none()
    }

    fn cancel(&self) {
        self.settle.lock().take();
        if let Some(remove) = self.remove.lock().take() {
            remove.remove();
        }
    }

    /// Returns false if already settled.
    fn settle(&self, result: Result<Value, MessengerError>) -> bool {
        let Some(tx) = self.settle.lock().take() else {
            return false;
        };
        if let Some(remove) = self.remove.lock().take() {
            remove.remove();
        }
        let _ = tx.send(result);
        true
    }
}

/// Removes the listener of an abandoned request.
struct CancelOnDrop(Arc<PendingRequest>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Requests need a tokio runtime for their deadline timers.
fn current_runtime() -> Result<tokio::runtime::Handle, MessengerError> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| MessengerError::InvalidArgument("requests need a tokio runtime".into()))
}

/// Spawn on the current tokio runtime. Outside a runtime the task is dropped.
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!("no tokio runtime; dropping background task"),
    }
}

/// `https://a.test/path?q` -> `https://a.test`. Opaque origins are rejected.
pub fn normalize_origin(origin: &str) -> Result<String, MessengerError> {
    let url = url::Url::parse(origin.trim())
        .map_err(|e| MessengerError::InvalidArgument(format!("invalid origin {origin:?}: {e}")))?;
    let origin_of = url.origin();
    if !origin_of.is_tuple() {
        return Err(MessengerError::InvalidArgument(format!(
            "origin {origin:?} has no scheme/host"
        )));
    }
    Ok(origin_of.ascii_serialization())
}

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0:?} is a reserved request name")]
    ReservedName(String),
    #[error("unable to find a request name for {0:?}")]
    UnknownRequestName(String),
    #[error("connected client {peer} has no request name {name:?} so this request would fail")]
    PeerCapabilityMismatch { peer: String, name: String },
    #[error("cannot send {0:?}: encryption is on but there is no connected client")]
    NoConnection(String),
    #[error("crypto session has not been established")]
    SessionNotEstablished,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("timed out waiting for {target:?} to respond to request {name:?}")]
    RequestTimeout { name: String, target: String },
    #[error("responder for request {name:?} failed with message: {message:?}")]
    RemoteResponderError { name: String, message: String },
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("connection failed after {attempts} attempts over {elapsed:?}")]
    ConnectionFailed { attempts: u32, elapsed: Duration },
    #[error("no target window; call set_target or connect first")]
    TargetNotSet,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
