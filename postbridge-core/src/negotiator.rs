//! Connection negotiator: the initiator side (`connect`) and the acceptor
//! side (`accept_connections`) of the handshake.
//!
//! The initiator generates the session key, ships it with its identity over
//! the reserved handshake request, and retries on silence. The acceptor
//! checks the offer, imports the key, records the peer and answers with its
//! own identity. Each acceptor call admits at most one handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::crypto::CryptoSession;
use crate::messenger::{normalize_origin, Inner, Messenger, MessengerError};
use crate::protocol::{
    ConnectMessage, ConnectReply, NegotiationState, PeerConnection, DEFAULT_MAX_RETRIES,
    HANDSHAKE_ATTEMPT_TIMEOUT_MS, HANDSHAKE_REQUEST_NAME,
};
use crate::responder::{Handler, HandlerFuture, RequestValidator, UnbindResponders};
use crate::transport::{MessageEvent, Window};

/// Arguments for [`Messenger::connect`].
#[derive(Clone)]
pub struct ConnectArgs {
    pub target_window: Arc<dyn Window>,
    pub target_origin: String,
    /// Handshake attempts; 0 still makes one attempt.
    pub max_retries: u32,
}

impl ConnectArgs {
    pub fn new(target_window: Arc<dyn Window>, target_origin: impl Into<String>) -> Self {
        Self {
            target_window,
            target_origin: target_origin.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Arguments for [`Messenger::accept_connections`].
#[derive(Debug, Clone, Default)]
pub struct AcceptArgs {
    /// Accept handshakes from any origin. Required when `origin` is unset.
    pub allow_any_origin: bool,
    /// Only accept handshakes announcing this client name.
    pub from_client_name: Option<String>,
    /// Only accept handshakes from this origin. Takes precedence over `allow_any_origin`.
    pub origin: Option<String>,
}

impl AcceptArgs {
    pub fn from_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..Self::default()
        }
    }

    pub fn any_origin() -> Self {
        Self {
            allow_any_origin: true,
            ..Self::default()
        }
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.from_client_name = Some(client_name.into());
        self
    }
}

impl Messenger {
    /// Initiate a handshake with `target_window`, re-posting the same offer
    /// every 500 ms. A reply to any attempt completes the handshake.
    ///
    /// On success the peer connection is recorded and, if encryption is on,
    /// the session generated here becomes active.
    pub async fn connect(&self, args: ConnectArgs) -> Result<PeerConnection, MessengerError> {
        if args.target_origin.trim().is_empty() {
            return Err(MessengerError::InvalidArgument(
                "target_origin is required for connect".into(),
            ));
        }
        let expected_origin = normalize_origin(&args.target_origin)?;
        let inner = &self.inner;
        inner.set_target(args.target_window, &expected_origin)?;
        self.begin_listening(move |origin| origin == expected_origin);

        let use_encryption = inner.config.use_encryption;
        let session = use_encryption.then(CryptoSession::generate);
        let offer = ConnectMessage {
            client_name: inner.config.client_name.clone(),
            iv: session.as_ref().map(|s| s.iv().to_vec()),
            exported_key: session.as_ref().map(CryptoSession::export_key),
            origin: inner.host.origin(),
            request_names: inner.names.declared().cloned(),
            use_encryption,
        };
        let offer = serde_json::to_value(&offer)?;

        inner.set_negotiation(NegotiationState::Handshaking);
        let attempts = args.max_retries.max(1);
        let per_attempt = Duration::from_millis(HANDSHAKE_ATTEMPT_TIMEOUT_MS);
        trace_event!(inner, debug, attempts, "sending handshake");
        match inner
            .send_request_repeating(HANDSHAKE_REQUEST_NAME, offer, per_attempt, attempts)
            .await
        {
            Ok(reply) => inner.finish_connect(reply, session),
            Err(MessengerError::RequestTimeout { .. }) => {
                Err(inner.fail_handshake(MessengerError::ConnectionFailed {
                    attempts,
                    elapsed: per_attempt * attempts,
                }))
            }
            Err(MessengerError::RemoteResponderError { message, .. }) => {
                Err(inner.fail_handshake(MessengerError::InvalidHandshake(message)))
            }
            Err(err) => Err(inner.fail_handshake(err)),
        }
    }

    /// Wait for one inbound handshake and complete it.
    ///
    /// Rejected offers (encryption flag mismatch, missing key material,
    /// mismatched request-name sets) get an error reply and fail this call
    /// with `InvalidHandshake`. Later handshakes are ignored either way.
    pub async fn accept_connections(
        &self,
        args: AcceptArgs,
    ) -> Result<PeerConnection, MessengerError> {
        let origin = match (&args.origin, args.allow_any_origin) {
            (Some(origin), _) => Some(normalize_origin(origin)?),
            (None, true) => None,
            (None, false) => {
                return Err(MessengerError::InvalidArgument(
                    "allow_any_origin must be true if origin is not specified".into(),
                ))
            }
        };
        self.begin_listening(move |event_origin| {
            origin.as_deref().map_or(true, |expected| event_origin == expected)
        });

        let accepted = Arc::new(AtomicBool::new(false));
        let validate: RequestValidator = {
            let from_client_name = args.from_client_name.clone();
            let accepted = accepted.clone();
            Arc::new(move |data: &Value| {
                let Ok(offer) = serde_json::from_value::<ConnectMessage>(data.clone()) else {
                    return false;
                };
                if let Some(expected) = &from_client_name {
                    if *expected != offer.client_name {
                        return false;
                    }
                }
                !accepted.swap(true, Ordering::SeqCst)
            })
        };

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let unbind_slot: Arc<Mutex<Option<UnbindResponders>>> = Arc::new(Mutex::new(None));
        let handler: Handler = {
            let weak = Arc::downgrade(&self.inner);
            let unbind_slot = unbind_slot.clone();
            Arc::new(move |data: Value, event: MessageEvent| -> HandlerFuture {
                let weak = weak.clone();
                let tx = tx.clone();
                let unbind_slot = unbind_slot.clone();
                Box::pin(async move {
                    if let Some(unbind) = unbind_slot.lock().take() {
                        unbind.unbind();
                    }
                    let inner = weak
                        .upgrade()
                        .ok_or_else(|| anyhow::anyhow!("messenger was dropped"))?;
                    let outcome = inner.complete_accept(data, event);
                    let reply = match &outcome {
                        Ok(_) => Ok(serde_json::to_value(inner.connect_reply())?),
                        Err(err) => Err(anyhow::anyhow!(err.to_string())),
                    };
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(outcome);
                    }
                    reply
                })
            })
        };

        trace_event!(self.inner, info, "accepting connections");
        let unbind = self.inner.bind_resolved(
            vec![(HANDSHAKE_REQUEST_NAME.to_string(), handler)],
            Some(validate),
        );
        *unbind_slot.lock() = Some(unbind);

        let outcome = rx.await.map_err(|_| {
            MessengerError::InvalidHandshake("handshake responder went away".into())
        })?;
        if let Some(unbind) = unbind_slot.lock().take() {
            unbind.unbind();
        }
        outcome
    }
}

impl Inner {
    fn finish_connect(
        &self,
        reply: Value,
        session: Option<CryptoSession>,
    ) -> Result<PeerConnection, MessengerError> {
        let reply: ConnectReply = serde_json::from_value(reply).map_err(|e| {
            self.fail_handshake(MessengerError::InvalidHandshake(format!(
                "malformed handshake reply: {e}"
            )))
        })?;
        if reply.use_encryption != self.config.use_encryption {
            return Err(self.fail_handshake(MessengerError::InvalidHandshake(format!(
                "peer {} has use_encryption={} but this client has {}",
                reply.client_name, reply.use_encryption, self.config.use_encryption
            ))));
        }
        let connection = PeerConnection::from(reply);
        if let Some(session) = session {
            *self.crypto.write() = Some(session);
        }
        {
            let mut state = self.state.lock();
            state.connection = Some(connection.clone());
            state.negotiation = NegotiationState::Connected;
        }
        trace_event!(self, info, peer = %connection.peer_client_name, "connected");
        Ok(connection)
    }

    /// Validate an admitted offer and record the peer. The reply target is
    /// set first so a rejection still reaches the initiator.
    fn complete_accept(
        &self,
        data: Value,
        event: MessageEvent,
    ) -> Result<PeerConnection, MessengerError> {
        let offer: ConnectMessage = serde_json::from_value(data)
            .map_err(|e| self.fail_handshake(MessengerError::InvalidHandshake(e.to_string())))?;
        let source = event.source.ok_or_else(|| {
            self.fail_handshake(MessengerError::InvalidHandshake(
                "handshake event has no source".into(),
            ))
        })?;
        self.set_negotiation(NegotiationState::Handshaking);
        self.set_target(source, &offer.origin).map_err(|e| {
            self.fail_handshake(MessengerError::InvalidHandshake(e.to_string()))
        })?;

        let use_encryption = self.config.use_encryption;
        if offer.use_encryption != use_encryption {
            return Err(self.fail_handshake(MessengerError::InvalidHandshake(format!(
                "peer {} has use_encryption={} but this client has {}",
                offer.client_name, offer.use_encryption, use_encryption
            ))));
        }
        if let (Some(ours), Some(theirs)) = (self.names.declared(), &offer.request_names) {
            if ours != theirs {
                return Err(self.fail_handshake(MessengerError::InvalidHandshake(format!(
                    "request names declared by {} do not match",
                    offer.client_name
                ))));
            }
        }
        let session = if use_encryption {
            let (Some(iv), Some(key)) = (&offer.iv, &offer.exported_key) else {
                return Err(self.fail_handshake(MessengerError::InvalidHandshake(
                    "encryption is required but iv or exported key was not provided".into(),
                )));
            };
            let session = CryptoSession::import(key, iv).map_err(|e| {
                self.fail_handshake(MessengerError::InvalidHandshake(e.to_string()))
            })?;
            Some(session)
        } else {
            None
        };

        let connection = PeerConnection {
            peer_client_name: offer.client_name,
            peer_request_names: offer.request_names,
            use_encryption,
        };
        if let Some(session) = session {
            *self.crypto.write() = Some(session);
        }
        {
            let mut state = self.state.lock();
            state.connection = Some(connection.clone());
            state.negotiation = NegotiationState::Connected;
        }
        trace_event!(self, info, peer = %connection.peer_client_name, "accepted connection");
        Ok(connection)
    }

    fn connect_reply(&self) -> ConnectReply {
        ConnectReply {
            client_name: self.config.client_name.clone(),
            request_names: self.names.declared().cloned(),
            use_encryption: self.config.use_encryption,
        }
    }

    fn fail_handshake(&self, err: MessengerError) -> MessengerError {
        self.set_negotiation(NegotiationState::HandshakeFailed);
        trace_event!(self, warn, error = %err, "handshake failed");
        err
    }
}
