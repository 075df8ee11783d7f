//! Session hub: the owned context every coordination operation runs against.
//!
//! ```text
//!   local change                       bytes from a peer
//!        │                                    │
//!        ▼                                    ▼
//!   SessionHub::emit()                 SessionHub::ingest()
//!        │ seal + encode                      │ decode + authenticate
//!        │ RateLimiter::can_send              │ RateLimiter::can_send (events)
//!        ▼                                    ▼
//!   SessionRegistry (selection) ◄──── SessionRegistry / MergePolicy
//!        │                                    │
//!        ▼                                    ▼
//!   EventDispatcher::dispatch          EventDispatcher::dispatch
//!        │                                    (no re-broadcast)
//!        ▼
//!   PeerBroadcaster::broadcast_raw
//! ```
//!
//! Nothing in here is global. Tests and multi-instance hosts each build
//! their own hub.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::broadcast::{PeerBroadcaster, PeerId, PeerSink};
use crate::crypto::{Ed25519Verifier, MessageSigner, MessageVerifier};
use crate::error::CollabError;
use crate::events::{EventDispatcher, EventKind, HandlerResult};
use crate::merge::{LastWriteWins, MergePolicy, StateSnapshot};
use crate::protocol::{EventEnvelope, Frame, JoinInfo, MessageType, ProtocolError};
use crate::rate_limit::{LimiterConfig, RateLimiter};
use crate::session::{unix_millis, SessionId, SessionRegistry};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub limiter: LimiterConfig,
    /// Sessions idle longer than this are dropped by [`SessionHub::reap_expired`]
    pub idle_timeout: Duration,
    /// Reject unsigned frames (heartbeats excepted)
    pub require_signatures: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            idle_timeout: Duration::from_secs(30),
            require_signatures: false,
        }
    }
}

/// Result of [`SessionHub::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Handlers ran and the frame went out
    Delivered { handlers: usize, peers: usize },
    /// Sender is over its byte budget; nothing happened
    Throttled,
}

/// Result of [`SessionHub::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Event {
        kind: EventKind,
        sender: SessionId,
        handlers: usize,
    },
    StateMerged(SessionId),
    Joined(SessionId),
    Left(SessionId),
    Ping { answered: bool },
    Pong,
    Throttled(SessionId),
    Ignored,
}

impl IngestOutcome {
    /// Whether a relaying host should forward the frame to other peers.
    pub fn should_relay(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Event { .. }
                | IngestOutcome::StateMerged(_)
                | IngestOutcome::Joined(_)
                | IngestOutcome::Left(_)
        )
    }
}

pub struct SessionHub {
    config: HubConfig,
    registry: SessionRegistry,
    limiter: RateLimiter,
    dispatcher: EventDispatcher,
    broadcaster: PeerBroadcaster,
    merger: Box<dyn MergePolicy>,
    signer: Option<Box<dyn MessageSigner>>,
    verifier: Box<dyn MessageVerifier>,
}

impl SessionHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config.limiter),
            config,
            registry: SessionRegistry::new(),
            dispatcher: EventDispatcher::new(),
            broadcaster: PeerBroadcaster::new(),
            merger: Box::new(LastWriteWins),
            signer: None,
            verifier: Box::new(Ed25519Verifier),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    pub fn with_merge_policy(mut self, policy: impl MergePolicy + 'static) -> Self {
        self.merger = Box::new(policy);
        self
    }

    /// Sign every outgoing frame with `signer`.
    pub fn with_signer(mut self, signer: impl MessageSigner + 'static) -> Self {
        self.signer = Some(Box::new(signer));
        self
    }

    pub fn with_verifier(mut self, verifier: impl MessageVerifier + 'static) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn broadcaster(&self) -> &PeerBroadcaster {
        &self.broadcaster
    }

    pub fn broadcaster_mut(&mut self) -> &mut PeerBroadcaster {
        &mut self.broadcaster
    }

    pub fn merge_policy(&self) -> &dyn MergePolicy {
        self.merger.as_ref()
    }

    /// Public key of the configured signer.
    pub fn public_key(&self) -> Option<Vec<u8>> {
        self.signer.as_ref().map(|s| s.public_key())
    }

    // ── Wiring ───────────────────────────────────────────────────

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&Value, &SessionId) -> HandlerResult + Send + 'static,
    {
        self.dispatcher.subscribe(kind, handler);
    }

    pub fn add_peer(&mut self, peer_id: PeerId, sink: Box<dyn PeerSink>) {
        if self.broadcaster.add_peer(peer_id, sink).is_some() {
            log::debug!("Replaced handle for peer {peer_id}");
        }
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        self.broadcaster.remove_peer(peer_id)
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Register a session and announce it to peers.
    ///
    /// Returns the number of peers reached.
    pub fn join(
        &mut self,
        id: SessionId,
        display_name: impl Into<String>,
        public_key: impl Into<Vec<u8>>,
    ) -> Result<usize, CollabError> {
        let info = JoinInfo {
            display_name: display_name.into(),
            public_key: public_key.into(),
        };
        self.registry
            .add_session(id.clone(), info.display_name.clone(), info.public_key.clone());
        log::info!("Session {} ({id}) joined", info.display_name);

        let frame = self.seal(Frame::join(id, unix_millis(), &info)?)?;
        Ok(self.broadcaster.broadcast(&frame)?)
    }

    /// Remove a session and announce its departure.
    ///
    /// Unknown ids are a silent no-op and return `Ok(false)`.
    pub fn leave(&mut self, id: &SessionId) -> Result<bool, CollabError> {
        self.limiter.forget(id);
        if self.registry.remove_session(id).is_none() {
            return Ok(false);
        }
        log::info!("Session {id} left");

        let frame = self.seal(Frame::leave(id.clone(), unix_millis()))?;
        self.broadcaster.broadcast(&frame)?;
        Ok(true)
    }

    pub fn update_presence(&mut self, id: &SessionId, state: Map<String, Value>) -> bool {
        self.registry.update_presence(id, state)
    }

    /// Drop sessions idle longer than `max_idle` along with their budgets.
    pub fn reap_idle(&mut self, max_idle: Duration) -> Vec<SessionId> {
        let reaped = self.registry.reap_idle(max_idle);
        for id in &reaped {
            self.limiter.forget(id);
            log::info!("Session {id} reaped after idling");
        }
        reaped
    }

    /// [`reap_idle`](Self::reap_idle) with the configured idle timeout.
    pub fn reap_expired(&mut self) -> Vec<SessionId> {
        self.reap_idle(self.config.idle_timeout)
    }

    // ── Events ───────────────────────────────────────────────────

    /// Publish a local event: rate check, local handlers, then broadcast.
    pub fn emit(
        &mut self,
        kind: EventKind,
        data: Value,
        sender: SessionId,
    ) -> Result<EmitOutcome, CollabError> {
        let envelope = EventEnvelope::new(kind, data, sender);
        let frame = self.seal(Frame::event(&envelope, unix_millis())?)?;
        let encoded = frame.encode()?;

        if !self.limiter.can_send(&envelope.sender_id, encoded.len()) {
            log::debug!("Throttled {kind} event from {}", envelope.sender_id);
            return Ok(EmitOutcome::Throttled);
        }

        self.track_selection(&envelope);
        let report = self
            .dispatcher
            .publish_encoded(&envelope, Arc::new(encoded), &mut self.broadcaster);

        Ok(EmitOutcome::Delivered {
            handlers: report.dispatch.invoked,
            peers: report.peers,
        })
    }

    /// [`emit`](Self::emit) with the kind given by name.
    pub fn emit_named(
        &mut self,
        kind: &str,
        data: Value,
        sender: SessionId,
    ) -> Result<EmitOutcome, CollabError> {
        let kind = kind.parse::<EventKind>()?;
        self.emit(kind, data, sender)
    }

    /// Apply a frame received from a peer.
    ///
    /// Event frames run local handlers only; relaying is the caller's call.
    /// A Ping is answered to the peer it came from with a Pong carrying the
    /// pinger's own session id, so the pinger can match the echo.
    pub fn ingest(&mut self, from: Option<PeerId>, bytes: &[u8]) -> Result<IngestOutcome, CollabError> {
        let frame = Frame::decode(bytes)?;

        match frame.msg_type {
            MessageType::Ping => {
                let answered = match from {
                    Some(peer_id) => self
                        .broadcaster
                        .send_to_peer(&peer_id, &Frame::pong(frame.sender.clone()))?,
                    None => false,
                };
                return Ok(IngestOutcome::Ping { answered });
            }
            MessageType::Pong => return Ok(IngestOutcome::Pong),
            _ => {}
        }

        self.authenticate(&frame)?;

        match frame.msg_type {
            MessageType::Event => {
                let envelope = frame.event_envelope()?;
                if envelope.sender_id != frame.sender {
                    log::warn!(
                        "Event sender {} does not match frame sender {}",
                        envelope.sender_id,
                        frame.sender
                    );
                    return Ok(IngestOutcome::Ignored);
                }
                if !self.limiter.can_send(&frame.sender, bytes.len()) {
                    log::debug!("Throttled inbound {} event from {}", envelope.kind, frame.sender);
                    return Ok(IngestOutcome::Throttled(frame.sender));
                }

                self.track_selection(&envelope);
                let report = self
                    .dispatcher
                    .dispatch(envelope.kind, &envelope.data, &envelope.sender_id);
                Ok(IngestOutcome::Event {
                    kind: envelope.kind,
                    sender: envelope.sender_id,
                    handlers: report.invoked,
                })
            }

            MessageType::StateSync => {
                let snapshot = frame.state_snapshot()?;
                if snapshot.origin != frame.sender {
                    log::warn!(
                        "State origin {} does not match frame sender {}",
                        snapshot.origin,
                        frame.sender
                    );
                    return Ok(IngestOutcome::Ignored);
                }
                if self.apply_remote_state(&frame.sender, &snapshot) {
                    Ok(IngestOutcome::StateMerged(frame.sender))
                } else {
                    Ok(IngestOutcome::Ignored)
                }
            }

            MessageType::Join => {
                let info = frame.join_info()?;
                if let Some(bound) = self.bound_key(&frame.sender) {
                    if bound != info.public_key.as_slice() {
                        return Err(CollabError::KeyRebind {
                            sender: frame.sender,
                        });
                    }
                }
                log::info!("Remote session {} ({}) joined", info.display_name, frame.sender);
                self.registry
                    .add_session(frame.sender.clone(), info.display_name, info.public_key);
                Ok(IngestOutcome::Joined(frame.sender))
            }

            MessageType::Leave => {
                self.limiter.forget(&frame.sender);
                if self.registry.remove_session(&frame.sender).is_some() {
                    log::info!("Remote session {} left", frame.sender);
                }
                Ok(IngestOutcome::Left(frame.sender))
            }

            MessageType::Ping | MessageType::Pong => Ok(IngestOutcome::Ignored),
        }
    }

    // ── State sync ───────────────────────────────────────────────

    /// Send a session's current state to one peer.
    ///
    /// Returns `Ok(false)` if the session or the peer is unknown.
    pub fn sync_state_with_peer(
        &mut self,
        peer_id: &PeerId,
        session_id: &SessionId,
    ) -> Result<bool, CollabError> {
        let Some(session) = self.registry.get(session_id) else {
            return Ok(false);
        };
        let frame = self.seal(Frame::state_sync(&session.snapshot())?)?;
        Ok(self.broadcaster.send_to_peer(peer_id, &frame)?)
    }

    /// Merge `remote` into the stored state of `session_id`.
    ///
    /// Returns `false` if the session is not registered.
    pub fn apply_remote_state(&mut self, session_id: &SessionId, remote: &StateSnapshot) -> bool {
        let Some(session) = self.registry.get_mut(session_id) else {
            return false;
        };
        let merged = self.merger.merge(&session.snapshot(), remote);
        session.state = merged.fields;
        session.last_seen = session.last_seen.max(merged.clock);
        true
    }

    // ── Internals ────────────────────────────────────────────────

    fn seal(&self, mut frame: Frame) -> Result<Frame, ProtocolError> {
        if let Some(signer) = &self.signer {
            let bytes = frame.signing_bytes()?;
            frame.signature = Some(signer.sign(&bytes));
        }
        Ok(frame)
    }

    fn authenticate(&self, frame: &Frame) -> Result<(), CollabError> {
        // A registered key always wins over one carried in a Join payload.
        let public_key = match (self.bound_key(&frame.sender), frame.msg_type) {
            (Some(bound), _) => bound.to_vec(),
            (None, MessageType::Join) => frame.join_info()?.public_key,
            (None, _) => Vec::new(),
        };

        let verified = match &frame.signature {
            Some(signature) if !public_key.is_empty() => {
                let signed = frame.signing_bytes()?;
                if !self.verifier.verify(&signed, signature, &public_key) {
                    return Err(CollabError::Signature {
                        sender: frame.sender.clone(),
                        msg_type: frame.msg_type,
                    });
                }
                true
            }
            _ => false,
        };

        if self.config.require_signatures && !verified {
            return Err(CollabError::MissingSignature {
                sender: frame.sender.clone(),
                msg_type: frame.msg_type,
            });
        }
        Ok(())
    }

    /// Non-empty public key of a registered session.
    fn bound_key(&self, id: &SessionId) -> Option<&[u8]> {
        self.registry
            .get(id)
            .map(|s| s.public_key.as_slice())
            .filter(|key| !key.is_empty())
    }

    /// Selection events double as presence: the sender's state becomes
    /// `{"selection": data}`.
    fn track_selection(&mut self, envelope: &EventEnvelope) {
        if envelope.kind != EventKind::Selection {
            return;
        }
        let mut state = Map::new();
        state.insert("selection".to_string(), envelope.data.clone());
        self.registry.update_presence(&envelope.sender_id, state);
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("sessions", &self.registry.len())
            .field("dispatcher", &self.dispatcher)
            .field("broadcaster", &self.broadcaster)
            .field("merge_policy", &self.merger.name())
            .field("signing", &self.signer.is_some())
            .finish()
    }
}
