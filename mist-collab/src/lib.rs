//! # mist-collab — Real-time session coordination for Mist
//!
//! Tracks who is connected, throttles what they send, dispatches typed
//! events locally and fans them out to peers.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!                    │          SessionHub          │
//!                    │                              │
//!  emit / ingest ──► │  SessionRegistry             │
//!                    │  RateLimiter   (6400 B / s)  │
//!                    │  EventDispatcher             │
//!                    │  MergePolicy   (LWW)         │
//!                    │  MessageSigner (Ed25519)     │
//!                    └──────────────┬───────────────┘
//!                                   │
//!                           ┌───────┴────────┐
//!                           │ PeerBroadcaster│
//!                           │ (fan-out)      │
//!                           └───┬────┬────┬──┘
//!                               ▼    ▼    ▼
//!                             PeerSink handles
//! ```
//!
//! ## Modules
//!
//! - [`session`] — Session registry and lifecycle
//! - [`rate_limit`] — Per-session byte budget
//! - [`events`] — Closed event kinds and ordered pub/sub
//! - [`broadcast`] — Best-effort fan-out with pruning
//! - [`merge`] — State conflict resolution
//! - [`protocol`] — Binary wire frames (bincode + JSON payloads)
//! - [`hub`] — The owned context composing all of the above
//! - [`crypto`] — Frame signing
//! - [`discovery`] — Host announcement through an external directory
//! - [`server`] — WebSocket relay host

pub mod session;
pub mod rate_limit;
pub mod events;
pub mod broadcast;
pub mod merge;
pub mod protocol;
pub mod hub;
pub mod crypto;
pub mod discovery;
pub mod server;
pub mod error;

// Re-exports for convenience
pub use session::{
    unix_millis, Session, SessionId, SessionLifecycle, SessionRegistry, MAX_TOMBSTONES,
};
pub use rate_limit::{LimiterConfig, RateBudget, RateLimiter};
pub use events::{
    DispatchReport, EventDispatcher, EventHandler, EventKind, HandlerResult, PublishReport,
    UnknownEventKind,
};
pub use broadcast::{BroadcastStats, ChannelPeer, PeerBroadcaster, PeerId, PeerSink, TransportError};
pub use merge::{merge, KeyedLastWriteWins, LastWriteWins, MergePolicy, StateSnapshot};
pub use protocol::{EventEnvelope, Frame, JoinInfo, MessageType, ProtocolError};
pub use hub::{EmitOutcome, HubConfig, IngestOutcome, SessionHub};
pub use crypto::{Ed25519Signer, Ed25519Verifier, MessageSigner, MessageVerifier};
pub use discovery::{
    announce_host, discover_host, DirectoryError, HostRecord, InMemoryDirectory, SessionDirectory,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use error::CollabError;
