//! Best-effort fan-out to connected peers.
//!
//! Every frame is encoded once and the same `Arc<Vec<u8>>` is handed to
//! each peer. A peer whose send fails is pruned on the spot and the loop
//! carries on. There is no retry and no backpressure: delivery is
//! at-most-once per peer per call.
//!
//! Peer ids are snapshotted before iterating and failed peers are removed
//! after the walk.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Frame, ProtocolError};

/// Identifier of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a send to a peer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The remote end is gone
    Closed,
    /// Transport-specific failure
    Failed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Peer connection closed"),
            Self::Failed(e) => write!(f, "Peer send failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One-method transport capability. Any wire protocol can implement it.
///
/// `send` must not block; async transports should enqueue and return.
pub trait PeerSink: Send {
    fn send(&self, frame: Arc<Vec<u8>>) -> Result<(), TransportError>;
}

impl<F> PeerSink for F
where
    F: Fn(Arc<Vec<u8>>) -> Result<(), TransportError> + Send,
{
    fn send(&self, frame: Arc<Vec<u8>>) -> Result<(), TransportError> {
        self(frame)
    }
}

/// Peer sink backed by an unbounded tokio channel.
///
/// The receiving half is drained by whatever task owns the real socket.
/// A dropped receiver surfaces as [`TransportError::Closed`].
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
}

impl ChannelPeer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PeerSink for ChannelPeer {
    fn send(&self, frame: Arc<Vec<u8>>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Fan-out calls made
    pub messages_sent: u64,
    /// Successful per-peer sends
    pub deliveries: u64,
    /// Peers removed after a failed send
    pub peers_pruned: u64,
    pub active_peers: usize,
}

/// Peer table plus fan-out.
#[derive(Default)]
pub struct PeerBroadcaster {
    peers: HashMap<PeerId, Box<dyn PeerSink>>,
    stats: BroadcastStats,
}

impl PeerBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns the handle it replaced, if any.
    pub fn add_peer(&mut self, peer_id: PeerId, sink: Box<dyn PeerSink>) -> Option<Box<dyn PeerSink>> {
        self.peers.insert(peer_id, sink)
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Encode `frame` once and send it to every peer.
    ///
    /// Returns the number of peers that accepted it.
    pub fn broadcast(&mut self, frame: &Frame) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        Ok(self.fan_out(encoded, None))
    }

    /// Send pre-encoded bytes to every peer.
    pub fn broadcast_raw(&mut self, encoded: Arc<Vec<u8>>) -> usize {
        self.fan_out(encoded, None)
    }

    /// Send pre-encoded bytes to every peer except `excluded`.
    pub fn broadcast_except(&mut self, excluded: &PeerId, encoded: Arc<Vec<u8>>) -> usize {
        self.fan_out(encoded, Some(excluded))
    }

    /// Send `frame` to a single peer.
    ///
    /// Returns `Ok(false)` if the peer is unknown or its send failed (in
    /// which case it has been pruned).
    pub fn send_to_peer(&mut self, peer_id: &PeerId, frame: &Frame) -> Result<bool, ProtocolError> {
        if !self.peers.contains_key(peer_id) {
            return Ok(false);
        }
        let encoded = Arc::new(frame.encode()?);
        Ok(self.send_raw_to_peer(peer_id, encoded))
    }

    /// Send pre-encoded bytes to a single peer.
    pub fn send_raw_to_peer(&mut self, peer_id: &PeerId, encoded: Arc<Vec<u8>>) -> bool {
        let Some(sink) = self.peers.get(peer_id) else {
            return false;
        };
        match sink.send(encoded) {
            Ok(()) => {
                self.stats.deliveries += 1;
                true
            }
            Err(e) => {
                self.prune(peer_id, &e);
                false
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            active_peers: self.peers.len(),
            ..self.stats
        }
    }

    fn fan_out(&mut self, encoded: Arc<Vec<u8>>, excluded: Option<&PeerId>) -> usize {
        let targets: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| Some(*id) != excluded)
            .copied()
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();

        for peer_id in targets {
            let Some(sink) = self.peers.get(&peer_id) else {
                continue;
            };
            match sink.send(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((peer_id, e)),
            }
        }

        for (peer_id, e) in &failed {
            self.prune(peer_id, e);
        }

        self.stats.messages_sent += 1;
        self.stats.deliveries += delivered as u64;
        delivered
    }

    fn prune(&mut self, peer_id: &PeerId, reason: &TransportError) {
        if self.peers.remove(peer_id).is_some() {
            self.stats.peers_pruned += 1;
            log::debug!("Pruned peer {peer_id}: {reason}");
        }
    }
}

impl fmt::Debug for PeerBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerBroadcaster")
            .field("peers", &self.peers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use std::sync::Mutex;

    type Inbox = Arc<Mutex<Vec<Arc<Vec<u8>>>>>;

    fn inbox_peer(inbox: Inbox) -> Box<dyn PeerSink> {
        Box::new(move |frame: Arc<Vec<u8>>| -> Result<(), TransportError> {
            inbox.lock().unwrap().push(frame);
            Ok(())
        })
    }

    fn failing_peer() -> Box<dyn PeerSink> {
        Box::new(|_frame: Arc<Vec<u8>>| -> Result<(), TransportError> {
            Err(TransportError::Failed("unreachable".into()))
        })
    }

    fn ping() -> Frame {
        Frame::ping(SessionId::from("s1"))
    }

    #[test]
    fn test_add_remove_peer() {
        let mut broadcaster = PeerBroadcaster::new();
        let peer = PeerId::new();

        assert!(broadcaster.add_peer(peer, inbox_peer(Inbox::default())).is_none());
        assert!(broadcaster.has_peer(&peer));
        assert_eq!(broadcaster.peer_count(), 1);

        assert!(broadcaster.remove_peer(&peer));
        assert!(!broadcaster.remove_peer(&peer));
        assert_eq!(broadcaster.peer_count(), 0);
    }

    #[test]
    fn test_failing_peer_is_pruned() {
        let mut broadcaster = PeerBroadcaster::new();
        let inbox1 = Inbox::default();
        let inbox3 = Inbox::default();
        let (p1, p2, p3) = (PeerId::new(), PeerId::new(), PeerId::new());

        broadcaster.add_peer(p1, inbox_peer(inbox1.clone()));
        broadcaster.add_peer(p2, failing_peer());
        broadcaster.add_peer(p3, inbox_peer(inbox3.clone()));

        assert_eq!(broadcaster.broadcast(&ping()).unwrap(), 2);
        assert_eq!(inbox1.lock().unwrap().len(), 1);
        assert_eq!(inbox3.lock().unwrap().len(), 1);
        assert!(!broadcaster.has_peer(&p2));

        let mut remaining = broadcaster.peer_ids();
        remaining.sort();
        let mut expected = vec![p1, p3];
        expected.sort();
        assert_eq!(remaining, expected);

        assert_eq!(broadcaster.broadcast(&ping()).unwrap(), 2);
        assert_eq!(inbox1.lock().unwrap().len(), 2);
        assert_eq!(inbox3.lock().unwrap().len(), 2);

        let stats = broadcaster.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.deliveries, 4);
        assert_eq!(stats.peers_pruned, 1);
        assert_eq!(stats.active_peers, 2);
    }

    #[test]
    fn test_frame_encoded_once_and_shared() {
        let mut broadcaster = PeerBroadcaster::new();
        let a = Inbox::default();
        let b = Inbox::default();
        broadcaster.add_peer(PeerId::new(), inbox_peer(a.clone()));
        broadcaster.add_peer(PeerId::new(), inbox_peer(b.clone()));

        broadcaster.broadcast(&ping()).unwrap();

        let a = a.lock().unwrap();
        let b = b.lock().unwrap();
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert_eq!(Frame::decode(&a[0]).unwrap(), ping());
    }

    #[test]
    fn test_broadcast_except() {
        let mut broadcaster = PeerBroadcaster::new();
        let origin = Inbox::default();
        let other = Inbox::default();
        let origin_id = PeerId::new();
        broadcaster.add_peer(origin_id, inbox_peer(origin.clone()));
        broadcaster.add_peer(PeerId::new(), inbox_peer(other.clone()));

        let count = broadcaster.broadcast_except(&origin_id, Arc::new(vec![1, 2, 3]));
        assert_eq!(count, 1);
        assert!(origin.lock().unwrap().is_empty());
        assert_eq!(*other.lock().unwrap()[0], vec![1, 2, 3]);
    }

    #[test]
    fn test_send_to_peer() {
        let mut broadcaster = PeerBroadcaster::new();
        let target = Inbox::default();
        let bystander = Inbox::default();
        let target_id = PeerId::new();
        broadcaster.add_peer(target_id, inbox_peer(target.clone()));
        broadcaster.add_peer(PeerId::new(), inbox_peer(bystander.clone()));

        assert!(broadcaster.send_to_peer(&target_id, &ping()).unwrap());
        assert_eq!(target.lock().unwrap().len(), 1);
        assert!(bystander.lock().unwrap().is_empty());

        // Unknown peer is a no-op.
        assert!(!broadcaster.send_to_peer(&PeerId::new(), &ping()).unwrap());
    }

    #[test]
    fn test_send_to_failing_peer_prunes() {
        let mut broadcaster = PeerBroadcaster::new();
        let peer = PeerId::new();
        broadcaster.add_peer(peer, failing_peer());

        assert!(!broadcaster.send_to_peer(&peer, &ping()).unwrap());
        assert!(!broadcaster.has_peer(&peer));
        assert_eq!(broadcaster.stats().peers_pruned, 1);
    }

    #[tokio::test]
    async fn test_channel_peer() {
        let (peer, mut rx) = ChannelPeer::new();
        let mut broadcaster = PeerBroadcaster::new();
        let peer_id = PeerId::new();
        broadcaster.add_peer(peer_id, Box::new(peer));

        assert_eq!(broadcaster.broadcast(&ping()).unwrap(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(Frame::decode(&received).unwrap(), ping());

        // Dropping the receiver closes the peer.
        drop(rx);
        assert_eq!(broadcaster.broadcast(&ping()).unwrap(), 0);
        assert!(!broadcaster.has_peer(&peer_id));
    }

    #[test]
    fn test_empty_broadcast() {
        let mut broadcaster = PeerBroadcaster::new();
        assert_eq!(broadcaster.broadcast_raw(Arc::new(Vec::new())), 0);
        assert_eq!(broadcaster.stats().messages_sent, 1);
    }
}
