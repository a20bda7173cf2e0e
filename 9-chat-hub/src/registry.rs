//! Live peer connections and their outbound queues.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Implementation-assigned identity of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("peer is closed")]
    Closed,
    #[error("peer outbound queue is full ({capacity} frames)")]
    Lagging { capacity: usize },
}

/// One registered peer. Frames pushed through [`Peer::deliver`] are written to
/// the socket by the peer's own writer task, so enqueueing never waits on I/O.
pub struct Peer {
    id: ConnectionId,
    outbox: mpsc::Sender<Arc<str>>,
    capacity: usize,
    open: AtomicBool,
    closed: CancellationToken,
}

impl Peer {
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, PeerLink) {
        let (outbox, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        let peer = Self {
            id,
            outbox,
            capacity,
            open: AtomicBool::new(true),
            closed: closed.clone(),
        };
        let link = PeerLink {
            id,
            outbox: rx,
            closed,
        };
        (peer, link)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbox.is_closed()
    }

    pub fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }
        self.outbox.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Marks the peer dead and signals its reader and writer flows to stop.
    /// Safe to call more than once.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.closed.cancel();
    }
}

/// The transport-facing half of a peer: frames to write and the close signal.
pub struct PeerLink {
    pub id: ConnectionId,
    pub outbox: mpsc::Receiver<Arc<str>>,
    pub closed: CancellationToken,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    peers: RwLock<BTreeMap<ConnectionId, Arc<Peer>>>,
    /// Only written while holding the `peers` write lock.
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Allocates an id, registers a fresh peer, and hands back its link. Once
    /// the registry is closed the link comes back already closed.
    pub fn open(&self, queue_capacity: usize) -> PeerLink {
        let (peer, link) = Peer::new(self.next_id(), queue_capacity.max(1));
        let peer = Arc::new(peer);
        if !self.register(Arc::clone(&peer)) {
            peer.close();
        }
        link
    }

    /// Returns `false` when the registry is closed or a peer with the same id
    /// is already registered.
    pub fn register(&self, peer: Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        if self.closed.load(Ordering::Acquire) || peers.contains_key(&peer.id()) {
            return false;
        }
        peers.insert(peer.id(), peer);
        true
    }

    /// Refuses every later registration. Registered peers stay.
    pub fn close(&self) {
        let _peers = self.peers.write();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the registry and removes every peer, handing them back.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.write();
        self.closed.store(true, Ordering::Release);
        std::mem::take(&mut *peers).into_values().collect()
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Peer>> {
        self.peers.write().remove(&id)
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
