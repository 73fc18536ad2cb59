//! Sharded peer table: per-peer metadata guarded by 256 segment mutexes.

use std::collections::HashMap;
use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::decay::DecayingValue;
use crate::traits::ConnRef;

pub(crate) const SEGMENT_COUNT: usize = 256;

/// Identity key for a connection handle. Two `ConnRef`s clone from the same
/// `Arc` iff they share this key.
pub(crate) fn conn_key(conn: &ConnRef) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

/// A live connection together with the time we started tracking it.
pub(crate) struct TrackedConn {
    pub conn: ConnRef,
    pub opened: Instant,
}

/// Metadata for a single tracked peer.
///
/// Owned by the segment mutex of the peer's shard; never read or written
/// without holding it. The record exists while the peer has at least one
/// live connection or one decaying tag value.
pub(crate) struct PeerInfo {
    pub id: PeerId,
    /// When we began tracking this peer.
    pub first_seen: Instant,
    /// Static tag values, keyed by tag name.
    pub tags: HashMap<String, i64>,
    /// Decaying tag values, keyed by the decayer's tag id.
    pub decaying: HashMap<usize, DecayingValue>,
    /// Cached sum of all static and decaying tag values.
    pub score: i64,
    /// Live connections, keyed by connection identity.
    pub conns: HashMap<usize, TrackedConn>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            first_seen: Instant::now(),
            tags: HashMap::new(),
            decaying: HashMap::new(),
            score: 0,
            conns: HashMap::new(),
        }
    }

    /// Detached copy of this peer's tag state.
    pub fn tag_info(&self) -> TagInfo {
        let mut tags = self.tags.clone();
        for value in self.decaying.values() {
            tags.insert(value.tag.to_string(), value.value);
        }
        TagInfo {
            first_seen: self.first_seen,
            value: self.score,
            tags,
            conns: self
                .conns
                .values()
                .map(|tracked| (tracked.conn.remote_multiaddr().to_string(), tracked.opened))
                .collect(),
        }
    }
}

/// Snapshot of a peer's tags and connections, safe to hold without any lock.
#[derive(Debug, Clone)]
pub struct TagInfo {
    /// When the manager began tracking the peer.
    pub first_seen: Instant,
    /// The peer's total score.
    pub value: i64,
    /// All tag values (static and decaying), keyed by tag name.
    pub tags: HashMap<String, i64>,
    /// Open time of each live connection, keyed by remote address.
    pub conns: HashMap<String, Instant>,
}

pub(crate) type Segment = HashMap<PeerId, PeerInfo>;

/// The peer table, sharded 256 ways by the last byte of the peer id.
///
/// Every operation on a `PeerInfo` acquires exactly one segment mutex.
/// Cross-segment iteration locks segments one at a time; readers accept the
/// resulting weak snapshot semantics.
pub(crate) struct Segments {
    segments: [Mutex<Segment>; SEGMENT_COUNT],
}

impl Segments {
    pub fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, peer: &PeerId) -> &Mutex<Segment> {
        let index = peer.to_bytes().last().copied().unwrap_or(0) as usize;
        &self.segments[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<Segment>> {
        self.segments.iter()
    }

    pub fn count_peers(&self) -> usize {
        self.segments.iter().map(|segment| segment.lock().len()).sum()
    }
}
