//! The connection manager: tracks open connections, accrues peer scores, and
//! trims the lowest-valued peers when the high watermark is exceeded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, debug_span, error, info, warn};

use crate::config::{ConnManagerConfig, SUPERVISOR_INTERVAL};
use crate::decay::{self, Decayer};
use crate::registry::ProtectRegistry;
use crate::state::{conn_key, PeerInfo, Segments, TagInfo, TrackedConn};
use crate::traits::{ConnRef, Connection, Notifiee};

/// Connection manager.
///
/// Connections are reported through the [`Notifee`] returned by
/// [`ConnManager::notifee`]. Once the count exceeds the configured high
/// watermark, the background supervisor closes the connections of the
/// lowest-scored peers until the low watermark is reached. Newly seen peers
/// are given a grace period before they become subject to trimming, and
/// successive trims are separated by at least the silence period.
///
/// Background tasks exit when [`ConnManager::close`] is awaited, or when the
/// manager is dropped.
pub struct ConnManager {
    shared: Arc<Shared>,
    decayer: Option<Decayer>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// State shared between the facade, the notifee, and the background tasks.
pub(crate) struct Shared {
    low_water: usize,
    high_water: usize,
    grace_period: Duration,
    silence_period: Duration,
    pub(crate) segments: Segments,
    conn_count: AtomicUsize,
    protected: ProtectRegistry,
    /// Single-slot guard: at most one trim runs at any instant.
    trim_running: AtomicBool,
    /// Written only by the trimmer.
    last_trim: Mutex<Option<Instant>>,
}

impl ConnManager {
    /// Creates the manager and spawns its background tasks on the current
    /// tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: ConnManagerConfig) -> Self {
        let shared = Arc::new(Shared {
            low_water: config.low_water,
            high_water: config.high_water,
            grace_period: config.grace_period,
            silence_period: config.silence_period,
            segments: Segments::new(),
            conn_count: AtomicUsize::new(0),
            protected: ProtectRegistry::new(),
            trim_running: AtomicBool::new(false),
            last_trim: Mutex::new(None),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(supervise(
            Arc::clone(&shared),
            shutdown_rx.clone(),
        )));

        let mut decayer = None;
        if let Some(decayer_config) = config.decayer {
            let (handle, task) = decay::spawn(decayer_config, Arc::clone(&shared), shutdown_rx);
            tasks.push(task);
            decayer = Some(handle);
        }

        Self {
            shared,
            decayer,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// The notification sink to register with the network layer.
    pub fn notifee(&self) -> Notifee {
        Notifee {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Handle to the decaying-tag subsystem, if it was configured.
    pub fn decayer(&self) -> Option<Decayer> {
        self.decayer.clone()
    }

    /// Associates a named integer value with a peer, replacing any previous
    /// value under the same name. Untracked peers are left alone.
    pub fn tag_peer(&self, peer: &PeerId, tag: &str, value: i64) {
        let segment = self.shared.segments.get(peer);
        let mut peers = segment.lock();
        let Some(info) = peers.get_mut(peer) else {
            info!(%peer, tag, "tried to tag untracked peer");
            return;
        };
        let old = info.tags.insert(tag.to_string(), value).unwrap_or(0);
        info.score += value - old;
    }

    /// Removes a named value from a peer.
    pub fn untag_peer(&self, peer: &PeerId, tag: &str) {
        let segment = self.shared.segments.get(peer);
        let mut peers = segment.lock();
        let Some(info) = peers.get_mut(peer) else {
            info!(%peer, tag, "tried to untag untracked peer");
            return;
        };
        if let Some(old) = info.tags.remove(tag) {
            info.score -= old;
        }
    }

    /// Updates a named value through `upsert`, which receives the current
    /// value (zero if absent).
    pub fn upsert_tag(&self, peer: &PeerId, tag: &str, upsert: impl FnOnce(i64) -> i64) {
        let segment = self.shared.segments.get(peer);
        let mut peers = segment.lock();
        let Some(info) = peers.get_mut(peer) else {
            info!(%peer, tag, "tried to upsert tag on untracked peer");
            return;
        };
        let old = info.tags.get(tag).copied().unwrap_or(0);
        let new = upsert(old);
        info.score += new - old;
        info.tags.insert(tag.to_string(), new);
    }

    /// Detached copy of a peer's tag state, or `None` for untracked peers.
    pub fn get_tag_info(&self, peer: &PeerId) -> Option<TagInfo> {
        let segment = self.shared.segments.get(peer);
        let peers = segment.lock();
        peers.get(peer).map(PeerInfo::tag_info)
    }

    /// Marks a peer as exempt from trimming for the given reason.
    pub fn protect(&self, peer: PeerId, reason: &str) {
        self.shared.protected.protect(peer, reason);
    }

    /// Removes one protection reason. Returns whether the peer remains
    /// protected under any other reason.
    pub fn unprotect(&self, peer: &PeerId, reason: &str) -> bool {
        self.shared.protected.unprotect(peer, reason)
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.shared.protected.is_protected(peer)
    }

    /// Closes the connections of as many peers as needed to bring the count
    /// down to the low watermark, lowest-scored peers first, skipping peers
    /// that are protected or still within their grace period.
    ///
    /// Returns immediately if another trim is in progress or the last trim
    /// finished less than the silence period ago.
    pub fn trim_open_conns(&self) {
        self.shared.trim();
    }

    /// Configuration plus live status.
    pub fn get_info(&self) -> ConnManagerInfo {
        ConnManagerInfo {
            low_water: self.shared.low_water,
            high_water: self.shared.high_water,
            last_trim: *self.shared.last_trim.lock(),
            grace_period: self.shared.grace_period,
            conn_count: self.shared.conn_count.load(Ordering::Relaxed),
        }
    }

    /// Number of peers currently tracked.
    pub fn peer_count(&self) -> usize {
        self.shared.segments.count_peers()
    }

    /// Signals the background tasks to stop and waits for them. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Shared {
    /// Runs one trim if the single-flight slot is free; otherwise a no-op.
    pub(crate) fn trim(&self) {
        if self.trim_running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.do_trim();
        self.trim_running.store(false, Ordering::Release);
    }

    fn do_trim(&self) {
        if let Some(last) = *self.last_trim.lock() {
            if last.elapsed() < self.silence_period {
                // the last trim just took place; skip this attempt
                return;
            }
        }

        let _span = debug_span!("trim_open_conns").entered();
        for conn in self.conns_to_close() {
            info!(peer = %conn.remote_peer(), "closing connection");
            let _ = conn.close();
        }
        *self.last_trim.lock() = Some(Instant::now());
    }

    /// Selects the victim connections for one trim.
    ///
    /// Snapshots every non-protected peer's score segment by segment, sorts
    /// ascending, and collects all connections of the lowest-scored peers
    /// past their grace period until the excess over the low watermark is
    /// covered. The returned connections are closed by the caller with no
    /// locks held, since `close` can re-enter the notifee.
    fn conns_to_close(&self) -> Vec<ConnRef> {
        if self.low_water == 0 || self.high_water == 0 {
            // trimming is disabled
            return Vec::new();
        }
        let conn_count = self.conn_count.load(Ordering::Relaxed);
        if conn_count <= self.low_water {
            debug!(conn_count, "open connection count below limit");
            return Vec::new();
        }

        let now = Instant::now();
        let mut candidates = Vec::with_capacity(self.segments.count_peers());
        {
            let protected = self.protected.read();
            for segment in self.segments.iter() {
                let peers = segment.lock();
                for info in peers.values() {
                    if protected.contains_key(&info.id) {
                        continue;
                    }
                    candidates.push((info.id, info.score, info.first_seen));
                }
            }
        }

        candidates.sort_unstable_by_key(|(_, score, _)| *score);

        let mut target = (conn_count - self.low_water) as i64;
        let mut selected = Vec::with_capacity(conn_count - self.low_water + 10);

        for (peer, _, first_seen) in candidates {
            if first_seen + self.grace_period > now {
                continue;
            }

            // re-lock the segment so the connection snapshot is consistent
            // with concurrent connect/disconnect notifications
            let segment = self.segments.get(&peer);
            let peers = segment.lock();
            if let Some(info) = peers.get(&peer) {
                for tracked in info.conns.values() {
                    selected.push(Arc::clone(&tracked.conn));
                }
                target -= info.conns.len() as i64;
            }
            drop(peers);

            if target <= 0 {
                break;
            }
        }

        if target > 0 {
            warn!(
                excess = target,
                "trim finished above the low watermark; remaining peers are protected or in grace"
            );
        }

        selected
    }
}

/// Periodic supervisor: wakes once a minute and trims when the connection
/// count exceeds the high watermark.
async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(
        Instant::now() + SUPERVISOR_INTERVAL,
        SUPERVISOR_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.conn_count.load(Ordering::Relaxed) > shared.high_water {
                    shared.trim();
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Notification sink maintaining the peer table and the connection counter.
///
/// Must not do blocking work: the network layer calls it on its hot path.
#[derive(Clone)]
pub struct Notifee {
    shared: Arc<Shared>,
}

impl Notifiee for Notifee {
    fn connected(&self, conn: ConnRef) {
        let peer = conn.remote_peer();
        let segment = self.shared.segments.get(&peer);
        let mut peers = segment.lock();

        let info = peers.entry(peer).or_insert_with(|| PeerInfo::new(peer));
        let key = conn_key(&conn);
        if info.conns.contains_key(&key) {
            error!(%peer, "received connected notification for a connection we are already tracking");
            return;
        }

        info.conns.insert(
            key,
            TrackedConn {
                conn,
                opened: Instant::now(),
            },
        );
        self.shared.conn_count.fetch_add(1, Ordering::Relaxed);
    }

    fn disconnected(&self, conn: &ConnRef) {
        let peer = conn.remote_peer();
        let segment = self.shared.segments.get(&peer);
        let mut peers = segment.lock();

        let Some(info) = peers.get_mut(&peer) else {
            error!(%peer, "received disconnected notification for a peer we are not tracking");
            return;
        };
        if info.conns.remove(&conn_key(conn)).is_none() {
            error!(%peer, "received disconnected notification for a connection we are not tracking");
            return;
        }

        self.shared.conn_count.fetch_sub(1, Ordering::Relaxed);
        if info.conns.is_empty() && info.decaying.is_empty() {
            peers.remove(&peer);
        }
    }

    fn listen(&self, _addr: &Multiaddr) {}

    fn listen_close(&self, _addr: &Multiaddr) {}

    fn opened_stream(&self, _peer: &PeerId) {}

    fn closed_stream(&self, _peer: &PeerId) {}
}

/// Configuration and status data for a [`ConnManager`].
#[derive(Debug, Clone)]
pub struct ConnManagerInfo {
    pub low_water: usize,
    pub high_water: usize,
    /// When the last trim completed, if any.
    pub last_trim: Option<Instant>,
    pub grace_period: Duration,
    /// The live connection count.
    pub conn_count: usize,
}
