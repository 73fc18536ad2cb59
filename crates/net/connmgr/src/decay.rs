//! Decaying tags: a single-writer loop that applies decay ticks and bump commands.
//!
//! The loop serialises three event streams: a resolution-grained ticker, a
//! bounded queue of bump commands, and a shutdown signal. Tag descriptors are
//! owned by the decayer and addressed from peer records by a dense integer
//! id, so values never hold references back into the tag graph.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::warn;

use crate::config::{DecayerConfig, BUMP_QUEUE_CAPACITY, DEFAULT_RESOLUTION};
use crate::manager::Shared;
use crate::state::PeerInfo;

/// Decay function: maps a tag's current value to its next value, plus a flag
/// requesting removal of the value.
pub type DecayFn = Arc<dyn Fn(&DecayingValue) -> (i64, bool) + Send + Sync>;

/// Bump function: folds an externally submitted delta into a tag's current
/// value.
pub type BumpFn = Arc<dyn Fn(&DecayingValue, i64) -> i64 + Send + Sync>;

/// The state of one decaying tag on one peer.
#[derive(Debug, Clone)]
pub struct DecayingValue {
    /// Name of the tag this value belongs to.
    pub tag: Arc<str>,
    /// The peer this value belongs to.
    pub peer: PeerId,
    /// Current value; folded into the peer's cached score.
    pub value: i64,
    /// When the value was created by its first bump.
    pub added: Instant,
    /// When the value was last bumped.
    pub last_visit: Instant,
}

/// Errors surfaced by the decaying-tag subsystem.
#[derive(Debug, Error)]
pub enum DecayError {
    #[error("decaying tag with name {0} already exists")]
    AlreadyRegistered(String),
    #[error("bump queue full; dropped bump for peer {peer}, tag {tag}, delta {delta}")]
    QueueFull {
        peer: PeerId,
        tag: String,
        delta: i64,
    },
}

struct BumpCmd {
    peer: PeerId,
    tag: usize,
    delta: i64,
}

struct TagEntry {
    name: Arc<str>,
    /// Decay interval expressed in resolution rounds.
    rounds: u64,
    /// The round at which this tag is next due for a decay visit.
    next_round: u64,
    decay_fn: DecayFn,
    bump_fn: BumpFn,
}

pub(crate) struct DecayerInner {
    resolution: Duration,
    /// Registered tags, indexed by tag id. Never invoked while this lock is
    /// held; decay and bump callbacks only ever run under a segment mutex.
    tags: Mutex<Vec<TagEntry>>,
    current_round: AtomicU64,
    bump_tx: mpsc::Sender<BumpCmd>,
}

/// Handle to the decaying-tag subsystem.
#[derive(Clone)]
pub struct Decayer {
    inner: Arc<DecayerInner>,
}

impl Decayer {
    pub fn resolution(&self) -> Duration {
        self.inner.resolution
    }

    /// Registers a new decaying tag under a globally unique name.
    ///
    /// Intervals below the resolution are clamped up to it; intervals that
    /// are not a multiple of the resolution are rounded up to the next
    /// multiple. Both cases log a warning.
    pub fn register_decaying_tag(
        &self,
        name: impl Into<String>,
        interval: Duration,
        decay_fn: DecayFn,
        bump_fn: BumpFn,
    ) -> Result<DecayingTag, DecayError> {
        let name = name.into();
        let resolution = self.inner.resolution;

        let mut tags = self.inner.tags.lock();
        if tags.iter().any(|tag| &*tag.name == name) {
            return Err(DecayError::AlreadyRegistered(name));
        }

        let rounds = if interval < resolution {
            warn!(
                tag = %name,
                ?interval,
                ?resolution,
                "decay interval below tracker resolution; clamping to resolution"
            );
            1
        } else {
            if interval.as_nanos() % resolution.as_nanos() != 0 {
                warn!(
                    tag = %name,
                    ?interval,
                    ?resolution,
                    "decay interval not a multiple of tracker resolution; rounding up"
                );
            }
            interval.as_nanos().div_ceil(resolution.as_nanos()) as u64
        };

        let name: Arc<str> = name.into();
        let next_round = self.inner.current_round.load(Ordering::Relaxed) + rounds;
        tags.push(TagEntry {
            name: Arc::clone(&name),
            rounds,
            next_round,
            decay_fn,
            bump_fn,
        });

        Ok(DecayingTag {
            id: tags.len() - 1,
            name,
            tx: self.inner.bump_tx.clone(),
        })
    }
}

/// Handle to one registered decaying tag. Cheap to clone; bumping does not
/// require access to the connection manager.
#[derive(Clone, Debug)]
pub struct DecayingTag {
    id: usize,
    name: Arc<str>,
    tx: mpsc::Sender<BumpCmd>,
}

impl DecayingTag {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a delta to be folded into this tag's value for `peer` by the
    /// decayer loop. Non-blocking: fails with [`DecayError::QueueFull`] when
    /// the queue is saturated rather than stalling the caller.
    pub fn bump(&self, peer: PeerId, delta: i64) -> Result<(), DecayError> {
        let cmd = BumpCmd {
            peer,
            tag: self.id,
            delta,
        };
        self.tx.try_send(cmd).map_err(|_| DecayError::QueueFull {
            peer,
            tag: self.name.to_string(),
            delta,
        })
    }
}

/// Creates the decayer and spawns its loop on the current runtime.
pub(crate) fn spawn(
    config: DecayerConfig,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) -> (Decayer, JoinHandle<()>) {
    let resolution = if config.resolution.is_zero() {
        warn!(default = ?DEFAULT_RESOLUTION, "decayer resolution of zero; using default");
        DEFAULT_RESOLUTION
    } else {
        config.resolution
    };

    let (bump_tx, bump_rx) = mpsc::channel(BUMP_QUEUE_CAPACITY);
    let inner = Arc::new(DecayerInner {
        resolution,
        tags: Mutex::new(Vec::new()),
        current_round: AtomicU64::new(0),
        bump_tx,
    });

    let task = tokio::spawn(run(Arc::clone(&inner), shared, bump_rx, shutdown));
    (Decayer { inner }, task)
}

/// The single-writer loop. Ticks, bumps, and shutdown are serialised here;
/// pending bumps are not drained on shutdown.
async fn run(
    inner: Arc<DecayerInner>,
    shared: Arc<Shared>,
    mut bump_rx: mpsc::Receiver<BumpCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + inner.resolution, inner.resolution);
    loop {
        tokio::select! {
            _ = ticker.tick() => inner.tick(&shared),
            cmd = bump_rx.recv() => match cmd {
                Some(cmd) => inner.apply_bump(&shared, cmd),
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

impl DecayerInner {
    /// One decay round: visit every peer's values for each tag that is due,
    /// then re-arm the visited tags.
    fn tick(&self, shared: &Shared) {
        let round = self.current_round.fetch_add(1, Ordering::Relaxed) + 1;

        let visit: Vec<(usize, DecayFn)> = {
            let tags = self.tags.lock();
            tags.iter()
                .enumerate()
                .filter(|(_, tag)| tag.next_round <= round)
                .map(|(id, tag)| (id, Arc::clone(&tag.decay_fn)))
                .collect()
        };
        if visit.is_empty() {
            return;
        }

        for segment in shared.segments.iter() {
            let mut peers = segment.lock();
            for info in peers.values_mut() {
                for (tag_id, decay_fn) in &visit {
                    let (after, remove) = match info.decaying.get(tag_id) {
                        Some(value) => decay_fn(value),
                        None => continue,
                    };
                    if remove {
                        if let Some(value) = info.decaying.remove(tag_id) {
                            info.score -= value.value;
                        }
                    } else if let Some(value) = info.decaying.get_mut(tag_id) {
                        info.score += after - value.value;
                        value.value = after;
                    }
                }
            }
            // A peer whose last decaying value just expired and who has no
            // connections left is no longer tracked.
            peers.retain(|_, info| !info.conns.is_empty() || !info.decaying.is_empty());
        }

        let mut tags = self.tags.lock();
        for (tag_id, _) in &visit {
            if let Some(tag) = tags.get_mut(*tag_id) {
                tag.next_round = round + tag.rounds;
            }
        }
    }

    /// Applies one queued bump, creating the peer record and the value on
    /// first contact.
    fn apply_bump(&self, shared: &Shared, cmd: BumpCmd) {
        let (name, bump_fn) = {
            let tags = self.tags.lock();
            match tags.get(cmd.tag) {
                Some(tag) => (Arc::clone(&tag.name), Arc::clone(&tag.bump_fn)),
                None => return,
            }
        };

        let now = Instant::now();
        let segment = shared.segments.get(&cmd.peer);
        let mut peers = segment.lock();
        let info = peers
            .entry(cmd.peer)
            .or_insert_with(|| PeerInfo::new(cmd.peer));
        let value = info.decaying.entry(cmd.tag).or_insert_with(|| DecayingValue {
            tag: name,
            peer: cmd.peer,
            value: 0,
            added: now,
            last_visit: now,
        });

        let prev = value.value;
        let next = bump_fn(value, cmd.delta);
        value.value = next;
        value.last_visit = now;
        info.score += next - prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnManagerConfig;
    use crate::manager::ConnManager;
    use crate::presets::*;

    fn test_peer_id(n: u8) -> PeerId {
        let bytes = [n; 32];
        let key = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes).unwrap();
        let keypair =
            libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(key));
        keypair.public().to_peer_id()
    }

    fn test_manager() -> (ConnManager, Decayer) {
        let manager = ConnManager::new(
            ConnManagerConfig::new(10, 10, Duration::from_secs(1)).with_decayer(
                DecayerConfig::default().with_resolution(Duration::from_millis(50)),
            ),
        );
        let decayer = manager.decayer().expect("decayer enabled");
        (manager, decayer)
    }

    /// Lets the decayer loop drain everything that is ready without moving
    /// the paused clock.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Advances the paused clock, firing any due decay ticks in order.
    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        settle().await;
    }

    fn score(manager: &ConnManager, peer: &PeerId) -> i64 {
        manager.get_tag_info(peer).map(|info| info.value).unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_expire() {
        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        let tag = decayer
            .register_decaying_tag(
                "pop",
                Duration::from_millis(250),
                expire_when_inactive(Duration::from_secs(1)),
                sum_unbounded(),
            )
            .unwrap();

        tag.bump(peer, 10).unwrap();
        settle().await;
        assert_eq!(score(&manager, &peer), 10);

        for _ in 0..4 {
            advance(Duration::from_millis(250)).await;
        }
        assert_eq!(score(&manager, &peer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_bumps() {
        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        let tag = decayer
            .register_decaying_tag(
                "pop",
                Duration::from_millis(250),
                expire_when_inactive(Duration::from_secs(1)),
                sum_bounded(10, 20),
            )
            .unwrap();

        tag.bump(peer, 5).unwrap();
        settle().await;
        assert_eq!(score(&manager, &peer), 10);

        tag.bump(peer, 100).unwrap();
        settle().await;
        assert_eq!(score(&manager, &peer), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_tags_no_decay() {
        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        let mut tags = Vec::new();
        for name in ["beep", "bop", "foo"] {
            let tag = decayer
                .register_decaying_tag(
                    name,
                    Duration::from_millis(250),
                    no_decay(),
                    sum_bounded(0, 100),
                )
                .unwrap();
            tags.push(tag);
        }

        for tag in &tags {
            tag.bump(peer, 100).unwrap();
        }
        for tag in &tags {
            tag.bump(peer, 100).unwrap();
        }
        settle().await;

        // each tag is upper-bounded at 100
        let info = manager.get_tag_info(&peer).unwrap();
        assert_eq!(info.value, 300);
        for name in ["beep", "bop", "foo"] {
            assert_eq!(info.tags.get(name), Some(&100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_decay_functions() {
        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        let tag1 = decayer
            .register_decaying_tag(
                "beep",
                Duration::from_millis(250),
                fixed_decay(10),
                sum_unbounded(),
            )
            .unwrap();
        let tag2 = decayer
            .register_decaying_tag(
                "bop",
                Duration::from_millis(100),
                fixed_decay(5),
                sum_unbounded(),
            )
            .unwrap();
        let tag3 = decayer
            .register_decaying_tag(
                "foo",
                Duration::from_millis(50),
                fixed_decay(1),
                sum_unbounded(),
            )
            .unwrap();

        tag1.bump(peer, 1000).unwrap();
        tag2.bump(peer, 1000).unwrap();
        tag3.bump(peer, 1000).unwrap();
        settle().await;

        // no decay has happened yet
        assert_eq!(score(&manager, &peer), 3000);

        // only the 50ms tag ticks
        advance(Duration::from_millis(50)).await;
        assert_eq!(score(&manager, &peer), 2999);

        // the 50ms tag ticks thrice more, the 100ms tag twice
        advance(Duration::from_millis(150)).await;
        assert_eq!(score(&manager, &peer), 2986);

        // the 50ms tag and the 250ms tag tick once each
        advance(Duration::from_millis(50)).await;
        assert_eq!(score(&manager, &peer), 2975);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_peers() {
        let (manager, decayer) = test_manager();
        let peers = [test_peer_id(1), test_peer_id(2), test_peer_id(3)];

        let tag1 = decayer
            .register_decaying_tag(
                "beep",
                Duration::from_millis(250),
                fixed_decay(10),
                sum_unbounded(),
            )
            .unwrap();
        let tag2 = decayer
            .register_decaying_tag(
                "bop",
                Duration::from_millis(100),
                fixed_decay(5),
                sum_unbounded(),
            )
            .unwrap();
        let tag3 = decayer
            .register_decaying_tag(
                "foo",
                Duration::from_millis(50),
                fixed_decay(1),
                sum_unbounded(),
            )
            .unwrap();

        for (peer, initial) in peers.iter().zip([1000, 500, 100]) {
            tag1.bump(*peer, initial).unwrap();
            tag2.bump(*peer, initial).unwrap();
            tag3.bump(*peer, initial).unwrap();
        }
        settle().await;

        advance(Duration::from_secs(3)).await;

        assert_eq!(score(&manager, &peers[0]), 2670);
        assert_eq!(score(&manager, &peers[1]), 1170);
        assert_eq!(score(&manager, &peers[2]), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_decay_and_overwrite() {
        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        let tag = decayer
            .register_decaying_tag(
                "beep",
                Duration::from_millis(250),
                linear_decay(0.5),
                overwrite(),
            )
            .unwrap();

        tag.bump(peer, 1000).unwrap();
        settle().await;

        advance(Duration::from_millis(250)).await;
        assert_eq!(score(&manager, &peer), 500);

        advance(Duration::from_millis(250)).await;
        assert_eq!(score(&manager, &peer), 250);

        tag.bump(peer, 1000).unwrap();
        settle().await;
        assert_eq!(score(&manager, &peer), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_duplicate_name() {
        let (_manager, decayer) = test_manager();

        decayer
            .register_decaying_tag("pop", Duration::from_millis(250), no_decay(), sum_unbounded())
            .unwrap();
        let err = decayer
            .register_decaying_tag("pop", Duration::from_millis(500), no_decay(), sum_unbounded())
            .unwrap_err();

        assert!(matches!(err, DecayError::AlreadyRegistered(name) if name == "pop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_clamped_to_resolution() {
        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        // 30ms is below the 50ms resolution and gets clamped up to it
        let tag = decayer
            .register_decaying_tag(
                "fast",
                Duration::from_millis(30),
                fixed_decay(1),
                sum_unbounded(),
            )
            .unwrap();

        tag.bump(peer, 10).unwrap();
        settle().await;

        advance(Duration::from_millis(50)).await;
        assert_eq!(score(&manager, &peer), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bump_queue_full() {
        let (_manager, decayer) = test_manager();
        let peer = test_peer_id(1);

        let tag = decayer
            .register_decaying_tag("pop", Duration::from_millis(250), no_decay(), sum_unbounded())
            .unwrap();

        // fill the queue without yielding to the decayer loop
        for _ in 0..BUMP_QUEUE_CAPACITY {
            tag.bump(peer, 1).unwrap();
        }
        let err = tag.bump(peer, 1).unwrap_err();
        assert!(matches!(err, DecayError::QueueFull { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decaying_state_survives_disconnect() {
        use crate::traits::{Connection, ConnRef, Notifiee};
        use std::sync::atomic::AtomicBool;

        struct TestConn {
            peer: PeerId,
            closed: AtomicBool,
        }

        impl Connection for TestConn {
            fn remote_peer(&self) -> PeerId {
                self.peer
            }
            fn remote_multiaddr(&self) -> libp2p::Multiaddr {
                "/ip4/127.0.0.1/tcp/1634".parse().unwrap()
            }
            fn close(&self) -> std::io::Result<()> {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let (manager, decayer) = test_manager();
        let peer = test_peer_id(1);
        let conn: ConnRef = Arc::new(TestConn {
            peer,
            closed: AtomicBool::new(false),
        });

        let tag = decayer
            .register_decaying_tag("pop", Duration::from_millis(250), no_decay(), sum_unbounded())
            .unwrap();

        let notifee = manager.notifee();
        notifee.connected(Arc::clone(&conn));
        tag.bump(peer, 42).unwrap();
        settle().await;
        assert_eq!(score(&manager, &peer), 42);

        // the record stays alive while decaying values remain
        notifee.disconnected(&conn);
        assert_eq!(manager.get_info().conn_count, 0);
        assert_eq!(score(&manager, &peer), 42);

        notifee.connected(Arc::clone(&conn));
        assert_eq!(manager.get_info().conn_count, 1);
        assert_eq!(score(&manager, &peer), 42);
    }
}
