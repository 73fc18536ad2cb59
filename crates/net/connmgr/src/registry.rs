//! Protection registry: peers protected under any reason are exempt from trimming.

use std::collections::{HashMap, HashSet};

use libp2p::PeerId;
use parking_lot::{RwLock, RwLockReadGuard};

/// Maps peer ids to the set of reasons they are protected for.
///
/// Indexed by peer id, not by connection, so protection survives
/// disconnect/reconnect cycles. Guarded by its own lock, independent of the
/// peer table's segment mutexes; the trimmer holds it read-shared for the
/// whole duration of a candidate snapshot.
pub(crate) struct ProtectRegistry {
    protected: RwLock<HashMap<PeerId, HashSet<String>>>,
}

impl ProtectRegistry {
    pub fn new() -> Self {
        Self {
            protected: RwLock::new(HashMap::new()),
        }
    }

    pub fn protect(&self, peer: PeerId, reason: &str) {
        self.protected
            .write()
            .entry(peer)
            .or_default()
            .insert(reason.to_string());
    }

    /// Removes one protection reason. Returns whether the peer remains
    /// protected under any other reason.
    pub fn unprotect(&self, peer: &PeerId, reason: &str) -> bool {
        let mut protected = self.protected.write();
        let Some(reasons) = protected.get_mut(peer) else {
            return false;
        };
        reasons.remove(reason);
        if reasons.is_empty() {
            protected.remove(peer);
            return false;
        }
        true
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.protected
            .read()
            .get(peer)
            .is_some_and(|reasons| !reasons.is_empty())
    }

    /// Read guard over the full registry, held by the trimmer across its
    /// snapshot so protection state is consistent within one trim.
    pub fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, HashSet<String>>> {
        self.protected.read()
    }
}
