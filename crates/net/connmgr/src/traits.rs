//! Contracts between the connection manager and the network layer.

use std::io;
use std::sync::Arc;

use libp2p::{Multiaddr, PeerId};

/// A single transport-layer association with a remote peer.
///
/// The connection manager never inspects the transport; it only needs to know
/// which peer is on the other end, where the connection came from, and how to
/// terminate it.
pub trait Connection: Send + Sync {
    /// The peer on the remote end of this connection.
    fn remote_peer(&self) -> PeerId;

    /// The remote address this connection is bound to.
    fn remote_multiaddr(&self) -> Multiaddr;

    /// Closes the connection. Errors are advisory; the connection is treated
    /// as terminated either way.
    fn close(&self) -> io::Result<()>;
}

/// Shared handle to a connection.
///
/// Two handles refer to the same connection iff they point at the same
/// underlying object; the manager keys its bookkeeping on that identity, not
/// on any value comparison.
pub type ConnRef = Arc<dyn Connection>;

/// Notification sink fed by the network layer.
///
/// Only `connected` and `disconnected` carry state; the remaining hooks exist
/// because the network layer's contract enumerates them.
pub trait Notifiee: Send + Sync {
    fn connected(&self, conn: ConnRef);
    fn disconnected(&self, conn: &ConnRef);
    fn listen(&self, addr: &Multiaddr);
    fn listen_close(&self, addr: &Multiaddr);
    fn opened_stream(&self, peer: &PeerId);
    fn closed_stream(&self, peer: &PeerId);
}
