use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Direct, bidirectional data link with a single remote participant.
///
/// Peer-links report what happens to them through a stream of [PeerEvent]s returned by the
/// [PeerFactory] alongside the link itself.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Applies a negotiation signal received from the remote counterpart.
    async fn signal(&self, signal: Value) -> Result<(), Error>;

    /// Sends a payload over the established link.
    async fn send(&self, data: Bytes) -> Result<(), Error>;

    /// Tears the link down.
    async fn close(&self) -> Result<(), Error>;
}

/// Events emitted by a [PeerLink].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Negotiation data that has to be delivered to the remote counterpart.
    Signal(Value),
    /// Link became ready to send and receive data.
    Connect,
    /// Payload received from the remote counterpart.
    Data(Bytes),
    /// Link failure.
    Error(Error),
    /// Link has been closed.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerOptions {
    /// Whether this side starts the negotiation handshake.
    pub initiator: bool,
    /// Send ICE candidates as separate signals instead of waiting for gathering to complete.
    pub trickle: bool,
}

impl PeerOptions {
    pub fn new(initiator: bool) -> Self {
        PeerOptions {
            initiator,
            trickle: true,
        }
    }
}

/// Creates [PeerLink]s. Transport-specific configuration belongs to the factory.
#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    async fn create(
        &self,
        options: PeerOptions,
    ) -> Result<(Arc<dyn PeerLink>, UnboundedReceiver<PeerEvent>), Error>;
}

/// Peer-link together with the identifier of the remote participant it connects to.
#[derive(Clone)]
pub struct PeerHandle {
    id: Arc<str>,
    link: Arc<dyn PeerLink>,
}

impl PeerHandle {
    pub fn new(id: Arc<str>, link: Arc<dyn PeerLink>) -> Self {
        PeerHandle { id, link }
    }

    /// Identifier of the remote participant.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle").field("id", &self.id).finish()
    }
}

/// Tells which side of a pair initiates the connection.
///
/// Both sides evaluate it with their arguments swapped, so exactly one of them ends up as an
/// initiator without any coordination.
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    remote_id > local_id
}
