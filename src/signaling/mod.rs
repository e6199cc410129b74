//! Signaling side-channel used to discover room members and to relay negotiation data
//! between them before (and while) direct peer-links are established.
//!
//! Protocol consists of three JSON messages, tagged by `event` field:
//! - `join {room, peerId}` sent by a client entering a room,
//! - `joined {roomPeerIds}` broadcast by the server to every room member whenever someone
//!   joins,
//! - `signal {from, to, room, signal}` sent by a client and forwarded by the server to the
//!   addressed member of the same room.

mod memory;
mod rooms;
mod server;
mod ws;

pub use memory::MemorySignaling;
pub use server::SignalingServer;
pub use ws::WsConnector;

use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SignalingMessage {
    Join {
        room: String,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Joined {
        #[serde(rename = "roomPeerIds")]
        room_peer_ids: Vec<String>,
    },
    Signal {
        from: String,
        to: String,
        room: String,
        signal: Value,
    },
}

/// Client side of an open signaling connection.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Queues a message for delivery to the signaling server.
    fn send(&self, message: SignalingMessage) -> Result<(), Error>;

    /// Closes the connection. Inbound message stream ends afterwards.
    async fn close(&self) -> Result<(), Error>;
}

/// Opens [SignalingChannel]s.
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    /// Connects to a signaling server. Returns the channel used to emit messages together with
    /// the stream of messages received from the server.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, UnboundedReceiver<SignalingMessage>), Error>;
}
