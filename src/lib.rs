//! `wrtc-rooms` connects every peer that joined the same topic (room) with every other one,
//! using WebRTC data channels negotiated through a WebSocket signaling server:
//! - A [ConnectionHandlerCreator] is configured once with a signaling server URL and transport
//!   options, and produces one [ConnectionHandler] per topic.
//! - Each handler joins its topic, creates a peer-link for every other member and exposes
//!   what happens to them as five streams: `connect`, `disconnect`, `message`, `response` and
//!   `error`.
//! - Payloads are JSON values. Those carrying a `result` field are treated as responses to
//!   earlier requests, everything else is a message.
//!
//! Both collaborators of a handler, the signaling channel and the peer-link, are traits
//! ([SignalingConnector], [PeerFactory]), so transports can be replaced, ie. with
//! [MemorySignaling] for peers living in the same process.
//!
//! Peer negotiation uses the same signal format as NodeJS [SimplePeer](https://www.npmjs.com/package/simple-peer).
//!
//! # Examples
//!
//! ```rust,no_run
//! use wrtc_rooms::{webrtc_handler, Error, HandlerOptions, Options, SignalingServer};
//! use futures_util::StreamExt;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // server side of the signaling protocol, usually running somewhere else
//!     let server = SignalingServer::bind("127.0.0.1:0").await?;
//!     let creator = webrtc_handler(&server.url(), Options::local());
//!
//!     let alice = creator.create(HandlerOptions::new("my-topic")).await?;
//!     let mut alice_connected = alice.connect();
//!     let mut alice_messages = alice.message();
//!
//!     let bob = creator.create(HandlerOptions::new("my-topic")).await?;
//!     let mut bob_connected = bob.connect();
//!
//!     // wait for both ends of the data channel to open
//!     let _to_bob = alice_connected.next().await.unwrap();
//!     let to_alice = bob_connected.next().await.unwrap();
//!
//!     bob.send(&to_alice, &json!({"hello": "alice"})).await?;
//!     let msg = alice_messages.next().await.unwrap();
//!     assert_eq!(msg.message, json!({"hello": "alice"}));
//!
//!     alice.destroy().await?;
//!     bob.destroy().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

mod data_channel;
pub mod error;
pub mod handler;
pub mod peer;
pub mod peer_connection;
pub mod signaling;
pub mod subject;

pub use error::Error;
pub use handler::{
    webrtc_handler, ConnectionHandler, ConnectionHandlerCreator, HandlerOptions, PeerMessage,
    PeerResponse,
};
pub use peer::{PeerEvent, PeerFactory, PeerHandle, PeerLink, PeerOptions};
pub use peer_connection::{Options, RtcPeer, RtcPeerFactory, Signal};
pub use signaling::{
    MemorySignaling, SignalingChannel, SignalingConnector, SignalingMessage, SignalingServer,
    WsConnector,
};
pub use subject::{Subject, Subscription};
