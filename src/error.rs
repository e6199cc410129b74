use std::sync::Arc;

/// Errors produced by the connection handler and its transports.
///
/// Errors are published on the handler's error stream, which may have many subscribers, so
/// every variant is cheaply cloneable. Foreign errors which are not `Clone` are kept behind
/// an [Arc].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Failure reported by a peer-link, wrapped before it's published on the error stream.
    #[error("peer-link failure: {source}")]
    P2pPeer { source: Box<Error> },
    /// Signaling server relayed a signal from a peer which this handler never registered.
    #[error("no peer-link registered for remote peer `{0}`")]
    UnknownPeer(Arc<str>),
    /// Data channel is not open (yet or anymore).
    #[error("data channel is not open")]
    ChannelClosed,
    /// Connection to the signaling server has been closed.
    #[error("signaling channel closed")]
    SignalingClosed,
    /// Peer connection failed to establish or broke down.
    #[error("peer connection failed")]
    ConnectionFailed,
    /// Signal payload couldn't be understood by the peer-link.
    #[error("malformed signal: {0}")]
    MalformedSignal(Arc<str>),
    #[error(transparent)]
    Rtc(Arc<webrtc::Error>),
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
    #[error(transparent)]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Wraps an error coming out of a peer-link.
    pub fn peer(source: Error) -> Self {
        Error::P2pPeer {
            source: Box::new(source),
        }
    }

    /// Stable identifier of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::P2pPeer { .. } => "P2P_PEER",
            Error::UnknownPeer(_) => "P2P_UNKNOWN_PEER",
            Error::ChannelClosed => "P2P_CHANNEL_CLOSED",
            Error::SignalingClosed => "P2P_SIGNALING_CLOSED",
            Error::ConnectionFailed => "P2P_CONNECTION_FAILED",
            Error::MalformedSignal(_) => "P2P_MALFORMED_SIGNAL",
            Error::Rtc(_) => "P2P_RTC",
            Error::Json(_) => "P2P_JSON",
            Error::WebSocket(_) => "P2P_WEBSOCKET",
            Error::Io(_) => "P2P_IO",
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Rtc(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
