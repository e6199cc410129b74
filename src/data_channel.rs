use crate::error::Error;
use crate::peer::PeerEvent;
use crate::peer_connection::PeerEvents;
use arc_swap::ArcSwap;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;
use webrtc::data_channel::RTCDataChannel;

/// Data channel carrying the payloads of a [RtcPeer](crate::peer_connection::RtcPeer).
///
/// Lifecycle of the underlying channel is reported through [PeerEvent]s: `Connect` once it
/// opens, `Data` for every received message, `Error` and `Close` when it goes down.
pub(crate) struct DataChannel {
    dc: Arc<RTCDataChannel>,
    status: Arc<ArcSwap<DataChannelState>>,
}

impl DataChannel {
    pub fn new(dc: Arc<RTCDataChannel>, events: PeerEvents) -> Self {
        let status = Arc::new(ArcSwap::new(DataChannelState::waiting()));
        let s = Arc::downgrade(&status);
        let e = events.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.rcu(|old| match &**old {
                        DataChannelState::Waiting => DataChannelState::open(),
                        _ => old.clone(),
                    });
                    if old.is_waiting() {
                        e.emit(PeerEvent::Connect);
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let e = events.clone();
        dc.on_close(Box::new(move || {
            let s = s.clone();
            let e = e.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    status.store(DataChannelState::closed_gracefully());
                }
                e.close();
            })
        }));
        let s = Arc::downgrade(&status);
        let e = events.clone();
        dc.on_error(Box::new(move |err| {
            let s = s.clone();
            let e = e.clone();
            Box::pin(async move {
                let error: Error = err.into();
                if let Some(status) = s.upgrade() {
                    status.store(DataChannelState::failed(error.clone()));
                }
                e.emit(PeerEvent::Error(error));
            })
        }));
        let e = events;
        dc.on_message(Box::new(move |msg| {
            debug!("received {} bytes", msg.data.len());
            e.emit(PeerEvent::Data(msg.data));
            Box::pin(async move {})
        }));
        DataChannel { dc, status }
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }

    pub fn is_open(&self) -> bool {
        self.status.load().is_open()
    }

    /// Sends a payload. Fails unless the channel is open.
    pub async fn send(&self, data: &Bytes) -> Result<(), Error> {
        match &**self.status.load() {
            DataChannelState::Open => {}
            DataChannelState::Closed {
                reason: Some(reason),
            } => return Err(reason.clone()),
            _ => return Err(Error::ChannelClosed),
        }
        self.dc.send(data).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), Error> {
        let old = self.status.swap(DataChannelState::closed_gracefully());
        if let DataChannelState::Closed { .. } = &*old {
            return Ok(());
        }
        self.dc.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("state", &**self.status.load())
            .finish()
    }
}

#[derive(Debug)]
enum DataChannelState {
    /// Underlying data channel is waiting to become open.
    Waiting,
    /// Underlying data channel is open and ready to send/receive messages.
    Open,
    /// Underlying data channel has already been closed.
    Closed {
        /// Optional error reason, why the channel has been closed.
        reason: Option<Error>,
    },
}

impl DataChannelState {
    fn waiting() -> Arc<Self> {
        Arc::new(DataChannelState::Waiting)
    }

    fn open() -> Arc<Self> {
        Arc::new(DataChannelState::Open)
    }

    fn closed_gracefully() -> Arc<Self> {
        Arc::new(DataChannelState::Closed { reason: None })
    }

    fn failed(reason: Error) -> Arc<Self> {
        Arc::new(DataChannelState::Closed {
            reason: Some(reason),
        })
    }

    fn is_waiting(&self) -> bool {
        matches!(self, DataChannelState::Waiting)
    }

    fn is_open(&self) -> bool {
        matches!(self, DataChannelState::Open)
    }
}
