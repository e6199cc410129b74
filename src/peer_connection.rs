use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::peer::{PeerEvent, PeerFactory, PeerLink, PeerOptions};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Negotiation messages exchanged between two [RtcPeer]s.
///
/// Serialized form follows the one used by NodeJS [SimplePeer](https://www.npmjs.com/package/simple-peer),
/// so [RtcPeer] can negotiate with peers written in that library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
    Renegotiate { renegotiate: bool },
}

/// Transport configuration shared by all peers created by a [RtcPeerFactory].
#[derive(Clone)]
pub struct Options {
    /// Label of the data channel opened by the initiator.
    pub label: Arc<str>,
    pub channel_config: Option<RTCDataChannelInit>,
    pub rtc_config: RTCConfiguration,
}

impl Options {
    pub fn with_ice_servers(urls: &[&str]) -> Self {
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: urls.iter().map(|&url| url.to_owned()).collect(),
                ..Default::default()
            }]
        };
        Options {
            label: Arc::from("data"),
            channel_config: None,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        }
    }

    /// Configuration without any ICE servers, usable for peers on the same host or network.
    pub fn local() -> Self {
        Options::with_ice_servers(&[])
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::with_ice_servers(&["stun:stun.l.google.com:19302"])
    }
}

/// Creates [RtcPeer]s.
#[derive(Clone, Default)]
pub struct RtcPeerFactory {
    options: Options,
}

impl RtcPeerFactory {
    pub fn new(options: Options) -> Self {
        RtcPeerFactory { options }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        options: PeerOptions,
    ) -> Result<(Arc<dyn PeerLink>, UnboundedReceiver<PeerEvent>), Error> {
        let (peer, events) = RtcPeer::start(options, self.options.clone()).await?;
        Ok((Arc::new(peer), events))
    }
}

/// Sender side of a peer event stream. Guarantees that nothing is emitted after `Close`.
#[derive(Debug, Clone)]
pub(crate) struct PeerEvents {
    sender: UnboundedSender<PeerEvent>,
    closed: Arc<AtomicBool>,
}

impl PeerEvents {
    fn new() -> (Self, UnboundedReceiver<PeerEvent>) {
        let (sender, receiver) = unbounded_channel();
        let events = PeerEvents {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (events, receiver)
    }

    pub fn emit(&self, event: PeerEvent) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.sender.send(event);
        }
    }

    /// Emits `Close` the first time it's called.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(PeerEvent::Close);
        }
    }

    fn emit_signal(&self, signal: &Signal) -> Result<(), Error> {
        let value = serde_json::to_value(signal)?;
        self.emit(PeerEvent::Signal(value));
        Ok(())
    }
}

/// WebRTC peer-link with a single data channel.
///
/// The initiator opens the data channel and sends an offer once negotiation is needed. The
/// other side answers and receives the data channel from its remote counterpart. Every
/// negotiation message comes out as a [PeerEvent::Signal] and must be passed to
/// [PeerLink::signal] of the remote peer.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    initiator: bool,
    trickle: bool,
    channel: Arc<ArcSwapOption<DataChannel>>,
    events: PeerEvents,
    /// Remote ICE candidates received before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl RtcPeer {
    pub async fn start(
        peer: PeerOptions,
        options: Options,
    ) -> Result<(Self, UnboundedReceiver<PeerEvent>), Error> {
        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(options.rtc_config).await?);
        let (events, receiver) = PeerEvents::new();
        let channel: Arc<ArcSwapOption<DataChannel>> = Arc::new(ArcSwapOption::empty());
        let PeerOptions { initiator, trickle } = peer;

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                debug!("peer connection state changed: {s}");
                match s {
                    RTCPeerConnectionState::Failed => {
                        events.emit(PeerEvent::Error(Error::ConnectionFailed));
                        events.close();
                    }
                    RTCPeerConnectionState::Closed => events.close(),
                    _ => {}
                }
                Box::pin(async move {})
            }));
        }
        if trickle {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(candidate) => {
                            if let Err(e) = events.emit_signal(&Signal::Candidate { candidate }) {
                                warn!("failed to serialize ICE candidate: {e}");
                            }
                        }
                        Err(e) => warn!("failed to serialize ICE candidate: {e}"),
                    }
                }
                Box::pin(async move {})
            }));
        }
        if initiator {
            let pc_ref = Arc::downgrade(&pc);
            let negotiation_events = events.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let pc = pc_ref.clone();
                let events = negotiation_events.clone();
                Box::pin(async move {
                    if let Err(e) = offer(&pc, trickle, &events).await {
                        events.emit(PeerEvent::Error(e));
                    }
                })
            }));
            let dc = pc
                .create_data_channel(&options.label, options.channel_config)
                .await?;
            channel.store(Some(Arc::new(DataChannel::new(dc, events.clone()))));
        } else {
            let slot = channel.clone();
            let events = events.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let dc = DataChannel::new(dc, events.clone());
                debug!("remote peer opened data channel `{}`", dc.label());
                slot.store(Some(Arc::new(dc)));
                Box::pin(async move {})
            }));
        }

        let peer = RtcPeer {
            pc,
            initiator,
            trickle,
            channel,
            events,
            pending_candidates: Mutex::new(Vec::new()),
        };
        Ok((peer, receiver))
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Returns `true` once the data channel is open.
    pub fn is_connected(&self) -> bool {
        match self.channel.load_full() {
            Some(dc) => dc.is_open(),
            None => false,
        }
    }

    async fn apply(&self, signal: Signal) -> Result<(), Error> {
        match signal {
            Signal::Offer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                self.flush_candidates().await?;
                let answer = self.pc.create_answer(None).await?;
                publish_local(&self.pc, answer, self.trickle, &self.events).await?;
            }
            Signal::Answer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                self.flush_candidates().await?;
            }
            Signal::Candidate { candidate } => {
                if self.pc.remote_description().await.is_some() {
                    self.pc.add_ice_candidate(candidate).await?;
                } else {
                    self.pending_candidates.lock().await.push(candidate);
                }
            }
            Signal::Renegotiate { .. } => {
                if self.initiator {
                    offer(&Arc::downgrade(&self.pc), self.trickle, &self.events).await?;
                } else {
                    debug!("ignoring renegotiation request: not an initiator");
                }
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self) -> Result<(), Error> {
        let candidates: Vec<_> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in candidates {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcPeer {
    async fn signal(&self, signal: Value) -> Result<(), Error> {
        let signal: Signal = serde_json::from_value(signal)
            .map_err(|e| Error::MalformedSignal(Arc::from(e.to_string())))?;
        self.apply(signal).await
    }

    async fn send(&self, data: Bytes) -> Result<(), Error> {
        match self.channel.load_full() {
            Some(dc) => dc.send(&data).await,
            None => Err(Error::ChannelClosed),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(dc) = self.channel.load_full() {
            dc.close().await?;
        }
        // `RTCPeerConnection::close` future is not `Send`, drive it on a blocking thread
        let pc = self.pc.clone();
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || handle.block_on(pc.close()))
            .await
            .map_err(std::io::Error::from)??;
        self.events.close();
        Ok(())
    }
}

impl AsRef<RTCPeerConnection> for RtcPeer {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer")
            .field("initiator", &self.initiator)
            .field("state", &self.pc.connection_state())
            .field("channel", &self.channel.load_full())
            .finish()
    }
}

fn build_api() -> Result<API, Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    // Each peer connection needs its own interceptor registry.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn offer(
    pc: &Weak<RTCPeerConnection>,
    trickle: bool,
    events: &PeerEvents,
) -> Result<(), Error> {
    if let Some(pc) = pc.upgrade() {
        let offer = pc.create_offer(None).await?;
        publish_local(&pc, offer, trickle, events).await?;
    }
    Ok(())
}

/// Sets a local description and hands it over to the remote side. Without trickle ICE the
/// description is sent only after gathering completes, with all candidates inlined.
async fn publish_local(
    pc: &RTCPeerConnection,
    desc: RTCSessionDescription,
    trickle: bool,
    events: &PeerEvents,
) -> Result<(), Error> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(desc.clone()).await?;
    let desc = if trickle {
        desc
    } else {
        let _ = gathered.recv().await;
        pc.local_description().await.unwrap_or(desc)
    };
    let signal = match desc.sdp_type {
        RTCSdpType::Offer => Signal::Offer { sdp: desc.sdp },
        RTCSdpType::Answer => Signal::Answer { sdp: desc.sdp },
        other => {
            return Err(Error::MalformedSignal(Arc::from(format!(
                "unsupported local description type: {other}"
            ))))
        }
    };
    events.emit_signal(&signal)
}
