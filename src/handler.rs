use crate::error::Error;
use crate::peer::{is_initiator, PeerEvent, PeerFactory, PeerHandle, PeerOptions};
use crate::peer_connection::{Options, RtcPeerFactory};
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingMessage, WsConnector};
use crate::subject::{Subject, Subscription};
use bytes::Bytes;
use log::{debug, error, warn};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Length of generated local peer identifiers.
pub const PEER_ID_LENGTH: usize = 10;

/// Generates a random identifier made of lowercase ASCII letters.
///
/// Identifiers are not guaranteed to be globally unique, collisions are just unlikely.
pub fn random_peer_id() -> String {
    let mut rng = rand::thread_rng();
    (0..PEER_ID_LENGTH)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Room shared by all peers which should connect to each other.
    pub topic: String,
}

impl HandlerOptions {
    pub fn new<S: Into<String>>(topic: S) -> Self {
        HandlerOptions {
            topic: topic.into(),
        }
    }
}

/// Generic message received from a remote peer.
#[derive(Debug, Clone)]
pub struct PeerMessage {
    pub peer: PeerHandle,
    pub message: Value,
}

/// Message received from a remote peer, which carries a `result` field.
#[derive(Debug, Clone)]
pub struct PeerResponse {
    pub peer: PeerHandle,
    pub response: Value,
}

/// Produces [ConnectionHandler]s connected to a single signaling server.
pub struct ConnectionHandlerCreator {
    server_url: Arc<str>,
    connector: Arc<dyn SignalingConnector>,
    factory: Arc<dyn PeerFactory>,
}

impl ConnectionHandlerCreator {
    pub fn new<S, P>(server_url: &str, connector: S, factory: P) -> Self
    where
        S: SignalingConnector,
        P: PeerFactory,
    {
        ConnectionHandlerCreator {
            server_url: Arc::from(server_url),
            connector: Arc::new(connector),
            factory: Arc::new(factory),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Joins the topic on the signaling server and starts connecting to every peer already in
    /// it, as well as every peer which joins later.
    pub async fn create(&self, options: HandlerOptions) -> Result<ConnectionHandler, Error> {
        let peer_id: Arc<str> = Arc::from(random_peer_id());
        let topic: Arc<str> = Arc::from(options.topic);
        let (signaling, inbound) = self.connector.connect(&self.server_url).await?;
        let join = SignalingMessage::Join {
            room: topic.to_string(),
            peer_id: peer_id.to_string(),
        };
        if let Err(e) = signaling.send(join) {
            if let Err(e) = signaling.close().await {
                warn!("failed to close signaling connection: {e}");
            }
            return Err(e);
        }
        debug!("peer `{peer_id}` joining topic `{topic}`");

        let state = Arc::new(HandlerState {
            peer_id,
            topic,
            signaling,
            factory: self.factory.clone(),
            peers: RwLock::new(HashMap::new()),
            streams: Streams::default(),
            closed: CancellationToken::new(),
        });
        let router = tokio::spawn(route(state.clone(), inbound));
        Ok(ConnectionHandler {
            state,
            router: Mutex::new(Some(router)),
        })
    }
}

/// Creates handlers connecting peers with WebRTC data channels, negotiated through a WebSocket
/// signaling server under `server_url`.
pub fn webrtc_handler(server_url: &str, options: Options) -> ConnectionHandlerCreator {
    ConnectionHandlerCreator::new(server_url, WsConnector, RtcPeerFactory::new(options))
}

/// Peer-to-peer connections with every other member of a topic.
///
/// Handler is a source of five event streams. [ConnectionHandler::destroy] completes all of
/// them. Dropping the handler without destroying it stops event processing and releases the
/// signaling connection and peer-links in the background, if a tokio runtime is still around.
pub struct ConnectionHandler {
    state: Arc<HandlerState>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandler {
    /// Identifier of the local peer.
    pub fn peer_id(&self) -> &str {
        &self.state.peer_id
    }

    pub fn topic(&self) -> &str {
        &self.state.topic
    }

    /// Identifiers of the remote peers this handler holds a peer-link for.
    pub async fn peers(&self) -> Vec<String> {
        let peers = self.state.peers.read().await;
        let mut ids: Vec<String> = peers.keys().map(|id| id.to_string()).collect();
        ids.sort();
        ids
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Failures of peer-links, wrapped in [Error::P2pPeer].
    pub fn error(&self) -> Subscription<Error> {
        self.state.streams.error.subscribe()
    }

    /// Peers whose link became ready to send data.
    pub fn connect(&self) -> Subscription<PeerHandle> {
        self.state.streams.connect.subscribe()
    }

    /// Currently nothing is published here: closing peer-links are not reported.
    pub fn disconnect(&self) -> Subscription<PeerHandle> {
        self.state.streams.disconnect.subscribe()
    }

    pub fn message(&self) -> Subscription<PeerMessage> {
        self.state.streams.message.subscribe()
    }

    pub fn response(&self) -> Subscription<PeerResponse> {
        self.state.streams.response.subscribe()
    }

    /// Serializes `message` to JSON and sends it to a given peer.
    pub async fn send<T>(&self, peer: &PeerHandle, message: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(message)?;
        peer.link().send(Bytes::from(data)).await
    }

    /// Leaves the topic: closes the signaling connection and all peer-links, then completes
    /// every event stream. Calling it again has no effect.
    pub async fn destroy(&self) -> Result<(), Error> {
        let state = &self.state;
        if state.closed.is_cancelled() {
            return Ok(());
        }
        state.closed.cancel();
        if let Some(router) = self.router.lock().await.take() {
            let _ = router.await;
        }
        state.release().await
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if self.state.closed.is_cancelled() {
            return;
        }
        self.state.closed.cancel();
        let state = self.state.clone();
        let router = self.router.get_mut().take();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(router) = router {
                        let _ = router.await;
                    }
                    if let Err(e) = state.release().await {
                        warn!("failed to close signaling connection of `{}`: {e}", state.peer_id);
                    }
                });
            }
            Err(_) => warn!(
                "handler `{}` dropped outside of tokio runtime, peer-links were not closed",
                state.peer_id
            ),
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("peer_id", &self.state.peer_id)
            .field("topic", &self.state.topic)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[derive(Default)]
struct Streams {
    error: Subject<Error>,
    connect: Subject<PeerHandle>,
    disconnect: Subject<PeerHandle>,
    message: Subject<PeerMessage>,
    response: Subject<PeerResponse>,
}

impl Streams {
    fn complete(&self) {
        self.error.complete();
        self.connect.complete();
        self.disconnect.complete();
        self.message.complete();
        self.response.complete();
    }
}

struct HandlerState {
    peer_id: Arc<str>,
    topic: Arc<str>,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    /// Modified only by the router task.
    peers: RwLock<HashMap<Arc<str>, PeerHandle>>,
    streams: Streams,
    closed: CancellationToken,
}

impl HandlerState {
    /// Closes the signaling channel and every peer-link, then completes the streams.
    /// Must run after the router task finished.
    async fn release(&self) -> Result<(), Error> {
        let res = self.signaling.close().await;

        let peers: Vec<PeerHandle> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            if let Err(e) = peer.link().close().await {
                warn!("failed to close peer-link to `{}`: {e}", peer.id());
            }
        }

        self.streams.complete();
        debug!("peer `{}` left topic `{}`", self.peer_id, self.topic);
        res
    }

    /// Creates peer-links for room members not known yet.
    async fn on_joined(self: &Arc<Self>, room_peer_ids: Vec<String>) {
        for remote_id in room_peer_ids {
            if *remote_id == *self.peer_id
                || self.peers.read().await.contains_key(remote_id.as_str())
            {
                continue;
            }
            let initiator = is_initiator(&self.peer_id, &remote_id);
            debug!("connecting `{}` to `{remote_id}` (initiator: {initiator})", self.peer_id);
            match self.factory.create(PeerOptions::new(initiator)).await {
                Ok((link, events)) => {
                    let peer = PeerHandle::new(Arc::from(remote_id), link);
                    self.peers
                        .write()
                        .await
                        .insert(Arc::from(peer.id()), peer.clone());
                    tokio::spawn(pump(self.clone(), peer, events));
                }
                Err(e) => {
                    error!("failed to create peer-link to `{remote_id}`: {e}");
                    self.streams.error.next(Error::peer(e));
                }
            }
        }
    }

    /// Passes a relayed signal to the peer-link it was sent from.
    ///
    /// Fails if the sender has no peer-link registered. Failures of the peer-link itself are
    /// published on the error stream.
    async fn on_signal(&self, from: &str, signal: Value) -> Result<(), Error> {
        let peer = self
            .peers
            .read()
            .await
            .get(from)
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(Arc::from(from)))?;
        if let Err(e) = peer.link().signal(signal).await {
            self.streams.error.next(Error::peer(e));
        }
        Ok(())
    }

    fn on_data(&self, peer: &PeerHandle, data: &[u8]) -> Result<(), Error> {
        let value: Value = serde_json::from_slice(data)?;
        if value.get("result").map_or(false, is_truthy) {
            self.streams.response.next(PeerResponse {
                peer: peer.clone(),
                response: value,
            });
        } else {
            self.streams.message.next(PeerMessage {
                peer: peer.clone(),
                message: value,
            });
        }
        Ok(())
    }
}

/// Processes signaling messages one by one until the handler is destroyed.
async fn route(state: Arc<HandlerState>, mut inbound: UnboundedReceiver<SignalingMessage>) {
    loop {
        let msg = tokio::select! {
            _ = state.closed.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!("signaling connection of `{}` closed", state.peer_id);
                    break;
                }
            },
        };
        match msg {
            SignalingMessage::Joined { room_peer_ids } => state.on_joined(room_peer_ids).await,
            SignalingMessage::Signal { from, signal, .. } => {
                if let Err(e) = state.on_signal(&from, signal).await {
                    error!("failed to relay signal to `{}`: {e}", state.peer_id);
                }
            }
            SignalingMessage::Join { .. } => warn!("unexpected `join` message from signaling server"),
        }
    }
}

/// Forwards events of a single peer-link to the handler streams and the signaling channel.
async fn pump(state: Arc<HandlerState>, peer: PeerHandle, mut events: UnboundedReceiver<PeerEvent>) {
    loop {
        let event = tokio::select! {
            _ = state.closed.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            PeerEvent::Data(data) => {
                if let Err(e) = state.on_data(&peer, &data) {
                    error!("failed to parse message from `{}`: {e}", peer.id());
                }
            }
            PeerEvent::Signal(signal) => {
                let msg = SignalingMessage::Signal {
                    from: state.peer_id.to_string(),
                    to: peer.id().to_string(),
                    room: state.topic.to_string(),
                    signal,
                };
                if let Err(e) = state.signaling.send(msg) {
                    warn!("failed to send signal to `{}`: {e}", peer.id());
                }
            }
            PeerEvent::Error(e) => state.streams.error.next(Error::peer(e)),
            PeerEvent::Connect => state.streams.connect.next(peer.clone()),
            PeerEvent::Close => {
                // disconnect stream is not fed by peer-link closures
                debug!("peer-link to `{}` closed", peer.id());
            }
        }
    }
}

/// JavaScript truthiness of a JSON value.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::handler::{
        is_truthy, random_peer_id, webrtc_handler, ConnectionHandler, ConnectionHandlerCreator,
        HandlerOptions, PEER_ID_LENGTH,
    };
    use crate::peer::{PeerEvent, PeerFactory, PeerLink, PeerOptions};
    use crate::peer_connection::Options;
    use crate::signaling::{
        MemorySignaling, SignalingChannel, SignalingConnector, SignalingMessage, SignalingServer,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct FakePeer {
        signals: UnboundedSender<Value>,
        sent: UnboundedSender<Bytes>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerLink for FakePeer {
        async fn signal(&self, signal: Value) -> Result<(), Error> {
            let _ = self.signals.send(signal);
            Ok(())
        }

        async fn send(&self, data: Bytes) -> Result<(), Error> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ChannelClosed);
            }
            let _ = self.sent.send(data);
            Ok(())
        }

        async fn close(&self) -> Result<(), Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Test side of a [FakePeer]: what it received plus a way to make it emit events.
    struct FakeRemote {
        options: PeerOptions,
        peer: Arc<FakePeer>,
        events: UnboundedSender<PeerEvent>,
        signals: UnboundedReceiver<Value>,
        sent: UnboundedReceiver<Bytes>,
    }

    struct FakeFactory {
        created: UnboundedSender<FakeRemote>,
    }

    impl FakeFactory {
        fn new() -> (Self, UnboundedReceiver<FakeRemote>) {
            let (created, rx) = unbounded_channel();
            (FakeFactory { created }, rx)
        }
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create(
            &self,
            options: PeerOptions,
        ) -> Result<(Arc<dyn PeerLink>, UnboundedReceiver<PeerEvent>), Error> {
            let (signals_tx, signals) = unbounded_channel();
            let (sent_tx, sent) = unbounded_channel();
            let (events, events_rx) = unbounded_channel();
            let peer = Arc::new(FakePeer {
                signals: signals_tx,
                sent: sent_tx,
                closed: AtomicBool::new(false),
            });
            let _ = self.created.send(FakeRemote {
                options,
                peer: peer.clone(),
                events,
                signals,
                sent,
            });
            Ok((peer, events_rx))
        }
    }

    struct Setup {
        hub: MemorySignaling,
        handler: ConnectionHandler,
        created: UnboundedReceiver<FakeRemote>,
    }

    async fn setup(topic: &str) -> Result<Setup, Error> {
        let hub = MemorySignaling::new();
        let (factory, created) = FakeFactory::new();
        let creator = ConnectionHandlerCreator::new("memory://", hub.clone(), factory);
        let handler = creator.create(HandlerOptions::new(topic)).await?;
        Ok(Setup {
            hub,
            handler,
            created,
        })
    }

    /// Joins the topic with a hand-driven signaling client.
    async fn join_raw(
        hub: &MemorySignaling,
        topic: &str,
        peer_id: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, UnboundedReceiver<SignalingMessage>), Error> {
        let (channel, inbound) = hub.connect("memory://").await?;
        channel.send(SignalingMessage::Join {
            room: topic.into(),
            peer_id: peer_id.into(),
        })?;
        Ok((channel, inbound))
    }

    async fn next_created(created: &mut UnboundedReceiver<FakeRemote>) -> FakeRemote {
        timeout(TIMEOUT, created.recv()).await.unwrap().unwrap()
    }

    /// Joins a raw remote and waits for the handler to register a link for it.
    async fn connect_remote(
        s: &mut Setup,
        topic: &str,
        remote_id: &str,
    ) -> Result<
        (
            FakeRemote,
            Arc<dyn SignalingChannel>,
            UnboundedReceiver<SignalingMessage>,
        ),
        Error,
    > {
        let (channel, inbound) = join_raw(&s.hub, topic, remote_id).await?;
        let remote = next_created(&mut s.created).await;
        wait_for_peer(&s.handler, remote_id).await;
        Ok((remote, channel, inbound))
    }

    async fn wait_for_peer(handler: &ConnectionHandler, remote_id: &str) {
        timeout(TIMEOUT, async {
            while !handler.peers().await.iter().any(|id| id == remote_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn random_peer_ids() {
        let id = random_peer_id();
        assert_eq!(id.len(), PEER_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_lowercase()));
        assert_ne!(random_peer_id(), random_peer_id());
    }

    #[test]
    fn truthiness_of_result_field() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("ok")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[tokio::test]
    async fn ignores_self_and_known_peers() -> Result<(), Error> {
        let mut s = setup("topic").await?;

        // the handler alone in the room: `joined` lists only itself
        let (r1, _c1, _i1) = connect_remote(&mut s, "topic", "~first").await?;
        assert!(r1.options.initiator);

        // second join broadcasts both `~first` and the handler again
        let (r2, _c2, _i2) = connect_remote(&mut s, "topic", "0second").await?;
        assert!(!r2.options.initiator);
        assert!(r1.options.trickle && r2.options.trickle);

        // another broadcast with nothing new
        let (_c, _i) = join_raw(&s.hub, "topic", "0second").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(s.created.try_recv().is_err());

        assert_eq!(s.handler.peers().await, vec!["0second", "~first"]);
        assert!(!s.handler.peers().await.contains(&s.handler.peer_id().to_string()));
        s.handler.destroy().await
    }

    #[tokio::test]
    async fn exactly_one_initiator_per_pair() -> Result<(), Error> {
        let hub = MemorySignaling::new();
        let (f1, mut c1) = FakeFactory::new();
        let (f2, mut c2) = FakeFactory::new();
        let h1 = ConnectionHandlerCreator::new("memory://", hub.clone(), f1)
            .create(HandlerOptions::new("topic"))
            .await?;
        let h2 = ConnectionHandlerCreator::new("memory://", hub.clone(), f2)
            .create(HandlerOptions::new("topic"))
            .await?;

        let p1 = next_created(&mut c1).await;
        let p2 = next_created(&mut c2).await;
        wait_for_peer(&h1, h2.peer_id()).await;
        wait_for_peer(&h2, h1.peer_id()).await;
        assert_ne!(p1.options.initiator, p2.options.initiator);
        assert_eq!(p1.options.initiator, h2.peer_id() > h1.peer_id());

        assert_eq!(h1.peers().await, vec![h2.peer_id().to_string()]);
        assert_eq!(h2.peers().await, vec![h1.peer_id().to_string()]);
        h1.destroy().await?;
        h2.destroy().await
    }

    #[tokio::test]
    async fn relays_signals_both_ways() -> Result<(), Error> {
        let mut s = setup("topic").await?;
        let (channel, mut inbound) = join_raw(&s.hub, "topic", "~remote").await?;
        let mut remote = next_created(&mut s.created).await;

        // outgoing: peer-link signal goes to the addressed member
        let offer = json!({"type": "offer", "sdp": "v=0"});
        remote.events.send(PeerEvent::Signal(offer.clone())).unwrap();
        let relayed = loop {
            match timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap() {
                SignalingMessage::Joined { .. } => continue,
                other => break other,
            }
        };
        assert_eq!(
            relayed,
            SignalingMessage::Signal {
                from: s.handler.peer_id().into(),
                to: "~remote".into(),
                room: "topic".into(),
                signal: offer,
            }
        );

        // incoming: signal from the remote member reaches its peer-link
        let answer = json!({"type": "answer", "sdp": "v=0"});
        channel.send(SignalingMessage::Signal {
            from: "~remote".into(),
            to: s.handler.peer_id().into(),
            room: "topic".into(),
            signal: answer.clone(),
        })?;
        let received = timeout(TIMEOUT, remote.signals.recv()).await.unwrap().unwrap();
        assert_eq!(received, answer);

        s.handler.destroy().await
    }

    #[tokio::test]
    async fn signal_from_unknown_peer_fails() -> Result<(), Error> {
        let s = setup("topic").await?;
        let res = s.handler.state.on_signal("ghost", json!({})).await;
        match res {
            Err(Error::UnknownPeer(id)) => assert_eq!(&*id, "ghost"),
            other => panic!("unexpected result: {other:?}"),
        }
        s.handler.destroy().await
    }

    #[tokio::test]
    async fn unknown_signal_does_not_stop_the_handler() -> Result<(), Error> {
        let mut s = setup("topic").await?;
        let (ghost, _inbound) = join_raw(&s.hub, "other-topic", "ghost").await?;
        ghost.send(SignalingMessage::Signal {
            from: "ghost".into(),
            to: s.handler.peer_id().into(),
            room: "topic".into(),
            signal: json!({"type": "offer", "sdp": "v=0"}),
        })?;

        let (remote, _c, _i) = connect_remote(&mut s, "topic", "~remote").await?;
        assert!(remote.options.initiator);
        s.handler.destroy().await
    }

    #[tokio::test]
    async fn routes_peer_events_to_streams() -> Result<(), Error> {
        let mut s = setup("topic").await?;
        let mut connect = s.handler.connect();
        let mut message = s.handler.message();
        let mut response = s.handler.response();
        let mut errors = s.handler.error();
        let (remote, _c, _i) = connect_remote(&mut s, "topic", "~remote").await?;

        remote.events.send(PeerEvent::Connect).unwrap();
        let peer = timeout(TIMEOUT, connect.next()).await.unwrap().unwrap();
        assert_eq!(peer.id(), "~remote");

        remote.events.send(PeerEvent::Data(Bytes::from_static(b"not json"))).unwrap();
        remote.events.send(PeerEvent::Data(Bytes::from_static(br#"{"a":1}"#))).unwrap();
        remote.events.send(PeerEvent::Data(Bytes::from_static(br#"{"result":0}"#))).unwrap();
        remote
            .events
            .send(PeerEvent::Data(Bytes::from_static(br#"{"id":"x","result":[1]}"#)))
            .unwrap();

        let m = timeout(TIMEOUT, message.next()).await.unwrap().unwrap();
        assert_eq!(m.peer.id(), "~remote");
        assert_eq!(m.message, json!({"a": 1}));
        let m = timeout(TIMEOUT, message.next()).await.unwrap().unwrap();
        assert_eq!(m.message, json!({"result": 0}));
        let r = timeout(TIMEOUT, response.next()).await.unwrap().unwrap();
        assert_eq!(r.peer.id(), "~remote");
        assert_eq!(r.response, json!({"id": "x", "result": [1]}));

        remote.events.send(PeerEvent::Error(Error::ConnectionFailed)).unwrap();
        let e = timeout(TIMEOUT, errors.next()).await.unwrap().unwrap();
        assert_eq!(e.code(), "P2P_PEER");
        match e {
            Error::P2pPeer { source } => assert!(matches!(*source, Error::ConnectionFailed)),
            other => panic!("unexpected error: {other:?}"),
        }

        s.handler.destroy().await
    }

    #[tokio::test]
    async fn send_serializes_to_json() -> Result<(), Error> {
        let mut s = setup("topic").await?;
        let mut connect = s.handler.connect();
        let (mut remote, _c, _i) = connect_remote(&mut s, "topic", "~remote").await?;
        remote.events.send(PeerEvent::Connect).unwrap();
        let peer = timeout(TIMEOUT, connect.next()).await.unwrap().unwrap();

        s.handler.send(&peer, &json!({"a": 1})).await?;
        let sent = remote.sent.recv().await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&sent).unwrap(), json!({"a": 1}));

        // bytes sent by one handler, delivered to another, come out as a message
        let mut message = s.handler.message();
        remote.events.send(PeerEvent::Data(sent)).unwrap();
        let m = timeout(TIMEOUT, message.next()).await.unwrap().unwrap();
        assert_eq!(m.message, json!({"a": 1}));

        remote.peer.close().await?;
        let res = s.handler.send(&peer, &json!({"a": 2})).await;
        assert!(matches!(res, Err(Error::ChannelClosed)));
        s.handler.destroy().await
    }

    #[tokio::test]
    async fn destroy_completes_all_streams_once() -> Result<(), Error> {
        let mut s = setup("topic").await?;
        let mut error = s.handler.error();
        let mut connect = s.handler.connect();
        let mut disconnect = s.handler.disconnect();
        let mut message = s.handler.message();
        let mut response = s.handler.response();
        let (remote, _c, mut inbound) = connect_remote(&mut s, "topic", "~remote").await?;

        // closing peer-links are not reported as disconnects
        remote.events.send(PeerEvent::Close).unwrap();

        s.handler.destroy().await?;
        assert!(s.handler.is_destroyed());
        assert!(remote.peer.closed.load(Ordering::SeqCst));
        assert!(s.handler.peers().await.is_empty());

        let _ = remote.events.send(PeerEvent::Connect);
        let _ = remote.events.send(PeerEvent::Data(Bytes::from_static(br#"{"a":1}"#)));

        assert!(error.next().await.is_none());
        assert!(connect.next().await.is_none());
        assert!(disconnect.next().await.is_none());
        assert!(message.next().await.is_none());
        assert!(response.next().await.is_none());

        // signaling connection is gone, so the room only holds the remote now
        let (_c, mut late) = join_raw(&s.hub, "topic", "~late").await?;
        let joined = timeout(TIMEOUT, late.recv()).await.unwrap().unwrap();
        assert_eq!(
            joined,
            SignalingMessage::Joined {
                room_peer_ids: vec!["~late".into(), "~remote".into()]
            }
        );
        while let Ok(msg) = inbound.try_recv() {
            assert!(matches!(msg, SignalingMessage::Joined { .. }));
        }

        s.handler.destroy().await?;
        assert!(s.handler.connect().next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_handler_releases_connections() -> Result<(), Error> {
        let mut s = setup("topic").await?;
        let mut connect = s.handler.connect();
        let (remote, _c, _i) = connect_remote(&mut s, "topic", "~remote").await?;

        drop(s.handler);
        timeout(TIMEOUT, async {
            while !remote.peer.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(timeout(TIMEOUT, connect.next()).await.unwrap().is_none());

        // handler's signaling connection left the room
        let (_c, mut late) = join_raw(&s.hub, "topic", "~late").await?;
        assert_eq!(
            timeout(TIMEOUT, late.recv()).await.unwrap().unwrap(),
            SignalingMessage::Joined {
                room_peer_ids: vec!["~late".into(), "~remote".into()]
            }
        );
        Ok(())
    }

    /// Signaling connection which refuses every message.
    struct RefusingConnector {
        closed: Arc<AtomicBool>,
    }

    struct RefusingChannel {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SignalingChannel for RefusingChannel {
        fn send(&self, _message: SignalingMessage) -> Result<(), Error> {
            Err(Error::SignalingClosed)
        }

        async fn close(&self) -> Result<(), Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl SignalingConnector for RefusingConnector {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Arc<dyn SignalingChannel>, UnboundedReceiver<SignalingMessage>), Error> {
            let (_tx, rx) = unbounded_channel();
            let channel = RefusingChannel {
                closed: self.closed.clone(),
            };
            Ok((Arc::new(channel), rx))
        }
    }

    #[tokio::test]
    async fn failed_join_closes_signaling() {
        let closed = Arc::new(AtomicBool::new(false));
        let connector = RefusingConnector {
            closed: closed.clone(),
        };
        let (factory, _created) = FakeFactory::new();
        let creator = ConnectionHandlerCreator::new("memory://", connector, factory);
        let res = creator.create(HandlerOptions::new("topic")).await;
        assert!(matches!(res, Err(Error::SignalingClosed)));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn webrtc_peers_exchange_messages() -> Result<(), Error> {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = SignalingServer::bind("127.0.0.1:0").await?;
        let creator = webrtc_handler(&server.url(), Options::local());
        assert_eq!(creator.server_url(), server.url());

        let h1 = creator.create(HandlerOptions::new("replication")).await?;
        let mut connect1 = h1.connect();
        let mut message1 = h1.message();
        let h2 = creator.create(HandlerOptions::new("replication")).await?;
        let mut connect2 = h2.connect();
        let mut response2 = h2.response();

        let to_h2 = timeout(Duration::from_secs(30), connect1.next()).await.unwrap().unwrap();
        let to_h1 = timeout(Duration::from_secs(30), connect2.next()).await.unwrap().unwrap();
        assert_eq!(to_h2.id(), h2.peer_id());
        assert_eq!(to_h1.id(), h1.peer_id());

        h2.send(&to_h1, &json!({"method": "masterChangesSince"})).await?;
        let m = timeout(TIMEOUT, message1.next()).await.unwrap().unwrap();
        assert_eq!(m.peer.id(), h2.peer_id());
        assert_eq!(m.message, json!({"method": "masterChangesSince"}));

        h1.send(&m.peer, &json!({"result": {"checkpoint": 1}})).await?;
        let r = timeout(TIMEOUT, response2.next()).await.unwrap().unwrap();
        assert_eq!(r.response, json!({"result": {"checkpoint": 1}}));

        h1.destroy().await?;
        h2.destroy().await?;
        server.shutdown().await;
        Ok(())
    }
}
