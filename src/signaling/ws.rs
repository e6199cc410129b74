use crate::error::Error;
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a [SignalingServer](crate::signaling::SignalingServer) (or any server speaking
/// the same JSON protocol) over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, UnboundedReceiver<SignalingMessage>), Error> {
        let (stream, _) = connect_async(url).await?;
        debug!("connected to signaling server {url}");
        let (write, read) = stream.split();
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let closed = CancellationToken::new();

        tokio::spawn(writer(write, outbound_rx));
        tokio::spawn(reader(read, inbound_tx, closed.clone()));

        let channel = WsChannel {
            outbound: outbound_tx,
            closed,
        };
        Ok((Arc::new(channel), inbound_rx))
    }
}

struct WsChannel {
    outbound: UnboundedSender<Message>,
    closed: CancellationToken,
}

#[async_trait]
impl SignalingChannel for WsChannel {
    fn send(&self, message: SignalingMessage) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::SignalingClosed);
        }
        let text = serde_json::to_string(&message)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| Error::SignalingClosed)
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            let _ = self.outbound.send(Message::Close(None));
        }
        Ok(())
    }
}

async fn writer(mut write: SplitSink<WsStream, Message>, mut outbound: UnboundedReceiver<Message>) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!("failed to send signaling message: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
    debug!("signaling writer terminated");
}

async fn reader(
    mut read: SplitStream<WsStream>,
    inbound: UnboundedSender<SignalingMessage>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = read.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(msg) => {
                    if inbound.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to decode signaling message `{text}`: {e}"),
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!("signaling server closed the connection");
                break;
            }
            Some(Ok(_)) => { /* ping/pong/binary frames carry no signaling data */ }
            Some(Err(e)) => {
                error!("signaling connection failed: {e}");
                break;
            }
        }
    }
    closed.cancel();
}
