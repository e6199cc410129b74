use crate::error::Error;
use crate::signaling::rooms::{Rooms, Session};
use crate::signaling::SignalingMessage;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// WebSocket signaling server grouping clients into rooms.
///
/// Whenever a client joins a room, every member of that room receives the full list of member
/// ids. Signals are forwarded to the addressed member of the room they name. Clients leave
/// their rooms when their connection closes.
pub struct SignalingServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
}

impl SignalingServer {
    /// Binds the server to a given address and starts accepting connections in the background.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let rooms = Arc::new(Mutex::new(Rooms::default()));
        info!("signaling server listening on {local_addr}");
        let accept_loop = tokio::spawn(accept_loop(listener, rooms, shutdown.clone()));
        Ok(SignalingServer {
            local_addr,
            shutdown,
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stops accepting new connections and disconnects all clients.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.accept_loop.await;
    }
}

impl std::fmt::Debug for SignalingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, rooms: Arc<Mutex<Rooms>>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    let rooms = rooms.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, rooms, shutdown).await {
                            warn!("signaling connection {addr} failed: {e}");
                        }
                    });
                }
                Err(e) => warn!("failed to accept signaling connection: {e}"),
            }
        }
    }
    debug!("signaling server stopped");
}

async fn serve(
    stream: TcpStream,
    rooms: Arc<Mutex<Rooms>>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = unbounded_channel::<SignalingMessage>();
    let mut session = Session::new(rooms, tx);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(msg) = rx.recv() => {
                let text = serde_json::to_string(&msg)?;
                write.send(Message::Text(text)).await?;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(msg) => session.handle(msg),
                    Err(e) => warn!("failed to decode signaling message `{text}`: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
