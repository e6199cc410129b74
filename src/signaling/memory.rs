use crate::error::Error;
use crate::signaling::rooms::{Rooms, Session};
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingMessage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// In-process signaling hub with the same room semantics as [SignalingServer].
///
/// All channels connected through the same hub (or its clones) share rooms, the `url` passed
/// to [SignalingConnector::connect] is ignored.
///
/// [SignalingServer]: crate::signaling::SignalingServer
#[derive(Debug, Clone, Default)]
pub struct MemorySignaling {
    rooms: Arc<Mutex<Rooms>>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingConnector for MemorySignaling {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, UnboundedReceiver<SignalingMessage>), Error> {
        let (tx, rx) = unbounded_channel();
        let session = Session::new(self.rooms.clone(), tx);
        let channel = MemoryChannel {
            session: Mutex::new(Some(session)),
        };
        Ok((Arc::new(channel), rx))
    }
}

struct MemoryChannel {
    /// `None` once closed.
    session: Mutex<Option<Session>>,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    fn send(&self, message: SignalingMessage) -> Result<(), Error> {
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_mut() {
            Some(session) => {
                session.handle(message);
                Ok(())
            }
            None => Err(Error::SignalingClosed),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        // dropping the session leaves the rooms and ends the inbound stream
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(session);
        Ok(())
    }
}
