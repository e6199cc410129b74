use crate::signaling::SignalingMessage;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// Server-side room registry: room name -> (peer id -> outbound queue of that member).
#[derive(Debug, Default)]
pub(crate) struct Rooms {
    rooms: HashMap<String, BTreeMap<String, UnboundedSender<SignalingMessage>>>,
}

impl Rooms {
    /// Adds a member to a room and tells every member who is in it now.
    fn join(&mut self, room: &str, peer_id: &str, tx: UnboundedSender<SignalingMessage>) {
        let members = self.rooms.entry(room.to_owned()).or_default();
        members.insert(peer_id.to_owned(), tx);
        let room_peer_ids: Vec<String> = members.keys().cloned().collect();
        debug!("room `{room}`: `{peer_id}` joined, members: {room_peer_ids:?}");
        for tx in members.values() {
            let _ = tx.send(SignalingMessage::Joined {
                room_peer_ids: room_peer_ids.clone(),
            });
        }
    }

    /// Forwards a signal to its addressee. Returns `false` if there's no such member.
    fn relay(&self, message: SignalingMessage) -> bool {
        let target = match &message {
            SignalingMessage::Signal { to, room, .. } => {
                self.rooms.get(room).and_then(|members| members.get(to))
            }
            _ => None,
        };
        match target {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Removes a member, unless its id has since been taken over by another connection.
    fn leave(&mut self, room: &str, peer_id: &str, tx: &UnboundedSender<SignalingMessage>) {
        if let Some(members) = self.rooms.get_mut(room) {
            match members.get(peer_id) {
                Some(member) if member.same_channel(tx) => {
                    members.remove(peer_id);
                    debug!("room `{room}`: `{peer_id}` left");
                }
                _ => return,
            }
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn members(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Single client connection as seen by the server. Leaves all joined rooms when dropped.
pub(crate) struct Session {
    rooms: Arc<Mutex<Rooms>>,
    outbound: UnboundedSender<SignalingMessage>,
    joined: Vec<(String, String)>,
}

impl Session {
    pub(crate) fn new(rooms: Arc<Mutex<Rooms>>, outbound: UnboundedSender<SignalingMessage>) -> Self {
        Session {
            rooms,
            outbound,
            joined: Vec::new(),
        }
    }

    /// Handles a message sent by the client.
    pub(crate) fn handle(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Join { room, peer_id } => {
                lock(&self.rooms).join(&room, &peer_id, self.outbound.clone());
                self.joined.push((room, peer_id));
            }
            msg @ SignalingMessage::Signal { .. } => {
                if !lock(&self.rooms).relay(msg.clone()) {
                    debug!("dropping signal without a recipient: {msg:?}");
                }
            }
            SignalingMessage::Joined { .. } => {
                warn!("client sent a server-only `joined` message, ignoring");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut rooms = lock(&self.rooms);
        for (room, peer_id) in self.joined.drain(..) {
            rooms.leave(&room, &peer_id, &self.outbound);
        }
    }
}

fn lock(rooms: &Mutex<Rooms>) -> std::sync::MutexGuard<'_, Rooms> {
    rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod test {
    use crate::signaling::rooms::{Rooms, Session};
    use crate::signaling::SignalingMessage;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::unbounded_channel;

    fn join(room: &str, peer_id: &str) -> SignalingMessage {
        SignalingMessage::Join {
            room: room.into(),
            peer_id: peer_id.into(),
        }
    }

    #[test]
    fn joined_is_broadcast_to_every_member() {
        let rooms = Arc::new(Mutex::new(Rooms::default()));
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let mut s1 = Session::new(rooms.clone(), tx1);
        let mut s2 = Session::new(rooms.clone(), tx2);

        s1.handle(join("r", "bbb"));
        s2.handle(join("r", "aaa"));

        let only_self = SignalingMessage::Joined {
            room_peer_ids: vec!["bbb".into()],
        };
        let both = SignalingMessage::Joined {
            room_peer_ids: vec!["aaa".into(), "bbb".into()],
        };
        assert_eq!(rx1.try_recv().unwrap(), only_self);
        assert_eq!(rx1.try_recv().unwrap(), both);
        assert_eq!(rx2.try_recv().unwrap(), both);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn signals_reach_only_the_addressee_in_the_same_room() {
        let rooms = Arc::new(Mutex::new(Rooms::default()));
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let (tx3, mut rx3) = unbounded_channel();
        let mut s1 = Session::new(rooms.clone(), tx1);
        let mut s2 = Session::new(rooms.clone(), tx2);
        let mut s3 = Session::new(rooms.clone(), tx3);
        s1.handle(join("r", "a"));
        s2.handle(join("r", "b"));
        s3.handle(join("other", "b"));
        while rx1.try_recv().is_ok() {}
        while rx2.try_recv().is_ok() {}
        while rx3.try_recv().is_ok() {}

        let signal = SignalingMessage::Signal {
            from: "a".into(),
            to: "b".into(),
            room: "r".into(),
            signal: json!({"type": "offer", "sdp": "x"}),
        };
        s1.handle(signal.clone());

        assert_eq!(rx2.try_recv().unwrap(), signal);
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn dropped_sessions_leave_their_rooms() {
        let rooms = Arc::new(Mutex::new(Rooms::default()));
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let mut s1 = Session::new(rooms.clone(), tx1);
        let mut s2 = Session::new(rooms.clone(), tx2);
        s1.handle(join("r", "a"));
        s2.handle(join("r", "b"));
        assert_eq!(rooms.lock().unwrap().members("r"), vec!["a", "b"]);

        drop(s1);
        assert_eq!(rooms.lock().unwrap().members("r"), vec!["b"]);
        drop(s2);
        assert!(rooms.lock().unwrap().members("r").is_empty());
    }

    #[test]
    fn stale_session_does_not_evict_reused_id() {
        let rooms = Arc::new(Mutex::new(Rooms::default()));
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let (tx3, _rx3) = unbounded_channel();
        let mut old = Session::new(rooms.clone(), tx1);
        let mut new = Session::new(rooms.clone(), tx2);
        let mut other = Session::new(rooms.clone(), tx3);
        old.handle(join("r", "a"));
        new.handle(join("r", "a"));
        other.handle(join("r", "b"));
        while rx2.try_recv().is_ok() {}

        drop(old);
        assert_eq!(rooms.lock().unwrap().members("r"), vec!["a", "b"]);

        let signal = SignalingMessage::Signal {
            from: "b".into(),
            to: "a".into(),
            room: "r".into(),
            signal: json!({"type": "renegotiate", "renegotiate": true}),
        };
        other.handle(signal.clone());
        assert_eq!(rx2.try_recv().unwrap(), signal);

        drop(new);
        assert_eq!(rooms.lock().unwrap().members("r"), vec!["b"]);
    }
}
