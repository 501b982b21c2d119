use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::room::RoomKey;

use super::event::ServerEvent;

pub type SessionId = Uuid;

/// Live-connection bookkeeping: which sessions are members of which
/// rooms, and the outbound channel for each. Nothing here is persisted;
/// a disconnect erases every trace.
///
/// Injected into the ws layer rather than living in a global, so tests
/// can stand up their own and a distributed registry can replace it
/// later.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomKey, HashMap<SessionId, UnboundedSender<ServerEvent>>>,
    memberships: HashMap<SessionId, HashSet<RoomKey>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a room. Idempotent: re-joining keeps the single
    /// existing membership.
    pub fn join(&self, room: RoomKey, session: SessionId, tx: UnboundedSender<ServerEvent>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .rooms
            .entry(room.clone())
            .or_default()
            .entry(session)
            .or_insert(tx);
        inner.memberships.entry(session).or_default().insert(room);
    }

    /// Fan the event out to every member of the room, the sender's own
    /// session included. Sessions whose channel is gone are dropped from
    /// the room. Returns how many sessions the event was queued for.
    pub fn broadcast(&self, room: &RoomKey, event: &ServerEvent) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let Some(members) = inner.rooms.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (session, tx) in members.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*session);
            }
        }

        for session in dead {
            members.remove(&session);
            if let Some(rooms) = inner.memberships.get_mut(&session) {
                rooms.remove(room);
            }
        }
        if members.is_empty() {
            inner.rooms.remove(room);
        }

        delivered
    }

    /// Drop all of a session's room memberships. Peers are not notified;
    /// they simply stop receiving from a session that no longer exists.
    pub fn disconnect(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let Some(rooms) = inner.memberships.remove(&session) else {
            return;
        };
        for room in rooms {
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&session);
                if members.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }
    }

    pub fn member_count(&self, room: &RoomKey) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.rooms.get(room).map(HashMap::len).unwrap_or(0)
    }
}
