use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use lyceum_types::events::GatewayEvent;

/// A broadcast group. Personal rooms are keyed by user id, conversation
/// rooms by conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Personal(Uuid),
    Conversation(Uuid),
}

/// Tracks live connections and the rooms they joined.
///
/// Room membership is connection-scoped: a user with two open connections
/// is two members. Nothing here consults the conversation store, so joining
/// a conversation room does not require being a participant of it.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// Connections and rooms change together, so they share one lock.
    table: RwLock<MembershipTable>,
}

#[derive(Default)]
struct MembershipTable {
    connections: HashMap<Uuid, Member>,
    rooms: HashMap<Room, HashSet<Uuid>>,
}

struct Member {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    rooms: HashSet<Room>,
}

impl MembershipTable {
    fn join(&mut self, conn_id: Uuid, room: Room) -> bool {
        let Some(member) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        member.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id)
    }

    fn leave(&mut self, conn_id: Uuid, room: Room) -> bool {
        if let Some(member) = self.connections.get_mut(&conn_id) {
            member.rooms.remove(&room);
        }
        let Some(members) = self.rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        removed
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection for `user_id`. Returns the connection id and
    /// the receiver its writer task drains.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.table.write().await.connections.insert(
            conn_id,
            Member {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        (conn_id, rx)
    }

    /// Joins the personal room of `requested`. Only the connection's own user
    /// id is accepted; joining again is a no-op.
    pub async fn join_personal(&self, conn_id: Uuid, requested: Uuid) -> anyhow::Result<()> {
        let mut table = self.inner.table.write().await;
        let Some(owner) = table.connections.get(&conn_id).map(|m| m.user_id) else {
            bail!("connection is not registered");
        };
        if owner != requested {
            bail!("cannot join another user's personal room");
        }
        table.join(conn_id, Room::Personal(requested));
        Ok(())
    }

    /// Returns false if the connection was already in the room.
    pub async fn join_conversation(&self, conn_id: Uuid, conversation_id: Uuid) -> bool {
        self.inner
            .table
            .write()
            .await
            .join(conn_id, Room::Conversation(conversation_id))
    }

    /// Returns false if the connection was not in the room.
    pub async fn leave_conversation(&self, conn_id: Uuid, conversation_id: Uuid) -> bool {
        self.inner
            .table
            .write()
            .await
            .leave(conn_id, Room::Conversation(conversation_id))
    }

    /// Sends `event` to every connection in `room` except `except`.
    /// Returns how many connections it was queued for.
    pub async fn broadcast(&self, room: Room, event: GatewayEvent, except: Option<Uuid>) -> usize {
        let table = self.inner.table.read().await;
        let Some(members) = table.rooms.get(&room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(member) = table.connections.get(conn_id) {
                // A closed receiver means the connection is tearing down.
                if member.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Fans a conversation-scoped event out to its conversation room, skipping
    /// `except`. Events without a conversation reach nobody.
    pub async fn relay(&self, event: GatewayEvent, except: Option<Uuid>) -> usize {
        match event.conversation_id() {
            Some(conversation_id) => {
                self.broadcast(Room::Conversation(conversation_id), event, except)
                    .await
            }
            None => 0,
        }
    }

    /// Sends an event to one connection.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        let table = self.inner.table.read().await;
        if let Some(member) = table.connections.get(&conn_id) {
            let _ = member.tx.send(event);
        }
    }

    /// Drops the connection and removes it from every room it joined.
    /// Rooms left empty are removed.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let mut table = self.inner.table.write().await;
        let Some(member) = table.connections.remove(&conn_id) else {
            return;
        };
        for room in member.rooms {
            if let Some(members) = table.rooms.get_mut(&room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    table.rooms.remove(&room);
                }
            }
        }
        debug!("Connection {} of {} removed from all rooms", conn_id, member.user_id);
    }

    pub async fn room_size(&self, room: Room) -> usize {
        self.inner
            .table
            .read()
            .await
            .rooms
            .get(&room)
            .map_or(0, HashSet::len)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.table.read().await.rooms.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.table.read().await.connections.len()
    }
}
