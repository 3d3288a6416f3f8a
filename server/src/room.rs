use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::User;
use crate::playback::{MediaDescription, PlaybackState};
use crate::protocol::{Command, Envelope};

/// Per-socket outbound queue. The gateway drains it into the websocket sink,
/// so a slow member only backs up its own queue.
pub type Outbound = mpsc::UnboundedSender<String>;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("cannot remove master from room")]
    MasterRemoval,
    #[error("master already connected")]
    MasterConflict,
}

/// Mutable half of a room, guarded as one unit: a member join racing a
/// master broadcast must see either the old or the new roster, never half of
/// it.
struct RoomInner {
    members: HashMap<i64, User>,
    sockets: HashMap<i64, Outbound>,
    master_socket: Option<Outbound>,
    state: PlaybackState,
    description: MediaDescription,
}

/// One synchronization scope: a master, a member roster, their live sockets,
/// and the shared playback state. The master is fixed at creation and is
/// always part of the roster.
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub master: User,
    inner: RwLock<RoomInner>,
}

impl Room {
    fn new(master: User, name: &str) -> Self {
        let mut members = HashMap::new();
        members.insert(master.id, master.clone());
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            master,
            inner: RwLock::new(RoomInner {
                members,
                sockets: HashMap::new(),
                master_socket: None,
                state: PlaybackState::default(),
                description: MediaDescription::default(),
            }),
        }
    }

    pub async fn add_member(&self, user: User) {
        self.inner.write().await.members.insert(user.id, user);
    }

    pub async fn remove_member(&self, user_id: i64) -> Result<(), RoomError> {
        if user_id == self.master.id {
            return Err(RoomError::MasterRemoval);
        }
        self.inner.write().await.members.remove(&user_id);
        Ok(())
    }

    pub async fn is_member(&self, user_id: i64) -> bool {
        self.inner.read().await.members.contains_key(&user_id)
    }

    pub async fn add_connected_socket(&self, user_id: i64, tx: Outbound) {
        self.inner.write().await.sockets.insert(user_id, tx);
    }

    pub async fn remove_connected_socket(&self, user_id: i64) {
        self.inner.write().await.sockets.remove(&user_id);
    }

    pub async fn is_connected(&self, user_id: i64) -> bool {
        self.inner.read().await.sockets.contains_key(&user_id)
    }

    /// Claim the master slot. Fails while another live master connection
    /// holds it; a sender whose connection is gone does not count.
    pub async fn bind_master(&self, tx: Outbound) -> Result<(), RoomError> {
        let mut inner = self.inner.write().await;
        if matches!(&inner.master_socket, Some(existing) if !existing.is_closed()) {
            return Err(RoomError::MasterConflict);
        }
        inner.master_socket = Some(tx);
        Ok(())
    }

    pub async fn release_master(&self) {
        self.inner.write().await.master_socket = None;
    }

    /// One message from the master: `desc` replaces the media description,
    /// everything else runs through the playback-state policy and fans out
    /// to members when it says so. Dispatch holds the write lock end to end,
    /// which is what keeps master updates ordered for every member.
    pub async fn recv_master(&self, raw: Value) {
        let msg = Envelope::new(raw);
        let mut inner = self.inner.write().await;
        if msg.command() == Some(Command::Desc) {
            inner.description.update(&msg);
        } else if inner.state.update(&msg) {
            let text = msg.pack().to_string();
            for (member_id, tx) in &inner.sockets {
                // A member that vanished mid-fanout is its own problem.
                if tx.send(text.clone()).is_err() {
                    tracing::debug!("member {member_id} socket gone, skipping");
                }
            }
        }
    }

    /// One message from a member. Members may only query; state from a
    /// member is accepted and ignored, they never originate authority.
    pub async fn recv_member(&self, user_id: i64, raw: Value) {
        let msg = Envelope::new(raw);
        match msg.command() {
            Some(Command::Req) => {
                let extra = {
                    let inner = self.inner.read().await;
                    match msg.name() {
                        Some("desc") => inner.description.to_json(),
                        Some("state") => inner.state.to_json(),
                        other => {
                            tracing::warn!("unknown req name {other:?} from {user_id}");
                            return;
                        }
                    }
                };
                self.send_to(user_id, &json!({"command": "req", "extra": extra}))
                    .await;
            }
            Some(Command::State) => {}
            other => {
                tracing::warn!("unknown command {other:?} from member {user_id}");
            }
        }
    }

    /// Unicast; silently a no-op when the member is not connected.
    pub async fn send_to(&self, user_id: i64, payload: &Value) {
        let inner = self.inner.read().await;
        if let Some(tx) = inner.sockets.get(&user_id) {
            let _ = tx.send(payload.to_string());
        }
    }
}

/// Directory of live rooms. Rooms are created and deleted explicitly; a
/// master disconnect leaves its room in place for reconnection.
pub struct RoomRegistry {
    rooms: DashMap<Uuid, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn create_room(&self, master: User, name: &str) -> Arc<Room> {
        let room = Arc::new(Room::new(master, name));
        self.rooms.insert(room.id, room.clone());
        tracing::info!("room {} ({}) created by {}", room.id, room.name, room.master.name);
        room
    }

    pub fn get_room(&self, id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.clone())
    }

    pub fn delete_room(&self, id: &Uuid) -> Option<Arc<Room>> {
        let removed = self.rooms.remove(id).map(|(_, room)| room);
        if let Some(room) = &removed {
            tracing::info!("room {} deleted", room.id);
        }
        removed
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn user(id: i64) -> User {
        User {
            id,
            name: format!("user{id}"),
            password_hash: String::new(),
        }
    }

    async fn join(room: &Room, id: i64) -> UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.add_member(user(id)).await;
        room.add_connected_socket(id, tx).await;
        rx
    }

    fn state_msg(name: &str, value: Value, ts: f64) -> Value {
        json!({"command": "state", "name": name, "value": value, "timestamp": ts})
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn master_cannot_leave_the_roster() {
        let room = Room::new(user(1), "movie night");
        room.add_member(user(2)).await;

        assert!(matches!(
            room.remove_member(1).await,
            Err(RoomError::MasterRemoval)
        ));
        assert!(room.is_member(1).await);

        room.remove_member(2).await.unwrap();
        assert!(!room.is_member(2).await);
    }

    #[tokio::test]
    async fn deduped_fields_broadcast_once() {
        let room = Room::new(user(1), "r");
        let mut rx_a = join(&room, 2).await;
        let mut rx_b = join(&room, 3).await;

        room.recv_master(state_msg("volume", json!(50), 1.0)).await;
        room.recv_master(state_msg("volume", json!(50), 2.0)).await;

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn pause_and_pos_broadcast_every_time() {
        let room = Room::new(user(1), "r");
        let mut rx = join(&room, 2).await;

        room.recv_master(state_msg("pause", json!(true), 1.0)).await;
        room.recv_master(state_msg("pause", json!(true), 2.0)).await;
        assert_eq!(drain(&mut rx).len(), 2);

        let pos = state_msg("pos", json!(12.5), 100.0);
        room.recv_master(pos.clone()).await;
        room.recv_master(pos).await;
        let ticks = drain(&mut rx);
        assert_eq!(ticks.len(), 2);
        let payload: Value = serde_json::from_str(&ticks[0]).unwrap();
        assert_eq!(payload, json!({"command": "state", "name": "pos", "value": 12.5, "extra": null}));
        assert_eq!(ticks[0], ticks[1]);
    }

    #[tokio::test]
    async fn desc_updates_without_broadcast() {
        let room = Room::new(user(1), "r");
        let mut rx = join(&room, 2).await;

        room.recv_master(json!({
            "command": "desc",
            "extra": {"filename": "a.mkv", "filesize": 1024, "duration": 600, "pos": 0.0},
        }))
        .await;
        assert!(drain(&mut rx).is_empty());

        room.recv_member(2, json!({"command": "req", "name": "desc"})).await;
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        let reply: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(reply["command"], json!("req"));
        assert_eq!(reply["extra"]["filename"]["value"], json!("a.mkv"));
    }

    #[tokio::test]
    async fn member_queries_reply_to_that_member_only() {
        let room = Room::new(user(1), "r");
        let mut rx_a = join(&room, 2).await;
        let mut rx_b = join(&room, 3).await;

        room.recv_master(state_msg("volume", json!(70), 1.0)).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        room.recv_member(2, json!({"command": "req", "name": "state"})).await;
        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 1);
        let reply: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(reply["extra"]["volume"]["value"], json!(70));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn member_state_and_unknown_messages_are_dropped() {
        let room = Room::new(user(1), "r");
        let mut rx_a = join(&room, 2).await;
        let mut rx_b = join(&room, 3).await;

        // Members never originate authority.
        room.recv_member(2, state_msg("volume", json!(10), 1.0)).await;
        room.recv_member(2, json!({"command": "bogus"})).await;
        room.recv_member(2, json!({"command": "req", "name": "bogus"})).await;
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());

        // The authoritative volume is still unset.
        room.recv_member(2, json!({"command": "req", "name": "state"})).await;
        let reply: Value = serde_json::from_str(&drain(&mut rx_a)[0]).unwrap();
        assert_eq!(reply["extra"]["volume"]["value"], Value::Null);
    }

    #[tokio::test]
    async fn dead_socket_does_not_abort_the_fanout() {
        let room = Room::new(user(1), "r");
        let rx_dead = join(&room, 2).await;
        let mut rx_live = join(&room, 3).await;
        drop(rx_dead);

        room.recv_master(state_msg("pause", json!(true), 1.0)).await;
        assert_eq!(drain(&mut rx_live).len(), 1);
    }

    #[tokio::test]
    async fn unicast_to_absent_member_is_a_noop() {
        let room = Room::new(user(1), "r");
        room.send_to(99, &json!({"command": "req"})).await;
    }

    #[tokio::test]
    async fn only_one_live_master_connection() {
        let room = Room::new(user(1), "r");
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        room.bind_master(tx1).await.unwrap();
        assert!(matches!(
            room.bind_master(tx2.clone()).await,
            Err(RoomError::MasterConflict)
        ));

        room.release_master().await;
        room.bind_master(tx2).await.unwrap();
    }

    #[tokio::test]
    async fn stale_master_sender_is_replaced() {
        let room = Room::new(user(1), "r");
        let (tx1, rx1) = mpsc::unbounded_channel();
        room.bind_master(tx1).await.unwrap();
        drop(rx1);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        room.bind_master(tx2).await.unwrap();
    }

    #[tokio::test]
    async fn registry_lifecycle() {
        let registry = RoomRegistry::new();
        let room = registry.create_room(user(1), "movie night");
        assert_eq!(room.name, "movie night");
        assert!(room.is_member(1).await);

        let found = registry.get_room(&room.id).unwrap();
        assert_eq!(found.id, room.id);

        registry.delete_room(&room.id);
        assert!(registry.get_room(&room.id).is_none());
        assert!(registry.delete_room(&room.id).is_none());
    }
}
