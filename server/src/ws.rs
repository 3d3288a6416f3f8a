use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{AuthError, User};
use crate::room::Room;
use crate::AppState;

// Close codes are part of the wire protocol; clients match on them.
const CLOSE_UNAUTHORIZED: u16 = 4001;
const CLOSE_ROOM_NOT_FOUND: u16 = 4004;
const CLOSE_MASTER_CONFLICT: u16 = 4009;
const CLOSE_SERVER_ERROR: u16 = 1002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Master,
    Member,
}

pub async fn master_endpoint(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let auth = auth_header(&headers);
    ws.on_upgrade(move |socket| handle_connection(socket, state, room_id, auth, Role::Master))
}

pub async fn member_endpoint(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let auth = auth_header(&headers);
    ws.on_upgrade(move |socket| handle_connection(socket, state, room_id, auth, Role::Member))
}

fn auth_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn authenticate(state: &AppState, header: Option<&str>) -> Result<User, &'static str> {
    let claims = state.tokens.verify(header).map_err(|e| match e {
        AuthError::Expired => "Unauthorized token expired",
        _ => "Unauthorized",
    })?;
    state.users.by_name(&claims.sub).ok_or("Unauthorized")
}

fn lookup_room(state: &AppState, raw_id: &str) -> Option<Arc<Room>> {
    let id = raw_id.parse::<Uuid>().ok()?;
    state.registry.get_room(&id)
}

/// Per-connection lifecycle: authenticate, bind into the room, stream
/// messages into the room's dispatch, clean up on the way out. Both roles
/// share the shape; they differ in how they bind.
async fn handle_connection(
    mut socket: WebSocket,
    state: AppState,
    room_id: String,
    auth: Option<String>,
    role: Role,
) {
    let user = match authenticate(&state, auth.as_deref()) {
        Ok(user) => user,
        Err(reason) => {
            close_with(socket, CLOSE_UNAUTHORIZED, reason).await;
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    state.live_connections.insert(conn_id, user.id);
    tracing::debug!(
        "connection {conn_id} opened by {} ({} live)",
        user.name,
        state.live_connections.len()
    );

    // Every return below this point must drop the live entry, including the
    // not-found path.
    let Some(room) = lookup_room(&state, &room_id) else {
        state.live_connections.remove(&conn_id);
        close_with(socket, CLOSE_ROOM_NOT_FOUND, "Room not found").await;
        return;
    };

    let (tx, rx) = mpsc::unbounded_channel::<String>();

    if role == Role::Master && room.bind_master(tx.clone()).await.is_err() {
        state.live_connections.remove(&conn_id);
        close_with(socket, CLOSE_MASTER_CONFLICT, "Master already connected").await;
        return;
    }

    room.add_member(user.clone()).await;
    if role == Role::Member {
        room.add_connected_socket(user.id, tx.clone()).await;
    }

    let (ws_sender, mut ws_receiver) = socket.split();
    let send_task = tokio::spawn(pump_outbound(rx, ws_sender));

    let mut stream_error: Option<String> = None;
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(raw) => match role {
                    Role::Master => room.recv_master(raw).await,
                    Role::Member => room.recv_member(user.id, raw).await,
                },
                Err(e) => {
                    tracing::warn!("malformed frame from {}: {e}", user.name);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                stream_error = Some(e.to_string());
                break;
            }
        }
    }

    match role {
        // The master never leaves the roster; only its live link is freed so
        // it can reconnect.
        Role::Master => room.release_master().await,
        Role::Member => {
            room.remove_connected_socket(user.id).await;
            let _ = room.remove_member(user.id).await;
        }
    }
    state.live_connections.remove(&conn_id);
    tracing::debug!("connection {conn_id} closed for {}", user.name);

    // All senders into the queue are gone now, so the pump drains and hands
    // the sink back for the final close frame.
    drop(tx);
    if let Ok(mut sink) = send_task.await {
        if let Some(err) = stream_error {
            let frame = CloseFrame {
                code: CLOSE_SERVER_ERROR,
                reason: Cow::Owned(format!("Closed by server with err: {err}")),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }
    }
}

/// Drains one connection's outbound queue into its websocket sink, then
/// returns the sink. Runs as its own task so a slow socket never stalls
/// room dispatch.
async fn pump_outbound(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut sink: SplitSink<WebSocket, Message>,
) -> SplitSink<WebSocket, Message> {
    while let Some(text) = rx.recv().await {
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    sink
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app_state() -> AppState {
        AppState::new()
    }

    #[test]
    fn authenticate_resolves_registered_users() {
        let state = app_state();
        state.users.register("alice", "pw").unwrap();
        let token = state.tokens.issue("alice", 60);

        let user = authenticate(&state, Some(&token)).unwrap();
        assert_eq!(user.name, "alice");

        assert_eq!(authenticate(&state, None), Err("Unauthorized"));
        assert_eq!(authenticate(&state, Some("junk")), Err("Unauthorized"));

        let expired = state.tokens.issue("alice", -1);
        assert_eq!(
            authenticate(&state, Some(&expired)),
            Err("Unauthorized token expired")
        );

        // A valid token for an unknown subject is still unauthorized.
        let ghost = state.tokens.issue("bob", 60);
        assert_eq!(authenticate(&state, Some(&ghost)), Err("Unauthorized"));
    }

    #[tokio::test]
    async fn lookup_room_rejects_unknown_and_unparsable_ids() {
        let state = app_state();
        let master = state.users.register("alice", "pw").unwrap();
        let room = state.registry.create_room(master, "r");

        assert!(lookup_room(&state, &room.id.to_string()).is_some());
        assert!(lookup_room(&state, &Uuid::new_v4().to_string()).is_none());
        assert!(lookup_room(&state, "not-a-uuid").is_none());
    }

    #[tokio::test]
    async fn member_cleanup_stops_future_broadcasts() {
        let state = app_state();
        let master = state.users.register("alice", "pw").unwrap();
        let member = state.users.register("bob", "pw").unwrap();
        let room = state.registry.create_room(master, "r");

        let (tx, mut rx) = mpsc::unbounded_channel();
        room.add_member(member.clone()).await;
        room.add_connected_socket(member.id, tx).await;

        room.recv_master(json!({"command": "state", "name": "pause", "value": true, "timestamp": 1.0}))
            .await;
        assert!(rx.try_recv().is_ok());

        // The gateway's member cleanup sequence.
        room.remove_connected_socket(member.id).await;
        let _ = room.remove_member(member.id).await;

        room.recv_master(json!({"command": "state", "name": "pause", "value": false, "timestamp": 2.0}))
            .await;
        assert!(rx.try_recv().is_err());
        assert!(!room.is_member(member.id).await);
        assert!(!room.is_connected(member.id).await);
    }
}
