use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{TokenKeeper, User};
use crate::AppState;

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomBody {
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResponse {
    if body.username.is_empty() || body.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Invalid format"})),
        );
    }
    match state.users.register(&body.username, &body.password) {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"status": true, "message": "Registration successful"})),
        ),
        Err(_) => (
            StatusCode::CONFLICT,
            Json(json!({"message": "User name has already been used"})),
        ),
    }
}

pub async fn login(State(state): State<AppState>, Json(body): Json<Credentials>) -> ApiResponse {
    match state.users.verify_login(&body.username, &body.password) {
        Some(user) => {
            let token = state.tokens.issue(&user.name, TokenKeeper::DEFAULT_TTL_SECS);
            (
                StatusCode::OK,
                Json(json!({"access_token": token, "token_type": "bearer"})),
            )
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Invalid credentials"})),
        ),
    }
}

/// Tokens are stateless and expire on their own; logout exists so clients
/// have a uniform endpoint to forget their token against.
pub async fn logout() -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({"message": "Logout successful"})),
    )
}

/// The authenticated caller becomes the room's master.
pub async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateRoomBody>>,
) -> ApiResponse {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let name = body
        .and_then(|Json(b)| b.name)
        .unwrap_or_else(|| "New Room".to_string());
    let room = state.registry.create_room(user, &name);
    (
        StatusCode::OK,
        Json(json!({"room_id": room.id, "name": &room.name})),
    )
}

pub async fn delete_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> ApiResponse {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let not_found = (
        StatusCode::NOT_FOUND,
        Json(json!({"message": "Room not found"})),
    );
    let Ok(id) = room_id.parse::<Uuid>() else {
        return not_found;
    };
    let Some(room) = state.registry.get_room(&id) else {
        return not_found;
    };
    if room.master.id != user.id {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"message": "Only the room master can delete it"})),
        );
    }
    state.registry.delete_room(&id);
    (StatusCode::OK, Json(json!({"status": true})))
}

fn current_user(state: &AppState, headers: &HeaderMap) -> Result<User, ApiResponse> {
    let unauthorized = (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Unauthorized"})),
    );
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let claims = state.tokens.verify(header).map_err(|_| unauthorized.clone())?;
    state.users.by_name(&claims.sub).ok_or(unauthorized)
}
