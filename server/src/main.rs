use axum::routing::{delete, get, post};
use axum::Router;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

mod api;
mod auth;
mod config;
mod playback;
mod protocol;
mod room;
mod ws;

use auth::{TokenKeeper, UserDirectory};
use config::Config;
use room::RoomRegistry;

/// Everything the handlers share: the room registry, the auth
/// collaborators, and the gateway's live-connection bookkeeping
/// (connection id -> user id).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub users: Arc<UserDirectory>,
    pub tokens: Arc<TokenKeeper>,
    pub live_connections: Arc<DashMap<Uuid, i64>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            users: Arc::new(UserDirectory::new()),
            tokens: Arc::new(TokenKeeper::new()),
            live_connections: Arc::new(DashMap::new()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let default_filter = if config.debug {
        "mpv_sync_server=debug,info"
    } else {
        "mpv_sync_server=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let state = AppState::new();

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/api/register", post(api::register))
        .route("/api/login", post(api::login))
        .route("/api/logout", get(api::logout))
        .route("/room/create", post(api::create_room))
        .route("/room/:room_id", delete(api::delete_room))
        .route("/ws/master/:room_id", get(ws::master_endpoint))
        .route("/ws/member/:room_id", get(ws::member_endpoint))
        .with_state(state);

    let listener = TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("mpv-sync server listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
