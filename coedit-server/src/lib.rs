//! Server backend for the coedit collaborative code editor.
//!
//! Many editors connected to the same session observe one shared document;
//! each edit is merged with concurrent edits from other participants and
//! broadcast back with every caret and selection translated into the merged
//! text. Sessions live in an external compare-and-swap store; the in-memory
//! hub only fans websocket traffic in and out.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use axum::Router;
use axum::extract::{Form, Path, State, WebSocketUpgrade};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

pub mod hub;
pub mod messages;
mod patch;
pub mod session;
pub mod store;

use crate::hub::UsersManager;
use crate::messages::{UpdateSessionRequest, UpdateSessionResponse};
use crate::session::Session;
use crate::store::{
    MemorySessionStore, RedisConfig, RedisSessionStore, SessionId, SessionStore, StoreError,
};

/// Largest request body the server accepts.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The shared state of the server, accessible from within request handlers.
pub struct ServerState {
    store: Arc<dyn SessionStore>,
    users: UsersManager,
    start_time: u64,
}

impl ServerState {
    /// Builds the state around an already-connected session store.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime returned before UNIX_EPOCH")
            .as_secs();
        Self {
            users: UsersManager::new(Arc::clone(&store)),
            store,
            start_time,
        }
    }

    /// State backed by the Redis store described by `REDIS_HOST`,
    /// `REDIS_PASSWORD` and `REDIS_DB`.
    pub async fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| String::from("localhost:6379"));
        let password = std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());
        let db = std::env::var("REDIS_DB")
            .unwrap_or_else(|_| String::from("0"))
            .parse()
            .context("Unable to parse REDIS_DB")?;
        let config = RedisConfig { host, password, db };
        let store = RedisSessionStore::connect(&config)
            .await
            .context("Could not connect to redis")?;
        Ok(Self::new(Arc::new(store)))
    }

    /// State backed by an in-memory store, for testing.
    pub fn temporary() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of sessions with a live hub.
    live_sessions: usize,
}

/// Error responder for one-shot API calls; missing sessions map to 404,
/// everything else to 500.
struct AppError(StoreError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self.0 {
            StoreError::NotFound(_) => {
                warn!("{}", self.0);
                (StatusCode::NOT_FOUND, self.0.to_string()).into_response()
            }
            _ => {
                error!("request failed: {:#}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

/// Builds the full API router around the shared state.
pub fn server(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/api/new_session", get(new_session_handler))
        .route("/api/stats", get(stats_handler))
        .route(
            "/api/{session_id}",
            get(load_session_handler).post(update_session_handler),
        )
        .route(
            "/api/{session_id}/{user_id}/session_ws",
            get(session_ws_handler),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Handler for the `/api/new_session` endpoint.
async fn new_session_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<String>, AppError> {
    let id = state.store.create_session().await?;
    info!("created session {id}");
    Ok(Json(id.to_string()))
}

/// Handler for the `/api/{session_id}` load endpoint.
async fn load_session_handler(
    Path(session_id): Path<SessionId>,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Session>, AppError> {
    Ok(Json(state.store.load_session(&session_id).await?))
}

/// Handler for the one-shot `/api/{session_id}` update endpoint.
async fn update_session_handler(
    Path(session_id): Path<SessionId>,
    State(state): State<Arc<ServerState>>,
    Form(req): Form<UpdateSessionRequest>,
) -> Result<Json<UpdateSessionResponse>, AppError> {
    Ok(Json(state.store.update_session(&session_id, req).await?))
}

/// Handler for the `/api/{session_id}/{user_id}/session_ws` endpoint.
async fn session_ws_handler(
    Path((session_id, user_id)): Path<(SessionId, String)>,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("socket connection for session {session_id}, user {user_id}");
    ws.on_upgrade(move |socket| async move {
        state.users.register_user(session_id, &user_id, socket);
    })
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> Json<Stats> {
    Json(Stats {
        start_time: state.start_time,
        live_sessions: state.users.session_count(),
    })
}
