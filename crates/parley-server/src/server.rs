use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use parley_core::ids::SessionToken;
use parley_store::sessions::SessionRow;
use parley_store::{Database, StoreError};

use crate::client::{self, ClientId, ClientRegistry};
use crate::handlers::HandlerState;
use crate::presence::{self, PresenceBroadcaster};
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            max_send_queue: 256,
            max_sessions: 10_000,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive; dropping it shuts everything down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    presence: PresenceBroadcaster,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    // Start the presence forwarding bridge
    let bridge_handle =
        presence::start_bridge(Arc::clone(&client_registry), presence.subscribe_events());

    // Start dead-client cleanup task (every 60s)
    let _cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        std::time::Duration::from_secs(60),
    );

    // Message processing channel
    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let handler_state = Arc::new(HandlerState::new(
        db,
        presence,
        Arc::clone(&client_registry),
        config.max_sessions,
    ));

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
    };

    // Start RPC message processor
    let rpc_handle = tokio::spawn(process_rpc_messages(
        msg_rx,
        handler_state,
        client_registry,
    ));

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Parley server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
        _rpc: rpc_handle,
        _cleanup,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _rpc: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session: Option<String>,
}

/// WebSocket upgrade handler. A presented session token is checked before
/// the upgrade; bad credentials are turned away with 401.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let bound = match query.session {
        Some(raw) => {
            if !SessionToken::is_valid_format(&raw) {
                return (StatusCode::UNAUTHORIZED, "invalid session, log in again")
                    .into_response();
            }
            let token = SessionToken::from_raw(raw);
            match state.handler_state.sessions.lookup(&token) {
                Ok(session) => Some(session),
                Err(StoreError::NotFound(_)) => {
                    return (StatusCode::UNAUTHORIZED, "invalid session, log in again")
                        .into_response();
                }
                Err(e) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
                }
            }
        }
        None => None,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, bound))
}

/// Handle a new WebSocket connection: register it, subscribe it to its
/// session's room, emit the handshake payload, then run the message loop.
async fn handle_socket(socket: WebSocket, state: AppState, bound: Option<SessionRow>) {
    let (client_id, rx) = state.client_registry.register();

    if let Some(ref session) = bound {
        state
            .client_registry
            .bind_session(&client_id, session.id.clone(), &session.room)
            .await;
    }

    let hello = serde_json::json!({
        "type": "hello",
        "client_id": client_id.to_string(),
        "session": bound.as_ref().map(|s| s.id.as_str()),
        "room": bound.as_ref().map(|s| s.room.as_str()),
    });
    if let Ok(json) = serde_json::to_string(&hello) {
        state.client_registry.send_to(&client_id, json).await;
    }

    tracing::info!(client_id = %client_id, "WebSocket client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        None,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let result = resp.result.unwrap_or_default();
    let status = result
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");

    let http_status = if status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(result))
}

/// Process incoming RPC messages from WebSocket clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                let resp = RpcResponse::parse_error();
                if let Ok(json) = serde_json::to_string(&resp) {
                    registry.send_to(&client_id, json).await;
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));
        let response = crate::handlers::dispatch(
            &state,
            Some(&client_id),
            &request.method,
            &params,
            request.id,
        )
        .await;

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json).await;
        }
    }
}
