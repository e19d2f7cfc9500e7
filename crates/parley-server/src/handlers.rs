//! RPC method handlers organized by domain.

use std::sync::Arc;

use parley_core::errors::ChatError;
use parley_core::ids::{SessionToken, UserId};
use parley_store::messages::{MessageRepo, NewMessage};
use parley_store::sessions::SessionRepo;
use parley_store::Database;

use crate::client::{ClientId, ClientRegistry};
use crate::coordinator::RoomCoordinator;
use crate::presence::PresenceBroadcaster;
use crate::rpc::{self, RpcResponse};

const DEFAULT_LIST_LIMIT: u32 = 100;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub sessions: SessionRepo,
    pub messages: MessageRepo,
    pub coordinator: RoomCoordinator,
    pub registry: Arc<ClientRegistry>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        presence: PresenceBroadcaster,
        registry: Arc<ClientRegistry>,
        max_sessions: usize,
    ) -> Self {
        Self {
            sessions: SessionRepo::with_capacity(db.clone(), max_sessions),
            messages: MessageRepo::new(db.clone()),
            coordinator: RoomCoordinator::new(db, presence),
            registry,
        }
    }
}

/// Dispatch an RPC method to the appropriate handler.
///
/// `caller` is the connection that sent the request, when it arrived over a
/// WebSocket — room switches re-subscribe it to the new room.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    caller: Option<&ClientId>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Session registry
        "session.create" => session_create(state, params, id),
        "session.get" => session_get(state, params, id),
        "session.destroy" => session_destroy(state, params, id).await,

        // Rooms
        "room.switch" => room_switch(state, caller, params, id).await,
        "room.members" => room_members(state, params, id),

        // Transaction sync
        "transaction.submit" => transaction_submit(state, params, id),
        "transaction.bulk" | "transaction.submitBatch" => transaction_bulk(state, params, id),
        "transaction.list" => transaction_list(state, params, id),

        // System
        "system.ping" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ── Session handlers ──

fn session_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.sessions.create(&user_id) {
        Ok(session) => match serde_json::to_value(&session) {
            Ok(v) => RpcResponse::success(id, serde_json::json!({ "session": v })),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

fn session_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let token = match require_session(params, &id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.sessions.lookup(&token) {
        Ok(session) => match serde_json::to_value(&session) {
            Ok(v) => RpcResponse::success(id, serde_json::json!({ "session": v })),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(parley_store::StoreError::NotFound(_)) => {
            RpcResponse::chat_error(id, &ChatError::InvalidSession)
        }
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

async fn session_destroy(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let raw = match rpc::require_str(params, "session") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let token = SessionToken::from_raw(raw);

    match state.sessions.destroy(&token) {
        Ok(()) => {
            // Fire-and-forget teardown of the session's live subscriptions
            state.registry.clear_session(&token).await;
            RpcResponse::success(id, serde_json::json!({ "destroyed": true }))
        }
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

// ── Room handlers ──

async fn room_switch(
    state: &Arc<HandlerState>,
    caller: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let raw_token = match rpc::require_str(params, "session") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let room = match rpc::require_str(params, "room") {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let outcome = match state.coordinator.switch_room(raw_token, room) {
        Ok(outcome) => outcome,
        Err(e) => return RpcResponse::chat_error(id, &e),
    };

    // Carry the session's connections (all devices) to the new room, and
    // late-attach the calling connection if it wasn't bound yet.
    let token = SessionToken::from_raw(raw_token);
    state.registry.move_session(&token, room).await;
    if let Some(caller) = caller {
        state.registry.bind_session(caller, token, room).await;
    }

    match (
        serde_json::to_value(&outcome.session),
        serde_json::to_value(&outcome.members),
    ) {
        (Ok(session), Ok(members)) => RpcResponse::success(
            id,
            serde_json::json!({ "session": session, "members": members }),
        ),
        (Err(e), _) | (_, Err(e)) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn room_members(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let room = match rpc::require_str(params, "room") {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.sessions.members_of(room) {
        Ok(members) => match serde_json::to_value(&members) {
            Ok(v) => RpcResponse::success(id, serde_json::json!({ "room": room, "members": v })),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

// ── Transaction sync handlers ──

fn transaction_submit(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let msg: NewMessage = match serde_json::from_value(params.clone()) {
        Ok(m) => m,
        Err(e) => return RpcResponse::invalid_params(id, e.to_string()),
    };

    match state.messages.insert(&msg) {
        Ok(stored) => match serde_json::to_value(&stored) {
            Ok(v) => RpcResponse::success(id, serde_json::json!({ "transaction": v })),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

fn transaction_bulk(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(raw) = params.get("transactions") else {
        return RpcResponse::invalid_params(id, "Missing required parameter: transactions");
    };
    let msgs: Vec<NewMessage> = match serde_json::from_value(raw.clone()) {
        Ok(m) => m,
        Err(e) => return RpcResponse::invalid_params(id, e.to_string()),
    };

    match state.messages.insert_batch(&msgs) {
        Ok(offline_ids) => {
            RpcResponse::success(id, serde_json::json!({ "offline_ids": offline_ids }))
        }
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

fn transaction_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let room = rpc::optional_str(params, "room");
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = rpc::optional_u32(params, "offset").unwrap_or(0);

    match state.messages.list(room, limit, offset) {
        Ok(rows) => match serde_json::to_value(&rows) {
            Ok(v) => RpcResponse::success(id, serde_json::json!({ "transactions": v })),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => RpcResponse::chat_error(id, &ChatError::from(e)),
    }
}

// ── System handlers ──

fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    match state.sessions.count() {
        Ok(sessions) => RpcResponse::success(
            id,
            serde_json::json!({
                "status": "healthy",
                "sessions": sessions,
                "clients": state.registry.count(),
            }),
        ),
        Err(e) => RpcResponse::success(
            id,
            serde_json::json!({ "status": "unhealthy", "reason": e.to_string() }),
        ),
    }
}

/// Validate the session param's fixed-length format before any lookup.
fn require_session(
    params: &serde_json::Value,
    id: &Option<serde_json::Value>,
) -> Result<SessionToken, RpcResponse> {
    match rpc::require_str(params, "session") {
        Ok(raw) if SessionToken::is_valid_format(raw) => Ok(SessionToken::from_raw(raw)),
        Ok(_) => Err(RpcResponse::chat_error(id.clone(), &ChatError::InvalidSession)),
        Err(e) => Err(RpcResponse::invalid_params(id.clone(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::sessions::DEFAULT_ROOM;
    use parley_store::users::UserRepo;

    fn setup() -> (Arc<HandlerState>, PresenceBroadcaster, Arc<ClientRegistry>) {
        let db = Database::in_memory().unwrap();
        UserRepo::new(db.clone())
            .upsert(&UserId::from_raw("user_ada"), "Ada", None)
            .unwrap();

        let presence = PresenceBroadcaster::new(16);
        let registry = Arc::new(ClientRegistry::new(32));
        let state = Arc::new(HandlerState::new(
            db,
            presence.clone(),
            Arc::clone(&registry),
            100,
        ));
        (state, presence, registry)
    }

    async fn call(
        state: &Arc<HandlerState>,
        method: &str,
        params: serde_json::Value,
    ) -> RpcResponse {
        dispatch(state, None, method, &params, Some(serde_json::json!(1))).await
    }

    fn result(resp: &RpcResponse) -> &serde_json::Value {
        resp.result.as_ref().unwrap()
    }

    #[tokio::test]
    async fn unknown_method() {
        let (state, _, _) = setup();
        let resp = call(&state, "no.such.method", serde_json::json!({})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn session_create_and_get() {
        let (state, _, _) = setup();
        let resp = call(&state, "session.create", serde_json::json!({"user_id": "user_ada"})).await;
        assert!(resp.success);
        let token = result(&resp)["session"]["id"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 32);
        assert_eq!(result(&resp)["session"]["room"], DEFAULT_ROOM);

        let resp = call(&state, "session.get", serde_json::json!({"session": token})).await;
        assert!(resp.success);
        assert_eq!(result(&resp)["session"]["user_id"], "user_ada");
    }

    #[tokio::test]
    async fn session_create_requires_user_id() {
        let (state, _, _) = setup();
        let resp = call(&state, "session.create", serde_json::json!({})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn session_create_past_capacity() {
        let db = Database::in_memory().unwrap();
        let presence = PresenceBroadcaster::new(16);
        let registry = Arc::new(ClientRegistry::new(32));
        let state = Arc::new(HandlerState::new(db, presence, registry, 1));

        let params = serde_json::json!({"user_id": "user_ada"});
        assert!(call(&state, "session.create", params.clone()).await.success);

        let resp = call(&state, "session.create", params).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "CAPACITY");
    }

    #[tokio::test]
    async fn session_get_rejects_malformed_token() {
        let (state, _, _) = setup();
        let resp = call(&state, "session.get", serde_json::json!({"session": "short"})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "INVALID_SESSION");
    }

    #[tokio::test]
    async fn session_destroy_is_idempotent() {
        let (state, _, _) = setup();
        let resp = call(&state, "session.create", serde_json::json!({"user_id": "user_ada"})).await;
        let token = result(&resp)["session"]["id"].as_str().unwrap().to_string();

        let params = serde_json::json!({"session": token});
        assert!(call(&state, "session.destroy", params.clone()).await.success);
        assert!(call(&state, "session.destroy", params).await.success);
    }

    #[tokio::test]
    async fn room_switch_updates_session_and_returns_members() {
        let (state, _, _) = setup();
        let resp = call(&state, "session.create", serde_json::json!({"user_id": "user_ada"})).await;
        let token = result(&resp)["session"]["id"].as_str().unwrap().to_string();

        let resp = call(
            &state,
            "room.switch",
            serde_json::json!({"session": token, "room": "general"}),
        )
        .await;
        assert!(resp.success);
        assert_eq!(result(&resp)["session"]["room"], "general");
        let members = result(&resp)["members"].as_array().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["display_name"], "Ada");
    }

    #[tokio::test]
    async fn room_switch_rebinds_the_calling_connection() {
        let (state, _, registry) = setup();
        let resp = call(&state, "session.create", serde_json::json!({"user_id": "user_ada"})).await;
        let token = result(&resp)["session"]["id"].as_str().unwrap().to_string();

        let (caller, _rx) = registry.register();
        let params = serde_json::json!({"session": token, "room": "general"});
        let resp = dispatch(&state, Some(&caller), "room.switch", &params, None).await;
        assert!(resp.success);

        assert_eq!(registry.clients_in_room("general").await, vec![caller]);
    }

    #[tokio::test]
    async fn room_switch_unknown_session() {
        let (state, _, _) = setup();
        let resp = call(
            &state,
            "room.switch",
            serde_json::json!({"session": SessionToken::new().as_str(), "room": "general"}),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "INVALID_SESSION");
    }

    #[tokio::test]
    async fn room_members_polling() {
        let (state, _, _) = setup();
        call(&state, "session.create", serde_json::json!({"user_id": "user_ada"})).await;

        let resp = call(&state, "room.members", serde_json::json!({"room": DEFAULT_ROOM})).await;
        assert!(resp.success);
        assert_eq!(result(&resp)["members"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transaction_submit_and_list() {
        let (state, _, _) = setup();
        let resp = call(
            &state,
            "transaction.submit",
            serde_json::json!({
                "offline_id": "a",
                "author_id": "user_ada",
                "room": "Lobby",
                "payload": {"body": "hello"},
            }),
        )
        .await;
        assert!(resp.success);
        assert!(result(&resp)["transaction"]["id"]
            .as_str()
            .unwrap()
            .starts_with("msg_"));

        let resp = call(&state, "transaction.list", serde_json::json!({})).await;
        assert_eq!(result(&resp)["transactions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transaction_bulk_acks_and_converges() {
        let (state, _, _) = setup();
        let params = serde_json::json!({
            "transactions": [
                {"offline_id": "a", "author_id": "user_ada", "room": "Lobby", "payload": {"body": "1"}},
                {"offline_id": "b", "author_id": "user_ada", "room": "Lobby", "payload": {"body": "2"}},
            ]
        });

        let first = call(&state, "transaction.bulk", params.clone()).await;
        assert!(first.success);
        assert_eq!(
            result(&first)["offline_ids"],
            serde_json::json!(["a", "b"])
        );

        // Resubmitting the same batch acknowledges the same set, stores nothing new
        let second = call(&state, "transaction.bulk", params).await;
        assert_eq!(
            result(&second)["offline_ids"],
            serde_json::json!(["a", "b"])
        );

        let resp = call(&state, "transaction.list", serde_json::json!({})).await;
        assert_eq!(result(&resp)["transactions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transaction_bulk_requires_transactions_param() {
        let (state, _, _) = setup();
        let resp = call(&state, "transaction.bulk", serde_json::json!({})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (state, _, _) = setup();
        let resp = call(&state, "system.ping", serde_json::json!({})).await;
        assert!(resp.success);
        assert_eq!(result(&resp)["status"], "healthy");
        assert_eq!(result(&resp)["sessions"], 0);
    }
}
