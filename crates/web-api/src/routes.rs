use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use domain::{ChatId, History, MessageId, UserId};

use crate::{auth::credentials_from_request, error::ApiError, session::ChatSession, state::AppState};

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    message_id: MessageId,
}

#[derive(Debug, Serialize)]
struct UserStatusResponse {
    user_id: UserId,
    status: u8,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/users/{user_id}/status", get(user_status))
        .route("/chats/{chat_id}/messages", get(get_history))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 升级为 WebSocket；认证在会话内完成，失败时直接关闭连接
async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let credentials = credentials_from_request(&headers, query.token.as_deref());
    ws.on_upgrade(move |socket| ChatSession::new(state, credentials).run(socket))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let credentials = credentials_from_request(headers, None);
    Ok(state.identity.identify(&credentials).await?)
}

async fn user_status(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
) -> Result<Json<UserStatusResponse>, ApiError> {
    authenticate(&state, &headers).await?;
    let status = state.registry.user_status(user_id).await;
    Ok(Json(UserStatusResponse {
        user_id,
        status: status.code(),
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<History>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let history = state
        .message_service
        .history(chat_id, user_id, query.message_id)
        .await?;
    Ok(Json(history))
}
