use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use tracing::instrument;

use super::{AppState, AuthUser};
use crate::error::ApiError;
use crate::models::{
    AppendHistoryRequest, ChatLogEntry, ChatSession, DeleteSessionRequest, RenameSessionRequest,
    SessionLogQuery,
};

#[instrument(skip(state), fields(user = %user.email))]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<ChatSession>>, ApiError> {
    Ok(Json(state.history.list(&user.email).await?))
}

#[instrument(skip(state, req), fields(user = %user.email, session = %req.session_id))]
pub async fn append_entry(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<AppendHistoryRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .history
        .append(&user.email, &req.session_id, req.entry)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, req), fields(user = %user.email, session = %req.id))]
pub async fn rename_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<RenameSessionRequest>,
) -> Result<StatusCode, ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    state.history.rename(&user.email, &req.id, title).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, req), fields(user = %user.email, session = %req.id))]
pub async fn delete_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<DeleteSessionRequest>,
) -> Result<StatusCode, ApiError> {
    state.history.delete(&user.email, &req.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, query), fields(user = %user.email, session = %query.session_id))]
pub async fn session_log(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SessionLogQuery>,
) -> Result<Json<Vec<ChatLogEntry>>, ApiError> {
    Ok(Json(state.history.log(&user.email, &query.session_id).await?))
}
