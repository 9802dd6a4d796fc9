//! Call-log handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;

use crate::{
    error::{AppError, Result},
    models::*,
    storage::StatusChange,
    AppState,
};

use super::AuthUser;

/// `POST /api/v1/calls/start`: the caller opens a ringing row before any signaling.
pub async fn start_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<StartCallRequest>,
) -> Result<(StatusCode, Json<CallLog>)> {
    if req.room_id.trim().is_empty() {
        return Err(AppError::BadRequest("roomId is required".to_string()));
    }
    if req.receiver_id.trim().is_empty() {
        return Err(AppError::BadRequest("receiverId is required".to_string()));
    }
    if req.receiver_id == auth.user_id {
        return Err(AppError::BadRequest("Cannot call yourself".to_string()));
    }

    let call = state.storage.create_call(&auth.user_id, &req).await?;

    tracing::info!(
        "Call {} started: {} -> {} ({})",
        call.id,
        call.caller_id,
        call.receiver_id,
        call.call_type
    );

    Ok((StatusCode::CREATED, Json(call)))
}

/// `PATCH /api/v1/calls/:call_id/status`
pub async fn update_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<i64>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<CallLog>> {
    if req.status == CallLogStatus::Ringing {
        return Err(AppError::BadRequest("Calls cannot be moved back to ringing".to_string()));
    }
    if matches!(req.duration, Some(d) if d < 0) {
        return Err(AppError::BadRequest("duration must not be negative".to_string()));
    }

    let call = state
        .storage
        .get_call(call_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Call {}", call_id)))?;

    if !call.is_participant(&auth.user_id) {
        return Err(AppError::Forbidden);
    }

    let updated = match state
        .storage
        .update_call_status(call_id, req.status, req.duration)
        .await?
    {
        StatusChange::Applied(updated) => updated,
        StatusChange::NotFound => return Err(AppError::NotFound(format!("Call {}", call_id))),
        StatusChange::Rejected { current } => {
            return Err(AppError::Conflict(format!(
                "Call {} is {} and cannot become {}",
                call_id,
                current,
                req.status.as_str()
            )));
        }
    };

    tracing::info!("Call {} is now {} (reported by {})", call_id, updated.status, auth.user_id);

    let notification = WsServerMessage::Notification(json!({
        "event": "call_status",
        "callId": updated.id,
        "status": updated.status,
    }));
    for participant in [&updated.caller_id, &updated.receiver_id] {
        state.ws_manager.send_to_user(participant, notification.clone());
    }

    Ok(Json(updated))
}

/// `GET /api/v1/calls`: the user's call history, newest first
pub async fn list_calls(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListCallsQuery>,
) -> Result<Json<Vec<CallLog>>> {
    let max = state.config.limits.max_call_history;
    let limit = query.limit.unwrap_or(50).clamp(1, max.max(1));

    let calls = state.storage.list_calls_for_user(&auth.user_id, limit).await?;
    Ok(Json(calls))
}
