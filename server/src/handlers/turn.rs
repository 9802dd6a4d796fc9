//! TURN credentials handler for WebRTC

use axum::{extract::State, Json};
use crate::{
    crypto,
    error::{AppError, Result},
    models::TurnCredentialsResponse,
    AppState,
};

use super::AuthUser;

/// Time-limited TURN credentials bound to the caller's user id
pub async fn get_credentials(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<TurnCredentialsResponse>> {
    let turn_config = &state.config.turn;

    if !turn_config.enabled || turn_config.urls.is_empty() {
        return Err(AppError::NotFound("TURN relay is not configured".to_string()));
    }

    let (username, credential) = crypto::generate_turn_credentials(
        &auth.user_id,
        &turn_config.secret,
        turn_config.ttl_seconds,
    );

    Ok(Json(TurnCredentialsResponse {
        urls: turn_config.urls.clone(),
        username,
        credential,
        ttl: turn_config.ttl_seconds,
    }))
}
