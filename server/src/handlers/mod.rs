//! HTTP request handlers for Callflow Server

pub mod calls;
pub mod health;
pub mod turn;
pub mod websocket;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use crate::{crypto, error::AppError, AppState};

/// Authenticated user context extracted from request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        // Extract Authorization header
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;

        // Parse "Bearer <token>"
        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized)?;

        let user_id = crypto::verify_token(token, &state.config.auth.token_secret)
            .ok_or(AppError::Unauthorized)?;

        Ok(AuthUser { user_id })
    }
}
