//! Cryptographic utilities for Callflow Server
//!
//! Only two things need keys here:
//! - Bearer tokens for the REST API and the realtime connection
//! - Time-limited TURN credentials

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use ring::hmac;

/// Issue a bearer token for `user_id`.
///
/// Format: `base64url(user_id).expires_at.hex(hmac_sha256(secret, prefix))`.
pub fn issue_token(user_id: &str, secret: &str, ttl_hours: i64) -> String {
    let expires_at = (Utc::now() + Duration::hours(ttl_hours)).timestamp();
    let payload = format!("{}.{}", URL_SAFE_NO_PAD.encode(user_id), expires_at);
    let signature = hmac::sign(&token_key(secret), payload.as_bytes());

    format!("{}.{}", payload, hex::encode(signature.as_ref()))
}

/// Returns the user id when the token is authentic and unexpired.
pub fn verify_token(token: &str, secret: &str) -> Option<String> {
    let mut parts = token.splitn(3, '.');
    let encoded_user = parts.next()?;
    let expires_at = parts.next()?;
    let signature = hex::decode(parts.next()?).ok()?;

    let payload = format!("{}.{}", encoded_user, expires_at);
    hmac::verify(&token_key(secret), payload.as_bytes(), &signature).ok()?;

    let expires_at: i64 = expires_at.parse().ok()?;
    if Utc::now().timestamp() > expires_at {
        return None;
    }

    let user_id = String::from_utf8(URL_SAFE_NO_PAD.decode(encoded_user).ok()?).ok()?;
    if user_id.is_empty() {
        return None;
    }
    Some(user_id)
}

fn token_key(secret: &str) -> hmac::Key {
    hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes())
}

/// Generate TURN credentials with time-limited validity
pub fn generate_turn_credentials(username: &str, secret: &str, ttl_seconds: u64) -> (String, String) {
    let timestamp = Utc::now().timestamp() as u64 + ttl_seconds;
    let turn_username = format!("{}:{}", timestamp, username);

    // HMAC-SHA1 is what TURN servers expect for the REST credential scheme
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let signature = hmac::sign(&key, turn_username.as_bytes());
    let turn_credential = base64::engine::general_purpose::STANDARD.encode(signature.as_ref());

    (turn_username, turn_credential)
}
