use crate::AppState;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

/// `?token=` query parameter shared by the /api endpoints.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Constant response for a missing or wrong token.
pub fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})))
}

/// A token matches only when one is configured and equal.
pub fn token_ok(state: &AppState, provided: Option<&str>) -> bool {
    !state.api_token.is_empty() && provided == Some(state.api_token.as_str())
}

/// Convert an internal error into a generic 500 response, logging the
/// real error.
pub fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
}
