pub mod admin;
pub mod catalog;
pub mod servers;

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::state::AppState;

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            error: format!("{} not found", what.into()),
            code: 404,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: 409,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: 400,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Reject requests without the configured `X-Auth-Token`.
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = &state.options.token {
        let given = request
            .headers()
            .get("X-Auth-Token")
            .and_then(|v| v.to_str().ok());
        if given != Some(token.as_str()) {
            return ApiError {
                error: "invalid token".to_string(),
                code: 401,
            }
            .into_response();
        }
    }
    next.run(request).await
}
