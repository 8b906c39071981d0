//! `POST /admin/bulk`

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub op: String,
    pub target: String,
    pub ids: Vec<String>,
    pub subject: Option<String>,
    pub text: Option<String>,
}

/// Apply `op` to every id of `target`.
///
/// Replies `{result, error_ids}`; ids that do not exist are reported in
/// `error_ids` with status 400. Op `fail` simulates a backend crash (500)
/// and malformed requests get a plain-text 400.
pub async fn bulk(State(state): State<AppState>, Json(req): Json<BulkRequest>) -> Response {
    info!("admin {} on {} {:?}", req.op, req.target, req.ids);

    if req.op == "fail" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "backend unavailable").into_response();
    }
    if req.op == "contact" && (req.subject.is_none() || req.text.is_none()) {
        return (StatusCode::BAD_REQUEST, "contact needs subject and text").into_response();
    }

    let mut inner = state.inner.write().await;
    let mut error_ids = Vec::new();
    for id in &req.ids {
        let known = match req.target.as_str() {
            "vm" => match id.parse::<u64>().ok().and_then(|id| inner.servers.get_mut(&id)) {
                Some(server) if server.status != "DELETED" => {
                    match req.op.as_str() {
                        "suspend" => server.status = "STOPPED".to_string(),
                        "resume" => server.status = "ACTIVE".to_string(),
                        _ => {}
                    }
                    server.touch();
                    true
                }
                _ => false,
            },
            "user" => match inner.users.get_mut(id) {
                Some(enabled) => {
                    match req.op.as_str() {
                        "suspend" => *enabled = false,
                        "resume" => *enabled = true,
                        _ => {}
                    }
                    true
                }
                None => false,
            },
            _ => false,
        };
        if !known {
            error_ids.push(id.clone());
        }
    }

    let (status, result) = if error_ids.is_empty() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::BAD_REQUEST, "partial")
    };
    (
        status,
        Json(json!({ "result": result, "error_ids": error_ids })),
    )
        .into_response()
}
