use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use tracing::info;
use uuid::Uuid;

use super::ApiError;
use crate::state::{AppState, Server};

/// `GET /servers/detail[?changes-since=<rfc3339>]`
///
/// With `changes-since`, only servers updated after that instant are listed,
/// deleted ones included, and an empty delta answers `304`.
pub async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let envelope = state.envelope();
    let inner = state.inner.read().await;

    let since = match query.get("changes-since") {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ApiError::bad_request(format!("invalid changes-since: {}", raw)))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let servers: Vec<Value> = match since {
        Some(since) => inner
            .servers
            .values()
            .filter(|s| s.updated >= since)
            .map(|s| s.to_json(envelope))
            .collect(),
        None => inner.live_servers().map(|s| s.to_json(envelope)).collect(),
    };

    if since.is_some() && servers.is_empty() {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    Ok(Json(envelope.wrap("servers", servers)).into_response())
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let inner = state.inner.read().await;
    inner
        .live_servers()
        .find(|s| s.id == id)
        .map(|s| Json(json!({ "server": s.to_json(state.envelope()) })))
        .ok_or_else(|| ApiError::not_found(format!("server {}", id)))
}

#[derive(Deserialize)]
pub struct CreateServerRequest {
    server: NewServer,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewServer {
    name: String,
    image_ref: String,
    flavor_ref: String,
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<CreateServerRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut inner = state.inner.write().await;

    let flavor = req
        .server
        .flavor_ref
        .parse::<u64>()
        .ok()
        .filter(|id| inner.flavors.contains_key(id))
        .ok_or_else(|| ApiError::bad_request("unknown flavorRef"))?;
    let image = req
        .server
        .image_ref
        .parse::<u64>()
        .ok()
        .filter(|id| inner.images.contains_key(id))
        .ok_or_else(|| ApiError::bad_request("unknown imageRef"))?;

    let id = inner.allocate_id();
    let now = Utc::now();
    let server = Server {
        id,
        name: req.server.name,
        status: "BUILD".to_string(),
        flavor,
        image,
        metadata: BTreeMap::new(),
        floating_ips: Vec::new(),
        firewall: BTreeMap::new(),
        created: now,
        updated: now,
    };
    let body = json!({ "server": server.to_json(state.envelope()) });
    info!("server {} '{}' created", id, server.name);
    inner.servers.insert(id, server);
    drop(inner);

    state.settle(id, "ACTIVE");
    Ok((StatusCode::ACCEPTED, Json(body)))
}

/// `DELETE /servers/{id}`: the server lingers as `DELETED` so that
/// `changes-since` polls can report it.
pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let mut inner = state.inner.write().await;
    take_failure(&mut inner.failures, id)?;
    let server = inner
        .servers
        .get_mut(&id)
        .filter(|s| s.status != "DELETED")
        .ok_or_else(|| ApiError::not_found(format!("server {}", id)))?;
    info!("server {} '{}' destroyed", id, server.name);
    drop(inner);

    state.settle(id, "DELETED");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct UpdateServerRequest {
    server: UpdateServer,
}

#[derive(Deserialize)]
struct UpdateServer {
    name: Option<String>,
}

/// `PUT /servers/{id}` (rename)
pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<UpdateServerRequest>,
) -> Result<Json<Value>, ApiError> {
    let envelope = state.envelope();
    let mut inner = state.inner.write().await;
    take_failure(&mut inner.failures, id)?;
    let server = live_server(&mut inner.servers, id)?;
    if let Some(name) = req.server.name {
        server.name = name;
        server.touch();
    }
    Ok(Json(json!({ "server": server.to_json(envelope) })))
}

/// `POST /servers/{id}/action` with a single-key body naming the action.
pub async fn server_action(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let (action, args) = body
        .as_object()
        .filter(|obj| obj.len() == 1)
        .and_then(|obj| obj.iter().next())
        .map(|(k, v)| (k.clone(), v.clone()))
        .ok_or_else(|| ApiError::bad_request("expected one action"))?;

    let mut inner = state.inner.write().await;
    take_failure(&mut inner.failures, id)?;
    let server = live_server(&mut inner.servers, id)?;
    let status = server.status.clone();
    info!("server {}: {} (status {})", id, action, status);

    let settle_to = match (action.as_str(), status.as_str()) {
        ("start", "STOPPED") => Some("ACTIVE"),
        ("shutdown", "ACTIVE") => Some("STOPPED"),
        ("reboot", "ACTIVE") => {
            server.status = "REBOOT".to_string();
            server.touch();
            Some("ACTIVE")
        }
        ("resize", "STOPPED") => {
            let flavor = args
                .get("flavorRef")
                .and_then(id_arg)
                .ok_or_else(|| ApiError::bad_request("resize needs flavorRef"))?;
            server.flavor = flavor;
            server.status = "RESIZE".to_string();
            server.touch();
            Some("STOPPED")
        }
        ("console", "ACTIVE") => {
            let console = json!({
                "console": {
                    "type": "vnc",
                    "url": format!("https://console.example.invalid/vnc/{}", Uuid::new_v4()),
                    "password": Uuid::new_v4().simple().to_string(),
                }
            });
            return Ok(Json(console).into_response());
        }
        ("addFloatingIp", _) => {
            let address = string_arg(&args, "address")?;
            if !server.floating_ips.contains(&address) {
                server.floating_ips.push(address);
            }
            server.touch();
            None
        }
        ("removeFloatingIp", _) => {
            let address = string_arg(&args, "address")?;
            server.floating_ips.retain(|a| *a != address);
            server.touch();
            None
        }
        ("firewallProfile", _) => {
            let nic = string_arg(&args, "nic")?;
            let profile = string_arg(&args, "profile")?;
            server.firewall.insert(nic, profile);
            server.touch();
            None
        }
        ("start" | "shutdown" | "reboot" | "resize" | "console", _) => {
            return Err(ApiError::conflict(format!(
                "cannot {} server in status {}",
                action, status
            )));
        }
        (other, _) => return Err(ApiError::bad_request(format!("unknown action {}", other))),
    };
    drop(inner);

    if let Some(target) = settle_to {
        state.settle(id, target);
    }
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Deserialize)]
pub struct MetadataRequest {
    meta: BTreeMap<String, String>,
}

/// `PUT /servers/{id}/metadata/{key}`
pub async fn set_metadata(
    State(state): State<AppState>,
    Path((id, key)): Path<(u64, String)>,
    Json(req): Json<MetadataRequest>,
) -> Result<Json<Value>, ApiError> {
    let value = req
        .meta
        .get(&key)
        .cloned()
        .ok_or_else(|| ApiError::bad_request(format!("body must set '{}'", key)))?;
    let mut inner = state.inner.write().await;
    take_failure(&mut inner.failures, id)?;
    let server = live_server(&mut inner.servers, id)?;
    server.metadata.insert(key.clone(), value.clone());
    server.touch();
    Ok(Json(json!({ "meta": { key: value } })))
}

/// `DELETE /servers/{id}/metadata/{key}`
pub async fn delete_metadata(
    State(state): State<AppState>,
    Path((id, key)): Path<(u64, String)>,
) -> Result<StatusCode, ApiError> {
    let mut inner = state.inner.write().await;
    take_failure(&mut inner.failures, id)?;
    let server = live_server(&mut inner.servers, id)?;
    server
        .metadata
        .remove(&key)
        .ok_or_else(|| ApiError::not_found(format!("metadata key {}", key)))?;
    server.touch();
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /servers/{id}/stats`
pub async fn server_stats(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let inner = state.inner.read().await;
    let server = inner
        .live_servers()
        .find(|s| s.id == id)
        .ok_or_else(|| ApiError::not_found(format!("server {}", id)))?;

    let running = server.status == "ACTIVE";
    let mut rng = rand::thread_rng();
    let mut sample = |max: f64| -> Vec<f64> {
        (0..8)
            .map(|_| if running { rng.gen_range(0.0..max) } else { 0.0 })
            .collect()
    };
    Ok(Json(json!({
        "stats": {
            "serverRef": id,
            "cpuBar": sample(100.0),
            "netBar": sample(1000.0),
            "refresh": 60,
        }
    })))
}

fn live_server(
    servers: &mut BTreeMap<u64, Server>,
    id: u64,
) -> Result<&mut Server, ApiError> {
    servers
        .get_mut(&id)
        .filter(|s| s.status != "DELETED")
        .ok_or_else(|| ApiError::not_found(format!("server {}", id)))
}

/// Consume an injected failure for `id`.
fn take_failure(failures: &mut HashMap<u64, u16>, id: u64) -> Result<(), ApiError> {
    match failures.remove(&id) {
        Some(code) => Err(ApiError {
            error: format!("injected failure for server {}", id),
            code,
        }),
        None => Ok(()),
    }
}

fn string_arg(args: &Value, name: &str) -> Result<String, ApiError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request(format!("missing '{}'", name)))
}

fn id_arg(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
