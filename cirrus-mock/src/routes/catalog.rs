//! Read-only listings: images, flavors, networks, volumes, keys, quotas and
//! floating IP pools.

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn list_images(State(state): State<AppState>) -> Json<Value> {
    let envelope = state.envelope();
    let inner = state.inner.read().await;
    let images = inner.images.values().map(|i| i.to_json(envelope)).collect();
    Json(envelope.wrap("images", images))
}

pub async fn list_flavors(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    let flavors = inner
        .flavors
        .values()
        .map(|f| {
            json!({
                "id": f.id,
                "name": f.name,
                "vcpus": f.vcpus,
                "ram": f.ram,
                "disk": f.disk,
            })
        })
        .collect();
    Json(state.envelope().wrap("flavors", flavors))
}

pub async fn list_networks(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    let networks = inner
        .networks
        .values()
        .map(|n| serde_json::to_value(n).unwrap_or(Value::Null))
        .collect();
    Json(state.envelope().wrap("networks", networks))
}

pub async fn list_volumes(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    let volumes = inner
        .volumes
        .values()
        .map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
        .collect();
    Json(state.envelope().wrap("volumes", volumes))
}

/// Keys come wrapped per record: `{"keypair": {...}}`.
pub async fn list_keys(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    let keys = inner
        .keypairs
        .values()
        .map(|k| json!({ "keypair": k }))
        .collect();
    Json(state.envelope().wrap("keypairs", keys))
}

pub async fn list_quotas(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    Json(state.envelope().wrap("quotas", inner.quotas()))
}

pub async fn list_pools(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    let pools = inner.pools.iter().map(|name| json!({ "name": name })).collect();
    Json(state.envelope().wrap("floating_ip_pools", pools))
}
