//! REST tests for the mock compute API.

mod common;

use cirrus_mock::{EnvelopeStyle, MockOptions};
use serde_json::{Value, json};
use std::time::Duration;

async fn server_status(server: &common::TestServer, id: u64) -> String {
    let body: Value = server
        .get(&format!("/servers/{}", id))
        .await
        .json()
        .await
        .unwrap();
    body["server"]["status"].as_str().unwrap().to_string()
}

// =============================================================================
// Listings
// =============================================================================

#[tokio::test]
async fn test_list_servers_current_envelope() {
    let server = common::TestServer::spawn().await;

    let response = server.get("/servers/detail").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let servers = body["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers[0]["flavor"]["id"], 2);
    assert!(servers[0]["metadata"]["role"].is_string());

    server.shutdown().await;
}

#[tokio::test]
async fn test_list_servers_legacy_envelope() {
    let server = common::TestServer::spawn_with(MockOptions {
        envelope: EnvelopeStyle::Legacy,
        ..MockOptions::default()
    })
    .await;

    let body: Value = server.get("/servers/detail").await.json().await.unwrap();
    let servers = body["servers"]["values"].as_array().unwrap();
    assert_eq!(servers.len(), 3);
    assert!(servers[0]["metadata"]["values"].is_object());

    server.shutdown().await;
}

#[tokio::test]
async fn test_catalog_listings() {
    let server = common::TestServer::spawn().await;

    let body: Value = server.get("/flavors/detail").await.json().await.unwrap();
    assert_eq!(body["flavors"].as_array().unwrap().len(), 4);

    let body: Value = server.get("/keys").await.json().await.unwrap();
    assert_eq!(body["keypairs"][0]["keypair"]["name"], "laptop");

    let body: Value = server.get("/os-floating-ip-pools").await.json().await.unwrap();
    assert_eq!(body["floating_ip_pools"][0]["name"], "public");

    let body: Value = server.get("/quotas").await.json().await.unwrap();
    let vm = body["quotas"]
        .as_array()
        .unwrap()
        .iter()
        .find(|q| q["resource"] == "vm")
        .unwrap()
        .clone();
    assert_eq!(vm["usage"], 3);
    assert_eq!(vm["limit"], 10);

    server.shutdown().await;
}

#[tokio::test]
async fn test_changes_since() {
    let server = common::TestServer::spawn().await;
    let since = chrono::Utc::now() + chrono::Duration::seconds(1);

    let response = server
        .get(&format!("/servers/detail?changes-since={}", since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
        .await;
    assert_eq!(response.status(), 304);

    let response = server.get("/servers/detail?changes-since=yesterday").await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

// =============================================================================
// Server lifecycle
// =============================================================================

#[tokio::test]
async fn test_reboot_goes_through_transient_status() {
    let server = common::TestServer::spawn().await;

    let response = server.post_json("/servers/1/action", &json!({"reboot": {}})).await;
    assert_eq!(response.status(), 202);
    assert_eq!(server_status(&server, 1).await, "REBOOT");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server_status(&server, 1).await, "ACTIVE");

    server.shutdown().await;
}

#[tokio::test]
async fn test_action_in_wrong_status_conflicts() {
    let server = common::TestServer::spawn().await;

    // server 3 is stopped
    let response = server.post_json("/servers/3/action", &json!({"shutdown": {}})).await;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], 409);

    let response = server.post_json("/servers/3/action", &json!({"explode": {}})).await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

#[tokio::test]
async fn test_injected_failure_is_consumed() {
    let server = common::TestServer::spawn().await;
    server.state.fail_next_action(1, 503).await;

    let response = server.post_json("/servers/1/action", &json!({"reboot": {}})).await;
    assert_eq!(response.status(), 503);

    let response = server.post_json("/servers/1/action", &json!({"reboot": {}})).await;
    assert_eq!(response.status(), 202);

    server.shutdown().await;
}

#[tokio::test]
async fn test_console() {
    let server = common::TestServer::spawn().await;

    let response = server
        .post_json("/servers/1/action", &json!({"console": {"type": "vnc"}}))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["console"]["type"], "vnc");
    assert!(body["console"]["url"].is_string());

    server.shutdown().await;
}

#[tokio::test]
async fn test_destroy_leaves_tombstone_for_delta() {
    let server = common::TestServer::spawn().await;
    let before = chrono::Utc::now() - chrono::Duration::seconds(1);

    let response = server.delete("/servers/2").await;
    assert_eq!(response.status(), 204);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = server.get("/servers/2").await;
    assert_eq!(response.status(), 404);

    let body: Value = server.get("/servers/detail").await.json().await.unwrap();
    assert_eq!(body["servers"].as_array().unwrap().len(), 2);

    let body: Value = server
        .get(&format!("/servers/detail?changes-since={}", before.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
        .await
        .json()
        .await
        .unwrap();
    let deleted: Vec<&Value> = body["servers"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| s["status"] == "DELETED")
        .collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0]["id"], 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_create_rename_and_metadata() {
    let server = common::TestServer::spawn().await;

    let response = server
        .post_json(
            "/servers",
            &json!({"server": {"name": "batch", "imageRef": "101", "flavorRef": "1"}}),
        )
        .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["server"]["status"], "BUILD");
    let id = body["server"]["id"].as_u64().unwrap();

    let response = server
        .put_json(&format!("/servers/{}", id), &json!({"server": {"name": "batch-2"}}))
        .await;
    assert_eq!(response.status(), 200);

    let response = server
        .put_json(
            &format!("/servers/{}/metadata/owner", id),
            &json!({"meta": {"owner": "ops"}}),
        )
        .await;
    assert_eq!(response.status(), 200);

    let body: Value = server.get(&format!("/servers/{}", id)).await.json().await.unwrap();
    assert_eq!(body["server"]["name"], "batch-2");
    assert_eq!(body["server"]["metadata"]["owner"], "ops");

    let response = server.delete(&format!("/servers/{}/metadata/owner", id)).await;
    assert_eq!(response.status(), 204);
    let response = server.delete(&format!("/servers/{}/metadata/owner", id)).await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn test_create_with_unknown_flavor() {
    let server = common::TestServer::spawn().await;

    let response = server
        .post_json(
            "/servers",
            &json!({"server": {"name": "x", "imageRef": "101", "flavorRef": "99"}}),
        )
        .await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

// =============================================================================
// Auth and admin
// =============================================================================

#[tokio::test]
async fn test_token_required() {
    let server = common::TestServer::spawn_with(MockOptions {
        token: Some("secret".to_string()),
        ..MockOptions::default()
    })
    .await;

    let response = server.get("/servers/detail").await;
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(format!("{}/servers/detail", server.base_url()))
        .header("X-Auth-Token", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_admin_bulk() {
    let server = common::TestServer::spawn().await;
    let url = format!("http://{}/admin/bulk", server.addr);

    let response = server
        .client
        .post(&url)
        .json(&json!({"op": "suspend", "target": "vm", "ids": ["1", "77"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_ids"], json!(["77"]));
    assert_eq!(server_status(&server, 1).await, "STOPPED");

    let response = server
        .client
        .post(&url)
        .json(&json!({"op": "fail", "target": "vm", "ids": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    server.shutdown().await;
}
