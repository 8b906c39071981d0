//! In-memory mock of the compute REST API.
//!
//! Serves the compute resources under `/compute/v2` in either list envelope
//! and the bulk admin endpoint under `/admin/bulk`. Servers move through
//! transitional statuses on a timer so pollers have something to observe.

pub mod routes;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, EnvelopeStyle, MockOptions};

/// Build the full mock router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compute = Router::new()
        // Servers
        .route("/servers", post(routes::servers::create_server))
        .route("/servers/detail", get(routes::servers::list_servers))
        .route(
            "/servers/{id}",
            get(routes::servers::get_server)
                .put(routes::servers::update_server)
                .delete(routes::servers::delete_server),
        )
        .route("/servers/{id}/action", post(routes::servers::server_action))
        .route("/servers/{id}/stats", get(routes::servers::server_stats))
        .route(
            "/servers/{id}/metadata/{key}",
            put(routes::servers::set_metadata).delete(routes::servers::delete_metadata),
        )
        // Catalog
        .route("/images/detail", get(routes::catalog::list_images))
        .route("/flavors/detail", get(routes::catalog::list_flavors))
        .route("/networks/detail", get(routes::catalog::list_networks))
        .route("/volumes/detail", get(routes::catalog::list_volumes))
        .route("/keys", get(routes::catalog::list_keys))
        .route("/quotas", get(routes::catalog::list_quotas))
        .route("/os-floating-ip-pools", get(routes::catalog::list_pools));

    Router::new()
        .nest("/compute/v2", compute)
        .route("/admin/bulk", post(routes::admin::bulk))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::require_token,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
