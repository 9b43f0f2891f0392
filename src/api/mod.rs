//! Control-plane HTTP interface: container commands and session attach/detach.

pub mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::lxc::Lxc;
use crate::registry::SessionRegistry;

pub use handlers::API_VERSION;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub lxc: Arc<Lxc>,
}

pub fn router(state: AppState) -> Router {
    use handlers::*;

    let containers_routes = Router::new()
        .route("/version", get(lxc_version))
        .route("/apiversion", get(api_version))
        .route("/containers", get(containers))
        .route("/container/{name}", get(container_info))
        .route("/container/{name}/start", post(container_start))
        .route("/container/{name}/stop", post(container_stop))
        .route("/container/{name}/freeze", post(container_freeze))
        .route("/container/{name}/unfreeze", post(container_unfreeze))
        .route("/add/container", post(container_create))
        .route("/del/container", post(container_destroy));

    let session_routes = Router::new()
        .route("/container/{name}/attach", get(attach))
        .route("/container/{name}/isattach", get(is_attach))
        .route("/container/{name}/detach", get(detach))
        .route("/sessions", get(sessions));

    Router::new()
        .route("/health", get(health))
        .merge(containers_routes)
        .merge(session_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
}
