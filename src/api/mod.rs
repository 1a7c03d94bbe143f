//! Management API exposed to core.
//!
//! Thin delegations to the Docker daemon behind signed-request
//! authentication; the watcher state is observable through `/v1/status`.

pub mod auth;
mod containers;
mod error;
mod images;
mod networks;
mod status;

pub use error::ApiError;

use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::sync::Arc;

use crate::watcher::EventWatcher;

pub struct AppState {
    pub watcher: EventWatcher,
    pub auth: auth::AuthConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/status", get(status::get_status))
        .route("/v1/watcher/restart", post(status::restart_watcher))
        .route(
            "/v1/containers",
            get(containers::list).post(containers::create),
        )
        .route(
            "/v1/containers/{id}",
            get(containers::inspect).delete(containers::remove),
        )
        .route("/v1/containers/{id}/start", post(containers::start))
        .route("/v1/containers/{id}/stop", post(containers::stop))
        .route("/v1/containers/{id}/restart", post(containers::restart))
        .route("/v1/images", get(images::list))
        .route("/v1/images/pull", post(images::pull))
        .route("/v1/images/{id}", delete(images::remove))
        .route("/v1/networks", get(networks::list).post(networks::create))
        .route("/v1/networks/{id}", delete(networks::remove))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_signature,
        ))
        .with_state(state)
}
