//! pipegrid-api: REST API for authoring desired state.
//!
//! Provides axum route handlers over the state store. Writes land in the
//! store, where the orchestrator's watcher picks them up.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pipelines` | List all pipeline versions |
//! | GET | `/api/v1/pipelines/{id}/versions` | List versions of one pipeline |
//! | GET | `/api/v1/pipelines/{id}/versions/{version}` | Get one version |
//! | PUT | `/api/v1/pipelines/{id}/versions/{version}` | Create or update a version |
//! | DELETE | `/api/v1/pipelines/{id}/versions/{version}` | Delete a version |
//! | GET | `/api/v1/blobs/{key}` | Fetch a blob |
//! | PUT | `/api/v1/blobs/{key}` | Store a blob |
//!
//! Blob keys usually contain `/` and must be percent-encoded in the path.

pub mod handlers;

use axum::Router;
use axum::routing::get;
use pipegrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    /// Key prefix pipeline versions are written under.
    pub prefix: String,
}

/// Build the API router.
pub fn build_router(store: StateStore, prefix: &str) -> Router {
    let api_state = ApiState {
        store,
        prefix: prefix.to_string(),
    };

    let api_routes = Router::new()
        .route("/pipelines", get(handlers::list_pipelines))
        .route("/pipelines/{id}/versions", get(handlers::list_versions))
        .route(
            "/pipelines/{id}/versions/{version}",
            get(handlers::get_version)
                .put(handlers::put_version)
                .delete(handlers::delete_version),
        )
        .route("/blobs/{key}", get(handlers::get_blob).put(handlers::put_blob))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
