//! fleetgrid-api: REST API for the fleetgrid manager.
//!
//! Manifest sources upsert and delete configs; builder workers claim tasks,
//! report progress and persist the state they built; the cluster
//! autoscaler resizes nodepools.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/configs?state=pending,done` | List configs |
//! | POST | `/api/v1/configs` | Upsert a manifest |
//! | GET | `/api/v1/configs/{name}` | Get a config |
//! | DELETE | `/api/v1/configs/{name}` | Mark a config for deletion |
//! | POST | `/api/v1/tasks/next` | Claim the next task |
//! | POST | `/api/v1/configs/{name}/clusters/{cluster}/task` | Report task progress |
//! | PUT | `/api/v1/configs/{name}/clusters/{cluster}/current` | Persist built state |
//! | PUT | `/api/v1/configs/{name}/clusters/{cluster}/nodepools` | Autoscaler resize |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Errors map onto HTTP status by [`fleetgrid_manager::Code`]: NotFound 404,
//! Aborted 409, FailedPrecondition 412, InvalidArgument 400, Internal 500.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use fleetgrid_manager::Manager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<Manager>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(manager: Arc<Manager>) -> Router {
    let api_state = ApiState { manager };

    let api_routes = Router::new()
        .route("/configs", get(handlers::list_configs).post(handlers::upsert_manifest))
        .route("/configs/{name}", get(handlers::get_config).delete(handlers::mark_for_deletion))
        .route("/configs/{name}/clusters/{cluster}/task", post(handlers::task_update))
        .route("/configs/{name}/clusters/{cluster}/current", put(handlers::update_current_state))
        .route("/configs/{name}/clusters/{cluster}/nodepools", put(handlers::update_nodepool))
        .route("/tasks/next", post(handlers::next_task))
        .with_state(api_state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(api_state))
}
