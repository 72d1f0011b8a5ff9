//! REST API handlers.
//!
//! Each handler calls one manager operation and returns a JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fleet_core::NodePool;
use fleetgrid_manager::{Code, ManagerError, render_prometheus};
use fleetgrid_state::{ClusterSnapshot, K8sContext, ManifestState, Workflow};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub fn status_for(code: Code) -> StatusCode {
    match code {
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::Aborted => StatusCode::CONFLICT,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn manager_error(err: ManagerError) -> Response {
    let status = status_for(err.code());
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "manager operation failed");
    }
    error_response(&err.to_string(), status)
}

/// Body carrying the new config version.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionResponse {
    pub version: u64,
}

// ── Configs ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Comma-separated manifest states.
    pub state: Option<String>,
}

fn parse_states(filter: Option<&str>) -> Result<Vec<ManifestState>, String> {
    filter
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ManifestState>())
        .collect()
}

/// GET /api/v1/configs
pub async fn list_configs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let states = match parse_states(query.state.as_deref()) {
        Ok(states) => states,
        Err(e) => return error_response(&e, StatusCode::BAD_REQUEST),
    };
    match state.manager.list_configs(&states) {
        Ok(configs) => ApiResponse::ok(configs).into_response(),
        Err(e) => manager_error(e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertRequest {
    pub name: String,
    /// Raw manifest text.
    pub manifest: String,
    #[serde(default)]
    pub k8s_ctx: K8sContext,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertResponse {
    pub name: String,
    pub version: u64,
}

/// POST /api/v1/configs
pub async fn upsert_manifest(
    State(state): State<ApiState>,
    Json(req): Json<UpsertRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .upsert_manifest(&req.name, &req.manifest, req.k8s_ctx)
        .await
    {
        Ok((name, version)) => ApiResponse::ok(UpsertResponse { name, version }).into_response(),
        Err(e) => manager_error(e),
    }
}

/// GET /api/v1/configs/{name}
pub async fn get_config(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_config(&name) {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => manager_error(e),
    }
}

/// DELETE /api/v1/configs/{name}
pub async fn mark_for_deletion(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.manager.mark_for_deletion(&name).await {
        Ok(version) => ApiResponse::ok(VersionResponse { version }).into_response(),
        Err(e) => manager_error(e),
    }
}

// ── Tasks ──────────────────────────────────────────────────────

/// POST /api/v1/tasks/next
pub async fn next_task(State(state): State<ApiState>) -> impl IntoResponse {
    match state.manager.next_task().await {
        Ok(task) => ApiResponse::ok(task).into_response(),
        Err(e) => manager_error(e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskUpdateRequest {
    pub task_id: String,
    pub version: u64,
    pub workflow: Workflow,
}

/// POST /api/v1/configs/{name}/clusters/{cluster}/task
pub async fn task_update(
    State(state): State<ApiState>,
    Path((name, cluster)): Path<(String, String)>,
    Json(req): Json<TaskUpdateRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .task_update(&name, &cluster, &req.task_id, req.version, req.workflow)
        .await
    {
        Ok(version) => ApiResponse::ok(VersionResponse { version }).into_response(),
        Err(e) => manager_error(e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentStateRequest {
    pub version: u64,
    pub current: ClusterSnapshot,
}

/// PUT /api/v1/configs/{name}/clusters/{cluster}/current
pub async fn update_current_state(
    State(state): State<ApiState>,
    Path((name, cluster)): Path<(String, String)>,
    Json(req): Json<CurrentStateRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .update_current_state(&name, &cluster, req.version, req.current)
        .await
    {
        Ok(version) => ApiResponse::ok(VersionResponse { version }).into_response(),
        Err(e) => manager_error(e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodePoolRequest {
    pub version: u64,
    pub nodepool: NodePool,
}

/// PUT /api/v1/configs/{name}/clusters/{cluster}/nodepools
pub async fn update_nodepool(
    State(state): State<ApiState>,
    Path((name, cluster)): Path<(String, String)>,
    Json(req): Json<NodePoolRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .update_nodepool(&name, &cluster, req.version, req.nodepool)
        .await
    {
        Ok(version) => ApiResponse::ok(VersionResponse { version }).into_response(),
        Err(e) => manager_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let configs = state.manager.configs_by_state().unwrap_or_default();
    let body = render_prometheus(&state.manager.metrics().snapshot(), &configs);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetgrid_manager::{Manager, ManagerConfig, ManagerMetrics};
    use fleetgrid_state::StateStore;

    const MANIFEST: &str = r#"
name: infra
providers:
  - name: hetzner-1
    kind: hetzner
    credentials:
      token: secret
nodePools:
  dynamic:
    - name: control
      provider: hetzner-1
      region: nbg1
      zone: nbg1-dc3
      count: 1
      serverType: cpx11
      image: ubuntu-22.04
kubernetes:
  clusters:
    - name: dev
      version: v1.29.0
      network: 192.168.2.0/24
      pools:
        control: [control]
        compute: []
"#;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let manager = Manager::new(store, ManagerConfig::default(), Arc::new(ManagerMetrics::new()));
        ApiState {
            manager: Arc::new(manager),
        }
    }

    fn upsert(name: &str) -> UpsertRequest {
        UpsertRequest {
            name: name.to_string(),
            manifest: MANIFEST.to_string(),
            k8s_ctx: K8sContext::default(),
        }
    }

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(status_for(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(Code::Aborted), StatusCode::CONFLICT);
        assert_eq!(status_for(Code::FailedPrecondition), StatusCode::PRECONDITION_FAILED);
        assert_eq!(status_for(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn state_filter_parsing() {
        assert_eq!(parse_states(None).unwrap(), Vec::<ManifestState>::new());
        assert_eq!(
            parse_states(Some("pending, done")).unwrap(),
            vec![ManifestState::Pending, ManifestState::Done]
        );
        assert!(parse_states(Some("pending,bogus")).is_err());
    }

    #[tokio::test]
    async fn list_configs_empty() {
        let state = test_state();
        let resp = list_configs(State(state), Query(ListQuery::default())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_configs_rejects_unknown_state() {
        let state = test_state();
        let query = ListQuery {
            state: Some("sideways".to_string()),
        };
        let resp = list_configs(State(state), Query(query)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upsert_and_get_config() {
        let state = test_state();
        let resp = upsert_manifest(State(state.clone()), Json(upsert("infra"))).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_config(State(state), Path("infra".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upsert_empty_manifest_is_bad_request() {
        let state = test_state();
        let mut req = upsert("infra");
        req.manifest.clear();
        let resp = upsert_manifest(State(state), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_nonexistent_config() {
        let state = test_state();
        let resp = get_config(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_nonexistent_config() {
        let state = test_state();
        let resp = mark_for_deletion(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn next_task_with_empty_queue() {
        let state = test_state();
        let resp = next_task(State(state)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stale_task_update_conflicts() {
        let state = test_state();
        upsert_manifest(State(state.clone()), Json(upsert("infra"))).await;

        let req = TaskUpdateRequest {
            task_id: "t".to_string(),
            version: 42,
            workflow: Workflow::default(),
        };
        let resp = task_update(
            State(state),
            Path(("infra".to_string(), "dev".to_string())),
            Json(req),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn nodepool_update_on_pending_config_fails_precondition() {
        let state = test_state();
        upsert_manifest(State(state.clone()), Json(upsert("infra"))).await;

        let pool: NodePool = serde_json::from_value(serde_json::json!({
            "name": "control-abcdefg",
            "is_control": true,
            "kind": { "type": "static", "node_keys": {} }
        }))
        .unwrap();
        let req = NodePoolRequest {
            version: 0,
            nodepool: pool,
        };
        let resp = update_nodepool(
            State(state),
            Path(("infra".to_string(), "dev".to_string())),
            Json(req),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
