//! REST 路由（axum）
//!
//! 错误统一返回 `{"kind", "detail"}`：NotFound -> 404，AlreadyExists / InvalidTransition -> 409，
//! Validation -> 422。处理函数从不等待调度器。

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::api::dto::{CreateDeploymentRequest, ErrorBody, ListDeploymentsQuery, ListRunsQuery, UpdatePoolRequest};
use crate::api::{HealthStatus, LocalOrchestrator, OrchestrationApi};
use crate::core::{OrchestrationError, RunState, ValidationError};
use crate::store::{Deployment, DeploymentFilter, FlowRun, PoolSpec, RunFilter, RunRequest, WorkPool};

type AppState = Arc<LocalOrchestrator>;

/// 处理函数的错误类型
pub struct ApiError(OrchestrationError);

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        Self(err)
    }
}

/// 错误种类对应的 HTTP 状态码
pub fn status_for(err: &OrchestrationError) -> StatusCode {
    match err {
        OrchestrationError::NotFound { .. } => StatusCode::NOT_FOUND,
        OrchestrationError::AlreadyExists { .. } | OrchestrationError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        OrchestrationError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestrationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestrationError::Transport(_) => StatusCode::BAD_GATEWAY,
        OrchestrationError::Cancelled { .. } | OrchestrationError::UpstreamFailure { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// 构建路由；列表与创建路由同时接受带与不带结尾 `/` 的路径
pub fn create_router(api: AppState) -> Router {
    Router::new()
        .route("/api/work_pools/", get(list_pools).post(create_pool))
        .route("/api/work_pools", get(list_pools).post(create_pool))
        .route(
            "/api/work_pools/:name",
            get(get_pool).patch(update_pool).delete(delete_pool),
        )
        .route("/api/deployments/", get(list_deployments).post(create_deployment))
        .route("/api/deployments", get(list_deployments).post(create_deployment))
        .route("/api/deployments/:id", get(get_deployment))
        .route("/api/deployments/:id/create_flow_run", post(create_flow_run))
        .route("/api/flow_runs/", get(list_runs))
        .route("/api/flow_runs", get(list_runs))
        .route("/api/flow_runs/:id", get(get_run))
        .route("/api/flow_runs/:id/cancel", post(cancel_run))
        .route("/api/health", get(health))
        .with_state(api)
}

/// POST /api/work_pools/：名称重复返回 409
async fn create_pool(
    State(api): State<AppState>,
    Json(spec): Json<PoolSpec>,
) -> Result<(StatusCode, Json<WorkPool>), ApiError> {
    let pool = api.create_pool(spec).await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

async fn list_pools(State(api): State<AppState>) -> ApiResult<Vec<WorkPool>> {
    Ok(Json(api.list_pools().await?))
}

async fn get_pool(State(api): State<AppState>, Path(name): Path<String>) -> ApiResult<WorkPool> {
    Ok(Json(api.get_pool(&name).await?))
}

/// PATCH /api/work_pools/:name：{"status": "PAUSED"}
async fn update_pool(
    State(api): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<UpdatePoolRequest>,
) -> ApiResult<WorkPool> {
    Ok(Json(api.set_pool_status(&name, req.status).await?))
}

async fn delete_pool(State(api): State<AppState>, Path(name): Path<String>) -> ApiResult<WorkPool> {
    Ok(Json(api.remove_pool(&name).await?))
}

async fn create_deployment(
    State(api): State<AppState>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let (pool_name, spec) = req.into_parts();
    let deployment = api.create_deployment(&pool_name, spec).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn list_deployments(
    State(api): State<AppState>,
    Query(q): Query<ListDeploymentsQuery>,
) -> ApiResult<Vec<Deployment>> {
    let filter = DeploymentFilter { pool_id: q.work_pool_id };
    Ok(Json(api.list_deployments(&filter).await?))
}

async fn get_deployment(State(api): State<AppState>, Path(id): Path<String>) -> ApiResult<Deployment> {
    Ok(Json(api.get_deployment(&id).await?))
}

/// POST /api/deployments/:id/create_flow_run：请求体可选 {"parameters", "tags"}
async fn create_flow_run(
    State(api): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Result<(StatusCode, Json<FlowRun>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let run = api.submit_flow(&id, request).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(State(api): State<AppState>, Query(q): Query<ListRunsQuery>) -> ApiResult<Vec<FlowRun>> {
    let state = match q.state.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<RunState>()
                .map_err(|e| OrchestrationError::from(ValidationError::new(e)))?,
        ),
        None => None,
    };
    let filter = RunFilter {
        pool_id: q.work_pool_id,
        deployment_id: q.deployment_id,
        state,
    };
    Ok(Json(api.list_runs(&filter).await?))
}

async fn get_run(State(api): State<AppState>, Path(id): Path<String>) -> ApiResult<FlowRun> {
    Ok(Json(api.get_run(&id).await?))
}

/// POST /api/flow_runs/:id/cancel：已终态返回 409
async fn cancel_run(State(api): State<AppState>, Path(id): Path<String>) -> ApiResult<FlowRun> {
    Ok(Json(api.cancel_run(&id).await?))
}

async fn health(State(api): State<AppState>) -> ApiResult<HealthStatus> {
    Ok(Json(api.health().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::store::EntityStore;

    fn app() -> Router {
        create_router(Arc::new(LocalOrchestrator::new(Arc::new(EntityStore::new()))))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn flow_json() -> Value {
        json!({
            "name": "etl",
            "tasks": [
                {"id": "a", "name": "a", "binding": {"origin_server": "s", "tool_name": "a"}},
                {"id": "b", "name": "b", "binding": {"origin_server": "s", "tool_name": "b"}, "upstream": ["a"]}
            ]
        })
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let app = app();
        let (status, pool) = send(&app, Method::POST, "/api/work_pools/", Some(json!({"name": "default"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(pool["type"], "process");
        assert_eq!(pool["status"], "READY");

        let (status, err) = send(&app, Method::POST, "/api/work_pools/", Some(json!({"name": "default"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["kind"], "already_exists");

        let (status, pool) = send(
            &app,
            Method::PATCH,
            "/api/work_pools/default",
            Some(json!({"status": "PAUSED"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool["status"], "PAUSED");

        let (status, _) = send(&app, Method::DELETE, "/api/work_pools/default", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, err) = send(&app, Method::GET, "/api/work_pools/default", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_deploy_submit_and_cancel() {
        let app = app();
        send(&app, Method::POST, "/api/work_pools", Some(json!({"name": "default"}))).await;

        let (status, dep) = send(
            &app,
            Method::POST,
            "/api/deployments/",
            Some(json!({"work_pool_name": "default", "flow": flow_json()})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(dep["version"], 1);
        let dep_id = dep["id"].as_str().unwrap().to_string();

        let uri = format!("/api/deployments/{dep_id}/create_flow_run");
        let (status, run) = send(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run["state"], "SCHEDULED");
        let run_id = run["id"].as_str().unwrap().to_string();

        let (_, runs) = send(&app, Method::GET, "/api/flow_runs/?state=scheduled", None).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);

        let (status, run) = send(&app, Method::POST, &format!("/api/flow_runs/{run_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["cancel_requested"], true);

        let (status, health) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["counts"]["flow_runs"], 1);
    }

    #[tokio::test]
    async fn test_cyclic_flow_is_unprocessable() {
        let app = app();
        send(&app, Method::POST, "/api/work_pools/", Some(json!({"name": "default"}))).await;
        let mut flow = flow_json();
        flow["tasks"][0]["upstream"] = json!(["b"]);
        let (status, err) = send(
            &app,
            Method::POST,
            "/api/deployments/",
            Some(json!({"work_pool_name": "default", "flow": flow})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["kind"], "validation");
        assert_eq!(err["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_state_filter_and_unknown_run() {
        let app = app();
        let (status, err) = send(&app, Method::GET, "/api/flow_runs/?state=sleeping", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["kind"], "validation");

        let (status, _) = send(&app, Method::GET, "/api/flow_runs/run_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
