//! REST 请求 / 响应体

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{EntityKind, ErrorKind, OrchestrationError, PoolStatus, RunState, ValidationError};
use crate::store::{DeploymentSpec, StoreStats};
use crate::workflow::FlowDefinition;

/// PATCH /api/work_pools/:name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePoolRequest {
    pub status: PoolStatus,
}

/// POST /api/deployments/
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub work_pool_name: String,
    #[serde(default)]
    pub name: String,
    pub flow: FlowDefinition,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CreateDeploymentRequest {
    pub fn new(work_pool_name: impl Into<String>, spec: DeploymentSpec) -> Self {
        Self {
            work_pool_name: work_pool_name.into(),
            name: spec.name,
            flow: spec.flow,
            parameters: spec.parameters,
            tags: spec.tags,
            description: spec.description,
        }
    }

    pub fn into_parts(self) -> (String, DeploymentSpec) {
        let spec = DeploymentSpec {
            name: self.name,
            flow: self.flow,
            parameters: self.parameters,
            tags: self.tags,
            description: self.description,
        };
        (self.work_pool_name, spec)
    }
}

/// GET /api/deployments/ 查询参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDeploymentsQuery {
    #[serde(default)]
    pub work_pool_id: Option<String>,
}

/// GET /api/flow_runs/ 查询参数；state 大小写不敏感
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub work_pool_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// GET /api/health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub counts: StoreStats,
    pub timestamp: i64,
}

/// 错误响应体：`kind` + `detail`，附带可选的上下文字段以便客户端还原错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<RunState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl From<&OrchestrationError> for ErrorBody {
    fn from(err: &OrchestrationError) -> Self {
        let mut body = ErrorBody {
            kind: err.kind(),
            detail: err.to_string(),
            entity: None,
            id: None,
            from: None,
            to: None,
            nodes: Vec::new(),
        };
        match err {
            OrchestrationError::NotFound { kind, id } => {
                body.entity = Some(*kind);
                body.id = Some(id.clone());
            }
            OrchestrationError::AlreadyExists { kind, name } => {
                body.entity = Some(*kind);
                body.id = Some(name.clone());
            }
            OrchestrationError::InvalidTransition { run_id, from, to } => {
                body.id = Some(run_id.clone());
                body.from = Some(*from);
                body.to = Some(*to);
            }
            OrchestrationError::Validation(v) => {
                body.detail = v.message.clone();
                body.nodes = v.nodes.clone();
            }
            OrchestrationError::Timeout { run_id, .. }
            | OrchestrationError::Cancelled { run_id, .. }
            | OrchestrationError::UpstreamFailure { run_id, .. } => body.id = Some(run_id.clone()),
            OrchestrationError::Transport(_) => {}
        }
        body
    }
}

impl ErrorBody {
    /// 还原为 OrchestrationError；上下文缺失时退化为 Transport
    pub fn into_error(self) -> OrchestrationError {
        match (self.kind, self.entity, self.id, self.from, self.to) {
            (ErrorKind::NotFound, Some(kind), Some(id), _, _) => OrchestrationError::NotFound { kind, id },
            (ErrorKind::AlreadyExists, Some(kind), Some(name), _, _) => {
                OrchestrationError::AlreadyExists { kind, name }
            }
            (ErrorKind::InvalidTransition, _, Some(run_id), Some(from), Some(to)) => {
                OrchestrationError::InvalidTransition { run_id, from, to }
            }
            (ErrorKind::Validation, ..) => ValidationError::with_nodes(self.detail, self.nodes).into(),
            (ErrorKind::Cancelled, _, Some(run_id), _, _) => OrchestrationError::Cancelled {
                run_id,
                detail: self.detail,
            },
            (ErrorKind::UpstreamFailure, _, Some(run_id), _, _) => OrchestrationError::UpstreamFailure {
                run_id,
                detail: self.detail,
            },
            (kind, ..) => OrchestrationError::Transport(format!("{kind:?}: {}", self.detail)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_restores_typed_errors() {
        let errors = vec![
            OrchestrationError::not_found(EntityKind::Deployment, "dep_1"),
            OrchestrationError::AlreadyExists {
                kind: EntityKind::WorkPool,
                name: "default".into(),
            },
            OrchestrationError::InvalidTransition {
                run_id: "run_1".into(),
                from: RunState::Completed,
                to: RunState::Cancelled,
            },
            ValidationError::with_nodes("cyclic dependency detected: a -> b -> a", vec!["a".into(), "b".into()]).into(),
        ];
        for err in errors {
            let body = ErrorBody::from(&err);
            let wire = serde_json::to_string(&body).unwrap();
            let back: ErrorBody = serde_json::from_str(&wire).unwrap();
            assert_eq!(back.into_error().to_string(), err.to_string());
        }
    }

    #[test]
    fn test_error_body_wire_shape() {
        let body = ErrorBody::from(&OrchestrationError::not_found(EntityKind::FlowRun, "run_x"));
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["kind"], "not_found");
        assert_eq!(v["detail"], "flow run 'run_x' not found");
        assert!(v.get("nodes").is_none());
    }

    #[test]
    fn test_malformed_body_becomes_transport() {
        let body: ErrorBody = serde_json::from_str(r#"{"kind": "not_found", "detail": "gone"}"#).unwrap();
        assert!(body.into_error().is_transient());
    }
}
