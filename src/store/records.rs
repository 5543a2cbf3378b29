//! 实体记录：工作池、部署、流运行
//!
//! 时间戳均为毫秒（`chrono::Utc::now().timestamp_millis()`）。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{OrchestrationError, PoolStatus, RunState, TaskRunState};
use crate::workflow::{FlowDefinition, TaskId};

pub type PoolId = String;
pub type DeploymentId = String;
pub type RunId = String;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}

/// 工作池
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPool {
    pub id: PoolId,
    pub name: String,
    /// 执行环境类别：process / docker / kubernetes ...
    #[serde(rename = "type")]
    pub pool_type: String,
    #[serde(default)]
    pub description: String,
    /// 仅回显，模拟器不限制并发
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    pub status: PoolStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 创建工作池的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_pool_type")]
    pub pool_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
}

fn default_pool_type() -> String {
    "process".to_string()
}

impl PoolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool_type: default_pool_type(),
            description: String::new(),
            concurrency_limit: None,
        }
    }

    pub fn with_type(mut self, pool_type: impl Into<String>) -> Self {
        self.pool_type = pool_type.into();
        self
    }
}

/// 部署：流定义与工作池的不可变绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    /// 同一工作池内同名部署的版本号，从 1 开始
    pub version: u32,
    pub pool_id: PoolId,
    pub flow: FlowDefinition,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub created_at: i64,
}

/// 创建部署的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// 为空时使用 `<flow 名>_deployment`
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

impl DeploymentSpec {
    pub fn new(flow: FlowDefinition) -> Self {
        Self {
            name: String::new(),
            flow,
            parameters: Map::new(),
            tags: Vec::new(),
            description: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// 提交运行时附带的参数与标签
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 状态变迁记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RunState,
    pub message: String,
    pub timestamp: i64,
}

/// 单个任务的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub name: String,
    pub state: TaskRunState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: i64,
}

/// 流运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: RunId,
    pub deployment_id: DeploymentId,
    pub pool_id: PoolId,
    pub flow_name: String,
    pub state: RunState,
    /// 状态变迁日志（首条为 SCHEDULED）
    pub history: Vec<StateTransition>,
    /// 进入 RUNNING 时确定的执行顺序
    #[serde(default)]
    pub execution_order: Vec<TaskId>,
    #[serde(default)]
    pub task_runs: Vec<TaskRun>,
    /// FAILED / CANCELLED 时的错误详情
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: i64,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    /// 正在执行（锁外）的任务；仅调度器使用
    #[serde(skip)]
    pub(crate) in_flight: Option<TaskId>,
}

impl FlowRun {
    pub(crate) fn new(deployment: &Deployment, request: RunRequest) -> Self {
        let now = now_millis();
        let mut parameters = deployment.parameters.clone();
        parameters.extend(request.parameters);

        let mut tags = deployment.tags.clone();
        for tag in request.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        Self {
            id: new_id("run"),
            deployment_id: deployment.id.clone(),
            pool_id: deployment.pool_id.clone(),
            flow_name: deployment.flow.name.clone(),
            state: RunState::Scheduled,
            history: vec![StateTransition {
                state: RunState::Scheduled,
                message: "Run scheduled".to_string(),
                timestamp: now,
            }],
            execution_order: Vec::new(),
            task_runs: Vec::new(),
            error: None,
            parameters,
            tags,
            cancel_requested: false,
            created_at: now,
            start_time: None,
            end_time: None,
            in_flight: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn task_run(&self, task_id: &str) -> Option<&TaskRun> {
        self.task_runs.iter().find(|t| t.task_id == task_id)
    }

    /// 最近一条状态消息
    pub fn message(&self) -> &str {
        self.history.last().map(|h| h.message.as_str()).unwrap_or_default()
    }

    /// 按状态机推进；非法变迁返回 InvalidTransition 且不修改记录
    pub(crate) fn transition(
        &mut self,
        to: RunState,
        message: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        if !self.state.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        let message = message.into();
        let now = now_millis();
        match to {
            RunState::Running => self.start_time = Some(now),
            RunState::Failed | RunState::Cancelled => {
                self.error = Some(message.clone());
                self.end_time = Some(now);
            }
            RunState::Completed => self.end_time = Some(now),
            _ => {}
        }
        self.state = to;
        self.history.push(StateTransition {
            state: to,
            message,
            timestamp: now,
        });
        Ok(())
    }
}

/// 流运行的列表过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub pool_id: Option<PoolId>,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub state: Option<RunState>,
}

impl RunFilter {
    pub fn matches(&self, run: &FlowRun) -> bool {
        self.pool_id.as_ref().map_or(true, |p| &run.pool_id == p)
            && self
                .deployment_id
                .as_ref()
                .map_or(true, |d| &run.deployment_id == d)
            && self.state.map_or(true, |s| run.state == s)
    }
}

/// 部署的列表过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentFilter {
    #[serde(default)]
    pub pool_id: Option<PoolId>,
}

/// 实体计数（健康检查用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub work_pools: usize,
    pub deployments: usize,
    pub flow_runs: usize,
    pub active_runs: usize,
}
