//! 编排 API：实体存储操作的请求 / 响应边界
//!
//! - LocalOrchestrator：进程内实现，包装显式构造的 Arc<EntityStore>
//! - HttpOrchestrationClient：REST 客户端（reqwest）
//! - server：axum 路由（feature `server`）

pub mod client;
pub mod dto;
pub mod local;
#[cfg(feature = "server")]
pub mod server;

use async_trait::async_trait;

use crate::core::{PoolStatus, Result};
use crate::store::{
    Deployment, DeploymentFilter, DeploymentSpec, FlowRun, PoolSpec, RunFilter, RunRequest, WorkPool,
};

pub use client::HttpOrchestrationClient;
pub use dto::{CreateDeploymentRequest, ErrorBody, HealthStatus, UpdatePoolRequest};
pub use local::LocalOrchestrator;

/// 编排 API；工作池按名称寻址，部署与运行按 ID 寻址。读操作从不修改状态
#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    async fn create_pool(&self, spec: PoolSpec) -> Result<WorkPool>;

    async fn get_pool(&self, name: &str) -> Result<WorkPool>;

    async fn list_pools(&self) -> Result<Vec<WorkPool>>;

    async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<WorkPool>;

    async fn remove_pool(&self, name: &str) -> Result<WorkPool>;

    /// 在指定工作池中创建部署（流定义会重新校验）
    async fn create_deployment(&self, pool_name: &str, spec: DeploymentSpec) -> Result<Deployment>;

    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment>;

    async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>>;

    /// 提交运行：部署及其工作池必须存在；每次调用都创建新运行
    async fn submit_flow(&self, deployment_id: &str, request: RunRequest) -> Result<FlowRun>;

    async fn get_run(&self, run_id: &str) -> Result<FlowRun>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<FlowRun>>;

    /// 请求取消；运行已终态时返回 InvalidTransition
    async fn cancel_run(&self, run_id: &str) -> Result<FlowRun>;

    async fn health(&self) -> Result<HealthStatus>;
}
