//! 实体存储（内存版）
//!
//! 工作池 / 部署按创建顺序存放在 RwLock<Vec<_>> 中；每个流运行有独立的 Mutex，
//! 状态读-改-写只持有该运行的锁。枚举运行时先在读锁下拷贝句柄，再逐个加锁，
//! 因此调度 tick 不会阻塞其它运行的 API 读取。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::core::{EntityKind, OrchestrationError, PoolStatus, Result, RunState, ValidationError};
use crate::store::records::*;
use crate::workflow::TaskId;

/// 单个流运行的共享句柄
pub type RunHandle = Arc<Mutex<FlowRun>>;

#[derive(Default)]
struct RunIndex {
    order: Vec<RunId>,
    by_id: HashMap<RunId, RunHandle>,
}

/// 实体存储：显式构造并以 Arc 形式交给 API 层与调度器
#[derive(Default)]
pub struct EntityStore {
    pools: RwLock<Vec<WorkPool>>,
    deployments: RwLock<Vec<Arc<Deployment>>>,
    runs: RwLock<RunIndex>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- 工作池 ----

    /// 创建工作池；名称唯一
    pub async fn create_pool(&self, spec: PoolSpec) -> Result<WorkPool> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ValidationError::new("work pool name must not be empty").into());
        }

        let mut pools = self.pools.write().await;
        if pools.iter().any(|p| p.name == name) {
            return Err(OrchestrationError::AlreadyExists {
                kind: EntityKind::WorkPool,
                name: name.to_string(),
            });
        }

        let now = now_millis();
        let pool = WorkPool {
            id: new_id("pool"),
            name: name.to_string(),
            pool_type: spec.pool_type,
            description: spec.description,
            concurrency_limit: spec.concurrency_limit,
            status: PoolStatus::Ready,
            created_at: now,
            updated_at: now,
        };
        pools.push(pool.clone());
        tracing::info!("Created work pool: {} ({})", pool.name, pool.id);
        Ok(pool)
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<WorkPool> {
        self.pools
            .read()
            .await
            .iter()
            .find(|p| p.id == pool_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::not_found(EntityKind::WorkPool, pool_id))
    }

    /// 按名称查找；名称与创建时一样去掉首尾空白
    pub async fn find_pool_by_name(&self, name: &str) -> Result<WorkPool> {
        let trimmed = name.trim();
        self.pools
            .read()
            .await
            .iter()
            .find(|p| p.name == trimmed)
            .cloned()
            .ok_or_else(|| OrchestrationError::not_found(EntityKind::WorkPool, name))
    }

    pub async fn list_pools(&self) -> Vec<WorkPool> {
        self.pools.read().await.clone()
    }

    /// 切换工作池状态（READY / PAUSED）
    pub async fn set_pool_status(&self, pool_id: &str, status: PoolStatus) -> Result<WorkPool> {
        let mut pools = self.pools.write().await;
        let pool = pools
            .iter_mut()
            .find(|p| p.id == pool_id)
            .ok_or_else(|| OrchestrationError::not_found(EntityKind::WorkPool, pool_id))?;
        if pool.status != status {
            pool.status = status;
            pool.updated_at = now_millis();
            tracing::info!("Work pool {} is now {:?}", pool.name, status);
        }
        Ok(pool.clone())
    }

    /// 删除工作池；引用它的部署保留，但之后无法再提交运行
    pub async fn remove_pool(&self, pool_id: &str) -> Result<WorkPool> {
        let mut pools = self.pools.write().await;
        let idx = pools
            .iter()
            .position(|p| p.id == pool_id)
            .ok_or_else(|| OrchestrationError::not_found(EntityKind::WorkPool, pool_id))?;
        let pool = pools.remove(idx);
        tracing::info!("Removed work pool: {} ({})", pool.name, pool.id);
        Ok(pool)
    }

    // ---- 部署 ----

    /// 创建部署：校验工作池存在、流定义合法；同名部署递增版本号
    pub async fn create_deployment(&self, pool_id: &str, spec: DeploymentSpec) -> Result<Deployment> {
        self.get_pool(pool_id).await?;
        spec.flow.validate()?;

        let name = if spec.name.trim().is_empty() {
            format!("{}_deployment", spec.flow.name)
        } else {
            spec.name.trim().to_string()
        };

        let mut deployments = self.deployments.write().await;
        let version = deployments
            .iter()
            .filter(|d| d.pool_id == pool_id && d.name == name)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;

        let deployment = Deployment {
            id: new_id("dep"),
            name,
            version,
            pool_id: pool_id.to_string(),
            description: spec
                .description
                .or_else(|| spec.flow.description.clone())
                .unwrap_or_default(),
            flow: spec.flow,
            parameters: spec.parameters,
            tags: spec.tags,
            created_at: now_millis(),
        };
        deployments.push(Arc::new(deployment.clone()));
        tracing::info!(
            "Created deployment: {} v{} -> pool {} ({} tasks)",
            deployment.name,
            deployment.version,
            deployment.pool_id,
            deployment.flow.tasks.len()
        );
        Ok(deployment)
    }

    pub(crate) async fn deployment_handle(&self, deployment_id: &str) -> Result<Arc<Deployment>> {
        self.deployments
            .read()
            .await
            .iter()
            .find(|d| d.id == deployment_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::not_found(EntityKind::Deployment, deployment_id))
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        self.deployment_handle(deployment_id)
            .await
            .map(|d| Deployment::clone(&d))
    }

    pub async fn list_deployments(&self, filter: &DeploymentFilter) -> Vec<Deployment> {
        self.deployments
            .read()
            .await
            .iter()
            .filter(|d| filter.pool_id.as_ref().map_or(true, |p| &d.pool_id == p))
            .map(|d| Deployment::clone(d))
            .collect()
    }

    // ---- 流运行 ----

    /// 创建流运行（SCHEDULED）；部署及其工作池都必须存在
    pub async fn create_run(&self, deployment_id: &str, request: RunRequest) -> Result<FlowRun> {
        let deployment = self.deployment_handle(deployment_id).await?;
        self.get_pool(&deployment.pool_id).await?;

        let run = FlowRun::new(&deployment, request);
        let snapshot = run.clone();

        let mut runs = self.runs.write().await;
        runs.order.push(run.id.clone());
        runs.by_id.insert(run.id.clone(), Arc::new(Mutex::new(run)));
        drop(runs);

        tracing::info!(
            "Created flow run: {} for deployment {}",
            snapshot.id,
            deployment_id
        );
        Ok(snapshot)
    }

    pub(crate) async fn run_handle(&self, run_id: &str) -> Result<RunHandle> {
        self.runs
            .read()
            .await
            .by_id
            .get(run_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::not_found(EntityKind::FlowRun, run_id))
    }

    /// 按创建顺序拷贝所有运行句柄（不持有存储锁）
    pub(crate) async fn run_handles(&self) -> Vec<RunHandle> {
        let runs = self.runs.read().await;
        runs.order
            .iter()
            .filter_map(|id| runs.by_id.get(id).cloned())
            .collect()
    }

    pub async fn get_run(&self, run_id: &str) -> Result<FlowRun> {
        let handle = self.run_handle(run_id).await?;
        let run = handle.lock().await;
        Ok(run.clone())
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Vec<FlowRun> {
        let mut out = Vec::new();
        for handle in self.run_handles().await {
            let run = handle.lock().await;
            if filter.matches(&run) {
                out.push(run.clone());
            }
        }
        out
    }

    /// 部署流定义的执行顺序（拓扑序，同层按定义位置）
    pub(crate) async fn execution_order(&self, deployment_id: &str) -> Result<Vec<TaskId>> {
        let deployment = self.deployment_handle(deployment_id).await?;
        Ok(deployment.flow.execution_order()?)
    }

    /// 按状态机更新运行状态；进入 RUNNING 时同时确定执行顺序
    pub async fn update_run_state(
        &self,
        run_id: &str,
        new_state: RunState,
        detail: Option<String>,
    ) -> Result<FlowRun> {
        let handle = self.run_handle(run_id).await?;
        let mut run = handle.lock().await;
        if new_state == RunState::Running && run.state.can_transition_to(RunState::Running) {
            run.execution_order = self.execution_order(&run.deployment_id).await?;
        }
        let message = detail.unwrap_or_else(|| format!("Moved to {new_state}"));
        run.transition(new_state, message)?;
        tracing::debug!("Run {} -> {}", run.id, run.state);
        Ok(run.clone())
    }

    /// 请求取消：只设置标记，由调度器在下一次 tick 生效。已终态的运行返回 InvalidTransition。
    pub async fn request_cancel(&self, run_id: &str) -> Result<FlowRun> {
        let handle = self.run_handle(run_id).await?;
        let mut run = handle.lock().await;
        if run.is_terminal() {
            return Err(OrchestrationError::InvalidTransition {
                run_id: run.id.clone(),
                from: run.state,
                to: RunState::Cancelled,
            });
        }
        if !run.cancel_requested {
            run.cancel_requested = true;
            tracing::info!("Cancellation requested for run {} (state {})", run.id, run.state);
        }
        Ok(run.clone())
    }

    pub async fn stats(&self) -> StoreStats {
        let work_pools = self.pools.read().await.len();
        let deployments = self.deployments.read().await.len();
        let handles = self.run_handles().await;
        let mut active_runs = 0;
        for handle in &handles {
            if !handle.lock().await.is_terminal() {
                active_runs += 1;
            }
        }
        StoreStats {
            work_pools,
            deployments,
            flow_runs: handles.len(),
            active_runs,
        }
    }
}
