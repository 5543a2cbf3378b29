//! 进程内编排 API

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{HealthStatus, OrchestrationApi};
use crate::core::{PoolStatus, Result};
use crate::store::records::now_millis;
use crate::store::{
    Deployment, DeploymentFilter, DeploymentSpec, EntityStore, FlowRun, PoolSpec, RunFilter, RunRequest,
    WorkPool,
};

/// 直接调用实体存储的编排 API
#[derive(Clone)]
pub struct LocalOrchestrator {
    store: Arc<EntityStore>,
}

impl LocalOrchestrator {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }
}

#[async_trait]
impl OrchestrationApi for LocalOrchestrator {
    async fn create_pool(&self, spec: PoolSpec) -> Result<WorkPool> {
        self.store.create_pool(spec).await
    }

    async fn get_pool(&self, name: &str) -> Result<WorkPool> {
        self.store.find_pool_by_name(name).await
    }

    async fn list_pools(&self) -> Result<Vec<WorkPool>> {
        Ok(self.store.list_pools().await)
    }

    async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<WorkPool> {
        let pool = self.store.find_pool_by_name(name).await?;
        self.store.set_pool_status(&pool.id, status).await
    }

    async fn remove_pool(&self, name: &str) -> Result<WorkPool> {
        let pool = self.store.find_pool_by_name(name).await?;
        self.store.remove_pool(&pool.id).await
    }

    async fn create_deployment(&self, pool_name: &str, spec: DeploymentSpec) -> Result<Deployment> {
        let pool = self.store.find_pool_by_name(pool_name).await?;
        self.store.create_deployment(&pool.id, spec).await
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        self.store.get_deployment(deployment_id).await
    }

    async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        Ok(self.store.list_deployments(filter).await)
    }

    async fn submit_flow(&self, deployment_id: &str, request: RunRequest) -> Result<FlowRun> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        self.store.get_pool(&deployment.pool_id).await?;
        self.store.create_run(deployment_id, request).await
    }

    async fn get_run(&self, run_id: &str) -> Result<FlowRun> {
        self.store.get_run(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<FlowRun>> {
        Ok(self.store.list_runs(filter).await)
    }

    async fn cancel_run(&self, run_id: &str) -> Result<FlowRun> {
        self.store.request_cancel(run_id).await
    }

    async fn health(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            status: "ok".to_string(),
            counts: self.store.stats().await,
            timestamp: now_millis(),
        })
    }
}
