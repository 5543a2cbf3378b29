//! 流运行器：确保工作池 -> 部署 -> 提交 -> 轮询至终态
//!
//! 轮询使用指数退避（有上限）；超时后发送一次尽力而为的取消请求并返回 Timeout。
//! 只有轮询调用会重试，且只重试 Transport 类错误。

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::api::OrchestrationApi;
use crate::config::RunnerSection;
use crate::core::{OrchestrationError, Result, RunState};
use crate::store::{Deployment, DeploymentSpec, FlowRun, PoolSpec, RunRequest, WorkPool};
use crate::workflow::FlowDefinition;

/// 运行器配置
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub backoff_factor: f64,
    /// 等待终态的总时长
    pub timeout: Duration,
    /// 连续 Transport 失败的最大重试次数
    pub max_poll_failures: u32,
    /// ensure_pool 新建工作池时使用的类型
    pub pool_type: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&RunnerSection::default())
    }
}

impl From<&RunnerSection> for RunnerConfig {
    fn from(section: &RunnerSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms.max(1)),
            max_poll_interval: Duration::from_millis(section.max_poll_interval_ms.max(section.poll_interval_ms)),
            backoff_factor: section.backoff_factor.max(1.0),
            timeout: Duration::from_secs(section.timeout_secs),
            max_poll_failures: section.max_poll_failures,
            pool_type: section.pool_type.clone(),
        }
    }
}

impl RunnerConfig {
    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor).min(self.max_poll_interval)
    }
}

/// ensure_pool 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAction {
    Created,
    Existing,
}

#[derive(Debug, Clone)]
pub struct EnsuredPool {
    pub pool: WorkPool,
    pub action: PoolAction,
}

/// run_flow 成功时的完整记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub pool: WorkPool,
    pub deployment: Deployment,
    pub run: FlowRun,
}

/// 流运行器
pub struct FlowRunner {
    api: Arc<dyn OrchestrationApi>,
    config: RunnerConfig,
}

impl FlowRunner {
    pub fn new(api: Arc<dyn OrchestrationApi>, config: RunnerConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// 确保工作池存在；已存在（包括并发创建导致的 AlreadyExists）视为成功
    pub async fn ensure_pool(&self, name: &str) -> Result<EnsuredPool> {
        match self.api.get_pool(name).await {
            Ok(pool) => {
                tracing::debug!("Work pool '{}' already exists", name);
                return Ok(EnsuredPool {
                    pool,
                    action: PoolAction::Existing,
                });
            }
            Err(OrchestrationError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let spec = PoolSpec::new(name).with_type(self.config.pool_type.clone());
        match self.api.create_pool(spec).await {
            Ok(pool) => {
                tracing::info!("Work pool '{}' created with type '{}'", name, pool.pool_type);
                Ok(EnsuredPool {
                    pool,
                    action: PoolAction::Created,
                })
            }
            Err(OrchestrationError::AlreadyExists { .. }) => Ok(EnsuredPool {
                pool: self.api.get_pool(name).await?,
                action: PoolAction::Existing,
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn deploy(&self, pool_name: &str, spec: DeploymentSpec) -> Result<Deployment> {
        let deployment = self.api.create_deployment(pool_name, spec).await?;
        tracing::info!(
            "Deployment '{}' v{} ({}) created on pool '{}'",
            deployment.name,
            deployment.version,
            deployment.id,
            pool_name
        );
        Ok(deployment)
    }

    pub async fn submit(&self, deployment_id: &str, request: RunRequest) -> Result<FlowRun> {
        let run = self.api.submit_flow(deployment_id, request).await?;
        tracing::info!("Flow run {} submitted for deployment {}", run.id, deployment_id);
        Ok(run)
    }

    /// 轮询直至终态：COMPLETED 返回运行记录，FAILED -> UpstreamFailure，CANCELLED -> Cancelled
    pub async fn wait_for_terminal(&self, run_id: &str) -> Result<FlowRun> {
        let started = Instant::now();
        let mut delay = self.config.poll_interval;
        let mut failures = 0u32;
        let mut last_state: Option<RunState> = None;

        loop {
            match self.api.get_run(run_id).await {
                Ok(run) => {
                    failures = 0;
                    if last_state != Some(run.state) {
                        tracing::debug!("Run {} is {}", run_id, run.state);
                        last_state = Some(run.state);
                    }
                    if run.is_terminal() {
                        return outcome(run);
                    }
                }
                Err(e) if e.is_transient() && failures < self.config.max_poll_failures => {
                    failures += 1;
                    tracing::warn!(
                        "Polling run {} failed ({}/{}): {}",
                        run_id,
                        failures,
                        self.config.max_poll_failures,
                        e
                    );
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                self.cancel_after_timeout(run_id).await;
                return Err(OrchestrationError::Timeout {
                    run_id: run_id.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay.min(self.config.timeout - elapsed)).await;
            delay = self.config.next_delay(delay);
        }
    }

    async fn cancel_after_timeout(&self, run_id: &str) {
        match self.api.cancel_run(run_id).await {
            Ok(_) => tracing::info!("Run {} timed out, cancellation requested", run_id),
            // 运行恰好已终态
            Err(OrchestrationError::InvalidTransition { .. }) => {
                tracing::debug!("Run {} reached a terminal state before cancellation", run_id)
            }
            Err(e) => tracing::warn!("Failed to cancel timed out run {}: {}", run_id, e),
        }
    }

    /// 确保工作池 -> 部署 -> 提交 -> 等待终态
    pub async fn run_flow(&self, pool_name: &str, flow: FlowDefinition, request: RunRequest) -> Result<RunReport> {
        let ensured = self.ensure_pool(pool_name).await?;
        let deployment = self.deploy(pool_name, DeploymentSpec::new(flow)).await?;
        let run = self.submit(&deployment.id, request).await?;
        let run = self.wait_for_terminal(&run.id).await?;
        Ok(RunReport {
            pool: ensured.pool,
            deployment,
            run,
        })
    }

    /// 状态流：每观察到一次状态变化产出一次运行记录，终态后结束；
    /// 错误（Transport 重试耗尽或其他错误）产出一次后结束。不设超时
    pub fn status_stream(&self, run_id: &str) -> impl Stream<Item = Result<FlowRun>> + Send + 'static {
        let config = self.config.clone();
        let init = PollState {
            api: Arc::clone(&self.api),
            run_id: run_id.to_string(),
            last: None,
            delay: config.poll_interval,
            failures: 0,
            first: true,
            done: false,
        };
        stream::unfold(init, move |mut st| {
            let config = config.clone();
            async move {
                if st.done {
                    return None;
                }
                loop {
                    if !st.first {
                        tokio::time::sleep(st.delay).await;
                        st.delay = config.next_delay(st.delay);
                    }
                    st.first = false;
                    match st.api.get_run(&st.run_id).await {
                        Ok(run) => {
                            st.failures = 0;
                            if st.last != Some(run.state) {
                                st.last = Some(run.state);
                                st.done = run.is_terminal();
                                st.delay = config.poll_interval;
                                return Some((Ok(run), st));
                            }
                        }
                        Err(e) if e.is_transient() && st.failures < config.max_poll_failures => {
                            st.failures += 1;
                        }
                        Err(e) => {
                            st.done = true;
                            return Some((Err(e), st));
                        }
                    }
                }
            }
        })
    }
}

struct PollState {
    api: Arc<dyn OrchestrationApi>,
    run_id: String,
    last: Option<RunState>,
    delay: Duration,
    failures: u32,
    first: bool,
    done: bool,
}

fn outcome(run: FlowRun) -> Result<FlowRun> {
    match run.state {
        RunState::Failed => Err(OrchestrationError::UpstreamFailure {
            run_id: run.id.clone(),
            detail: run.error.unwrap_or_else(|| "run failed".to_string()),
        }),
        RunState::Cancelled => Err(OrchestrationError::Cancelled {
            run_id: run.id.clone(),
            detail: run.error.unwrap_or_else(|| "run cancelled".to_string()),
        }),
        _ => Ok(run),
    }
}
