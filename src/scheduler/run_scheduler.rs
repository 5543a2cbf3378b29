//! 运行调度器
//!
//! 每次 tick 把每个未终结的运行推进一步：
//! SCHEDULED -> PENDING（工作池暂停时不动）-> RUNNING（确定执行顺序）-> 逐个执行任务 -> COMPLETED / FAILED。
//! 取消请求优先于正常推进。
//!
//! 同一次 tick 内各运行并发推进，慢任务不会拖住其它运行。任务在运行锁之外执行；
//! tick() 可被并发调用（后台循环之外还有手动驱动），in_flight 标记保证同一运行
//! 同时只有一个任务在执行。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::{PoolStatus, RunState, TaskRunState};
use crate::scheduler::executor::{TaskExecutor, TaskInputs};
use crate::store::records::now_millis;
use crate::store::{Deployment, EntityStore, FlowRun, RunHandle, TaskRun};
use crate::workflow::DependencyGraph;

/// 单次 tick 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// 发生状态变迁的运行数
    pub transitions: usize,
    /// 执行的任务数
    pub tasks_executed: usize,
}

/// 运行调度器
pub struct RunScheduler {
    store: Arc<EntityStore>,
    executor: Arc<dyn TaskExecutor>,
    tasks_per_tick: usize,
}

impl RunScheduler {
    pub fn new(store: Arc<EntityStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            store,
            executor,
            tasks_per_tick: 1,
        }
    }

    /// 每次 tick 每个运行最多执行的任务数（至少 1）
    pub fn with_tasks_per_tick(mut self, n: usize) -> Self {
        self.tasks_per_tick = n.max(1);
        self
    }

    /// 启动后台循环，直到 token 被取消
    pub fn spawn(self: Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // 跳过启动后立即触发的一次
            tracing::info!("Run scheduler started, tick every {:?}", period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Run scheduler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.tick().await;
                        if report != TickReport::default() {
                            tracing::debug!(
                                "tick: {} transitions, {} tasks executed",
                                report.transitions,
                                report.tasks_executed
                            );
                        }
                    }
                }
            }
        })
    }

    /// 推进所有运行一步；每个运行单独加锁，从不持有整个存储的锁
    pub async fn tick(&self) -> TickReport {
        let handles = self.store.run_handles().await;
        join_all(handles.iter().map(|handle| self.advance(handle)))
            .await
            .into_iter()
            .fold(TickReport::default(), |acc, r| TickReport {
                transitions: acc.transitions + r.transitions,
                tasks_executed: acc.tasks_executed + r.tasks_executed,
            })
    }

    async fn advance(&self, handle: &RunHandle) -> TickReport {
        let mut report = TickReport::default();
        self.step(handle, &mut report).await;
        report
    }

    async fn step(&self, handle: &RunHandle, report: &mut TickReport) {
        let mut run = handle.lock().await;
        if run.is_terminal() || run.in_flight.is_some() {
            return;
        }

        if run.cancel_requested {
            if run.transition(RunState::Cancelled, "Cancelled by request").is_ok() {
                tracing::info!("Flow run {} cancelled", run.id);
                report.transitions += 1;
            }
            return;
        }

        match run.state {
            RunState::Scheduled => {
                if self.pool_paused(&run.pool_id).await {
                    tracing::debug!("Run {} held: pool {} is paused", run.id, run.pool_id);
                    return;
                }
                if run.transition(RunState::Pending, "Waiting for worker").is_ok() {
                    report.transitions += 1;
                }
            }
            RunState::Pending => {
                match self.store.execution_order(&run.deployment_id).await {
                    Ok(order) => {
                        run.execution_order = order;
                        if run.transition(RunState::Running, "Executing tasks").is_ok() {
                            report.transitions += 1;
                        }
                    }
                    Err(e) => {
                        let detail = e.to_string();
                        // 部署在创建时已校验，这里只在数据被破坏时发生
                        let _ = run.transition(RunState::Running, "Executing tasks");
                        let _ = run.transition(RunState::Failed, format!("cannot plan execution: {detail}"));
                        tracing::warn!("Flow run {} failed before executing: {}", run.id, detail);
                        report.transitions += 1;
                    }
                }
            }
            RunState::Running => {
                if run.task_runs.len() >= run.execution_order.len() {
                    if run.transition(RunState::Completed, "All tasks finished").is_ok() {
                        tracing::info!("Flow run {} completed", run.id);
                        report.transitions += 1;
                    }
                    return;
                }
                let deployment = match self.store.deployment_handle(&run.deployment_id).await {
                    Ok(dep) => dep,
                    Err(e) => {
                        let _ = run.transition(RunState::Failed, e.to_string());
                        report.transitions += 1;
                        return;
                    }
                };
                drop(run);
                self.execute_tasks(handle, &deployment, report).await;
            }
            _ => {}
        }
    }

    /// 按执行顺序执行至多 tasks_per_tick 个任务；任务失败则运行直接 FAILED
    async fn execute_tasks(&self, handle: &RunHandle, deployment: &Deployment, report: &mut TickReport) {
        for _ in 0..self.tasks_per_tick {
            let (task, inputs) = {
                let mut run = handle.lock().await;
                if run.is_terminal() || run.cancel_requested || run.in_flight.is_some() {
                    return;
                }
                let Some(task_id) = run.execution_order.get(run.task_runs.len()).cloned() else {
                    return;
                };
                let Some(task) = deployment.flow.task(&task_id).cloned() else {
                    let _ = run.transition(
                        RunState::Failed,
                        format!("task '{task_id}' missing from deployment"),
                    );
                    report.transitions += 1;
                    return;
                };
                run.in_flight = Some(task_id);
                (task, collect_inputs(&run))
            };

            tracing::debug!("Executing task {} ({})", task.id, task.binding.qualified_name());
            let outcome = self.executor.execute(&task, &inputs).await;
            report.tasks_executed += 1;

            let mut run = handle.lock().await;
            run.in_flight = None;
            if run.cancel_requested || run.is_terminal() {
                tracing::debug!("Run {} cancelled while task {} was in flight, result dropped", run.id, task.id);
                return;
            }

            let now = now_millis();
            match outcome {
                Ok(value) => run.task_runs.push(TaskRun {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    state: TaskRunState::Completed,
                    result: Some(value),
                    error: None,
                    timestamp: now,
                }),
                Err(err) => {
                    run.task_runs.push(TaskRun {
                        task_id: task.id.clone(),
                        name: task.name.clone(),
                        state: TaskRunState::Failed,
                        result: None,
                        error: Some(err.clone()),
                        timestamp: now,
                    });
                    let detail = format!("task '{}' failed: {}", task.id, err);
                    if run.transition(RunState::Failed, detail.clone()).is_ok() {
                        let skipped = DependencyGraph::new(&deployment.flow.tasks)
                            .descendants(&task.id)
                            .len();
                        tracing::info!(
                            "Flow run {} failed: {} ({} downstream tasks skipped)",
                            run.id,
                            detail,
                            skipped
                        );
                        report.transitions += 1;
                    }
                    return;
                }
            }
        }
    }

    async fn pool_paused(&self, pool_id: &str) -> bool {
        matches!(
            self.store.get_pool(pool_id).await,
            Ok(pool) if pool.status == PoolStatus::Paused
        )
    }
}

fn collect_inputs(run: &FlowRun) -> TaskInputs {
    let upstream: HashMap<_, _> = run
        .task_runs
        .iter()
        .filter_map(|t| t.result.clone().map(|r| (t.task_id.clone(), r)))
        .collect();
    TaskInputs {
        parameters: run.parameters.clone(),
        upstream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SimulatedExecutor;
    use crate::store::{DeploymentSpec, PoolSpec, RunRequest};
    use crate::workflow::{FlowBuilder, FlowDefinition, TaskNode, ToolBinding};

    async fn setup(flow: FlowDefinition, exec: SimulatedExecutor) -> (Arc<EntityStore>, RunScheduler, String, String) {
        let store = Arc::new(EntityStore::new());
        let pool = store.create_pool(PoolSpec::new("p")).await.unwrap();
        let dep = store
            .create_deployment(&pool.id, DeploymentSpec::new(flow))
            .await
            .unwrap();
        let run = store.create_run(&dep.id, RunRequest::default()).await.unwrap();
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(exec));
        (store, scheduler, pool.id, run.id)
    }

    fn chain() -> FlowDefinition {
        FlowBuilder::new("chain")
            .tool("s", "a")
            .tool("s", "b")
            .sequential("s_a", "s_b")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_step_per_tick() {
        let (store, scheduler, _, run_id) = setup(chain(), SimulatedExecutor::new()).await;
        let expected = [
            (RunState::Pending, 0),
            (RunState::Running, 0),
            (RunState::Running, 1),
            (RunState::Running, 2),
            (RunState::Completed, 2),
        ];
        for (state, done) in expected {
            scheduler.tick().await;
            let run = store.get_run(&run_id).await.unwrap();
            assert_eq!(run.state, state);
            assert_eq!(run.task_runs.len(), done);
        }
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.execution_order, vec!["s_a", "s_b"]);
        // 终态后 tick 不再改变任何东西
        assert_eq!(scheduler.tick().await, TickReport::default());
    }

    #[tokio::test]
    async fn test_failure_halts_run() {
        let exec = SimulatedExecutor::new().fail_on(ToolBinding::new("s", "a"), "disk full");
        let (store, scheduler, _, run_id) = setup(chain(), exec).await;
        for _ in 0..6 {
            scheduler.tick().await;
        }
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error.as_deref(), Some("task 's_a' failed: disk full"));
        assert!(run.task_run("s_b").is_none());
    }

    #[tokio::test]
    async fn test_cancel_takes_priority() {
        let (store, scheduler, _, run_id) = setup(chain(), SimulatedExecutor::new()).await;
        scheduler.tick().await;
        scheduler.tick().await;
        store.request_cancel(&run_id).await.unwrap();
        scheduler.tick().await;
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Cancelled);
        assert!(run.task_runs.is_empty());
    }

    #[tokio::test]
    async fn test_paused_pool_holds_runs() {
        let (store, scheduler, pool_id, run_id) = setup(chain(), SimulatedExecutor::new()).await;
        store.set_pool_status(&pool_id, PoolStatus::Paused).await.unwrap();
        scheduler.tick().await;
        scheduler.tick().await;
        assert_eq!(store.get_run(&run_id).await.unwrap().state, RunState::Scheduled);

        store.set_pool_status(&pool_id, PoolStatus::Ready).await.unwrap();
        scheduler.tick().await;
        assert_eq!(store.get_run(&run_id).await.unwrap().state, RunState::Pending);
    }

    #[tokio::test]
    async fn test_tasks_per_tick() {
        let (store, scheduler, _, run_id) = setup(chain(), SimulatedExecutor::new()).await;
        let scheduler = scheduler.with_tasks_per_tick(5);
        for _ in 0..3 {
            scheduler.tick().await;
        }
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.task_runs.len(), 2);
        scheduler.tick().await;
        assert_eq!(store.get_run(&run_id).await.unwrap().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_during_in_flight_task_drops_result() {
        let exec = SimulatedExecutor::new().with_delay(Duration::from_millis(100));
        let (store, scheduler, _, run_id) = setup(chain(), exec).await;
        let scheduler = Arc::new(scheduler);
        scheduler.tick().await;
        scheduler.tick().await;

        let bg = Arc::clone(&scheduler);
        let in_flight = tokio::spawn(async move { bg.tick().await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // 任务执行期间读取不被阻塞，且并发 tick 不会重复推进
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(scheduler.tick().await.tasks_executed, 0);

        store.request_cancel(&run_id).await.unwrap();
        in_flight.await.unwrap();
        assert!(store.get_run(&run_id).await.unwrap().task_runs.is_empty());

        scheduler.tick().await;
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Cancelled);
        assert!(run.task_runs.is_empty());
    }

    #[tokio::test]
    async fn test_running_set_through_store_still_executes_tasks() {
        let (store, scheduler, _, run_id) = setup(chain(), SimulatedExecutor::new()).await;
        store.update_run_state(&run_id, RunState::Pending, None).await.unwrap();
        store.update_run_state(&run_id, RunState::Running, None).await.unwrap();

        scheduler.tick().await;
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.execution_order, vec!["s_a", "s_b"]);
        assert_eq!(run.task_runs.len(), 1);

        scheduler.tick().await;
        scheduler.tick().await;
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.task_runs.len(), 2);
    }

    /// 两个任务互相等待：只有并发推进时才能都完成
    struct Rendezvous(tokio::sync::Barrier);

    #[async_trait::async_trait]
    impl TaskExecutor for Rendezvous {
        async fn execute(&self, _task: &TaskNode, _inputs: &TaskInputs) -> Result<serde_json::Value, String> {
            self.0.wait().await;
            Ok(serde_json::json!({"status": "ok"}))
        }
    }

    #[tokio::test]
    async fn test_runs_advance_concurrently_within_tick() {
        let store = Arc::new(EntityStore::new());
        let pool = store.create_pool(PoolSpec::new("p")).await.unwrap();
        let flow = FlowBuilder::new("one").tool("s", "a").build().unwrap();
        let dep = store
            .create_deployment(&pool.id, DeploymentSpec::new(flow))
            .await
            .unwrap();
        let r1 = store.create_run(&dep.id, RunRequest::default()).await.unwrap();
        let r2 = store.create_run(&dep.id, RunRequest::default()).await.unwrap();
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(Rendezvous(tokio::sync::Barrier::new(2))));

        scheduler.tick().await;
        scheduler.tick().await;
        let report = tokio::time::timeout(Duration::from_secs(2), scheduler.tick())
            .await
            .expect("runs should execute concurrently");
        assert_eq!(report.tasks_executed, 2);
        for id in [&r1.id, &r2.id] {
            assert_eq!(store.get_run(id).await.unwrap().task_runs.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_background_loop_completes_run() {
        let (store, scheduler, _, run_id) = setup(chain(), SimulatedExecutor::new()).await;
        let token = CancellationToken::new();
        let handle = Arc::new(scheduler).spawn(Duration::from_millis(5), token.clone());

        let mut state = RunState::Scheduled;
        for _ in 0..200 {
            state = store.get_run(&run_id).await.unwrap().state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        handle.await.unwrap();
        assert_eq!(state, RunState::Completed);
    }
}
