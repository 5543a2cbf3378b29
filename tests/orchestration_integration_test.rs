//! 编排集成测试：规划 -> 部署 -> 调度 -> 轮询的端到端场景

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use flowsim::api::{HealthStatus, LocalOrchestrator, OrchestrationApi};
    use flowsim::core::{OrchestrationError, PoolStatus, Result, RunState};
    use flowsim::planner::{
        FallbackPolicy, HintedTask, NoHint, OrderingHint, StaticHint, TaskGraphPlanner, ToolDescriptor, ToolFeed,
    };
    use flowsim::runner::{FlowRunner, RunnerConfig};
    use flowsim::scheduler::{RunScheduler, SimulatedExecutor};
    use flowsim::store::{
        Deployment, DeploymentFilter, DeploymentSpec, EntityStore, FlowRun, PoolSpec, RunFilter, RunRequest,
        WorkPool,
    };
    use flowsim::workflow::{FlowDefinition, ToolBinding};
    use serde_json::json;

    /// 记录取消调用次数的 API 包装
    struct CountingApi {
        inner: LocalOrchestrator,
        cancels: AtomicUsize,
    }

    impl CountingApi {
        fn new(store: Arc<EntityStore>) -> Self {
            Self {
                inner: LocalOrchestrator::new(store),
                cancels: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OrchestrationApi for CountingApi {
        async fn create_pool(&self, spec: PoolSpec) -> Result<WorkPool> {
            self.inner.create_pool(spec).await
        }
        async fn get_pool(&self, name: &str) -> Result<WorkPool> {
            self.inner.get_pool(name).await
        }
        async fn list_pools(&self) -> Result<Vec<WorkPool>> {
            self.inner.list_pools().await
        }
        async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<WorkPool> {
            self.inner.set_pool_status(name, status).await
        }
        async fn remove_pool(&self, name: &str) -> Result<WorkPool> {
            self.inner.remove_pool(name).await
        }
        async fn create_deployment(&self, pool_name: &str, spec: DeploymentSpec) -> Result<Deployment> {
            self.inner.create_deployment(pool_name, spec).await
        }
        async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
            self.inner.get_deployment(deployment_id).await
        }
        async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
            self.inner.list_deployments(filter).await
        }
        async fn submit_flow(&self, deployment_id: &str, request: RunRequest) -> Result<FlowRun> {
            self.inner.submit_flow(deployment_id, request).await
        }
        async fn get_run(&self, run_id: &str) -> Result<FlowRun> {
            self.inner.get_run(run_id).await
        }
        async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<FlowRun>> {
            self.inner.list_runs(filter).await
        }
        async fn cancel_run(&self, run_id: &str) -> Result<FlowRun> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.inner.cancel_run(run_id).await
        }
        async fn health(&self) -> Result<HealthStatus> {
            self.inner.health().await
        }
    }

    fn fast_runner_config(timeout: Duration) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(25),
            backoff_factor: 1.5,
            timeout,
            max_poll_failures: 3,
            pool_type: "process".into(),
        }
    }

    async fn plan(descs: &[ToolDescriptor], policy: FallbackPolicy) -> FlowDefinition {
        TaskGraphPlanner::new(Arc::new(NoHint))
            .with_fallback(policy)
            .plan("integration", descs)
            .await
            .unwrap()
            .definition
    }

    async fn deploy(store: &Arc<EntityStore>, flow: FlowDefinition) -> Deployment {
        let api = LocalOrchestrator::new(Arc::clone(store));
        if api.get_pool("default").await.is_err() {
            api.create_pool(PoolSpec::new("default")).await.unwrap();
        }
        api.create_deployment("default", DeploymentSpec::new(flow)).await.unwrap()
    }

    async fn tick_until_terminal(scheduler: &RunScheduler, store: &EntityStore, run_id: &str) -> FlowRun {
        for _ in 0..50 {
            scheduler.tick().await;
            let run = store.get_run(run_id).await.unwrap();
            if run.is_terminal() {
                return run;
            }
        }
        panic!("run {run_id} never reached a terminal state");
    }

    /// 记录的状态序列必须是状态机中的合法路径，且没有连续重复
    fn assert_valid_history(run: &FlowRun) {
        assert_eq!(run.history.first().map(|h| h.state), Some(RunState::Scheduled));
        for pair in run.history.windows(2) {
            assert_ne!(pair[0].state, pair[1].state);
            assert!(
                pair[0].state.can_transition_to(pair[1].state),
                "illegal step {} -> {}",
                pair[0].state,
                pair[1].state
            );
        }
    }

    #[tokio::test]
    async fn test_independent_tasks_complete() {
        let descs = vec![
            ToolDescriptor::new("files", "read"),
            ToolDescriptor::new("web", "fetch"),
            ToolDescriptor::new("mail", "send"),
        ];
        let flow = plan(&descs, FallbackPolicy::Parallel).await;
        let store = Arc::new(EntityStore::new());
        let dep = deploy(&store, flow).await;
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(SimulatedExecutor::new()));
        let run = store.create_run(&dep.id, RunRequest::default()).await.unwrap();

        let run = tick_until_terminal(&scheduler, &store, &run.id).await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.task_runs.len(), 3);
        assert!(run.task_runs.iter().all(|t| t.result.is_some()));
        assert_valid_history(&run);
    }

    #[tokio::test]
    async fn test_failing_upstream_halts_downstream() {
        let descs = vec![
            ToolDescriptor::new("srv", "a"),
            ToolDescriptor::new("srv", "b").depends_on(&["a"]),
        ];
        let flow = plan(&descs, FallbackPolicy::Parallel).await;
        let store = Arc::new(EntityStore::new());
        let dep = deploy(&store, flow).await;
        let exec = SimulatedExecutor::new().fail_on(ToolBinding::new("srv", "a"), "connection reset");
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(exec));
        let run = store.create_run(&dep.id, RunRequest::default()).await.unwrap();

        let run = tick_until_terminal(&scheduler, &store, &run.id).await;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_deref().unwrap().contains("connection reset"));
        assert!(run.task_run("srv_b").is_none());
        assert_valid_history(&run);
    }

    #[tokio::test]
    async fn test_cancel_before_next_tick() {
        let flow = plan(&[ToolDescriptor::new("srv", "a")], FallbackPolicy::Sequential).await;
        let store = Arc::new(EntityStore::new());
        let dep = deploy(&store, flow).await;
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(SimulatedExecutor::new()));
        let api = LocalOrchestrator::new(Arc::clone(&store));

        let run = api.submit_flow(&dep.id, RunRequest::default()).await.unwrap();
        api.cancel_run(&run.id).await.unwrap();
        scheduler.tick().await;

        let run = api.get_run(&run.id).await.unwrap();
        assert_eq!(run.state, RunState::Cancelled);
        assert_valid_history(&run);

        // 已终态的运行不能再取消
        let err = api.cancel_run(&run.id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cycle_rejected_with_offending_nodes() {
        let hint = OrderingHint {
            tasks: vec![
                HintedTask {
                    task_key: "srv_a".into(),
                    depends_on: vec!["srv_b".into()],
                    ..Default::default()
                },
                HintedTask {
                    task_key: "srv_b".into(),
                    depends_on: vec!["srv_a".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let err = TaskGraphPlanner::new(Arc::new(StaticHint(hint)))
            .plan("cyclic", &[ToolDescriptor::new("srv", "a"), ToolDescriptor::new("srv", "b")])
            .await
            .unwrap_err();
        let mut nodes = err.nodes.clone();
        nodes.sort();
        assert_eq!(nodes, vec!["srv_a", "srv_b"]);
    }

    #[tokio::test]
    async fn test_declared_dependency_cycle_rejected() {
        let tools = [
            ToolDescriptor::new("srv", "a").depends_on(&["b"]),
            ToolDescriptor::new("srv", "b").depends_on(&["a"]),
        ];
        for policy in [FallbackPolicy::Sequential, FallbackPolicy::Parallel] {
            let err = TaskGraphPlanner::new(Arc::new(NoHint))
                .with_fallback(policy)
                .plan("cyclic", &tools)
                .await
                .unwrap_err();
            let mut nodes = err.nodes.clone();
            nodes.sort();
            assert_eq!(nodes, vec!["srv_a", "srv_b"], "{policy:?}");
        }
    }

    #[tokio::test]
    async fn test_timeout_sends_exactly_one_cancel() {
        let flow = plan(&[ToolDescriptor::new("srv", "a")], FallbackPolicy::Sequential).await;
        let store = Arc::new(EntityStore::new());
        let api = Arc::new(CountingApi::new(Arc::clone(&store)));
        // 没有调度器在运行，运行永远停留在 SCHEDULED
        let runner = FlowRunner::new(api.clone(), fast_runner_config(Duration::from_millis(100)));

        let err = runner
            .run_flow("default", flow, RunRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Timeout { .. }));
        assert_eq!(api.cancels.load(Ordering::SeqCst), 1);

        let run = store.list_runs(&RunFilter::default()).await.remove(0);
        assert!(run.cancel_requested);
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(SimulatedExecutor::new()));
        scheduler.tick().await;
        assert_eq!(store.get_run(&run.id).await.unwrap().state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_runs_of_same_deployment_are_independent() {
        let flow = plan(
            &[ToolDescriptor::new("srv", "a"), ToolDescriptor::new("srv", "b")],
            FallbackPolicy::Sequential,
        )
        .await;
        let store = Arc::new(EntityStore::new());
        let dep = deploy(&store, flow).await;
        let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(SimulatedExecutor::new()));

        let first = store.create_run(&dep.id, RunRequest::default()).await.unwrap();
        let second = store.create_run(&dep.id, RunRequest::default()).await.unwrap();
        scheduler.tick().await;
        store.request_cancel(&first.id).await.unwrap();

        let second = tick_until_terminal(&scheduler, &store, &second.id).await;
        let first = store.get_run(&first.id).await.unwrap();
        assert_eq!(first.state, RunState::Cancelled);
        assert_eq!(second.state, RunState::Completed);
        assert_eq!(second.task_runs.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_pool_twice_creates_one_pool() {
        let store = Arc::new(EntityStore::new());
        let runner = FlowRunner::new(
            Arc::new(LocalOrchestrator::new(Arc::clone(&store))),
            fast_runner_config(Duration::from_secs(1)),
        );
        runner.ensure_pool("shared").await.unwrap();
        runner.ensure_pool("shared").await.unwrap();
        assert_eq!(store.list_pools().await.len(), 1);
    }

    #[tokio::test]
    async fn test_feed_to_completed_run_with_background_scheduler() {
        let feed = ToolFeed::from_json(
            &json!({
                "available_servers": [
                    {"server_name": "csv", "tools": [
                        {"name": "load", "parameters": {"type": "object", "properties": {"path": {"type": "string"}, "_username": {}}}}
                    ]},
                    {"server_name": "report", "tools": [
                        {"name": "render", "description": "Render a summary report"}
                    ]}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let mut render = HintedTask {
            task_key: "report_render".into(),
            depends_on: vec!["csv_load".into()],
            ..Default::default()
        };
        render.parameters.insert("rows".into(), json!("{{csv_load}}"));
        let hint = OrderingHint {
            flow_name: Some("csv report".into()),
            tasks: vec![render],
            ..Default::default()
        };
        let plan = TaskGraphPlanner::new(Arc::new(StaticHint(hint)))
            .plan("summarize a csv", &feed.into_descriptors())
            .await
            .unwrap();
        assert!(plan.fallback.is_none());
        assert!(!plan.definition.task("csv_load").unwrap().parameters.contains_key("_username"));

        let store = Arc::new(EntityStore::new());
        let exec = SimulatedExecutor::new().with_result(ToolBinding::new("csv", "load"), json!([{"id": 1}]));
        let token = tokio_util::sync::CancellationToken::new();
        let handle = Arc::new(RunScheduler::new(Arc::clone(&store), Arc::new(exec)))
            .spawn(Duration::from_millis(5), token.clone());
        let runner = FlowRunner::new(
            Arc::new(LocalOrchestrator::new(Arc::clone(&store))),
            fast_runner_config(Duration::from_secs(5)),
        );

        let mut request = RunRequest::default();
        request.tags.push("nightly".into());
        let report = runner.run_flow("default", plan.definition, request).await.unwrap();
        token.cancel();
        handle.await.unwrap();

        assert_eq!(report.deployment.name, "csv_report_deployment");
        assert_eq!(report.run.state, RunState::Completed);
        assert_eq!(report.run.tags, vec!["nightly"]);
        assert_eq!(report.run.execution_order, vec!["csv_load", "report_render"]);
        let rendered = report.run.task_run("report_render").unwrap().result.clone().unwrap();
        assert_eq!(rendered["arguments"]["rows"], json!([{"id": 1}]));
        assert_valid_history(&report.run);
    }
}
