//! flowsim-server：REST 编排服务
//!
//! 启动实体存储与调度循环，并在 [server] host:port 上提供 /api/* 路由。
//! Ctrl+C / SIGTERM 后调度器停止、HTTP 服务优雅退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use flowsim::api::{server::create_router, LocalOrchestrator};
use flowsim::config::load_config;
use flowsim::core::ShutdownManager;
use flowsim::scheduler::{RunScheduler, SimulatedExecutor};
use flowsim::store::EntityStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowsim::observability::init();

    // 可选：第一个参数为额外配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let store = Arc::new(EntityStore::new());
    let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(SimulatedExecutor::new()))
        .with_tasks_per_tick(config.scheduler.tasks_per_tick);
    let scheduler_handle = Arc::new(scheduler).spawn(config.scheduler.tick_interval(), shutdown.token());

    let app = create_router(Arc::new(LocalOrchestrator::new(store)));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("flowsim-server listening on http://{}", addr);

    let token = shutdown.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Server error")?;

    scheduler_handle.await.context("Scheduler task panicked")?;
    tracing::info!("flowsim-server stopped");
    Ok(())
}
