//! 优雅关闭
//!
//! 调度循环与 REST 服务共用同一个 CancellationToken：收到 Ctrl+C / SIGTERM 后
//! 调度器在当前 tick 结束后退出，axum 停止接收新连接。

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 调用方主动停止（如 CLI 执行完毕）
    Finished,
}

/// 关闭信号管理器：只记录第一次关闭的原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调度循环等后台任务使用的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 子 token：可单独取消，整体关闭时一并取消
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!("Shutdown requested: {:?}", reason);
            self.token.cancel();
        } else {
            tracing::debug!("Shutdown already in progress, ignoring {:?}", reason);
        }
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM（unix）触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
                }
            });
        }
    }
}
