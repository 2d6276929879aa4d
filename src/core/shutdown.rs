//! 优雅关闭
//!
//! 后台任务（工具注册表刷新、会话池空闲回收）监听同一个 token；
//! 退出前由 ShutdownCoordinator 并发执行已注册的清理（如关闭所有浏览器会话），每项单独限时。

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

/// 关闭原因，只记录第一次触发的
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 输入流结束
    InputClosed,
    FatalError(String),
}

#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 后台任务据此退出；单轮停止信号可取其 child_token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason.clone()).is_ok() {
            tracing::info!(reason = ?reason, "shutdown requested");
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    hooks: Vec<Arc<dyn ShutdownCleanup>>,
    per_hook_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            hooks: Vec::new(),
            per_hook_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.per_hook_timeout = timeout;
        self
    }

    pub fn register(&mut self, hook: Arc<dyn ShutdownCleanup>) {
        self.hooks.push(hook);
    }

    /// 并发执行全部清理，返回失败或超时的清理名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        let reason = self.manager.reason().cloned();
        tracing::info!(hooks = self.hooks.len(), reason = ?reason, "running shutdown cleanup");

        let runs = self.hooks.iter().map(|hook| async move {
            let name = hook.name();
            match tokio::time::timeout(self.per_hook_timeout, hook.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(hook = name, "cleanup finished");
                    None
                }
                Ok(Err(e)) => {
                    tracing::warn!(hook = name, error = %e, "cleanup failed");
                    Some(name)
                }
                Err(_) => {
                    tracing::warn!(hook = name, timeout_ms = self.per_hook_timeout.as_millis() as u64, "cleanup timed out");
                    Some(name)
                }
            }
        });
        join_all(runs).await.into_iter().flatten().collect()
    }
}

/// 运行主任务直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("main task finished"),
        _ = manager.token.cancelled() => tracing::info!(reason = ?manager.reason(), "stopping main task"),
    }

    cleanup().await;
}
