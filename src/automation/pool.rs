//! 自动化会话池
//!
//! key -> 会话的并发安全映射。每个 key 对应一个 OnceCell：并发首次访问时只有一个调用方真正启动浏览器，
//! 其余等待同一个结果；启动失败的占位会被移除，下次访问重新尝试。
//! 空闲回收独立于请求路径定时运行，释放最后操作时间早于阈值的会话。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::automation::driver::{BrowserLauncher, Viewport};
use crate::automation::session::{AutomationSession, SessionOptions};
use crate::core::{RelayError, ShutdownCleanup, DEFAULT_SESSION_KEY};

type SessionCell = Arc<OnceCell<Arc<AutomationSession>>>;

pub struct SessionPool {
    launcher: Arc<dyn BrowserLauncher>,
    options: SessionOptions,
    idle_threshold: chrono::Duration,
    sessions: DashMap<String, SessionCell>,
}

impl SessionPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, options: SessionOptions, idle_threshold: Duration) -> Self {
        Self {
            launcher,
            options,
            idle_threshold: chrono::Duration::from_std(idle_threshold).unwrap_or_else(|_| chrono::Duration::minutes(30)),
            sessions: DashMap::new(),
        }
    }

    pub fn default_viewport(&self) -> Viewport {
        self.options.viewport
    }

    /// 取得或创建 key 对应的会话（空 key 使用共享默认会话）
    pub async fn get_or_create(&self, key: &str, viewport: Viewport) -> Result<Arc<AutomationSession>, RelayError> {
        let key = if key.is_empty() { DEFAULT_SESSION_KEY } else { key };
        let cell: SessionCell = self
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let options = SessionOptions {
            viewport,
            ..self.options
        };
        let result = cell
            .get_or_try_init(|| async {
                let driver = self.launcher.launch(viewport).await?;
                let session = AutomationSession::new(key, driver, options);
                tracing::info!(
                    session = %key,
                    id = %session.id(),
                    width = viewport.width,
                    height = viewport.height,
                    "automation session created"
                );
                Ok::<_, RelayError>(Arc::new(session))
            })
            .await;

        match result {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                self.sessions
                    .remove_if(key, |_, c| Arc::ptr_eq(c, &cell) && c.get().is_none());
                tracing::warn!(session = %key, error = %e, "automation session creation failed");
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// 关闭会话的全部页面、上下文与进程，并移除 key
    pub async fn release(&self, key: &str) -> bool {
        let Some((_, cell)) = self.sessions.remove(key) else {
            return false;
        };
        if let Some(session) = cell.get() {
            if let Err(e) = session.close().await {
                tracing::warn!(session = %key, error = %e, "automation session close failed");
            }
            tracing::info!(session = %key, "automation session released");
        }
        true
    }

    pub async fn release_all(&self) -> usize {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for key in keys {
            if self.release(&key).await {
                released += 1;
            }
        }
        released
    }

    /// 以 now 为基准回收空闲会话，返回释放数量
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.idle_threshold;
        let expired: Vec<(String, SessionCell)> = self
            .sessions
            .iter()
            .filter(|e| matches!(e.value().get(), Some(s) if s.last_action() < cutoff))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut released = 0;
        for (key, cell) in expired {
            if self
                .sessions
                .remove_if(&key, |_, c| Arc::ptr_eq(c, &cell))
                .is_none()
            {
                continue;
            }
            if let Some(session) = cell.get() {
                if let Err(e) = session.close().await {
                    tracing::warn!(session = %key, error = %e, "idle session close failed");
                }
            }
            released += 1;
        }
        if released > 0 {
            tracing::info!(released, remaining = self.sessions.len(), "idle automation sessions swept");
        }
        released
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// 定时回收，直到 shutdown 被取消
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionPool {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let released = self.release_all().await;
        tracing::info!(released, "all automation sessions released");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session_pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::mock::MockLauncher;

    fn pool(launcher: &MockLauncher) -> SessionPool {
        let options = SessionOptions {
            settle: Duration::ZERO,
            ..Default::default()
        };
        SessionPool::new(Arc::new(launcher.clone()), options, Duration::from_secs(30 * 60))
    }

    #[tokio::test]
    async fn test_concurrent_first_access_creates_one_session() {
        let launcher = MockLauncher::new().with_launch_delay(Duration::from_millis(50));
        let pool = Arc::new(pool(&launcher));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.get_or_create("conv-1", Viewport::default()).await.unwrap()
            }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }

        assert_eq!(launcher.launches(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_key_shares_default_session() {
        let launcher = MockLauncher::new();
        let pool = pool(&launcher);
        let a = pool.get_or_create("", Viewport::default()).await.unwrap();
        let b = pool.get_or_create(DEFAULT_SESSION_KEY, Viewport::default()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_sweep_releases_only_idle_sessions() {
        let launcher = MockLauncher::new();
        let pool = pool(&launcher);
        let now = Utc::now();
        let old = pool.get_or_create("old", Viewport::default()).await.unwrap();
        let fresh = pool.get_or_create("fresh", Viewport::default()).await.unwrap();
        old.set_last_action(now - chrono::Duration::minutes(40));
        fresh.set_last_action(now - chrono::Duration::minutes(5));

        assert_eq!(pool.sweep_at(now).await, 1);
        assert!(!pool.contains("old"));
        assert!(pool.contains("fresh"));
        assert_eq!(launcher.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_failed_launch_not_cached() {
        let launcher = MockLauncher::new().failing();
        let pool = pool(&launcher);
        let err = pool.get_or_create("k", Viewport::default()).await.err().unwrap();
        assert!(matches!(err, RelayError::Resource(_)));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_release_closes_and_removes() {
        let launcher = MockLauncher::new();
        let pool = pool(&launcher);
        let s = pool.get_or_create("k", Viewport::default()).await.unwrap();
        s.open_url("https://example.com").await.unwrap();
        assert!(pool.release("k").await);
        assert!(!pool.release("k").await);
        assert_eq!(launcher.shutdowns(), 1);
        assert!(launcher.ops().contains(&"close_page:1".to_string()));
    }
}
