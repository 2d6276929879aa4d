//! 记录型浏览器驱动（用于测试，无需 Chrome）
//!
//! 每个操作以文本形式追加到共享日志，例如 `navigate:1:https://example.com`、`history_back:1`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::automation::driver::{BrowserDriver, BrowserLauncher, PageId, Viewport};
use crate::core::RelayError;

#[derive(Debug, Default)]
pub struct MockBrowserLog {
    pub ops: Vec<String>,
    pub launches: usize,
    pub shutdowns: usize,
}

/// 可配置的假启动器；clone 之间共享日志
#[derive(Clone, Default)]
pub struct MockLauncher {
    log: Arc<Mutex<MockBrowserLog>>,
    launch_delay: Duration,
    fail_launch: bool,
    html: String,
    screenshot: Vec<u8>,
    selector_counts: HashMap<String, usize>,
    unreachable: Vec<String>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动耗时（用于并发首次访问测试）
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// evaluate 的返回值（页面 HTML）
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn with_screenshot(mut self, png: Vec<u8>) -> Self {
        self.screenshot = png;
        self
    }

    pub fn with_selector_count(mut self, selector: impl Into<String>, count: usize) -> Self {
        self.selector_counts.insert(selector.into(), count);
        self
    }

    /// 导航到该 URL 时失败
    pub fn with_unreachable(mut self, url: impl Into<String>) -> Self {
        self.unreachable.push(url.into());
        self
    }

    pub fn launches(&self) -> usize {
        self.log.lock().map(|l| l.launches).unwrap_or(0)
    }

    pub fn shutdowns(&self) -> usize {
        self.log.lock().map(|l| l.shutdowns).unwrap_or(0)
    }

    pub fn ops(&self) -> Vec<String> {
        self.log.lock().map(|l| l.ops.clone()).unwrap_or_default()
    }

    fn record(&self, op: String) {
        if let Ok(mut log) = self.log.lock() {
            log.ops.push(op);
        }
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn BrowserDriver>, RelayError> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if self.fail_launch {
            return Err(RelayError::Resource("mock browser failed to start".into()));
        }
        if let Ok(mut log) = self.log.lock() {
            log.launches += 1;
            log.ops.push(format!("launch:{}x{}", viewport.width, viewport.height));
        }
        Ok(Box::new(MockDriver {
            launcher: self.clone(),
            next_page: 0,
        }))
    }
}

pub struct MockDriver {
    launcher: MockLauncher,
    next_page: u64,
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn new_page(&mut self) -> Result<PageId, RelayError> {
        self.next_page += 1;
        self.launcher.record(format!("new_page:{}", self.next_page));
        Ok(PageId(self.next_page))
    }

    async fn close_page(&mut self, page: PageId) -> Result<(), RelayError> {
        self.launcher.record(format!("close_page:{}", page.0));
        Ok(())
    }

    async fn navigate(&mut self, page: PageId, url: &str, _timeout: Duration) -> Result<(), RelayError> {
        self.launcher.record(format!("navigate:{}:{}", page.0, url));
        if self.launcher.unreachable.iter().any(|u| u == url) {
            return Err(RelayError::Resource(format!("net::ERR_NAME_NOT_RESOLVED {}", url)));
        }
        Ok(())
    }

    async fn wait_for_load(&mut self, page: PageId, _timeout: Duration) -> Result<(), RelayError> {
        self.launcher.record(format!("wait_for_load:{}", page.0));
        Ok(())
    }

    async fn history_back(&mut self, page: PageId) -> Result<(), RelayError> {
        self.launcher.record(format!("history_back:{}", page.0));
        Ok(())
    }

    async fn screenshot(&mut self, page: PageId) -> Result<Vec<u8>, RelayError> {
        self.launcher.record(format!("screenshot:{}", page.0));
        Ok(self.launcher.screenshot.clone())
    }

    async fn mouse_move(&mut self, page: PageId, x: i64, y: i64) -> Result<(), RelayError> {
        self.launcher.record(format!("mouse_move:{}:{},{}", page.0, x, y));
        Ok(())
    }

    async fn mouse_click(&mut self, page: PageId, x: i64, y: i64) -> Result<(), RelayError> {
        self.launcher.record(format!("click:{}:{},{}", page.0, x, y));
        Ok(())
    }

    async fn insert_text(&mut self, page: PageId, text: &str) -> Result<(), RelayError> {
        self.launcher.record(format!("insert_text:{}:{}", page.0, text));
        Ok(())
    }

    async fn press_key(&mut self, page: PageId, key: &str) -> Result<(), RelayError> {
        self.launcher.record(format!("press_key:{}:{}", page.0, key));
        Ok(())
    }

    async fn wheel(&mut self, page: PageId, delta_x: i64, delta_y: i64) -> Result<(), RelayError> {
        self.launcher.record(format!("wheel:{}:{},{}", page.0, delta_x, delta_y));
        Ok(())
    }

    async fn evaluate(&mut self, page: PageId, _script: &str) -> Result<String, RelayError> {
        self.launcher.record(format!("evaluate:{}", page.0));
        Ok(self.launcher.html.clone())
    }

    async fn count_matches(&mut self, _page: PageId, selector: &str) -> Result<usize, RelayError> {
        Ok(self.launcher.selector_counts.get(selector).copied().unwrap_or(0))
    }

    async fn click_selector(&mut self, page: PageId, selector: &str) -> Result<(), RelayError> {
        self.launcher.record(format!("click_selector:{}:{}", page.0, selector));
        Ok(())
    }

    async fn fill_selector(&mut self, page: PageId, selector: &str, text: &str) -> Result<(), RelayError> {
        self.launcher.record(format!("fill_selector:{}:{}:{}", page.0, selector, text));
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), RelayError> {
        if let Ok(mut log) = self.launcher.log.lock() {
            log.shutdowns += 1;
            log.ops.push("shutdown".into());
        }
        Ok(())
    }
}
