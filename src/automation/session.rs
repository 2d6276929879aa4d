//! 自动化会话：一个浏览器实例 + 页面栈 + 指针位置 + 最后操作时间
//!
//! 同一会话同一时刻只有一个循环在驱动；内部状态放在 tokio Mutex 中，
//! 最后操作时间单独用原子量保存，空闲回收读取时不需要拿锁。

use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use image::imageops::FilterType;
use image::ImageFormat;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::automation::content::{simplify_html, VISIBLE_DOM_SCRIPT};
use crate::automation::driver::{BrowserDriver, PageId, Viewport};
use crate::core::RelayError;

/// 每格滚动对应的像素
pub const SCROLL_STEP_PX: i64 = 80;

/// wait 动作的最长等待
const MAX_WAIT_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub viewport: Viewport,
    /// 导航超时（唯一的硬超时）
    pub page_timeout: Duration,
    /// 每个动作后的稳定等待
    pub settle: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            page_timeout: Duration::from_secs(30),
            settle: Duration::from_millis(300),
        }
    }
}

struct SessionState {
    driver: Box<dyn BrowserDriver>,
    /// 页面栈，栈顶为当前页
    pages: Vec<PageId>,
    pointer: (i64, i64),
    closed: bool,
}

pub struct AutomationSession {
    key: String,
    id: Uuid,
    options: SessionOptions,
    last_action_ms: AtomicI64,
    state: Mutex<SessionState>,
}

fn no_page() -> RelayError {
    RelayError::Execution("Error: No page opened, call OpenUrl first.".to_string())
}

impl AutomationSession {
    pub fn new(key: impl Into<String>, driver: Box<dyn BrowserDriver>, options: SessionOptions) -> Self {
        Self {
            key: key.into(),
            id: Uuid::new_v4(),
            options,
            last_action_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            state: Mutex::new(SessionState {
                driver,
                pages: Vec::new(),
                pointer: (0, 0),
                closed: false,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn viewport(&self) -> Viewport {
        self.options.viewport
    }

    fn touch(&self) {
        self.last_action_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_action(&self) -> DateTime<Utc> {
        let ms = self.last_action_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// 覆盖最后操作时间（恢复会话或测试空闲回收时使用）
    pub fn set_last_action(&self, at: DateTime<Utc>) {
        self.last_action_ms
            .store(at.timestamp_millis(), Ordering::SeqCst);
    }

    async fn settle(&self) {
        if !self.options.settle.is_zero() {
            tokio::time::sleep(self.options.settle).await;
        }
    }

    pub async fn page_count(&self) -> usize {
        self.state.lock().await.pages.len()
    }

    pub async fn pointer(&self) -> (i64, i64) {
        self.state.lock().await.pointer
    }

    /// 关闭旧页面，新开一页并导航
    pub async fn open_url(&self, url: &str) -> Result<(), RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        for page in std::mem::take(&mut state.pages) {
            if let Err(e) = state.driver.close_page(page).await {
                tracing::debug!(error = %e, "close stale page failed");
            }
        }
        let page = state.driver.new_page().await?;
        state.pages.push(page);
        tracing::info!(session = %self.key, url = %url, "automation open url");
        state.driver.navigate(page, url, self.options.page_timeout).await?;
        drop(state);
        self.settle().await;
        Ok(())
    }

    /// 多于一页时关闭栈顶页，只有一页时浏览器历史后退
    pub async fn go_back(&self) -> Result<(), RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        match state.pages.len() {
            0 => return Err(no_page()),
            1 => {
                let page = state.pages[0];
                state.driver.history_back(page).await?;
                state.driver.wait_for_load(page, self.options.page_timeout).await?;
            }
            _ => {
                if let Some(page) = state.pages.pop() {
                    state.driver.close_page(page).await?;
                }
            }
        }
        drop(state);
        self.settle().await;
        Ok(())
    }

    /// 当前页截图，缩放到逻辑视口；没有打开页面时返回 None
    pub async fn screenshot(&self) -> Result<Option<Vec<u8>>, RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let Some(page) = state.pages.last().copied() else {
            return Ok(None);
        };
        let raw = state.driver.screenshot(page).await?;
        drop(state);
        Ok(Some(fit_to_viewport(raw, self.options.viewport)))
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<(), RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        state.driver.mouse_move(page, x, y).await?;
        state.pointer = (x, y);
        drop(state);
        self.settle().await;
        Ok(())
    }

    /// 点击指定坐标（未指定时用上次指针位置），然后等待可能触发的导航
    pub async fn click(&self, at: Option<(i64, i64)>) -> Result<(), RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        let (x, y) = at.unwrap_or(state.pointer);
        state.driver.mouse_click(page, x, y).await?;
        state.pointer = (x, y);
        state.driver.wait_for_load(page, self.options.page_timeout).await?;
        drop(state);
        self.settle().await;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<(), RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        state.driver.insert_text(page, text).await?;
        drop(state);
        self.settle().await;
        Ok(())
    }

    /// 按键；`Return` 视为 `Enter`，可能触发导航
    pub async fn press_key(&self, key: &str) -> Result<(), RelayError> {
        self.touch();
        let key = if key == "Return" { "Enter" } else { key };
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        state.driver.press_key(page, key).await?;
        if key == "Enter" {
            state.driver.wait_for_load(page, self.options.page_timeout).await?;
        }
        drop(state);
        self.settle().await;
        Ok(())
    }

    /// 滚动 amount 格，方向 up / down / left / right
    pub async fn scroll(&self, amount: i64, direction: &str) -> Result<(), RelayError> {
        let (dx, dy) = scroll_delta(amount, direction)?;
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        state.driver.wheel(page, dx, dy).await?;
        drop(state);
        self.settle().await;
        Ok(())
    }

    pub async fn wait(&self, seconds: f64) {
        self.touch();
        if seconds.is_finite() && seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(seconds.min(MAX_WAIT_SECS))).await;
        }
        self.touch();
    }

    /// 可见 DOM，经白名单精简并截断
    pub async fn visible_html(&self, max_chars: usize) -> Result<String, RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        let html = state.driver.evaluate(page, VISIBLE_DOM_SCRIPT).await?;
        Ok(simplify_html(&html, max_chars))
    }

    /// 选择器恰好匹配一个元素时点击
    pub async fn click_element(&self, selector: &str) -> Result<bool, RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        if state.driver.count_matches(page, selector).await? != 1 {
            return Ok(false);
        }
        state.driver.click_selector(page, selector).await?;
        state.driver.wait_for_load(page, self.options.page_timeout).await?;
        drop(state);
        self.settle().await;
        Ok(true)
    }

    /// 选择器恰好匹配一个元素时填入文本
    pub async fn input_element(&self, selector: &str, text: &str) -> Result<bool, RelayError> {
        self.touch();
        let mut state = self.state.lock().await;
        let page = state.pages.last().copied().ok_or_else(no_page)?;
        if state.driver.count_matches(page, selector).await? != 1 {
            return Ok(false);
        }
        state.driver.fill_selector(page, selector, text).await?;
        drop(state);
        self.settle().await;
        Ok(true)
    }

    /// 关闭全部页面、浏览上下文与进程；重复调用无副作用
    pub async fn close(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        for page in std::mem::take(&mut state.pages) {
            if let Err(e) = state.driver.close_page(page).await {
                tracing::debug!(error = %e, "close page failed during release");
            }
        }
        state.closed = true;
        state.driver.shutdown().await
    }
}

fn scroll_delta(amount: i64, direction: &str) -> Result<(i64, i64), RelayError> {
    let overflow = || RelayError::Execution(format!("Error: scroll_amount {} is out of range.", amount));
    let px = amount.checked_mul(SCROLL_STEP_PX).ok_or_else(overflow)?;
    let neg = || px.checked_neg().ok_or_else(overflow);
    match direction {
        "down" => Ok((0, px)),
        "up" => Ok((0, neg()?)),
        "right" => Ok((px, 0)),
        "left" => Ok((neg()?, 0)),
        other => Err(RelayError::Execution(format!(
            "Error: Unknown scroll_direction '{}', use up/down/left/right.",
            other
        ))),
    }
}

/// 截图缩放到逻辑视口；无法解码时原样返回
fn fit_to_viewport(png: Vec<u8>, viewport: Viewport) -> Vec<u8> {
    let img = match image::load_from_memory(&png) {
        Ok(img) => img,
        Err(e) => {
            tracing::warn!(error = %e, "screenshot decode failed, sending original bytes");
            return png;
        }
    };
    if img.width() == viewport.width && img.height() == viewport.height {
        return png;
    }
    let resized = img.resize_exact(viewport.width, viewport.height, FilterType::Triangle);
    let mut out = Cursor::new(Vec::new());
    match resized.write_to(&mut out, ImageFormat::Png) {
        Ok(()) => out.into_inner(),
        Err(e) => {
            tracing::warn!(error = %e, "screenshot encode failed, sending original bytes");
            png
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::driver::BrowserLauncher;
    use crate::automation::mock::MockLauncher;

    fn fast_options() -> SessionOptions {
        SessionOptions {
            settle: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn session(launcher: &MockLauncher) -> AutomationSession {
        let driver = launcher.launch(Viewport::default()).await.unwrap();
        AutomationSession::new("main", driver, fast_options())
    }

    #[tokio::test]
    async fn test_screenshot_before_navigate_is_none() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        assert!(s.screenshot().await.unwrap().is_none());
        assert!(!launcher.ops().iter().any(|op| op.starts_with("screenshot")));
    }

    #[tokio::test]
    async fn test_back_with_one_page_uses_history() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        s.open_url("https://example.com").await.unwrap();
        s.go_back().await.unwrap();
        assert!(launcher.ops().contains(&"history_back:1".to_string()));
        assert_eq!(s.page_count().await, 1);
    }

    #[tokio::test]
    async fn test_back_with_two_pages_pops_top() {
        let launcher = MockLauncher::new();
        let driver = launcher.launch(Viewport::default()).await.unwrap();
        let s = AutomationSession::new("main", driver, fast_options());
        s.open_url("https://example.com").await.unwrap();
        {
            let mut state = s.state.lock().await;
            let page = state.driver.new_page().await.unwrap();
            state.pages.push(page);
        }
        s.go_back().await.unwrap();
        let ops = launcher.ops();
        assert!(ops.contains(&"close_page:2".to_string()));
        assert!(!ops.iter().any(|op| op.starts_with("history_back")));
        assert_eq!(s.page_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_url_replaces_pages() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        s.open_url("https://a.com").await.unwrap();
        s.open_url("https://b.com").await.unwrap();
        assert_eq!(s.page_count().await, 1);
        assert!(launcher.ops().contains(&"close_page:1".to_string()));
    }

    #[tokio::test]
    async fn test_click_uses_last_pointer() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        s.open_url("https://a.com").await.unwrap();
        s.move_mouse(100, 200).await.unwrap();
        s.click(None).await.unwrap();
        assert!(launcher.ops().contains(&"click:1:100,200".to_string()));
    }

    #[tokio::test]
    async fn test_scroll_converts_to_pixels() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        s.open_url("https://a.com").await.unwrap();
        s.scroll(3, "up").await.unwrap();
        assert!(launcher.ops().contains(&"wheel:1:0,-240".to_string()));
        assert!(s.scroll(1, "sideways").await.is_err());
    }

    #[tokio::test]
    async fn test_scroll_amount_overflow_is_error() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        s.open_url("https://a.com").await.unwrap();
        let err = s.scroll(i64::MAX / 2, "down").await.unwrap_err();
        assert!(matches!(err, RelayError::Execution(_)));
        assert!(s.scroll(i64::MIN / 2, "up").await.is_err());
        assert!(!launcher.ops().iter().any(|op| op.starts_with("wheel")));
    }

    #[tokio::test]
    async fn test_return_key_maps_to_enter() {
        let launcher = MockLauncher::new();
        let s = session(&launcher).await;
        s.open_url("https://a.com").await.unwrap();
        s.press_key("Return").await.unwrap();
        assert!(launcher.ops().contains(&"press_key:1:Enter".to_string()));
    }

    #[tokio::test]
    async fn test_selector_actions_require_unique_match() {
        let launcher = MockLauncher::new()
            .with_selector_count("#login", 1)
            .with_selector_count(".item", 3);
        let s = session(&launcher).await;
        s.open_url("https://a.com").await.unwrap();
        assert!(s.click_element("#login").await.unwrap());
        assert!(!s.click_element(".item").await.unwrap());
        assert!(!s.input_element("#missing", "x").await.unwrap());
    }

    #[test]
    fn test_screenshot_downscaled_to_viewport() {
        let big = image::DynamicImage::new_rgb8(64, 40);
        let mut buf = Cursor::new(Vec::new());
        big.write_to(&mut buf, ImageFormat::Png).unwrap();
        let out = fit_to_viewport(buf.into_inner(), Viewport { width: 32, height: 20 });
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 20));
    }
}
