//! Headless Chrome 驱动（feature "browser"，需安装 Chrome/Chromium）
//!
//! headless_chrome 是同步 API，每个操作都放进 spawn_blocking。
//! 每个会话由 launch 独占一个浏览器进程（会话之间不共享 Cookie 与存储），页面以 PageId -> Tab 保存；shutdown 时丢弃 Browser 即结束进程。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::automation::driver::{BrowserDriver, BrowserLauncher, PageId, Viewport};
use crate::core::RelayError;

async fn blocking<T, F>(f: F) -> Result<T, RelayError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelayError::Resource(format!("browser task join: {}", e)))?
        .map_err(|e| RelayError::Resource(e.to_string()))
}

/// JS 字符串字面量
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    headless: bool,
}

impl ChromeLauncher {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn BrowserDriver>, RelayError> {
        let headless = self.headless;
        let browser = blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .window_size(Some((viewport.width, viewport.height)))
                .build()
                .map_err(|e| anyhow::anyhow!("Chrome launch options: {}", e))?;
            Browser::new(options)
        })
        .await
        .map_err(|e| RelayError::Resource(format!("Chrome launch failed: {}. Install Chrome/Chromium.", e.detail())))?;

        tracing::info!(width = viewport.width, height = viewport.height, "chrome launched");
        Ok(Box::new(ChromeDriver {
            browser: Some(browser),
            tabs: HashMap::new(),
            next_page: 0,
        }))
    }
}

pub struct ChromeDriver {
    browser: Option<Browser>,
    tabs: HashMap<PageId, Arc<Tab>>,
    next_page: u64,
}

impl ChromeDriver {
    fn tab(&self, page: PageId) -> Result<Arc<Tab>, RelayError> {
        self.tabs
            .get(&page)
            .cloned()
            .ok_or_else(|| RelayError::Execution(format!("Error: page {} is closed.", page.0)))
    }

    async fn eval(&self, page: PageId, script: String) -> Result<serde_json::Value, RelayError> {
        let tab = self.tab(page)?;
        blocking(move || {
            let result = tab.evaluate(&script, false)?;
            Ok(result.value.unwrap_or(serde_json::Value::Null))
        })
        .await
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn new_page(&mut self) -> Result<PageId, RelayError> {
        let browser = self
            .browser
            .clone()
            .ok_or_else(|| RelayError::Resource("browser already shut down".to_string()))?;
        let tab = blocking(move || browser.new_tab()).await?;
        self.next_page += 1;
        let page = PageId(self.next_page);
        self.tabs.insert(page, tab);
        Ok(page)
    }

    async fn close_page(&mut self, page: PageId) -> Result<(), RelayError> {
        if let Some(tab) = self.tabs.remove(&page) {
            blocking(move || tab.close(true).map(|_| ())).await?;
        }
        Ok(())
    }

    async fn navigate(&mut self, page: PageId, url: &str, timeout: Duration) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        let url = url.to_string();
        let nav = blocking(move || {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        });
        tokio::time::timeout(timeout + Duration::from_secs(1), nav)
            .await
            .map_err(|_| RelayError::Resource(format!("navigation timed out after {}s", timeout.as_secs())))?
    }

    async fn wait_for_load(&mut self, page: PageId, timeout: Duration) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        blocking(move || {
            tab.set_default_timeout(timeout);
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn history_back(&mut self, page: PageId) -> Result<(), RelayError> {
        self.eval(page, "history.back()".to_string()).await.map(|_| ())
    }

    async fn screenshot(&mut self, page: PageId) -> Result<Vec<u8>, RelayError> {
        let tab = self.tab(page)?;
        blocking(move || tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)).await
    }

    async fn mouse_move(&mut self, page: PageId, x: i64, y: i64) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        blocking(move || {
            tab.move_mouse_to_point(Point { x: x as f64, y: y as f64 })?;
            Ok(())
        })
        .await
    }

    async fn mouse_click(&mut self, page: PageId, x: i64, y: i64) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        blocking(move || {
            tab.click_point(Point { x: x as f64, y: y as f64 })?;
            Ok(())
        })
        .await
    }

    async fn insert_text(&mut self, page: PageId, text: &str) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        let text = text.to_string();
        blocking(move || {
            tab.send_character(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&mut self, page: PageId, key: &str) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        let key = key.to_string();
        blocking(move || {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn wheel(&mut self, page: PageId, delta_x: i64, delta_y: i64) -> Result<(), RelayError> {
        self.eval(page, format!("window.scrollBy({}, {})", delta_x, delta_y))
            .await
            .map(|_| ())
    }

    async fn evaluate(&mut self, page: PageId, script: &str) -> Result<String, RelayError> {
        Ok(match self.eval(page, script.to_string()).await? {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    async fn count_matches(&mut self, page: PageId, selector: &str) -> Result<usize, RelayError> {
        let script = format!(
            "(() => {{ try {{ return document.querySelectorAll({}).length; }} catch (e) {{ return 0; }} }})()",
            js_string(selector)
        );
        let value = self.eval(page, script).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn click_selector(&mut self, page: PageId, selector: &str) -> Result<(), RelayError> {
        let tab = self.tab(page)?;
        let selector = selector.to_string();
        blocking(move || {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn fill_selector(&mut self, page: PageId, selector: &str, text: &str) -> Result<(), RelayError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); el.focus(); el.value = {}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
            js_string(selector),
            js_string(text)
        );
        self.eval(page, script).await.map(|_| ())
    }

    async fn shutdown(&mut self) -> Result<(), RelayError> {
        for (_, tab) in self.tabs.drain() {
            if let Err(e) = blocking(move || tab.close(true).map(|_| ())).await {
                tracing::debug!(error = %e, "close tab failed during shutdown");
            }
        }
        if self.browser.take().is_some() {
            tracing::info!("chrome shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string(r#"a[name="q"]"#), r#""a[name=\"q\"]""#);
    }
}
