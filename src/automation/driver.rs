//! 浏览器驱动接缝
//!
//! AutomationSession 只通过 BrowserDriver 操作浏览器；默认实现为 headless Chrome（feature "browser"），
//! 测试使用 automation::mock 中的记录型驱动。每个驱动对应一个浏览器进程。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::RelayError;

/// 逻辑视口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// 驱动内的页面句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(pub u64);

#[async_trait]
pub trait BrowserDriver: Send {
    async fn new_page(&mut self) -> Result<PageId, RelayError>;

    async fn close_page(&mut self, page: PageId) -> Result<(), RelayError>;

    /// 打开 URL 并等待 DOM 就绪与网络空闲，超过 timeout 视为失败
    async fn navigate(&mut self, page: PageId, url: &str, timeout: Duration) -> Result<(), RelayError>;

    /// 等待当前导航（若有）完成
    async fn wait_for_load(&mut self, page: PageId, timeout: Duration) -> Result<(), RelayError>;

    async fn history_back(&mut self, page: PageId) -> Result<(), RelayError>;

    /// PNG 截图（可能是设备像素尺寸）
    async fn screenshot(&mut self, page: PageId) -> Result<Vec<u8>, RelayError>;

    async fn mouse_move(&mut self, page: PageId, x: i64, y: i64) -> Result<(), RelayError>;

    async fn mouse_click(&mut self, page: PageId, x: i64, y: i64) -> Result<(), RelayError>;

    async fn insert_text(&mut self, page: PageId, text: &str) -> Result<(), RelayError>;

    async fn press_key(&mut self, page: PageId, key: &str) -> Result<(), RelayError>;

    async fn wheel(&mut self, page: PageId, delta_x: i64, delta_y: i64) -> Result<(), RelayError>;

    /// 执行脚本，返回字符串结果
    async fn evaluate(&mut self, page: PageId, script: &str) -> Result<String, RelayError>;

    /// 选择器匹配到的元素数量
    async fn count_matches(&mut self, page: PageId, selector: &str) -> Result<usize, RelayError>;

    async fn click_selector(&mut self, page: PageId, selector: &str) -> Result<(), RelayError>;

    async fn fill_selector(&mut self, page: PageId, selector: &str, text: &str) -> Result<(), RelayError>;

    /// 关闭浏览上下文与进程
    async fn shutdown(&mut self) -> Result<(), RelayError>;
}

/// 创建浏览器实例
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn BrowserDriver>, RelayError>;
}

/// 未编译浏览器支持时使用：每次创建都返回 ResourceError
#[derive(Debug, Default)]
pub struct UnavailableLauncher;

#[async_trait]
impl BrowserLauncher for UnavailableLauncher {
    async fn launch(&self, _viewport: Viewport) -> Result<Box<dyn BrowserDriver>, RelayError> {
        Err(RelayError::Resource(
            "Browser support not compiled in. Rebuild with: cargo build --features browser".to_string(),
        ))
    }
}
