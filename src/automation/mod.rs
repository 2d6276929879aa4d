//! 自动化：浏览器 / 文件 / Shell 环境与驱动它的工具循环
//!
//! - **driver**: BrowserDriver / BrowserLauncher 接缝
//! - **session**: 单个自动化会话（页面栈、指针、最后操作时间）
//! - **pool**: 按 key 懒创建的会话池与空闲回收
//! - **sandbox**: 每用户沙箱中的文本编辑与 Shell
//! - **actions**: 环境控制工具的名称、参数与 Schema
//! - **loop_**: 提交 -> 执行 -> 再提交 的有界循环

pub mod actions;
#[cfg(feature = "browser")]
pub mod chrome;
pub mod content;
pub mod driver;
pub mod loop_;
pub mod mock;
pub mod persona;
pub mod pool;
pub mod sandbox;
pub mod session;

pub use actions::{environment_tool_definitions, is_environment_tool, ComputerAction, EditorCommand, EnvironmentCall, ENVIRONMENT_TOOLS};
#[cfg(feature = "browser")]
pub use chrome::ChromeLauncher;
pub use driver::{BrowserDriver, BrowserLauncher, PageId, UnavailableLauncher, Viewport};
pub use loop_::{AutomationLoop, AutomationSettings, AUTO_STOP_NOTICE, STOP_NOTICE};
pub use mock::MockLauncher;
pub use persona::{Persona, FINISH_TAG};
pub use pool::SessionPool;
pub use sandbox::Sandbox;
pub use session::{AutomationSession, SessionOptions};

use std::sync::Arc;

/// 按编译特性选择浏览器启动器
pub fn default_launcher(headless: bool) -> Arc<dyn BrowserLauncher> {
    #[cfg(feature = "browser")]
    {
        Arc::new(ChromeLauncher::new(headless))
    }
    #[cfg(not(feature = "browser"))]
    {
        tracing::warn!(headless, "browser feature disabled, automation sessions will be unavailable");
        Arc::new(UnavailableLauncher)
    }
}
