//! 核心层：错误分类、单轮上下文（停止信号）、优雅关闭

pub mod context;
pub mod error;
pub mod shutdown;

pub use context::{TurnContext, DEFAULT_SESSION_KEY};
pub use error::{ErrorKind, RelayError};
pub use shutdown::{run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
