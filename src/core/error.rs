//! 运行时错误类型
//!
//! 所有失败都以单次调用为范围：Lookup / Transport 对该调用是终态（不回传模型），
//! Internal 子处理器的 Execution 错误既上报前端也回传模型；Resource 错误中止当前自动化轮次；
//! Cancelled 表示外部停止信号，由循环转为可见提示而不是向上抛出。

use serde::Serialize;
use thiserror::Error;

/// 编排运行时中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// 未知工具或工具定义不完整（如 Backend 工具缺少 URL）
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// 后端 HTTP / 网络失败
    #[error("Transport error: {0}")]
    Transport(String),

    /// 内部处理异常或前置条件缺失（如未打开页面就截图）
    #[error("Execution error: {0}")]
    Execution(String),

    /// 会话创建或浏览器驱动失败
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    /// 工具定义存储读取 / 解析失败
    #[error("Tool store error: {0}")]
    Store(String),
}

/// 错误分类（随 StreamEvent::Error 一起序列化给前端）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Lookup,
    Transport,
    Execution,
    Resource,
    Cancelled,
    Config,
    Store,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Lookup(_) => ErrorKind::Lookup,
            RelayError::Transport(_) => ErrorKind::Transport,
            RelayError::Execution(_) => ErrorKind::Execution,
            RelayError::Resource(_) => ErrorKind::Resource,
            RelayError::Cancelled => ErrorKind::Cancelled,
            RelayError::Config(_) => ErrorKind::Config,
            RelayError::Store(_) => ErrorKind::Store,
        }
    }

    /// 去掉分类前缀的原始信息，用作回传模型的工具结果
    pub fn detail(&self) -> String {
        match self {
            RelayError::Lookup(s)
            | RelayError::Transport(s)
            | RelayError::Execution(s)
            | RelayError::Resource(s)
            | RelayError::Config(s)
            | RelayError::Store(s) => s.clone(),
            RelayError::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(RelayError::Lookup("x".into()).kind(), ErrorKind::Lookup);
        assert_eq!(RelayError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_detail_strips_prefix() {
        let err = RelayError::Transport("connection refused".into());
        assert_eq!(err.detail(), "connection refused");
        assert_eq!(err.to_string(), "Transport error: connection refused");
    }
}
