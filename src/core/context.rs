//! 单轮上下文：会话标识、调用者身份、停止信号与嵌套层级
//!
//! 停止信号是粗粒度的：分发器在两次调用之间、自动化循环在两轮之间轮询，不打断进行中的操作。
//! 嵌套委托使用子 token，外层取消会逐层传递到最内层。

use tokio_util::sync::CancellationToken;

/// 未指定会话时共享的默认会话 key
pub const DEFAULT_SESSION_KEY: &str = "main";

/// 一次用户轮次的上下文，随分发器 / 子处理器 / 自动化循环向下传递
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// 会话 ID（也是自动化会话池的 key）
    pub conversation_id: String,
    /// 外部用户 ID，决定沙箱目录
    pub user_id: String,
    /// 调用后端工具时透传的用户 token
    pub auth_token: Option<String>,
    /// 外部停止信号
    pub stop: CancellationToken,
    /// 当前委托深度（顶层为 0）
    pub depth: usize,
}

impl TurnContext {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            auth_token: None,
            stop: CancellationToken::new(),
            depth: 0,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 会话池 key：空会话 ID 时回落到共享的默认实例
    pub fn session_key(&self) -> &str {
        if self.conversation_id.is_empty() {
            DEFAULT_SESSION_KEY
        } else {
            &self.conversation_id
        }
    }

    /// 下一层委托使用的上下文：深度 +1，停止信号为子 token
    pub fn nested(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            auth_token: self.auth_token.clone(),
            stop: self.stop.child_token(),
            depth: self.depth + 1,
        }
    }
}
