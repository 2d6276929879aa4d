//! 单次工具调用及其结果槽
//!
//! ToolCall 在模型一轮输出中创建，由分发器在该轮生命周期内持有并填写 outcome，
//! 之后由轮次执行器写回对话记录。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::RelayError;
use crate::events::base64_bytes;

/// 工具的执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// 原样 HTTP 调用后端
    Backend,
    /// 交给内部子处理器
    Internal,
    /// 转发给客户端执行，下一轮回填结果
    #[default]
    FrontendForwarded,
}

/// 成功结果的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeValue {
    Text { text: String },
    Image {
        mime: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

/// 调用结果（成功 / 失败），取代按字符串区分类型的做法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { value: OutcomeValue },
    Error { message: String },
}

impl ToolOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutcome::Success {
            value: OutcomeValue::Text { text: text.into() },
        }
    }

    pub fn image(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        ToolOutcome::Success {
            value: OutcomeValue::Image {
                mime: mime.into(),
                bytes,
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolOutcome::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error { .. })
    }

    /// 文本形式（图片只给出占位描述）
    pub fn as_text(&self) -> String {
        match self {
            ToolOutcome::Success {
                value: OutcomeValue::Text { text },
            } => text.clone(),
            ToolOutcome::Success {
                value: OutcomeValue::Image { mime, bytes },
            } => format!("[{} image, {} bytes]", mime, bytes.len()),
            ToolOutcome::Error { message } => message.clone(),
        }
    }
}

impl From<&RelayError> for ToolOutcome {
    fn from(err: &RelayError) -> Self {
        ToolOutcome::error(err.detail())
    }
}

/// 中性的“已完成”结果（前端转发 / 环境控制调用的占位）
pub const DONE: &str = "DONE";

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 原始参数（JSON 文本，不透明）
    #[serde(default)]
    pub arguments: String,
    /// 由注册表解析得到，不信任模型提供的值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ToolOutcome>,
    #[serde(default)]
    pub needs_resubmission: bool,
    /// 回传模型时替换原始结果的提示（`{result}` 处填入原始结果）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_override: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            executor: None,
            outcome: None,
            needs_resubmission: false,
            prompt_override: None,
        }
    }

    /// 解析参数；空参数视为 `{}`
    pub fn parse_arguments(&self) -> Result<Value, RelayError> {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(raw)
            .map_err(|e| RelayError::Execution(format!("Invalid arguments for {}: {}", self.name, e)))
    }

    /// 同名同参数视为同一请求（批内去重）
    pub fn same_request(&self, other: &ToolCall) -> bool {
        self.name == other.name && self.arguments.trim() == other.arguments.trim()
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn succeed(&mut self, text: impl Into<String>) {
        self.outcome = Some(ToolOutcome::text(text));
    }

    /// 回传模型的文本：有 prompt_override 时用它替换原始结果
    pub fn model_facing_text(&self) -> String {
        let raw = self.outcome.as_ref().map(ToolOutcome::as_text).unwrap_or_default();
        match &self.prompt_override {
            Some(prompt) if prompt.contains("{result}") => prompt.replace("{result}", &raw),
            Some(prompt) => prompt.clone(),
            None => raw,
        }
    }
}
