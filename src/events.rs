//! 流式事件：一轮对话中向外层传输层输出的有序事件
//!
//! 每轮产生一个只能消费一次的惰性序列（EventStream），事件顺序即发送顺序，
//! 嵌套委托（子处理器 / 自动化循环）向外转发时必须保持原有顺序。

use std::pin::Pin;

use futures_util::Stream;
use serde::Serialize;

use crate::core::{ErrorKind, RelayError};
use crate::tools::ToolCall;

/// 单个流式事件（序列化为 JSON 供传输层使用）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AnswerStarted,
    /// 回答增量文本
    AnswerDelta { text: String },
    AnswerFinished,
    /// 思考过程增量（不回写对话）
    ReasoningDelta { text: String },
    /// 模型本轮请求的原始工具调用（由轮次执行器截获，不直接外发）
    FunctionCalls { calls: Vec<ToolCall> },
    /// 需要由外部（前端或自动化循环）执行的调用
    ToolCallRequested { call: ToolCall },
    /// 开始执行 Backend / Internal 工具
    ToolExecutionStarted {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// 子处理器的终态结果
    ToolResult { text: String },
    SearchResult { text: String },
    FileBytes {
        file_name: String,
        mime: String,
        #[serde(with = "crate::events::base64_bytes")]
        bytes: Vec<u8>,
    },
    ImageBytes {
        mime: String,
        #[serde(with = "crate::events::base64_bytes")]
        bytes: Vec<u8>,
    },
    Error { kind: ErrorKind, message: String },
    Waiting { text: String },
    FollowUpSuggestions { items: Vec<String> },
}

impl StreamEvent {
    pub fn answer(text: impl Into<String>) -> Self {
        StreamEvent::AnswerDelta { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        StreamEvent::ReasoningDelta { text: text.into() }
    }

    pub fn error(err: &RelayError) -> Self {
        StreamEvent::Error {
            kind: err.kind(),
            message: err.detail(),
        }
    }

    /// 子处理器的终态事件（结果 / 搜索结果 / 错误）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ToolResult { .. } | StreamEvent::SearchResult { .. } | StreamEvent::Error { .. }
        )
    }
}

/// 一轮的惰性事件序列
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>;

/// 二进制负载以 base64 文本序列化
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
