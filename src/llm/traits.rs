//! 模型提供方抽象
//!
//! 给定对话状态，返回一轮惰性、可取消的事件序列；具体厂商协议、提示格式与模型选择都在实现内部。
//! 提供方只读对话：回答与工具调用由轮次执行器（dispatch::turn）写回。

use crate::conversation::ConversationState;
use crate::core::TurnContext;
use crate::events::EventStream;
use crate::tools::ToolDefinition;

/// 模型提供方
pub trait ModelProvider: Send + Sync {
    /// 注册标签
    fn name(&self) -> &str;

    /// 提交对话与本轮可用的工具定义，返回事件流；模型请求的工具调用以 `StreamEvent::FunctionCalls` 给出。
    /// 实现应在 `ctx.stop` 取消后尽快结束流。
    fn stream<'a>(
        &'a self,
        conversation: &'a ConversationState,
        tools: &'a [ToolDefinition],
        ctx: &'a TurnContext,
    ) -> EventStream<'a>;
}
