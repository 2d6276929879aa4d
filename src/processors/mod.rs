//! 内部子处理器
//!
//! Internal 工具由子处理器执行：`prepare` 把参数映射到派生子对话（及目标模型），
//! `execute` 默认把子对话提交给目标模型并原样转发事件。
//! 终态事件（ToolResult / SearchResult / Error）由分发器截获为调用结果。
//!
//! 处理器在启动时显式注册到 ProcessorRegistry，名称即工具名。

pub mod agent;
pub mod delegate;
pub mod save_result;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;

use crate::conversation::ConversationState;
use crate::core::{RelayError, TurnContext};
use crate::dispatch::Dispatcher;
use crate::events::EventStream;
use crate::tools::ToolCall;

pub use agent::{AgentProcessor, AgentSkill, AGENT_FINISH_MARKER};
pub use delegate::DelegateProcessor;
pub use save_result::SaveResultProcessor;

/// 子处理器
pub trait SubProcessor: Send + Sync {
    /// 注册名（对应工具名）
    fn name(&self) -> &str;

    /// 执行过程是否可以跨越多个用户轮次
    fn multi_turn(&self) -> bool {
        false
    }

    /// 委托前是否丢弃调用方当前轮的提问内容
    fn clears_questions(&self) -> bool {
        !self.multi_turn()
    }

    /// 首次进入时把参数映射到子对话（重入时不调用）
    fn prepare(&self, _conversation: &mut ConversationState, _arguments: &str) -> Result<(), RelayError> {
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        _call: &'a ToolCall,
        conversation: &'a mut ConversationState,
        dispatcher: &'a Dispatcher,
        ctx: &'a TurnContext,
        _reenter: bool,
    ) -> EventStream<'a> {
        delegate_to_model(conversation, dispatcher, ctx)
    }
}

/// 把子对话提交给 `conversation.model`（未设置时为默认模型）并转发全部事件
pub fn delegate_to_model<'a>(
    conversation: &'a mut ConversationState,
    dispatcher: &'a Dispatcher,
    ctx: &'a TurnContext,
) -> EventStream<'a> {
    Box::pin(async_stream::stream! {
        let model = conversation
            .model
            .clone()
            .unwrap_or_else(|| dispatcher.default_model().to_string());
        let mut events = dispatcher.run_turn(&model, &mut *conversation, ctx);
        while let Some(event) = events.next().await {
            yield event;
        }
    })
}

#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn SubProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn SubProcessor>) {
        let name = processor.name().to_string();
        if self.processors.insert(name.clone(), processor).is_some() {
            tracing::warn!(processor = %name, "processor registered twice, replacing");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SubProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
