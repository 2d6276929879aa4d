//! 脚本化提供方（用于测试与本地联调，无需 API）
//!
//! 按顺序回放预先写好的轮次；脚本用完后若设置了 repeating 则重复该轮，否则回显最后一条文本提问。
//! 每次提交的对话都会被记录，便于断言模型实际看到的内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::conversation::{ContentUnit, ConversationState};
use crate::core::TurnContext;
use crate::events::{EventStream, StreamEvent};
use crate::llm::ModelProvider;
use crate::tools::{ToolCall, ToolDefinition};

pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Vec<StreamEvent>>>,
    repeating: Option<Vec<StreamEvent>>,
    seen: Mutex<Vec<ConversationState>>,
    seen_tools: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            repeating: None,
            seen: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
        }
    }

    pub fn with_turn(self, events: Vec<StreamEvent>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(events);
        }
        self
    }

    /// 纯文本回答轮
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_turn(text_turn(text))
    }

    /// 请求工具调用的轮
    pub fn with_calls(self, calls: Vec<ToolCall>) -> Self {
        self.with_turn(vec![StreamEvent::FunctionCalls { calls }])
    }

    /// 脚本用完后重复的轮
    pub fn repeating(mut self, events: Vec<StreamEvent>) -> Self {
        self.repeating = Some(events);
        self
    }

    /// 已提交次数
    pub fn submissions(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 每次提交时看到的对话
    pub fn seen(&self) -> Vec<ConversationState> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// 每次提交时呈现的工具名
    pub fn seen_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_turn(&self, conversation: &ConversationState, tools: &[ToolDefinition]) -> Vec<StreamEvent> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(conversation.clone());
        }
        if let Ok(mut seen) = self.seen_tools.lock() {
            seen.push(tools.iter().map(|t| t.name.clone()).collect());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (scripted, &self.repeating) {
            (Some(events), _) => events,
            (None, Some(events)) => events.clone(),
            (None, None) => {
                let last = conversation
                    .current_questions()
                    .into_iter()
                    .rev()
                    .find_map(|u| match u {
                        ContentUnit::Text { text } => Some(text),
                        _ => None,
                    })
                    .unwrap_or_else(|| "(no input)".to_string());
                text_turn(format!("Echo: {}", last))
            }
        }
    }
}

/// AnswerStarted / AnswerDelta / AnswerFinished
pub fn text_turn(text: impl Into<String>) -> Vec<StreamEvent> {
    vec![
        StreamEvent::AnswerStarted,
        StreamEvent::answer(text),
        StreamEvent::AnswerFinished,
    ]
}

impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream<'a>(
        &'a self,
        conversation: &'a ConversationState,
        tools: &'a [ToolDefinition],
        ctx: &'a TurnContext,
    ) -> EventStream<'a> {
        let events = self.next_turn(conversation, tools);
        Box::pin(async_stream::stream! {
            for event in events {
                if ctx.is_stopped() {
                    break;
                }
                yield event;
            }
        })
    }
}
