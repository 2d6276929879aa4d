//! 对话状态
//!
//! 由问答轮次（Exchange）组成，每轮包含带类型的提问 / 回答内容单元。
//! 调用方持有原始对话；子处理器与自动化循环向下委托时只操作派生副本（derive_for_delegate），
//! 多轮子处理器的副本按调用 ID 存回调用方，供下一次用户消息重入。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::events::base64_bytes;
use crate::tools::{ToolCall, ToolOutcome};

/// 内容单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentUnit {
    Text {
        text: String,
    },
    Image {
        mime: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    File {
        file_name: String,
        mime: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    /// 回答侧：模型请求的调用及其结果；提问侧：客户端回填的结果
    FunctionCall {
        calls: Vec<ToolCall>,
    },
    /// 系统提示（并入 system_prompt，不单独保存）
    System {
        text: String,
    },
    /// `Q:` / `A:` 格式的虚拟历史
    VirtualContext {
        text: String,
    },
}

impl ContentUnit {
    pub fn text(text: impl Into<String>) -> Self {
        ContentUnit::Text { text: text.into() }
    }
}

/// 一轮问答
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub questions: Vec<ContentUnit>,
    pub answers: Vec<ContentUnit>,
}

/// Agent 子处理器完成后留下的 (角色, 文本)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    /// 只追加，生命周期与对话相同
    #[serde(default)]
    pub agent_results: Vec<AgentResult>,
    /// 多轮子处理器的子对话，key 为调用 ID
    #[serde(default)]
    pub sub_conversations: BTreeMap<String, ConversationState>,
    /// 目标模型标签（子处理器委托时设置）
    #[serde(default)]
    pub model: Option<String>,
    /// 已逐轮持久化，外层日志无需再次记录
    #[serde(default)]
    pub persisted: bool,
}

static VIRTUAL_Q_RE: OnceLock<Regex> = OnceLock::new();
static VIRTUAL_A_RE: OnceLock<Regex> = OnceLock::new();

fn virtual_question_start() -> &'static Regex {
    VIRTUAL_Q_RE.get_or_init(|| Regex::new(r"(?m)^Q[:：]\s*").expect("literal regex"))
}

fn virtual_answer_start() -> &'static Regex {
    VIRTUAL_A_RE.get_or_init(|| Regex::new(r"\nA[:：]\s*").expect("literal regex"))
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// 以一条文本提问开始的对话
    pub fn with_question(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut conv = Self::new(session_id);
        conv.add_question(ContentUnit::text(text));
        conv
    }

    /// 添加提问内容
    ///
    /// 系统内容只在第一轮并入 system_prompt（已包含则忽略）；虚拟上下文展开为历史轮次；
    /// 客户端回填的调用结果写回上一轮记录的调用；其余内容追加到尚无回答的最后一轮，否则新开一轮。
    pub fn add_question(&mut self, unit: ContentUnit) {
        match unit {
            ContentUnit::System { text } => {
                if !self.inject_system_once(&text) {
                    tracing::debug!(exchanges = self.exchanges.len(), "system content ignored");
                }
            }
            ContentUnit::VirtualContext { text } => {
                self.add_virtual_contexts(&text);
            }
            ContentUnit::FunctionCall { calls } => {
                for call in calls {
                    if let Some(outcome) = call.outcome {
                        self.apply_tool_result(&call.id, outcome);
                    }
                }
            }
            other => match self.exchanges.last_mut() {
                Some(last) if last.answers.is_empty() => last.questions.push(other),
                _ => self.exchanges.push(Exchange {
                    questions: vec![other],
                    answers: Vec::new(),
                }),
            },
        }
    }

    pub fn add_answer(&mut self, unit: ContentUnit) {
        if self.exchanges.is_empty() {
            self.exchanges.push(Exchange::default());
        }
        if let Some(last) = self.exchanges.last_mut() {
            last.answers.push(unit);
        }
    }

    fn append_system(&mut self, text: &str) -> bool {
        if text.is_empty() || self.system_prompt.contains(text) {
            return false;
        }
        if !self.system_prompt.is_empty() {
            self.system_prompt.push('\n');
        }
        self.system_prompt.push_str(text);
        true
    }

    /// 仅在第一轮注入系统提示，且同一内容最多一次
    pub fn inject_system_once(&mut self, text: &str) -> bool {
        if self.exchanges.len() > 1 {
            return false;
        }
        self.append_system(text)
    }

    /// 展开 `Q:` / `A:` 文本为历史轮次（插在尚未回答的当前轮之前）
    pub fn add_virtual_contexts(&mut self, text: &str) -> usize {
        let starts: Vec<(usize, usize)> = virtual_question_start()
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();

        let mut parsed = Vec::new();
        for (i, (_, body_start)) in starts.iter().enumerate() {
            let body_end = starts.get(i + 1).map(|(s, _)| *s).unwrap_or(text.len());
            let segment = &text[*body_start..body_end];
            let Some(a) = virtual_answer_start().find(segment) else {
                continue;
            };
            let question = segment[..a.start()].trim();
            let answer = segment[a.end()..].trim_end();
            parsed.push(Exchange {
                questions: vec![ContentUnit::text(question)],
                answers: vec![ContentUnit::text(answer)],
            });
        }

        let count = parsed.len();
        let pending = matches!(self.exchanges.last(), Some(last) if last.answers.is_empty());
        let at = if pending {
            self.exchanges.len() - 1
        } else {
            self.exchanges.len()
        };
        self.exchanges.splice(at..at, parsed);
        count
    }

    /// 用于场景匹配的文本：系统提示 + 所有文本提问
    pub fn scene_text(&self) -> String {
        let mut text = self.system_prompt.clone();
        for exchange in &self.exchanges {
            for unit in &exchange.questions {
                if let ContentUnit::Text { text: t } = unit {
                    text.push('\n');
                    text.push_str(t);
                }
            }
        }
        text
    }

    /// 向下委托用的派生副本：只带 AgentResult，不带历史与子对话
    pub fn derive_for_delegate(&self) -> ConversationState {
        ConversationState {
            session_id: self.session_id.clone(),
            agent_results: self.agent_results.clone(),
            ..Default::default()
        }
    }

    /// 当前轮（最后一轮）的提问内容
    pub fn current_questions(&self) -> Vec<ContentUnit> {
        self.exchanges
            .last()
            .map(|e| e.questions.clone())
            .unwrap_or_default()
    }

    /// 上一轮回答中记录的调用
    pub fn previous_calls(&self) -> Vec<ToolCall> {
        let n = self.exchanges.len();
        if n < 2 {
            return Vec::new();
        }
        calls_in(&self.exchanges[n - 2])
    }

    /// 当前轮回答的纯文本
    pub fn last_answer_text(&self) -> String {
        let mut out = String::new();
        if let Some(last) = self.exchanges.last() {
            for unit in &last.answers {
                if let ContentUnit::Text { text } = unit {
                    out.push_str(text);
                }
            }
        }
        out
    }

    pub fn find_tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCall> {
        self.exchanges
            .iter_mut()
            .rev()
            .flat_map(|e| e.answers.iter_mut().rev())
            .filter_map(|unit| match unit {
                ContentUnit::FunctionCall { calls } => Some(calls.iter_mut()),
                _ => None,
            })
            .flatten()
            .find(|c| c.id == call_id)
    }

    /// 把结果写回已记录的调用；找不到对应调用时返回 false
    pub fn apply_tool_result(&mut self, call_id: &str, outcome: ToolOutcome) -> bool {
        match self.find_tool_call_mut(call_id) {
            Some(call) => {
                call.outcome = Some(outcome);
                true
            }
            None => {
                tracing::debug!(call_id = %call_id, "no recorded call for tool result");
                false
            }
        }
    }

    /// 用最新状态替换已记录的调用
    pub fn update_tool_call(&mut self, updated: &ToolCall) -> bool {
        match self.find_tool_call_mut(&updated.id) {
            Some(call) => {
                *call = updated.clone();
                true
            }
            None => false,
        }
    }

    /// 指定角色最近一次的结果
    pub fn agent_result(&self, role: &str) -> Option<&AgentResult> {
        self.agent_results.iter().rev().find(|r| r.role == role)
    }

    pub fn push_agent_result(&mut self, role: impl Into<String>, text: impl Into<String>) {
        self.agent_results.push(AgentResult {
            role: role.into(),
            text: text.into(),
        });
    }
}

fn calls_in(exchange: &Exchange) -> Vec<ToolCall> {
    exchange
        .answers
        .iter()
        .filter_map(|unit| match unit {
            ContentUnit::FunctionCall { calls } => Some(calls.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}
