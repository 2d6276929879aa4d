//! 多技能 Agent 处理器（多轮）
//!
//! 静态技能表：技能名 -> (系统提示, 目标模型)。首次进入时把子对话重置为一条任务提问，
//! 按 need_contexts 拉入此前其它角色的 AgentResult，再追加技能系统提示。
//! 累积回答中出现终止标记才输出终态结果并追加 (角色, 文本)；否则不给结果，
//! 分发器保存子对话并放弃剩余批次，等待下一次用户消息重入。

use std::collections::HashMap;

use futures_util::StreamExt;
use serde::Deserialize;

use crate::conversation::{ContentUnit, ConversationState};
use crate::core::{RelayError, TurnContext};
use crate::dispatch::Dispatcher;
use crate::events::{EventStream, StreamEvent};
use crate::processors::SubProcessor;
use crate::tools::ToolCall;

pub const AGENT_FINISH_MARKER: &str = "<finish>true</finish>";

const ASK_WHEN_UNSURE: &str = "对任务有任何不确定、模糊或缺失的信息，可以随时向用户提问，补充后再继续。";

/// (技能, 默认模型, 系统提示)
const BUILTIN_SKILLS: &[(&str, &str, &str)] = &[
    (
        "信息搜集",
        "claude",
        "你可以使用搜索摘要工具获取某个主题的相关信息。一次搜索的关键词不要太多，复杂的任务拆分成多次搜索。\
         每次调用时说明本次搜索的目的以及需要返回的信息内容和格式。",
    ),
    (
        "操作助手",
        "automation",
        "你需要通过可用的环境工具完成用户的操作指令。即使只是读写文件，完成后也要输出结束标记。",
    ),
    (
        "方案设计",
        "deepseek-r1",
        "你是一名方案设计师，需要完成用户指定需求的详细方案设计。",
    ),
    (
        "代码编写",
        "claude",
        "你是一名程序设计师，需要根据用户提供的方案编写完整的代码实现，保持结构简洁、代码完整。",
    ),
    (
        "文档编写",
        "claude",
        "你是一名文档编写专家，根据已知信息编写结构合理、逻辑清晰、内容完整的文档。",
    ),
    (
        "审阅者",
        "minimax",
        "你是一名评审专家，对文章、需求文档和代码进行质量评审，只返回修改意见，不需要返回原文。",
    ),
    (
        "计算者",
        "gpt-4o",
        "你是一名数学专家，把问题转换成一行数学表达式并调用数学计算器得到精确结果，再给出计算过程和结论。",
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSkill {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
}

impl AgentSkill {
    pub fn new(name: impl Into<String>, model: impl Into<String>, instructions: &str) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            system_prompt: format!(
                "{}\n{}\n最后一次性输出完整的结果，并以{}结束输出，表示本次工作已经完成。",
                instructions, ASK_WHEN_UNSURE, AGENT_FINISH_MARKER
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentArgs {
    skill: String,
    role: String,
    task: String,
    #[serde(default)]
    need_contexts: Vec<String>,
}

fn parse_args(arguments: &str) -> Result<AgentArgs, RelayError> {
    let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
    serde_json::from_str(raw).map_err(|e| RelayError::Execution(format!("Agent 参数错误：{}", e)))
}

fn unknown_skill(skill: &str) -> RelayError {
    RelayError::Execution(format!("技能参数错误：{}", skill))
}

pub struct AgentProcessor {
    name: String,
    skills: HashMap<String, AgentSkill>,
}

impl Default for AgentProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentProcessor {
    pub fn new() -> Self {
        let skills = BUILTIN_SKILLS
            .iter()
            .map(|(name, model, prompt)| (name.to_string(), AgentSkill::new(*name, *model, prompt)))
            .collect();
        Self {
            name: "OneAgent".to_string(),
            skills,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 覆盖技能使用的模型；未知技能忽略
    pub fn with_model(mut self, skill: &str, model: impl Into<String>) -> Self {
        match self.skills.get_mut(skill) {
            Some(s) => s.model = model.into(),
            None => tracing::warn!(skill = %skill, "model override for unknown agent skill ignored"),
        }
        self
    }

    pub fn skill(&self, name: &str) -> Option<&AgentSkill> {
        self.skills.get(name)
    }
}

impl SubProcessor for AgentProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn multi_turn(&self) -> bool {
        true
    }

    fn prepare(&self, conversation: &mut ConversationState, arguments: &str) -> Result<(), RelayError> {
        let args = parse_args(arguments)?;
        let skill = self.skills.get(&args.skill).ok_or_else(|| unknown_skill(&args.skill))?;

        conversation.exchanges.clear();
        conversation.add_question(ContentUnit::text(args.task));
        for role in &args.need_contexts {
            let shared = conversation
                .agent_results
                .iter()
                .find(|r| &r.role == role)
                .map(|r| r.text.clone());
            match shared {
                Some(text) => conversation.add_question(ContentUnit::text(text)),
                None => tracing::debug!(role = %role, "requested agent context not found"),
            }
        }
        conversation.add_question(ContentUnit::System {
            text: skill.system_prompt.clone(),
        });
        conversation.model = Some(skill.model.clone());
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        call: &'a ToolCall,
        conversation: &'a mut ConversationState,
        dispatcher: &'a Dispatcher,
        ctx: &'a TurnContext,
        reenter: bool,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            let args = match parse_args(&call.arguments) {
                Ok(args) => args,
                Err(e) => {
                    yield StreamEvent::error(&e);
                    return;
                }
            };
            let Some(skill) = self.skills.get(&args.skill) else {
                yield StreamEvent::error(&unknown_skill(&args.skill));
                return;
            };
            let model = conversation.model.clone().unwrap_or_else(|| skill.model.clone());
            if !dispatcher.has_model(&model) {
                yield StreamEvent::error(&RelayError::Lookup(format!("模型参数配置错误：{}", model)));
                return;
            }

            tracing::info!(role = %args.role, skill = %args.skill, model = %model, reenter, "agent started");
            yield StreamEvent::reasoning(format!(">**助理 {} 开始工作，使用模型 {}**\n", args.role, model));

            let mut answer = String::new();
            {
                let mut events = dispatcher.run_turn(&model, &mut *conversation, ctx);
                while let Some(event) = events.next().await {
                    match event {
                        // 内层错误只作为过程信息展示，不作为本技能的结果
                        StreamEvent::Error { message, .. } => {
                            yield StreamEvent::reasoning(format!("{}\n", message));
                        }
                        other => {
                            if let StreamEvent::AnswerDelta { text } = &other {
                                answer.push_str(text);
                            }
                            yield other;
                        }
                    }
                }
            }

            if answer.contains(AGENT_FINISH_MARKER) {
                tracing::info!(role = %args.role, skill = %args.skill, "agent finished");
                conversation.push_agent_result(
                    args.role.clone(),
                    format!("以下为 {}提供的参考信息：\n{}", args.role, answer),
                );
                yield StreamEvent::ToolResult { text: answer };
            } else {
                tracing::debug!(role = %args.role, "agent awaiting user input");
            }
        })
    }
}
