//! 调用分发器
//!
//! 接收一次模型输出中的工具调用批次，按顺序逐个路由：
//! - 内置透传别名（`$web_search`）：原样回显参数并标记回传
//! - 环境控制调用：占位成功 + ToolCallRequested，交给自动化循环认领
//! - Backend：HTTP 调用后端（批内去重）
//! - Internal：委托给子处理器（批内去重，多轮处理器无结果时放弃剩余批次）
//! - FrontendForwarded：占位成功并转发给客户端（批内去重）
//!
//! 分发器同时是组合根：持有工具注册表、提供方注册表、子处理器注册表与可选的自动化循环，
//! 子处理器与自动化循环通过 `&Dispatcher` 回调提交模型，不持有它的所有权。

pub mod backend;
mod turn;

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;

use crate::automation::{is_environment_tool, AutomationLoop};
use crate::conversation::{ContentUnit, ConversationState};
use crate::core::{RelayError, TurnContext};
use crate::events::{EventStream, StreamEvent};
use crate::llm::ProviderRegistry;
use crate::processors::ProcessorRegistry;
use crate::tools::{ExecutorKind, ToolCall, ToolDefinition, ToolOutcome, ToolRegistry, DONE};

pub use backend::{expand_url, BackendClient, MISSING_URL};

pub const TOOL_NOT_FOUND: &str = "[FUNC FAILED] 方法未找到";
/// 提供方原生联网搜索的回显别名
pub const WEB_SEARCH_ALIAS: &str = "$web_search";

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// 场景选择使用的工具分组
    pub tool_group: String,
    /// 子处理器未指定模型时使用的提供方
    pub default_model: String,
    /// 同一轮内最多回传模型的次数
    pub max_resubmissions: usize,
    /// 子处理器 / 自动化循环的最大嵌套深度
    pub max_depth: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            tool_group: crate::tools::DEFAULT_GROUP.to_string(),
            default_model: "claude".to_string(),
            max_resubmissions: 10,
            max_depth: 4,
        }
    }
}

pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    backend: BackendClient,
    processors: ProcessorRegistry,
    providers: ProviderRegistry,
    automation: Option<AutomationLoop>,
    settings: DispatchSettings,
}

/// 每个工具调用一行 JSON 审计日志
pub(crate) fn log_audit(call: &ToolCall, executor: &str, outcome: Option<&ToolOutcome>, started: Instant) {
    let duration_ms = started.elapsed().as_millis() as u64;
    let (ok, label) = match outcome {
        None => (false, "pending"),
        Some(o) if o.is_error() => (false, "error"),
        Some(_) => (true, "ok"),
    };
    let args_preview = if call.arguments.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", call.arguments.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        call.arguments.clone()
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.name,
        "call_id": call.id,
        "executor": executor,
        "ok": ok,
        "outcome": label,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

/// 批内已执行的同名同参数调用
fn find_executed<'c>(calls: &'c [ToolCall], executed: &[usize], call: &ToolCall) -> Option<&'c ToolCall> {
    executed
        .iter()
        .map(|&j| &calls[j])
        .find(|prior| prior.same_request(call) && prior.is_resolved())
}

impl Dispatcher {
    pub fn new(tools: Arc<ToolRegistry>, providers: ProviderRegistry) -> Self {
        Self {
            tools,
            backend: BackendClient::with_client(reqwest::Client::new(), "x-access-token", "body"),
            processors: ProcessorRegistry::new(),
            providers,
            automation: None,
            settings: DispatchSettings::default(),
        }
    }

    pub fn with_backend(mut self, backend: BackendClient) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_automation(mut self, automation: AutomationLoop) -> Self {
        self.automation = Some(automation);
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    pub fn automation(&self) -> Option<&AutomationLoop> {
        self.automation.as_ref()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn default_model(&self) -> &str {
        &self.settings.default_model
    }

    /// 标签可路由：已注册的提供方或自动化循环
    pub fn has_model(&self, label: &str) -> bool {
        self.providers.contains(label) || self.automation.as_ref().is_some_and(|a| a.label() == label)
    }

    /// 按顺序分发一批调用，结果写入各调用的 outcome
    ///
    /// `reenter` 只作用于批内第一个尚未解决的调用：多轮子处理器以保存的子对话继续执行。
    pub fn dispatch<'a>(
        &'a self,
        calls: &'a mut Vec<ToolCall>,
        caller: &'a mut ConversationState,
        ctx: &'a TurnContext,
        reenter: bool,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            let mut reenter = reenter;
            let mut executed: Vec<usize> = Vec::new();

            for i in 0..calls.len() {
                if ctx.is_stopped() {
                    tracing::info!(remaining = calls.len() - i, "dispatch stopped by signal");
                    break;
                }
                if calls[i].is_resolved() {
                    tracing::debug!(tool = %calls[i].name, "call already resolved, passing through");
                    continue;
                }
                let reenter_this = std::mem::take(&mut reenter);

                if calls[i].name == WEB_SEARCH_ALIAS {
                    let call = &mut calls[i];
                    let echoed = call.arguments.clone();
                    call.succeed(echoed);
                    call.needs_resubmission = true;
                    continue;
                }

                if is_environment_tool(&calls[i].name) {
                    let call = &mut calls[i];
                    call.succeed(DONE);
                    yield StreamEvent::ToolCallRequested { call: call.clone() };
                    continue;
                }

                let Some(def) = self.tools.get(&calls[i].name).await else {
                    let started = Instant::now();
                    let err = RelayError::Lookup(TOOL_NOT_FOUND.to_string());
                    let call = &mut calls[i];
                    call.outcome = Some(ToolOutcome::from(&err));
                    tracing::warn!(tool = %call.name, "unknown tool requested");
                    log_audit(call, "lookup", call.outcome.as_ref(), started);
                    yield StreamEvent::error(&err);
                    continue;
                };
                calls[i].executor = Some(def.executor);

                match def.executor {
                    ExecutorKind::FrontendForwarded => {
                        let duplicate = find_executed(&calls[..], &executed, &calls[i]).is_some();
                        let call = &mut calls[i];
                        call.succeed(DONE);
                        if duplicate {
                            tracing::debug!(tool = %call.name, "duplicate frontend call suppressed");
                        } else {
                            yield StreamEvent::ToolCallRequested { call: call.clone() };
                        }
                        executed.push(i);
                    }
                    ExecutorKind::Backend => {
                        if let Some(prior) = find_executed(&calls[..], &executed, &calls[i]).cloned() {
                            copy_result(&prior, &mut calls[i]);
                            tracing::debug!(tool = %prior.name, "duplicate backend call reuses prior outcome");
                            continue;
                        }
                        let started = Instant::now();
                        if !def.call_url.as_deref().is_some_and(|u| !u.trim().is_empty()) {
                            let err = RelayError::Lookup(MISSING_URL.to_string());
                            let call = &mut calls[i];
                            call.outcome = Some(ToolOutcome::from(&err));
                            tracing::warn!(tool = %call.name, "backend tool has no call url");
                            log_audit(call, "backend", call.outcome.as_ref(), started);
                            yield StreamEvent::error(&err);
                            continue;
                        }
                        yield started_event(&calls[i]);
                        let call = &mut calls[i];
                        let response = self.backend.invoke(&def, &call.arguments, ctx.auth_token.as_deref()).await;
                        match response {
                            Ok(body) if def.return_raw => {
                                let raw = self.backend.extract_raw(&body);
                                call.succeed(raw.clone());
                                yield StreamEvent::answer(raw);
                            }
                            Ok(body) => {
                                call.succeed(body);
                                call.needs_resubmission = true;
                                call.prompt_override = def.prompt.clone();
                            }
                            Err(e) => {
                                tracing::warn!(tool = %call.name, error = %e, "backend call failed");
                                call.outcome = Some(ToolOutcome::from(&e));
                                yield StreamEvent::error(&e);
                            }
                        }
                        log_audit(call, "backend", call.outcome.as_ref(), started);
                        executed.push(i);
                    }
                    ExecutorKind::Internal => {
                        if let Some(prior) = find_executed(&calls[..], &executed, &calls[i]).cloned() {
                            copy_result(&prior, &mut calls[i]);
                            tracing::debug!(tool = %prior.name, "duplicate internal call reuses prior outcome");
                            continue;
                        }
                        let started = Instant::now();
                        yield started_event(&calls[i]);
                        let mut events = self.run_processor(&def, &mut calls[i], &mut *caller, ctx, reenter_this);
                        while let Some(event) = events.next().await {
                            yield event;
                        }
                        drop(events);

                        let call = &calls[i];
                        log_audit(call, "internal", call.outcome.as_ref(), started);
                        if !call.is_resolved() {
                            tracing::info!(
                                tool = %call.name,
                                call_id = %call.id,
                                abandoned = calls.len() - i - 1,
                                "multi-turn processor awaiting user input, batch abandoned"
                            );
                            break;
                        }
                        executed.push(i);
                    }
                }
            }
        })
    }

    /// 在派生子对话上运行子处理器，终态事件写入调用结果，其余事件转发
    fn run_processor<'a>(
        &'a self,
        def: &'a ToolDefinition,
        call: &'a mut ToolCall,
        caller: &'a mut ConversationState,
        ctx: &'a TurnContext,
        reenter: bool,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            let Some(processor) = self.processors.get(&call.name) else {
                let err = RelayError::Lookup(format!("{}：{}", TOOL_NOT_FOUND, call.name));
                call.outcome = Some(ToolOutcome::from(&err));
                yield StreamEvent::error(&err);
                return;
            };

            let stored = if reenter && processor.multi_turn() {
                caller.sub_conversations.remove(&call.id)
            } else {
                None
            };
            let reentering = stored.is_some();
            let mut sub = match stored {
                Some(mut sub) => {
                    sub.agent_results = caller.agent_results.clone();
                    sub
                }
                None => caller.derive_for_delegate(),
            };
            if !processor.clears_questions() {
                for unit in caller.current_questions() {
                    if matches!(unit, ContentUnit::Text { .. } | ContentUnit::Image { .. } | ContentUnit::File { .. }) {
                        sub.add_question(unit);
                    }
                }
            }
            if !reentering {
                if let Err(e) = processor.prepare(&mut sub, &call.arguments) {
                    tracing::warn!(tool = %call.name, error = %e, "processor rejected arguments");
                    call.outcome = Some(ToolOutcome::from(&e));
                    call.needs_resubmission = true;
                    yield StreamEvent::error(&e);
                    return;
                }
            }

            tracing::info!(
                tool = %call.name,
                call_id = %call.id,
                reenter = reentering,
                depth = ctx.depth,
                "delegating to sub-processor"
            );
            let base = sub.agent_results.len();
            let nested = ctx.nested();
            let snapshot = call.clone();
            let mut terminal: Option<ToolOutcome> = None;
            {
                let mut events = processor.execute(&snapshot, &mut sub, self, &nested, reentering);
                while let Some(event) = events.next().await {
                    match event {
                        StreamEvent::ToolResult { text } | StreamEvent::SearchResult { text } => {
                            terminal = Some(ToolOutcome::text(text));
                        }
                        StreamEvent::Error { kind, message } => {
                            terminal = Some(ToolOutcome::error(message.clone()));
                            yield StreamEvent::Error { kind, message };
                        }
                        other => yield other,
                    }
                }
            }
            caller.agent_results.extend(sub.agent_results.iter().skip(base).cloned());

            match terminal {
                Some(outcome) => {
                    call.outcome = Some(outcome);
                    call.needs_resubmission = true;
                    call.prompt_override = def.prompt.clone();
                }
                None if processor.multi_turn() => {
                    caller.sub_conversations.insert(call.id.clone(), sub);
                }
                None => call.succeed(DONE),
            }
        })
    }
}

fn started_event(call: &ToolCall) -> StreamEvent {
    StreamEvent::ToolExecutionStarted {
        call_id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
    }
}

fn copy_result(prior: &ToolCall, call: &mut ToolCall) {
    call.outcome = prior.outcome.clone();
    call.needs_resubmission = prior.needs_resubmission;
    call.prompt_override = prior.prompt_override.clone();
}

