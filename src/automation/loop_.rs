//! 自动化工具循环
//!
//! Init -> (SubmitTurn <-> ExecuteTools) -> Done
//!
//! - Init：首轮注入人设系统提示（仅一次）
//! - SubmitTurn：通过分发器提交给配置的模型；截获环境控制调用（不向外转发），其余事件原样转发
//! - ExecuteTools：按顺序在会话池中 key 对应的会话上执行截获的调用，结果写回对话
//! - 有调用被执行才回到 SubmitTurn；轮数超过上限时输出自动中止提示，收到停止信号时输出停止提示
//!
//! 结束时把对话标记为已逐轮记录，外层无需再次持久化。

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;

use crate::automation::actions::{environment_tool_definitions, is_environment_tool, ComputerAction, EnvironmentCall};
use crate::automation::driver::Viewport;
use crate::automation::persona::Persona;
use crate::automation::pool::SessionPool;
use crate::automation::sandbox::{mime_for, Sandbox};
use crate::automation::session::AutomationSession;
use crate::conversation::ConversationState;
use crate::core::{RelayError, TurnContext};
use crate::dispatch::{log_audit, Dispatcher};
use crate::events::{EventStream, StreamEvent};
use crate::tools::{ToolCall, ToolOutcome, DONE};

pub const STOP_NOTICE: &str = "收到停止指令，停止执行。";
pub const AUTO_STOP_NOTICE: &str = "已达到自动操作步数上限，自动中止。";

const OPEN_URL_FAILED: &str = "Error: Can't open this url, try another please.";
const SCREENSHOT_FIRST: &str = "Error: You should call OpenUrl before screenshot.";
const FILE_NOT_FOUND: &str = "文件不存在";

/// 人设系统提示中的固定片段，用于判断是否已注入
const PERSONA_MARKER: &str = "<SYSTEM_CAPABILITY>";

#[derive(Debug, Clone)]
pub struct AutomationSettings {
    /// 路由到本循环的模型标签
    pub label: String,
    /// 实际驱动循环的提供方标签
    pub model: String,
    pub persona: Persona,
    pub max_rounds: usize,
    pub viewport: Viewport,
    /// GetPageHtml 返回的字符上限
    pub max_content_chars: usize,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            label: "automation".to_string(),
            model: "claude".to_string(),
            persona: Persona::Web,
            max_rounds: 30,
            viewport: Viewport::default(),
            max_content_chars: 20_000,
        }
    }
}

pub struct AutomationLoop {
    pool: Arc<SessionPool>,
    sandbox: Sandbox,
    settings: AutomationSettings,
}

/// 单个调用的执行结果及需要转发的事件
struct Executed {
    outcome: ToolOutcome,
    events: Vec<StreamEvent>,
}

impl Executed {
    fn new(outcome: ToolOutcome) -> Self {
        Self {
            outcome,
            events: Vec::new(),
        }
    }

    fn done() -> Self {
        Self::new(ToolOutcome::text(DONE))
    }

    fn failed(message: impl Into<String>) -> Self {
        Self::new(ToolOutcome::error(message))
    }

    fn with_event(mut self, event: StreamEvent) -> Self {
        self.events.push(event);
        self
    }

    fn outcome(mut self, outcome: ToolOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// 动作结果转为调用结果；资源错误向上传播以中止本轮
fn action_outcome(result: Result<(), RelayError>) -> Result<ToolOutcome, RelayError> {
    match result {
        Ok(()) => Ok(ToolOutcome::text(DONE)),
        Err(e @ RelayError::Resource(_)) => Err(e),
        Err(e) => Ok(ToolOutcome::error(e.detail())),
    }
}

fn selector_outcome(result: Result<bool, RelayError>, selector: &str) -> Result<ToolOutcome, RelayError> {
    match result {
        Ok(true) => Ok(ToolOutcome::text(DONE)),
        Ok(false) => Ok(ToolOutcome::error(format!(
            "Error: selector '{}' must match exactly one element.",
            selector
        ))),
        Err(e @ RelayError::Resource(_)) => Err(e),
        Err(e) => Ok(ToolOutcome::error(e.detail())),
    }
}

impl AutomationLoop {
    pub fn new(pool: Arc<SessionPool>, sandbox: Sandbox, settings: AutomationSettings) -> Self {
        Self { pool, sandbox, settings }
    }

    pub fn label(&self) -> &str {
        &self.settings.label
    }

    pub fn settings(&self) -> &AutomationSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn inject_persona(&self, conversation: &mut ConversationState) {
        if conversation.exchanges.len() != 1 || conversation.system_prompt.contains(PERSONA_MARKER) {
            return;
        }
        conversation.system_prompt = self.settings.persona.initial_prompt(&conversation.system_prompt);
    }

    pub fn run<'a>(
        &'a self,
        dispatcher: &'a Dispatcher,
        conversation: &'a mut ConversationState,
        ctx: &'a TurnContext,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            self.inject_persona(conversation);
            let env_tools = environment_tool_definitions(self.settings.persona);
            let mut rounds = 0usize;

            loop {
                if ctx.is_stopped() {
                    tracing::info!(conversation = %conversation.session_id, rounds, "automation stopped by signal");
                    yield StreamEvent::answer(STOP_NOTICE);
                    break;
                }
                rounds += 1;

                let mut pending: Vec<ToolCall> = Vec::new();
                {
                    let mut turn = dispatcher.model_turn(&self.settings.model, &mut *conversation, env_tools.clone(), ctx);
                    while let Some(event) = turn.next().await {
                        match event {
                            StreamEvent::ToolCallRequested { call } if is_environment_tool(&call.name) => {
                                pending.push(call);
                            }
                            other => yield other,
                        }
                    }
                }

                let need_rerun = !pending.is_empty();
                tracing::debug!(round = rounds, calls = pending.len(), "automation round submitted");

                let mut session: Option<Arc<AutomationSession>> = None;
                for (i, call) in pending.iter().enumerate() {
                    let started = Instant::now();
                    match self.execute(call, &mut session, ctx).await {
                        Ok(executed) => {
                            for event in executed.events {
                                yield event;
                            }
                            log_audit(call, "environment", Some(&executed.outcome), started);
                            conversation.apply_tool_result(&call.id, executed.outcome);
                        }
                        Err(e) => {
                            tracing::warn!(tool = %call.name, error = %e, "automation iteration aborted");
                            for rest in &pending[i..] {
                                conversation.apply_tool_result(&rest.id, ToolOutcome::error(e.detail()));
                            }
                            yield StreamEvent::error(&e);
                            break;
                        }
                    }
                }

                if !need_rerun {
                    break;
                }
                if rounds > self.settings.max_rounds {
                    tracing::warn!(rounds, max = self.settings.max_rounds, "automation auto-stopped");
                    yield StreamEvent::answer(AUTO_STOP_NOTICE);
                    break;
                }
            }

            conversation.persisted = true;
        })
    }

    async fn session(
        &self,
        slot: &mut Option<Arc<AutomationSession>>,
        ctx: &TurnContext,
    ) -> Result<Arc<AutomationSession>, RelayError> {
        if let Some(session) = slot {
            return Ok(Arc::clone(session));
        }
        let session = self.pool.get_or_create(ctx.session_key(), self.settings.viewport).await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn screenshot(
        &self,
        slot: &mut Option<Arc<AutomationSession>>,
        ctx: &TurnContext,
    ) -> Result<Executed, RelayError> {
        let session = self.session(slot, ctx).await?;
        Ok(match session.screenshot().await? {
            None => Executed::failed(SCREENSHOT_FIRST),
            Some(png) => Executed::new(ToolOutcome::image("image/png", png.clone())).with_event(StreamEvent::ImageBytes {
                mime: "image/png".to_string(),
                bytes: png,
            }),
        })
    }

    async fn execute(
        &self,
        call: &ToolCall,
        slot: &mut Option<Arc<AutomationSession>>,
        ctx: &TurnContext,
    ) -> Result<Executed, RelayError> {
        if !self.settings.persona.allows(&call.name) {
            return Ok(Executed::failed(format!(
                "Error: {} is not available in this environment.",
                call.name
            )));
        }
        let action = match EnvironmentCall::parse(call) {
            Ok(action) => action,
            Err(e) => return Ok(Executed::failed(e.detail())),
        };
        let user = ctx.user_id.as_str();

        match action {
            EnvironmentCall::OpenUrl(url) => {
                let executed = Executed::done().with_event(StreamEvent::reasoning(format!(
                    "call {}({})\n\n",
                    call.name, call.arguments
                )));
                let session = self.session(slot, ctx).await?;
                match session.open_url(&url).await {
                    Ok(()) => Ok(executed),
                    Err(e) => {
                        tracing::info!(url = %url, error = %e, "open url failed");
                        Ok(executed.outcome(ToolOutcome::error(OPEN_URL_FAILED)))
                    }
                }
            }
            EnvironmentCall::GoBack => {
                let session = self.session(slot, ctx).await?;
                Ok(Executed::new(action_outcome(session.go_back().await)?))
            }
            EnvironmentCall::GetPageHtml => {
                let session = self.session(slot, ctx).await?;
                Ok(match session.visible_html(self.settings.max_content_chars).await {
                    Ok(html) => Executed::new(ToolOutcome::text(html)),
                    Err(e @ RelayError::Resource(_)) => return Err(e),
                    Err(e) => Executed::failed(e.detail()),
                })
            }
            EnvironmentCall::Screenshot => self.screenshot(slot, ctx).await,
            EnvironmentCall::ClickElement(selector) => {
                let session = self.session(slot, ctx).await?;
                let result = session.click_element(&selector).await;
                Ok(Executed::new(selector_outcome(result, &selector)?))
            }
            EnvironmentCall::InputElement { selector, text } => {
                let session = self.session(slot, ctx).await?;
                let result = session.input_element(&selector, &text).await;
                Ok(Executed::new(selector_outcome(result, &selector)?))
            }
            EnvironmentCall::SendFile(path) => Ok(match self.sandbox.read_bytes(user, &path).await {
                Ok(Some((full, bytes))) => {
                    let file_name = full
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.clone());
                    Executed::new(ToolOutcome::text(format!("File sent: {}", file_name))).with_event(
                        StreamEvent::FileBytes {
                            file_name,
                            mime: mime_for(&full).to_string(),
                            bytes,
                        },
                    )
                }
                Ok(None) => {
                    let err = RelayError::Execution(FILE_NOT_FOUND.to_string());
                    Executed::failed(FILE_NOT_FOUND).with_event(StreamEvent::error(&err))
                }
                Err(e) => Executed::failed(e.detail()).with_event(StreamEvent::error(&e)),
            }),
            EnvironmentCall::Computer(action) => {
                let reasoning = StreamEvent::reasoning(format!("call computer_use({})\n\n", call.arguments));
                let executed = match action {
                    ComputerAction::Screenshot => self.screenshot(slot, ctx).await?,
                    ComputerAction::MouseMove { coordinate } => {
                        let session = self.session(slot, ctx).await?;
                        match coordinate {
                            Some([x, y]) => Executed::new(action_outcome(session.move_mouse(x, y).await)?),
                            None => Executed::done(),
                        }
                    }
                    ComputerAction::LeftClick { coordinate } => {
                        let session = self.session(slot, ctx).await?;
                        let at = coordinate.map(|[x, y]| (x, y));
                        Executed::new(action_outcome(session.click(at).await)?)
                    }
                    ComputerAction::Type { text } => {
                        let session = self.session(slot, ctx).await?;
                        Executed::new(action_outcome(session.type_text(&text).await)?)
                    }
                    ComputerAction::Key { text } => {
                        let session = self.session(slot, ctx).await?;
                        Executed::new(action_outcome(session.press_key(&text).await)?)
                    }
                    ComputerAction::Scroll {
                        scroll_amount,
                        scroll_direction,
                    } => {
                        let session = self.session(slot, ctx).await?;
                        Executed::new(action_outcome(session.scroll(scroll_amount, &scroll_direction).await)?)
                    }
                    ComputerAction::Wait { duration } => {
                        let session = self.session(slot, ctx).await?;
                        session.wait(duration).await;
                        Executed::done()
                    }
                };
                let mut events = vec![reasoning];
                events.extend(executed.events);
                Ok(Executed {
                    outcome: executed.outcome,
                    events,
                })
            }
            EnvironmentCall::Editor(command) => {
                let executed = Executed::done().with_event(StreamEvent::reasoning("call text_editor()\n\n"));
                Ok(match self.sandbox.edit(user, &command).await {
                    Ok(text) => executed.outcome(ToolOutcome::text(text)),
                    Err(e) => executed.outcome(ToolOutcome::error(e.detail())),
                })
            }
            EnvironmentCall::Bash(command) => {
                let executed = Executed::done().with_event(StreamEvent::reasoning(format!(
                    "call bash({})\n\n",
                    call.arguments
                )));
                Ok(match self.sandbox.run_shell(user, &command).await {
                    Ok(output) => executed.outcome(ToolOutcome::text(output)),
                    Err(e) => executed.outcome(ToolOutcome::error(e.detail())),
                })
            }
        }
    }
}
