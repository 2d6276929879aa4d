//! 单轮执行：提交模型 -> 截获工具调用 -> 分发 -> 按需回传
//!
//! `run_turn` 按模型标签路由：自动化循环的标签交给 AutomationLoop，其余走 `model_turn`。
//! `model_turn` 拥有回传循环：批次中有调用标记回传、且没有被放弃（多轮子处理器等待用户）时再次提交，
//! 超过 max_resubmissions 时输出错误结束。上一轮留下的多轮调用在提交模型之前先重入。

use futures_util::StreamExt;
use uuid::Uuid;

use super::Dispatcher;
use crate::automation::{is_environment_tool, STOP_NOTICE};
use crate::conversation::{ContentUnit, ConversationState};
use crate::core::{RelayError, TurnContext};
use crate::events::{EventStream, StreamEvent};
use crate::tools::{ToolCall, ToolDefinition};

pub const MODEL_NOT_CONFIGURED: &str = "模型参数配置错误：";

/// 上一轮被放弃、保存了子对话的多轮调用所在的批次
fn pending_reentry(conversation: &ConversationState) -> Option<Vec<ToolCall>> {
    let calls = conversation.previous_calls();
    calls
        .iter()
        .any(|c| !c.is_resolved() && conversation.sub_conversations.contains_key(&c.id))
        .then_some(calls)
}

impl Dispatcher {
    /// 一次完整的用户轮次
    pub fn run_turn<'a>(
        &'a self,
        model: &'a str,
        conversation: &'a mut ConversationState,
        ctx: &'a TurnContext,
    ) -> EventStream<'a> {
        if let Some(automation) = self.automation.as_ref().filter(|a| a.label() == model) {
            return automation.run(self, conversation, ctx);
        }
        Box::pin(async_stream::stream! {
            {
                let mut turn = self.model_turn(model, &mut *conversation, Vec::new(), ctx);
                while let Some(event) = turn.next().await {
                    yield event;
                }
            }
            if ctx.depth == 0 && ctx.is_stopped() {
                yield StreamEvent::answer(STOP_NOTICE);
            }
        })
    }

    /// 提交给指定提供方并处理工具调用；`extra_tools` 追加在场景选择的工具之后
    pub fn model_turn<'a>(
        &'a self,
        model: &'a str,
        conversation: &'a mut ConversationState,
        extra_tools: Vec<ToolDefinition>,
        ctx: &'a TurnContext,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            if ctx.depth > self.settings.max_depth {
                tracing::warn!(depth = ctx.depth, max = self.settings.max_depth, "delegation too deep");
                yield StreamEvent::error(&RelayError::Execution(format!(
                    "委托层级超过上限：{}",
                    self.settings.max_depth
                )));
                return;
            }
            let Some(provider) = self.providers.get(model) else {
                tracing::warn!(model = %model, "no provider registered for model label");
                yield StreamEvent::error(&RelayError::Lookup(format!("{}{}", MODEL_NOT_CONFIGURED, model)));
                return;
            };

            if let Some(mut pending) = pending_reentry(conversation) {
                tracing::info!(conversation = %conversation.session_id, calls = pending.len(), "re-entering multi-turn call");
                {
                    let mut events = self.dispatch(&mut pending, &mut *conversation, ctx, true);
                    while let Some(event) = events.next().await {
                        yield event;
                    }
                }
                for call in &pending {
                    conversation.update_tool_call(call);
                }
                if pending.iter().any(|c| !c.is_resolved()) || ctx.is_stopped() {
                    return;
                }
            }

            let mut resubmissions = 0usize;
            loop {
                if ctx.is_stopped() {
                    break;
                }
                let names = self.tools.select_by_scene(conversation, &self.settings.tool_group).await;
                let mut tools = self.tools.definitions(&names).await;
                tools.extend(extra_tools.iter().cloned());

                let mut answer = String::new();
                let mut calls: Vec<ToolCall> = Vec::new();
                {
                    let mut events = provider.stream(&*conversation, &tools, ctx);
                    while let Some(event) = events.next().await {
                        match event {
                            StreamEvent::FunctionCalls { calls: requested } => calls.extend(requested),
                            other => {
                                if let StreamEvent::AnswerDelta { text } = &other {
                                    answer.push_str(text);
                                }
                                yield other;
                            }
                        }
                    }
                }
                if !answer.is_empty() {
                    conversation.add_answer(ContentUnit::text(answer));
                }
                if calls.is_empty() {
                    break;
                }

                for call in calls.iter_mut() {
                    if call.id.is_empty() {
                        call.id = Uuid::new_v4().to_string();
                    }
                    call.executor = None;
                }
                tracing::info!(
                    model = %model,
                    calls = calls.len(),
                    resubmissions,
                    tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "model requested tool calls"
                );
                {
                    let mut events = self.dispatch(&mut calls, &mut *conversation, ctx, false);
                    while let Some(event) = events.next().await {
                        yield event;
                    }
                }

                let abandoned = calls.iter().any(|c| !c.is_resolved());
                let environment = calls.iter().any(|c| is_environment_tool(&c.name));
                let resubmit = !abandoned && !environment && calls.iter().any(|c| c.needs_resubmission);
                conversation.add_answer(ContentUnit::FunctionCall { calls });
                if !resubmit || ctx.is_stopped() {
                    break;
                }

                resubmissions += 1;
                if resubmissions > self.settings.max_resubmissions {
                    tracing::warn!(model = %model, max = self.settings.max_resubmissions, "resubmission cap reached");
                    yield StreamEvent::error(&RelayError::Execution(format!(
                        "工具调用回传次数超过上限：{}",
                        self.settings.max_resubmissions
                    )));
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::core::ErrorKind;
    use crate::dispatch::{DispatchSettings, TOOL_NOT_FOUND, WEB_SEARCH_ALIAS};
    use crate::llm::{ProviderRegistry, ScriptedProvider};
    use crate::processors::{ProcessorRegistry, SubProcessor};
    use crate::tools::{CallMethod, ExecutorKind, StaticToolStore, ToolOutcome, ToolRegistry, DONE};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(defs: Vec<ToolDefinition>, provider: Arc<ScriptedProvider>) -> Dispatcher {
        let tools = Arc::new(ToolRegistry::new(
            Arc::new(StaticToolStore::new(defs)),
            Duration::from_secs(1800),
            10,
        ));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        Dispatcher::new(tools, providers)
    }

    async fn run(d: &Dispatcher, conv: &mut ConversationState, ctx: &TurnContext) -> Vec<StreamEvent> {
        d.run_turn("claude", conv, ctx).collect().await
    }

    fn recorded_calls(conv: &ConversationState) -> Vec<ToolCall> {
        conv.exchanges
            .last()
            .map(|e| {
                e.answers
                    .iter()
                    .filter_map(|u| match u {
                        ContentUnit::FunctionCall { calls } => Some(calls.clone()),
                        _ => None,
                    })
                    .flatten()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn errors(events: &[StreamEvent]) -> Vec<(ErrorKind, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Error { kind, message } => Some((*kind, message.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_tool_is_single_lookup_error() {
        let provider = Arc::new(
            ScriptedProvider::new("claude").with_calls(vec![ToolCall::new("c1", "NoSuchTool", "{}")]),
        );
        let d = dispatcher(Vec::new(), provider.clone());
        let mut conv = ConversationState::with_question("s1", "hi");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        assert_eq!(errors(&events), vec![(ErrorKind::Lookup, TOOL_NOT_FOUND.to_string())]);
        assert_eq!(provider.submissions(), 1);
        let calls = recorded_calls(&conv);
        assert!(!calls[0].needs_resubmission);
        assert!(calls[0].outcome.as_ref().unwrap().is_error());
    }

    #[tokio::test]
    async fn test_identical_backend_calls_execute_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_string("晴 25°C"))
            .expect(1)
            .mount(&server)
            .await;
        let weather = ToolDefinition::new("Weather", ExecutorKind::Backend)
            .with_triggers("天气")
            .with_url(CallMethod::Get, format!("{}/weather?city={{city}}", server.uri()));

        let provider = Arc::new(
            ScriptedProvider::new("claude")
                .with_calls(vec![
                    ToolCall::new("c1", "Weather", r#"{"city":"北京"}"#),
                    ToolCall::new("c2", "Weather", r#"{"city":"北京"}"#),
                ])
                .with_text("北京晴"),
        );
        let d = dispatcher(vec![weather], provider.clone());
        let mut conv = ConversationState::with_question("s1", "北京天气怎么样");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        let started = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolExecutionStarted { .. }))
            .count();
        assert_eq!(started, 1);
        assert_eq!(provider.submissions(), 2);
        assert!(provider.seen_tools()[0].contains(&"Weather".to_string()));

        let first = conv.find_tool_call_mut("c1").unwrap().clone();
        let second = conv.find_tool_call_mut("c2").unwrap().clone();
        assert_eq!(first.outcome, Some(ToolOutcome::text("晴 25°C")));
        assert_eq!(first.outcome, second.outcome);
        assert!(events.contains(&StreamEvent::answer("北京晴")));
    }

    #[tokio::test]
    async fn test_return_raw_surfaces_field_without_resubmission() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"body":"订单已提交","code":0}"#))
            .mount(&server)
            .await;
        let mut order = ToolDefinition::new("Order", ExecutorKind::Backend)
            .with_url(CallMethod::Post, format!("{}/order", server.uri()));
        order.return_raw = true;

        let provider = Arc::new(ScriptedProvider::new("claude").with_calls(vec![ToolCall::new("c1", "Order", "{}")]));
        let d = dispatcher(vec![order], provider.clone());
        let mut conv = ConversationState::with_question("s1", "下单");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        assert!(events.contains(&StreamEvent::answer("订单已提交")));
        assert_eq!(provider.submissions(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_not_resubmitted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let def = ToolDefinition::new("Stock", ExecutorKind::Backend).with_url(CallMethod::Get, server.uri());
        let provider = Arc::new(ScriptedProvider::new("claude").with_calls(vec![ToolCall::new("c1", "Stock", "{}")]));
        let d = dispatcher(vec![def], provider.clone());
        let mut conv = ConversationState::with_question("s1", "股票");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        assert_eq!(errors(&events)[0].0, ErrorKind::Transport);
        assert_eq!(provider.submissions(), 1);
    }

    #[tokio::test]
    async fn test_backend_prompt_override_applied_on_resubmission() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("42"))
            .mount(&server)
            .await;
        let mut def = ToolDefinition::new("Count", ExecutorKind::Backend).with_url(CallMethod::Get, server.uri());
        def.prompt = Some("查询结果：{result}".into());
        let provider = Arc::new(
            ScriptedProvider::new("claude")
                .with_calls(vec![ToolCall::new("c1", "Count", "{}")])
                .with_text("共 42 个"),
        );
        let d = dispatcher(vec![def], provider.clone());
        let mut conv = ConversationState::with_question("s1", "数量");
        let ctx = TurnContext::new("s1", "u1");
        run(&d, &mut conv, &ctx).await;

        let seen = provider.seen();
        let resubmitted = &seen[1];
        let call = resubmitted.exchanges[0]
            .answers
            .iter()
            .find_map(|u| match u {
                ContentUnit::FunctionCall { calls } => calls.first().cloned(),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.model_facing_text(), "查询结果：42");
    }

    #[tokio::test]
    async fn test_frontend_duplicates_forwarded_once() {
        let def = ToolDefinition::new("OpenPage", ExecutorKind::FrontendForwarded);
        let provider = Arc::new(ScriptedProvider::new("claude").with_calls(vec![
            ToolCall::new("c1", "OpenPage", r#"{"page":"home"}"#),
            ToolCall::new("c2", "OpenPage", r#"{"page":"home"}"#),
            ToolCall::new("c3", "OpenPage", r#"{"page":"about"}"#),
        ]));
        let d = dispatcher(vec![def], provider.clone());
        let mut conv = ConversationState::with_question("s1", "打开首页");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        let forwarded: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallRequested { call } => Some(call.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(forwarded, vec!["c1", "c3"]);
        assert!(recorded_calls(&conv)
            .iter()
            .all(|c| c.outcome == Some(ToolOutcome::text(DONE)) && !c.needs_resubmission));
        assert_eq!(provider.submissions(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_cap_emits_error() {
        let provider = Arc::new(ScriptedProvider::new("claude").repeating(vec![StreamEvent::FunctionCalls {
            calls: vec![ToolCall::new("", WEB_SEARCH_ALIAS, r#"{"query":"rust"}"#)],
        }]));
        let d = dispatcher(Vec::new(), provider.clone()).with_settings(DispatchSettings {
            max_resubmissions: 2,
            ..Default::default()
        });
        let mut conv = ConversationState::with_question("s1", "搜索 rust");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        assert_eq!(provider.submissions(), 3);
        assert!(matches!(events.last(), Some(StreamEvent::Error { kind: ErrorKind::Execution, .. })));
        assert!(recorded_calls(&conv).iter().all(|c| !c.id.is_empty()));
    }

    #[tokio::test]
    async fn test_unknown_model_label() {
        let provider = Arc::new(ScriptedProvider::new("claude"));
        let d = dispatcher(Vec::new(), provider);
        let mut conv = ConversationState::with_question("s1", "hi");
        let ctx = TurnContext::new("s1", "u1");
        let events: Vec<StreamEvent> = d.run_turn("gpt-9", &mut conv, &ctx).collect().await;
        assert_eq!(errors(&events), vec![(ErrorKind::Lookup, format!("{}gpt-9", MODEL_NOT_CONFIGURED))]);
    }

    #[tokio::test]
    async fn test_stop_signal_yields_notice() {
        let provider = Arc::new(ScriptedProvider::new("claude").with_text("不会出现"));
        let d = dispatcher(Vec::new(), provider.clone());
        let mut conv = ConversationState::with_question("s1", "hi");
        let ctx = TurnContext::new("s1", "u1");
        ctx.stop.cancel();

        let events = run(&d, &mut conv, &ctx).await;
        assert_eq!(events, vec![StreamEvent::answer(STOP_NOTICE)]);
        assert_eq!(provider.submissions(), 0);
    }

    #[tokio::test]
    async fn test_preresolved_call_passes_through() {
        let provider = Arc::new(ScriptedProvider::new("claude"));
        let d = dispatcher(Vec::new(), provider);
        let mut conv = ConversationState::with_question("s1", "hi");
        let ctx = TurnContext::new("s1", "u1");
        let mut supplied = ToolCall::new("c1", "Unregistered", "{}");
        supplied.outcome = Some(ToolOutcome::text("from client"));
        let mut calls = vec![supplied];

        let events: Vec<StreamEvent> = d.dispatch(&mut calls, &mut conv, &ctx, false).collect().await;
        assert!(events.is_empty());
        assert_eq!(calls[0].outcome, Some(ToolOutcome::text("from client")));
    }

    struct Failing;

    impl SubProcessor for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        fn prepare(&self, _conversation: &mut ConversationState, arguments: &str) -> Result<(), RelayError> {
            Err(RelayError::Execution(format!("bad arguments: {}", arguments)))
        }
    }

    #[tokio::test]
    async fn test_internal_error_forwarded_and_resubmitted() {
        let def = ToolDefinition::new("Failing", ExecutorKind::Internal);
        let provider = Arc::new(
            ScriptedProvider::new("claude")
                .with_calls(vec![ToolCall::new("c1", "Failing", "{}")])
                .with_text("换个参数"),
        );
        let mut processors = ProcessorRegistry::new();
        processors.register(Arc::new(Failing));
        let d = dispatcher(vec![def], provider.clone()).with_processors(processors);
        let mut conv = ConversationState::with_question("s1", "试试");
        let ctx = TurnContext::new("s1", "u1");

        let events = run(&d, &mut conv, &ctx).await;
        assert_eq!(errors(&events)[0].0, ErrorKind::Execution);
        assert_eq!(provider.submissions(), 2);
        let call = conv.find_tool_call_mut("c1").unwrap();
        assert!(call.needs_resubmission);
        assert_eq!(call.executor, Some(ExecutorKind::Internal));
    }

    #[tokio::test]
    async fn test_backend_without_url_never_reports_start() {
        let def = ToolDefinition::new("Weather", ExecutorKind::Backend);
        let d = dispatcher(vec![def], Arc::new(ScriptedProvider::new("claude")));
        let mut conv = ConversationState::with_question("s1", "天气");
        let ctx = TurnContext::new("s1", "u1");
        let mut calls = vec![ToolCall::new("c1", "Weather", r#"{"city":"上海"}"#)];

        let events: Vec<StreamEvent> = d.dispatch(&mut calls, &mut conv, &ctx, false).collect().await;
        assert_eq!(errors(&events), vec![(ErrorKind::Lookup, crate::dispatch::MISSING_URL.to_string())]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolExecutionStarted { .. })));
        assert!(!calls[0].needs_resubmission);
    }

    #[derive(Default)]
    struct Counting {
        runs: std::sync::atomic::AtomicUsize,
    }

    impl SubProcessor for Counting {
        fn name(&self) -> &str {
            "Counting"
        }

        fn execute<'a>(
            &'a self,
            _call: &'a ToolCall,
            _conversation: &'a mut ConversationState,
            _dispatcher: &'a Dispatcher,
            _ctx: &'a TurnContext,
            _reenter: bool,
        ) -> EventStream<'a> {
            let n = self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Box::pin(async_stream::stream! {
                yield StreamEvent::ToolResult { text: format!("run {}", n) };
            })
        }
    }

    #[tokio::test]
    async fn test_identical_internal_calls_execute_once() {
        let def = ToolDefinition::new("Counting", ExecutorKind::Internal);
        let counting = Arc::new(Counting::default());
        let mut processors = ProcessorRegistry::new();
        processors.register(counting.clone());
        let d = dispatcher(vec![def], Arc::new(ScriptedProvider::new("claude"))).with_processors(processors);
        let mut conv = ConversationState::with_question("s1", "统计");
        let ctx = TurnContext::new("s1", "u1");
        let mut calls = vec![
            ToolCall::new("c1", "Counting", r#"{"n":1}"#),
            ToolCall::new("c2", "Counting", r#"{"n":1}"#),
        ];

        let events: Vec<StreamEvent> = d.dispatch(&mut calls, &mut conv, &ctx, false).collect().await;
        assert_eq!(counting.runs.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::ToolExecutionStarted { .. }))
                .count(),
            1
        );
        assert_eq!(calls[0].outcome, Some(ToolOutcome::text("run 1")));
        assert_eq!(calls[1].outcome, calls[0].outcome);
        assert!(calls.iter().all(|c| c.needs_resubmission));
    }
}
