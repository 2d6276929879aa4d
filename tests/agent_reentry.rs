//! 多轮 Agent 集成测试：未完成的 Agent 放弃批次，用户下一条消息到达后重入并继续执行剩余调用

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use toolrelay::dispatch::Dispatcher;
use toolrelay::llm::{ProviderRegistry, ScriptedProvider};
use toolrelay::processors::{AgentProcessor, ProcessorRegistry, AGENT_FINISH_MARKER};
use toolrelay::tools::{CallMethod, ExecutorKind, StaticToolStore, ToolCall, ToolDefinition, ToolRegistry};
use toolrelay::{ContentUnit, ConversationState, StreamEvent, TurnContext};

struct Harness {
    dispatcher: Dispatcher,
    outer: Arc<ScriptedProvider>,
    worker: Arc<ScriptedProvider>,
}

async fn harness(server: &MockServer, outer: ScriptedProvider, worker: ScriptedProvider) -> Harness {
    let defs = vec![
        ToolDefinition::new("OneAgent", ExecutorKind::Internal).with_triggers("调研"),
        ToolDefinition::new("Weather", ExecutorKind::Backend)
            .with_triggers("天气")
            .with_url(CallMethod::Get, format!("{}/weather?city={{city}}", server.uri())),
    ];
    let tools = Arc::new(ToolRegistry::new(
        Arc::new(StaticToolStore::new(defs)),
        Duration::from_secs(1800),
        10,
    ));
    tools.load().await.unwrap();

    let outer = Arc::new(outer);
    let worker = Arc::new(worker);
    let mut providers = ProviderRegistry::new();
    providers.register(outer.clone());
    providers.register(worker.clone());

    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(AgentProcessor::new().with_model("信息搜集", "worker")));

    Harness {
        dispatcher: Dispatcher::new(tools, providers).with_processors(processors),
        outer,
        worker,
    }
}

fn agent_call() -> ToolCall {
    ToolCall::new(
        "c1",
        "OneAgent",
        r#"{"skill":"信息搜集","role":"研究员","task":"调研华东天气"}"#,
    )
}

fn weather_call() -> ToolCall {
    ToolCall::new("c2", "Weather", r#"{"city":"上海"}"#)
}

async fn turn(h: &Harness, conv: &mut ConversationState, ctx: &TurnContext) -> Vec<StreamEvent> {
    h.dispatcher.run_turn("claude", conv, ctx).collect().await
}

#[tokio::test]
async fn test_unfinished_agent_abandons_batch_then_reenters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/weather"))
        .respond_with(ResponseTemplate::new(200).set_body_string("晴 26°C"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(
        &server,
        ScriptedProvider::new("claude")
            .with_calls(vec![agent_call(), weather_call()])
            .with_text("汇总完成"),
        ScriptedProvider::new("worker")
            .with_text("请问需要覆盖哪些城市？")
            .with_text(format!("上海、杭州均为晴天{}", AGENT_FINISH_MARKER)),
    )
    .await;
    let ctx = TurnContext::new("s1", "u1");
    let mut conv = ConversationState::with_question("s1", "帮我调研一下天气");

    // 第一轮：Agent 没有输出完成标记，后续调用不执行，子对话挂起
    let first = turn(&h, &mut conv, &ctx).await;
    assert!(first.contains(&StreamEvent::answer("请问需要覆盖哪些城市？")));
    assert!(!first
        .iter()
        .any(|e| matches!(e, StreamEvent::ToolExecutionStarted { name, .. } if name == "Weather")));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(conv.sub_conversations.contains_key("c1"));
    assert!(conv.agent_results.is_empty());
    assert_eq!(h.outer.submissions(), 1);

    // 第二轮：用户补充信息，Agent 重入完成，剩余调用继续执行后回传外层模型
    conv.add_question(ContentUnit::text("上海和杭州"));
    let second = turn(&h, &mut conv, &ctx).await;

    assert_eq!(conv.agent_results.len(), 1);
    assert_eq!(conv.agent_results[0].role, "研究员");
    assert!(conv.agent_results[0].text.contains("上海、杭州均为晴天"));
    assert!(conv.sub_conversations.is_empty());
    assert!(second
        .iter()
        .any(|e| matches!(e, StreamEvent::ToolExecutionStarted { name, .. } if name == "Weather")));
    assert!(second.contains(&StreamEvent::answer("汇总完成")));
    assert_eq!(h.outer.submissions(), 2);
    assert_eq!(h.worker.submissions(), 2);

    // 重入时 Agent 看到了用户的新消息
    let reentered = &h.worker.seen()[1];
    assert!(reentered.current_questions().contains(&ContentUnit::text("上海和杭州")));

    let recorded = conv.previous_calls();
    assert!(recorded.iter().all(|c| c.is_resolved()));
    server.verify().await;
}

#[tokio::test]
async fn test_finished_agent_result_is_resubmitted_same_turn() {
    let server = MockServer::start().await;
    let h = harness(
        &server,
        ScriptedProvider::new("claude")
            .with_calls(vec![agent_call()])
            .with_text("已整理"),
        ScriptedProvider::new("worker").with_text(format!("资料如下{}", AGENT_FINISH_MARKER)),
    )
    .await;
    let ctx = TurnContext::new("s1", "u1");
    let mut conv = ConversationState::with_question("s1", "帮我调研");

    let events = turn(&h, &mut conv, &ctx).await;
    assert!(events.contains(&StreamEvent::answer("已整理")));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::ToolResult { .. })));
    assert_eq!(h.outer.submissions(), 2);
    assert_eq!(conv.agent_results.len(), 1);
    assert!(conv.sub_conversations.is_empty());
}
