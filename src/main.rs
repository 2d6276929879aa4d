//! Toolrelay - 编排运行时的本地入口
//!
//! 加载配置与工具注册表，启动后台任务（注册表刷新、会话空闲回收），
//! 然后逐行读取 stdin：打印场景选择命中的工具，并用本地回显提供方跑一轮，输出事件 JSON。
//! 用于在接入真实传输层之前检查触发词配置与分发链路。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use toolrelay::automation::{default_launcher, AutomationLoop, Sandbox, SessionPool};
use toolrelay::config::{load_config, AppConfig};
use toolrelay::core::{run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use toolrelay::dispatch::{BackendClient, Dispatcher};
use toolrelay::llm::{ProviderRegistry, ScriptedProvider};
use toolrelay::processors::{AgentProcessor, ProcessorRegistry, SaveResultProcessor};
use toolrelay::tools::{TomlToolStore, ToolRegistry};
use toolrelay::{observability, ConversationState, TurnContext};

fn build_processors(cfg: &AppConfig, sandbox: Sandbox) -> ProcessorRegistry {
    let mut processors = ProcessorRegistry::new();
    let agent = cfg
        .processors
        .agent_models
        .iter()
        .fold(AgentProcessor::new(), |agent, (skill, model)| agent.with_model(skill, model.clone()));
    processors.register(Arc::new(agent));
    processors.register(Arc::new(SaveResultProcessor::new(sandbox)));
    for delegate in &cfg.processors.delegates {
        processors.register(Arc::new(delegate.clone()));
    }
    processors
}

async fn probe(dispatcher: Arc<Dispatcher>, shutdown: Arc<ShutdownManager>) -> anyhow::Result<()> {
    let group = dispatcher.settings().tool_group.clone();
    let model = dispatcher.default_model().to_string();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut conversation = ConversationState::new(uuid::Uuid::new_v4().to_string());

    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let selected = dispatcher.tools().select_by_text(line, &group).await;
        println!("tools: {:?}", selected);

        conversation.add_question(toolrelay::ContentUnit::text(line));
        let ctx = TurnContext::new(conversation.session_id.clone(), "local").with_stop(shutdown.token().child_token());
        let mut events = dispatcher.run_turn(&model, &mut conversation, &ctx);
        while let Some(event) = events.next().await {
            println!("{}", serde_json::to_string(&event).context("serialize event")?);
        }
    }
    shutdown.shutdown(ShutdownReason::InputClosed);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(std::env::args().nth(1).map(PathBuf::from)).context("Failed to load config")?;
    tracing::info!(app = cfg.app.name.as_deref().unwrap_or("toolrelay"), "starting");

    let shutdown = Arc::new(ShutdownManager::new());

    let registry = Arc::new(ToolRegistry::new(
        Arc::new(TomlToolStore::new(cfg.registry.store_path.clone())),
        cfg.registry.refresh_interval(),
        cfg.registry.max_hits,
    ));
    if let Err(e) = registry.load().await {
        tracing::warn!(error = %e, store = %cfg.registry.store_path.display(), "initial tool load failed, starting empty");
    }
    let refresher = Arc::clone(&registry).spawn_refresher(shutdown.token());

    let pool = Arc::new(SessionPool::new(
        default_launcher(cfg.automation.headless),
        cfg.automation.session_options(),
        cfg.automation.idle_threshold(),
    ));
    let sweeper = Arc::clone(&pool).spawn_sweeper(cfg.automation.sweep_interval(), shutdown.token());

    let sandbox = Sandbox::new(cfg.automation.sandbox_root.clone(), cfg.automation.shell_timeout());
    let backend = BackendClient::new(
        cfg.dispatch.http_timeout(),
        cfg.dispatch.auth_header.clone(),
        cfg.dispatch.raw_result_field.clone(),
    )
    .context("Failed to build backend client")?;

    // 厂商适配器不在本仓库内，本地以回显提供方注册默认模型
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(ScriptedProvider::new(cfg.dispatch.default_model.clone())));
    if cfg.automation.provider != cfg.dispatch.default_model {
        providers.register(Arc::new(ScriptedProvider::new(cfg.automation.provider.clone())));
    }

    let dispatcher = Arc::new(
        Dispatcher::new(Arc::clone(&registry), providers)
            .with_backend(backend)
            .with_processors(build_processors(&cfg, sandbox.clone()))
            .with_automation(AutomationLoop::new(Arc::clone(&pool), sandbox, cfg.automation.settings()))
            .with_settings(cfg.dispatch.settings(&cfg.registry.default_group)),
    );
    tracing::info!(
        processors = ?dispatcher.processors().names(),
        providers = ?dispatcher.providers().labels(),
        "dispatcher ready"
    );

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(pool);

    let app_shutdown = Arc::clone(&shutdown);
    run_with_graceful_shutdown(
        Arc::clone(&shutdown),
        async move {
            if let Err(e) = probe(dispatcher, app_shutdown).await {
                tracing::error!(error = %e, "probe loop failed");
            }
        },
        || async move {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            let failed = coordinator.run_cleanup().await;
            if !failed.is_empty() {
                tracing::warn!(hooks = ?failed, "some cleanup hooks did not finish");
            }
            let _ = refresher.await;
            let _ = sweeper.await;
        },
    )
    .await;

    Ok(())
}
