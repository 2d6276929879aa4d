//! 工具注册表
//!
//! 从 ToolStore 整表加载定义并构建按分组的触发词索引；快照整体替换（Arc swap），
//! 使用中的快照从不原地修改。load 之后按固定间隔（默认 30 分钟）视为过期，
//! 查询前 ensure_fresh 会重新加载，另有后台 refresher 定时刷新。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationState;
use crate::core::RelayError;
use crate::tools::matcher::HorspoolMatcher;
use crate::tools::{ToolDefinition, ToolStore};

/// 呈现给模型的定义数量上限
pub const MAX_EXPOSED_DEFINITIONS: usize = 10;

/// 单个分组的触发词索引
#[derive(Debug, Default)]
struct TriggerIndex {
    /// 全部触发词（去重，保持加载顺序）
    words: Vec<String>,
    /// 触发词 -> 工具名
    reverse: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct Snapshot {
    loaded_at: Option<Instant>,
    /// 仅启用的定义，保持加载顺序
    definitions: Vec<ToolDefinition>,
    by_name: HashMap<String, usize>,
    groups: HashMap<String, TriggerIndex>,
}

impl Snapshot {
    fn build(all: Vec<ToolDefinition>) -> Self {
        let definitions: Vec<ToolDefinition> = all.into_iter().filter(|d| d.enabled).collect();
        let mut by_name = HashMap::new();
        let mut groups: HashMap<String, TriggerIndex> = HashMap::new();

        for (i, def) in definitions.iter().enumerate() {
            if by_name.insert(def.name.clone(), i).is_some() {
                tracing::warn!(tool = %def.name, "duplicate tool name, later definition wins");
            }
            let index = groups.entry(def.group.clone()).or_default();
            for word in def.trigger_word_list() {
                let names = index.reverse.entry(word.clone()).or_default();
                if names.is_empty() {
                    index.words.push(word);
                }
                if !names.contains(&def.name) {
                    names.push(def.name.clone());
                }
            }
        }

        Self {
            loaded_at: Some(Instant::now()),
            definitions,
            by_name,
            groups,
        }
    }
}

pub struct ToolRegistry {
    store: Arc<dyn ToolStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_interval: Duration,
    max_hits: usize,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn ToolStore>, refresh_interval: Duration, max_hits: usize) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_interval,
            max_hits,
        }
    }

    /// 从存储重建索引并替换快照，返回启用的定义数
    pub async fn load(&self) -> Result<usize, RelayError> {
        let all = self.store.load_all().await?;
        let snapshot = Arc::new(Snapshot::build(all));
        let count = snapshot.definitions.len();
        *self.snapshot.write().await = snapshot;
        tracing::info!(tools = count, "tool registry loaded");
        Ok(count)
    }

    pub async fn refresh(&self) -> Result<usize, RelayError> {
        self.load().await
    }

    /// 快照过期时重新加载；失败时保留旧快照
    pub async fn ensure_fresh(&self) {
        let stale = {
            let snap = self.snapshot.read().await;
            snap.loaded_at
                .map(|t| t.elapsed() >= self.refresh_interval)
                .unwrap_or(true)
        };
        if stale {
            if let Err(e) = self.load().await {
                tracing::warn!(error = %e, "tool registry refresh failed, keeping previous snapshot");
            }
        }
    }

    async fn current(&self) -> Arc<Snapshot> {
        self.ensure_fresh().await;
        self.snapshot.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<ToolDefinition> {
        let snap = self.current().await;
        snap.by_name.get(name).map(|&i| snap.definitions[i].clone())
    }

    /// 按名取定义，至多 MAX_EXPOSED_DEFINITIONS 条，保持加载顺序
    pub async fn definitions(&self, names: &BTreeSet<String>) -> Vec<ToolDefinition> {
        let snap = self.current().await;
        snap.definitions
            .iter()
            .filter(|d| names.contains(&d.name))
            .take(MAX_EXPOSED_DEFINITIONS)
            .cloned()
            .collect()
    }

    /// 在文本中匹配分组触发词，返回命中的工具名
    pub async fn select_by_text(&self, text: &str, group: &str) -> BTreeSet<String> {
        let snap = self.current().await;
        let mut selected = BTreeSet::new();
        let Some(index) = snap.groups.get(group) else {
            return selected;
        };

        let mut matcher = HorspoolMatcher::new();
        for hit in matcher.search(text, &index.words, self.max_hits) {
            if let Some(names) = index.reverse.get(&hit.word) {
                selected.extend(names.iter().cloned());
            }
        }
        tracing::debug!(group = %group, selected = ?selected, "scene selection");
        selected
    }

    /// 场景选择：系统提示 + 全部文本提问
    pub async fn select_by_scene(&self, conversation: &ConversationState, group: &str) -> BTreeSet<String> {
        self.select_by_text(&conversation.scene_text(), group).await
    }

    /// 后台定时刷新，直到 shutdown 被取消
    pub fn spawn_refresher(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("tool registry refresher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "scheduled tool registry refresh failed");
                        }
                    }
                }
            }
        })
    }
}
