//! 工具定义（从存储加载，加载后不可变）

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ExecutorKind;

/// 未指定分组时的默认分组
pub const DEFAULT_GROUP: &str = "Internal";

/// Backend 工具的 HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallMethod {
    #[default]
    Get,
    Post,
}

/// 一条工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 参数 JSON Schema
    #[serde(default = "empty_schema")]
    pub parameters: Value,
    #[serde(default)]
    pub executor: ExecutorKind,
    #[serde(default = "default_group")]
    pub group: String,
    /// 触发词，逗号 / 空格分隔（中英文标点均可）
    #[serde(default)]
    pub trigger_words: String,
    #[serde(default)]
    pub call_method: CallMethod,
    /// URL 模板，GET 时 `{field}` 由参数替换
    #[serde(default)]
    pub call_url: Option<String>,
    /// 回传模型时的提示覆盖
    #[serde(default)]
    pub prompt: Option<String>,
    /// 直接取响应中的指定字段作为最终结果，不再回传模型
    #[serde(default)]
    pub return_raw: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_enabled() -> bool {
    true
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, executor: ExecutorKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: empty_schema(),
            executor,
            group: default_group(),
            trigger_words: String::new(),
            call_method: CallMethod::Get,
            call_url: None,
            prompt: None,
            return_raw: false,
            enabled: true,
        }
    }

    pub fn with_triggers(mut self, words: impl Into<String>) -> Self {
        self.trigger_words = words.into();
        self
    }

    pub fn with_url(mut self, method: CallMethod, url: impl Into<String>) -> Self {
        self.call_method = method;
        self.call_url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 拆分后的触发词（去空）
    pub fn trigger_word_list(&self) -> Vec<String> {
        self.trigger_words
            .split(&[',', '，', ' ', '\u{3000}'][..])
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(String::from)
            .collect()
    }

    /// 呈现给模型的函数描述
    pub fn to_function_json(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}
