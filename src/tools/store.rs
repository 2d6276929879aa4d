//! 工具定义存储
//!
//! 注册表定时从存储整表重新加载。默认实现读取 TOML 文件（`[[tools]]` 数组）。

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::RelayError;
use crate::tools::ToolDefinition;

/// 可查询的工具定义集合
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ToolDefinition>, RelayError>;
}

#[derive(Debug, Deserialize)]
struct ToolFile {
    #[serde(default)]
    tools: Vec<ToolDefinition>,
}

/// TOML 文件存储
#[derive(Debug, Clone)]
pub struct TomlToolStore {
    path: PathBuf,
}

impl TomlToolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(content: &str) -> Result<Vec<ToolDefinition>, RelayError> {
        let file: ToolFile = toml::from_str(content).map_err(|e| RelayError::Store(e.to_string()))?;
        Ok(file.tools)
    }
}

#[async_trait]
impl ToolStore for TomlToolStore {
    async fn load_all(&self) -> Result<Vec<ToolDefinition>, RelayError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RelayError::Store(format!("{}: {}", self.path.display(), e)))?;
        Self::parse(&content)
    }
}

/// 内存中的固定定义（嵌入式使用与测试）
#[derive(Debug, Clone, Default)]
pub struct StaticToolStore {
    definitions: Vec<ToolDefinition>,
}

impl StaticToolStore {
    pub fn new(definitions: Vec<ToolDefinition>) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl ToolStore for StaticToolStore {
    async fn load_all(&self) -> Result<Vec<ToolDefinition>, RelayError> {
        Ok(self.definitions.clone())
    }
}
