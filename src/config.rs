//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOOLRELAY__*` 覆盖（双下划线表示嵌套，如 `TOOLRELAY__AUTOMATION__MAX_ROUNDS=10`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::automation::{AutomationSettings, Persona, SessionOptions, Viewport};
use crate::dispatch::DispatchSettings;
use crate::processors::DelegateProcessor;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub registry: RegistrySection,
    pub dispatch: DispatchSection,
    pub automation: AutomationSection,
    pub processors: ProcessorsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [registry] 段：工具定义存储与场景选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// 工具定义 TOML 文件（`[[tools]]`）
    pub store_path: PathBuf,
    pub refresh_minutes: u64,
    /// 单次场景匹配的命中上限
    pub max_hits: usize,
    pub default_group: String,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("config/tools.toml"),
            refresh_minutes: 30,
            max_hits: 10,
            default_group: crate::tools::DEFAULT_GROUP.to_string(),
        }
    }
}

impl RegistrySection {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_minutes.max(1) * 60)
    }
}

/// [dispatch] 段：后端 HTTP 与回传上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub http_timeout_secs: u64,
    /// 透传用户 token 的请求头
    pub auth_header: String,
    /// return_raw 工具取值的响应字段
    pub raw_result_field: String,
    pub max_resubmissions: usize,
    pub max_depth: usize,
    pub default_model: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            http_timeout_secs: 60,
            auth_header: "x-access-token".to_string(),
            raw_result_field: "body".to_string(),
            max_resubmissions: 10,
            max_depth: 4,
            default_model: "claude".to_string(),
        }
    }
}

impl DispatchSection {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn settings(&self, tool_group: &str) -> DispatchSettings {
        DispatchSettings {
            tool_group: tool_group.to_string(),
            default_model: self.default_model.clone(),
            max_resubmissions: self.max_resubmissions,
            max_depth: self.max_depth,
        }
    }
}

/// [automation] 段：自动化循环、浏览器会话与沙箱
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    /// 路由到自动化循环的模型标签
    pub label: String,
    pub persona: Persona,
    /// 驱动循环的提供方标签
    pub provider: String,
    pub max_rounds: usize,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub page_timeout_secs: u64,
    pub settle_ms: u64,
    pub headless: bool,
    pub sandbox_root: PathBuf,
    pub shell_timeout_secs: u64,
    pub idle_minutes: u64,
    pub sweep_interval_minutes: u64,
    pub max_content_chars: usize,
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            label: "automation".to_string(),
            persona: Persona::Web,
            provider: "claude".to_string(),
            max_rounds: 30,
            viewport_width: 1280,
            viewport_height: 800,
            page_timeout_secs: 30,
            settle_ms: 300,
            headless: true,
            sandbox_root: PathBuf::from("auto_files"),
            shell_timeout_secs: 60,
            idle_minutes: 30,
            sweep_interval_minutes: 60,
            max_content_chars: 20_000,
        }
    }
}

impl AutomationSection {
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.viewport_width,
            height: self.viewport_height,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            viewport: self.viewport(),
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn settings(&self) -> AutomationSettings {
        AutomationSettings {
            label: self.label.clone(),
            model: self.provider.clone(),
            persona: self.persona,
            max_rounds: self.max_rounds,
            viewport: self.viewport(),
            max_content_chars: self.max_content_chars,
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.max(1) * 60)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }
}

/// [processors] 段：Agent 技能模型覆盖与委托处理器声明
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProcessorsSection {
    /// 技能名 -> 模型标签
    pub agent_models: HashMap<String, String>,
    /// `[[processors.delegates]]`
    pub delegates: Vec<DelegateProcessor>,
}

/// 从 config 目录加载配置，环境变量 TOOLRELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOOLRELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOOLRELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.registry.refresh_interval(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.automation.max_rounds, 30);
        assert_eq!(cfg.automation.idle_threshold(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.dispatch.auth_header, "x-access-token");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
[automation]
persona = "editor"
max_rounds = 5

[processors.agent_models]
"信息搜集" = "gpt-4o"

[[processors.delegates]]
name = "Translate"
model = "qwen"
argument = "text"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.automation.persona, Persona::Editor);
        assert_eq!(cfg.automation.max_rounds, 5);
        assert_eq!(cfg.automation.viewport_width, 1280);
        assert_eq!(cfg.processors.agent_models.get("信息搜集").map(String::as_str), Some("gpt-4o"));
        assert_eq!(cfg.processors.delegates[0].argument, "text");
    }
}
