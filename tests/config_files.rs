//! 随仓库发布的配置文件可以被正常加载

use toolrelay::automation::Persona;
use toolrelay::config::load_config;
use toolrelay::tools::{ExecutorKind, TomlToolStore};

#[test]
fn test_default_config_loads() {
    let cfg = load_config(None).unwrap();
    assert_eq!(cfg.automation.label, "automation");
    assert_eq!(cfg.automation.persona, Persona::Web);
    assert_eq!(cfg.registry.store_path.to_str(), Some("config/tools.toml"));
    assert!(cfg.processors.delegates.iter().any(|d| d.name == "Translate"));
}

#[test]
fn test_shipped_tool_store_parses() {
    let content = std::fs::read_to_string("config/tools.toml").unwrap();
    let defs = TomlToolStore::parse(&content).unwrap();
    let weather = defs.iter().find(|d| d.name == "Weather").unwrap();
    assert_eq!(weather.executor, ExecutorKind::Backend);
    assert!(weather.prompt.as_deref().unwrap_or_default().contains("{result}"));
    assert!(defs.iter().any(|d| d.name == "CreateOrder" && d.return_raw));
    assert!(defs
        .iter()
        .any(|d| d.name == "OpenPage" && d.executor == ExecutorKind::FrontendForwarded));
}
