//! 模型提供方注册表：启动时显式注册，标签 -> 实现

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::ModelProvider;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 provider.name() 为标签注册
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let label = provider.name().to_string();
        self.register_as(label, provider);
    }

    pub fn register_as(&mut self, label: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        let label = label.into();
        if self.providers.insert(label.clone(), provider).is_some() {
            tracing::warn!(provider = %label, "provider label registered twice, replacing");
        }
    }

    pub fn get(&self, label: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(label).cloned()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.providers.contains_key(label)
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.providers.keys().cloned().collect();
        labels.sort();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;

    #[test]
    fn test_alias_and_replacement() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new("claude")));
        registry.register_as("automation-model", Arc::new(ScriptedProvider::new("claude")));
        registry.register(Arc::new(ScriptedProvider::new("claude")));

        assert_eq!(registry.labels(), vec!["automation-model".to_string(), "claude".to_string()]);
        assert_eq!(registry.get("automation-model").map(|p| p.name().to_string()), Some("claude".to_string()));
        assert!(!registry.contains("gpt-4o"));
    }
}
