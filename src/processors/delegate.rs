//! 配置声明的委托处理器：取参数中的一个字段作为提问，转交给指定模型，回答直接给用户

use serde::Deserialize;
use serde_json::Value;

use crate::conversation::{ContentUnit, ConversationState};
use crate::core::RelayError;
use crate::processors::SubProcessor;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DelegateProcessor {
    pub name: String,
    /// 目标模型标签
    pub model: String,
    /// 作为提问的参数字段
    #[serde(default = "default_argument")]
    pub argument: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_argument() -> String {
    "prompt".to_string()
}

impl DelegateProcessor {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            argument: default_argument(),
            system_prompt: None,
        }
    }
}

impl SubProcessor for DelegateProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, conversation: &mut ConversationState, arguments: &str) -> Result<(), RelayError> {
        let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
        let args: Value = serde_json::from_str(raw)
            .map_err(|e| RelayError::Execution(format!("Invalid arguments for {}: {}", self.name, e)))?;
        let question = match args.get(&self.argument) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) | None => {
                return Err(RelayError::Execution(format!(
                    "Error: argument '{}' is required for {}.",
                    self.argument, self.name
                )))
            }
            Some(other) => other.to_string(),
        };

        if let Some(system) = &self.system_prompt {
            conversation.add_question(ContentUnit::System { text: system.clone() });
        }
        conversation.add_question(ContentUnit::text(question));
        conversation.model = Some(self.model.clone());
        Ok(())
    }
}
