//! 环境控制工具：名称集合、参数解析与参数 Schema
//!
//! 这些调用由分发器直接确认并转交自动化循环，不经过工具注册表。
//! 参数结构用 schemars 生成 JSON Schema，供提供方呈现给模型。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::automation::persona::Persona;
use crate::core::RelayError;
use crate::tools::{ExecutorKind, ToolCall, ToolDefinition};

/// 固定的环境控制工具名
pub const ENVIRONMENT_TOOLS: &[&str] = &[
    "computer",
    "str_replace_based_edit_tool",
    "bash",
    "OpenUrl",
    "GetPageHtml",
    "GoBack",
    "SendFile",
    "ClickElement",
    "InputElement",
    "Screenshot",
];

pub fn is_environment_tool(name: &str) -> bool {
    ENVIRONMENT_TOOLS.contains(&name)
}

fn default_scroll_amount() -> i64 {
    1
}

fn default_wait_secs() -> f64 {
    1.0
}

/// `computer` 工具的动作
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ComputerAction {
    Screenshot,
    MouseMove {
        coordinate: Option<[i64; 2]>,
    },
    /// 未给坐标时点击当前指针位置
    LeftClick {
        coordinate: Option<[i64; 2]>,
    },
    Type {
        text: String,
    },
    /// 按键名，如 Enter、Tab
    Key {
        text: String,
    },
    Scroll {
        #[serde(default = "default_scroll_amount")]
        scroll_amount: i64,
        /// up / down / left / right
        scroll_direction: String,
    },
    /// 等待秒数
    Wait {
        #[serde(default = "default_wait_secs")]
        duration: f64,
    },
}

/// `str_replace_based_edit_tool` 的命令，路径相对用户沙箱
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EditorCommand {
    Create {
        path: String,
        file_text: String,
    },
    View {
        path: String,
        /// 1 起始闭区间，结束为 -1 表示到末尾
        #[serde(default)]
        view_range: Option<[i64; 2]>,
    },
    /// old_str 缺省时把 new_str 追加到末尾；给出但未命中时报错
    StrReplace {
        path: String,
        #[serde(default)]
        old_str: Option<String>,
        #[serde(default)]
        new_str: String,
    },
    Insert {
        path: String,
        insert_line: i64,
        new_str: String,
    },
    UndoEdit {
        path: String,
    },
}

#[derive(Debug, Deserialize, JsonSchema)]
struct UrlArgs {
    url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PathArgs {
    /// 相对用户沙箱的路径
    path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SelectorArgs {
    /// CSS 选择器，必须恰好匹配一个元素
    selector: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct InputArgs {
    selector: String,
    text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BashArgs {
    command: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NoArgs {}

/// 解析后的环境控制调用
#[derive(Debug, Clone, PartialEq)]
pub enum EnvironmentCall {
    OpenUrl(String),
    GoBack,
    GetPageHtml,
    Screenshot,
    SendFile(String),
    ClickElement(String),
    InputElement { selector: String, text: String },
    Computer(ComputerAction),
    Editor(EditorCommand),
    Bash(String),
}

fn parse_args<T: for<'de> Deserialize<'de>>(call: &ToolCall) -> Result<T, RelayError> {
    let value = call.parse_arguments()?;
    serde_json::from_value(value)
        .map_err(|e| RelayError::Execution(format!("Error: invalid arguments for {}: {}", call.name, e)))
}

impl EnvironmentCall {
    pub fn parse(call: &ToolCall) -> Result<Self, RelayError> {
        Ok(match call.name.as_str() {
            "OpenUrl" => EnvironmentCall::OpenUrl(parse_args::<UrlArgs>(call)?.url),
            "GoBack" => EnvironmentCall::GoBack,
            "GetPageHtml" => EnvironmentCall::GetPageHtml,
            "Screenshot" => EnvironmentCall::Screenshot,
            "SendFile" => EnvironmentCall::SendFile(parse_args::<PathArgs>(call)?.path),
            "ClickElement" => EnvironmentCall::ClickElement(parse_args::<SelectorArgs>(call)?.selector),
            "InputElement" => {
                let args: InputArgs = parse_args(call)?;
                EnvironmentCall::InputElement {
                    selector: args.selector,
                    text: args.text,
                }
            }
            "computer" => EnvironmentCall::Computer(parse_args(call)?),
            "str_replace_based_edit_tool" => EnvironmentCall::Editor(parse_args(call)?),
            "bash" => EnvironmentCall::Bash(parse_args::<BashArgs>(call)?.command),
            other => {
                return Err(RelayError::Lookup(format!("[FUNC FAILED] 不是环境控制工具: {}", other)));
            }
        })
    }
}

fn schema_value(schema: schemars::schema::RootSchema) -> serde_json::Value {
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

fn definition(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    let mut def = ToolDefinition::new(name, ExecutorKind::FrontendForwarded).with_description(description);
    def.parameters = parameters;
    def
}

/// 当前人设可用的环境工具定义
pub fn environment_tool_definitions(persona: Persona) -> Vec<ToolDefinition> {
    let all = vec![
        definition(
            "computer",
            "Control the mouse and keyboard of the browser page and take screenshots.",
            schema_value(schema_for!(ComputerAction)),
        ),
        definition(
            "str_replace_based_edit_tool",
            "Create, view and edit text files in the user's sandbox.",
            schema_value(schema_for!(EditorCommand)),
        ),
        definition(
            "bash",
            "Run a bash command in the user's sandbox directory.",
            schema_value(schema_for!(BashArgs)),
        ),
        definition("OpenUrl", "Open a web page in a fresh tab.", schema_value(schema_for!(UrlArgs))),
        definition(
            "GetPageHtml",
            "Get the simplified visible HTML of the current page.",
            schema_value(schema_for!(NoArgs)),
        ),
        definition("GoBack", "Go back to the previous page.", schema_value(schema_for!(NoArgs))),
        definition(
            "SendFile",
            "Send a file from the sandbox to the user.",
            schema_value(schema_for!(PathArgs)),
        ),
        definition(
            "ClickElement",
            "Click the element matched by a CSS selector.",
            schema_value(schema_for!(SelectorArgs)),
        ),
        definition(
            "InputElement",
            "Fill text into the element matched by a CSS selector.",
            schema_value(schema_for!(InputArgs)),
        ),
        definition(
            "Screenshot",
            "Take a screenshot of the current page.",
            schema_value(schema_for!(NoArgs)),
        ),
    ];
    all.into_iter().filter(|d| persona.allows(&d.name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_computer_actions() {
        let call = ToolCall::new("1", "computer", r#"{"action":"left_click"}"#);
        assert_eq!(
            EnvironmentCall::parse(&call).unwrap(),
            EnvironmentCall::Computer(ComputerAction::LeftClick { coordinate: None })
        );
        let call = ToolCall::new("2", "computer", r#"{"action":"scroll","scroll_amount":3,"scroll_direction":"down"}"#);
        assert_eq!(
            EnvironmentCall::parse(&call).unwrap(),
            EnvironmentCall::Computer(ComputerAction::Scroll {
                scroll_amount: 3,
                scroll_direction: "down".into()
            })
        );
    }

    #[test]
    fn test_parse_editor_view() {
        let call = ToolCall::new(
            "1",
            "str_replace_based_edit_tool",
            r#"{"command":"view","path":"a.md","view_range":[1,-1]}"#,
        );
        assert_eq!(
            EnvironmentCall::parse(&call).unwrap(),
            EnvironmentCall::Editor(EditorCommand::View {
                path: "a.md".into(),
                view_range: Some([1, -1])
            })
        );
    }

    #[test]
    fn test_bad_arguments_are_execution_errors() {
        let call = ToolCall::new("1", "OpenUrl", r#"{"link":"x"}"#);
        assert!(matches!(EnvironmentCall::parse(&call), Err(RelayError::Execution(_))));
    }

    #[test]
    fn test_web_persona_hides_editor_tools() {
        let names: Vec<String> = environment_tool_definitions(Persona::Web)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"OpenUrl".to_string()));
        assert!(!names.contains(&"bash".to_string()));
        assert_eq!(environment_tool_definitions(Persona::Editor).len(), ENVIRONMENT_TOOLS.len());
    }
}
