//! 工具层：定义、调用、触发词匹配与注册表

pub mod call;
pub mod definition;
pub mod matcher;
pub mod registry;
pub mod store;

pub use call::{ExecutorKind, OutcomeValue, ToolCall, ToolOutcome, DONE};
pub use definition::{CallMethod, ToolDefinition, DEFAULT_GROUP};
pub use matcher::{Hit, HorspoolMatcher};
pub use registry::{ToolRegistry, MAX_EXPOSED_DEFINITIONS};
pub use store::{StaticToolStore, TomlToolStore, ToolStore};
