//! 模型层：提供方契约、显式注册表与脚本化实现

pub mod mock;
pub mod registry;
pub mod traits;

pub use mock::{text_turn, ScriptedProvider};
pub use registry::ProviderRegistry;
pub use traits::ModelProvider;
