//! Toolrelay - AI 助手网关的编排运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、单轮上下文（停止信号）、优雅关闭
//! - **observability**: 日志初始化
//! - **conversation**: 对话状态、内容单元、AgentResult
//! - **events**: 流式事件与一轮的惰性事件序列
//! - **llm**: 模型提供方契约、显式注册表、脚本化提供方
//! - **tools**: 工具定义、调用与结果、触发词匹配、注册表与存储
//! - **dispatch**: 调用分发器、后端 HTTP 调用、单轮执行（回传与重入）
//! - **processors**: 内部子处理器（Agent、结果存档、配置委托）
//! - **automation**: 浏览器 / 文件 / Shell 环境、会话池与自动化工具循环

pub mod automation;
pub mod config;
pub mod conversation;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod llm;
pub mod observability;
pub mod processors;
pub mod tools;

pub use conversation::{ContentUnit, ConversationState};
pub use core::{RelayError, TurnContext};
pub use dispatch::Dispatcher;
pub use events::{EventStream, StreamEvent};
