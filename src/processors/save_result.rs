//! SaveResultToFile：把指定角色最近一次的 AgentResult 追加写入用户沙箱，并把文件发给用户

use serde::Deserialize;

use crate::automation::sandbox::{mime_for, Sandbox};
use crate::conversation::ConversationState;
use crate::core::{RelayError, TurnContext};
use crate::dispatch::Dispatcher;
use crate::events::{EventStream, StreamEvent};
use crate::processors::SubProcessor;
use crate::tools::ToolCall;

pub const SAVED: &str = "文件写入完成，并且已经将文件发送给用户。";
pub const ROLE_RESULT_MISSING: &str = "文件写入出错，没有找到对应的角色的报告结果。";

#[derive(Debug, Deserialize)]
struct SaveArgs {
    role: String,
    #[serde(default)]
    title: String,
    filename: String,
}

pub struct SaveResultProcessor {
    sandbox: Sandbox,
}

impl SaveResultProcessor {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

impl SubProcessor for SaveResultProcessor {
    fn name(&self) -> &str {
        "SaveResultToFile"
    }

    fn execute<'a>(
        &'a self,
        call: &'a ToolCall,
        conversation: &'a mut ConversationState,
        _dispatcher: &'a Dispatcher,
        ctx: &'a TurnContext,
        _reenter: bool,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            let args: SaveArgs = match serde_json::from_str(&call.arguments) {
                Ok(args) => args,
                Err(e) => {
                    yield StreamEvent::error(&RelayError::Execution(format!("Invalid arguments for {}: {}", call.name, e)));
                    return;
                }
            };
            let Some(result) = conversation.agent_result(&args.role).cloned() else {
                tracing::info!(role = %args.role, "no agent result to save");
                yield StreamEvent::ToolResult { text: ROLE_RESULT_MISSING.to_string() };
                return;
            };

            let content = format!("{}\n\n{}\n\n", args.title, result.text);
            let path = match self.sandbox.append(&ctx.user_id, &args.filename, &content).await {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(file = %args.filename, error = %e, "save agent result failed");
                    yield StreamEvent::error(&e);
                    return;
                }
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    tracing::info!(role = %args.role, file = %path.display(), bytes = bytes.len(), "agent result saved");
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| args.filename.clone());
                    yield StreamEvent::FileBytes {
                        file_name,
                        mime: mime_for(&path).to_string(),
                        bytes,
                    };
                    yield StreamEvent::ToolResult { text: SAVED.to_string() };
                }
                Err(e) => {
                    yield StreamEvent::error(&RelayError::Execution(format!("Error: {}", e)));
                }
            }
        })
    }
}
