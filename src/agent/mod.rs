pub mod conversation;
pub mod model;
pub mod ollama;
pub mod runner;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};

pub use conversation::{Conversation, Role, ToolCall, ToolOutcome, ToolResult, Turn};
pub use model::{ModelBackend, ModelError, ModelTurn};
pub use ollama::OllamaBackend;
pub use runner::{Agent, AgentError, AgentOptions, AgentOutcome, SYSTEM_PROMPT};

use crate::mcp::error::codes;
use crate::mcp::{ClientError, RpcClient, ToolContent};
use crate::tools::ToolSpec;

/// How the agent reaches the tools. Every call yields an outcome; failures
/// are data for the model, not errors for the loop.
#[async_trait]
pub trait ToolGateway: Send {
    async fn list_tools(&mut self) -> Result<Vec<ToolSpec>, ClientError>;
    async fn call_tool(&mut self, name: &str, arguments: Map<String, Value>) -> ToolOutcome;
}

#[async_trait]
impl<R, W> ToolGateway for RpcClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn list_tools(&mut self) -> Result<Vec<ToolSpec>, ClientError> {
        RpcClient::list_tools(self).await
    }

    async fn call_tool(&mut self, name: &str, arguments: Map<String, Value>) -> ToolOutcome {
        match RpcClient::call_tool(self, name, arguments).await {
            Ok(result) if result.is_error == Some(true) => {
                let message = result
                    .content
                    .iter()
                    .map(|ToolContent::Text { text }| text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutcome::Failure {
                    code: codes::HANDLER_ERROR,
                    message,
                    data: result.structured_content,
                }
            }
            Ok(result) => ToolOutcome::Success(result.payload()),
            Err(ClientError::Rpc(error)) => ToolOutcome::Failure {
                code: error.code,
                message: error.message,
                data: error.data,
            },
            Err(other) => ToolOutcome::Failure {
                code: codes::INTERNAL_ERROR,
                message: other.to_string(),
                data: None,
            },
        }
    }
}
