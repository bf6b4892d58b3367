use super::JsonRpcError;
use crate::tools::{RegistryError, SchemaViolation};
use serde_json::{Value, json};
use thiserror::Error;

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const HANDLER_ERROR: i64 = -32001;
    pub const UNINITIALIZED: i64 = -32002;
    pub const TOOL_TIMEOUT: i64 = -32003;
}

/// Server-side failures. Every variant becomes an error response; none of
/// them closes the connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Tool error: {0}")]
    Handler(String),
    #[error("Session not initialized: '{0}' requires a completed initialize handshake")]
    Uninitialized(String),
    #[error("Tool '{tool}' timed out after {timeout_ms} ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => codes::PARSE_ERROR,
            RpcError::InvalidRequest(_) => codes::INVALID_REQUEST,
            RpcError::MethodNotFound(_) | RpcError::UnknownTool(_) => codes::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => codes::INVALID_PARAMS,
            RpcError::Handler(_) => codes::HANDLER_ERROR,
            RpcError::Uninitialized(_) => codes::UNINITIALIZED,
            RpcError::ToolTimeout { .. } => codes::TOOL_TIMEOUT,
            RpcError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    fn data(&self) -> Option<Value> {
        match self {
            RpcError::UnknownTool(tool) => Some(json!({ "tool": tool })),
            RpcError::Handler(message) => Some(json!({ "error": message })),
            RpcError::ToolTimeout { tool, timeout_ms } => {
                Some(json!({ "tool": tool, "timeout_ms": timeout_ms }))
            }
            _ => None,
        }
    }

    pub fn to_error_object(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data: self.data(),
        }
    }
}

impl From<RegistryError> for RpcError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownTool(name) => RpcError::UnknownTool(name),
            RegistryError::DuplicateTool(name) => {
                RpcError::Internal(format!("duplicate tool '{}'", name))
            }
        }
    }
}

impl From<SchemaViolation> for RpcError {
    fn from(err: SchemaViolation) -> Self {
        RpcError::InvalidParams(err.to_string())
    }
}
