use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::RpcError;
use super::session::Session;
use super::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, ServerCapabilities, ToolsCapability,
};
use crate::tools::ToolRegistry;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

const INSTRUCTIONS: &str = "Board game catalogue tools. Look games up by name, \
    designer or category, generate candidates, score them and fetch cards for display.";

/// Method bodies. Each returns the `result` value or the error to send back.
pub struct RequestHandler {
    registry: Arc<ToolRegistry>,
    server_info: Implementation,
    handler_timeout: Duration,
}

fn decode_params<T: DeserializeOwned>(params: &Map<String, Value>) -> Result<T, RpcError> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn encode<T: Serialize>(result: &T) -> Result<Value, RpcError> {
    serde_json::to_value(result).map_err(|e| RpcError::Internal(e.to_string()))
}

impl RequestHandler {
    pub fn new(registry: Arc<ToolRegistry>, server_info: Implementation) -> Self {
        Self {
            registry,
            server_info,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn handle_initialize(
        &self,
        session: &mut Session,
        params: &Map<String, Value>,
    ) -> Result<Value, RpcError> {
        debug!("Handling initialize request");
        let params: InitializeParams = decode_params(params)?;
        let version = session.complete_handshake(params)?;

        encode(&InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: self.server_info.clone(),
            instructions: Some(INSTRUCTIONS.to_string()),
        })
    }

    pub fn handle_ping(&self) -> Result<Value, RpcError> {
        Ok(json!({}))
    }

    pub fn handle_list_tools(&self) -> Result<Value, RpcError> {
        debug!("Handling tools/list request");
        encode(&ListToolsResult {
            tools: self.registry.list(),
        })
    }

    /// Resolves and validates the call, then runs the handler on the blocking
    /// pool under the handler timeout. Panics surface as handler errors.
    pub async fn handle_call_tool(&self, params: &Map<String, Value>) -> Result<Value, RpcError> {
        debug!("Handling tools/call request");
        let params: CallToolParams = decode_params(params)?;
        let tool = self.registry.resolve(&params.name).inspect_err(|_| {
            warn!("Unknown tool requested: {}", params.name);
        })?;

        let arguments = match params.arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(RpcError::InvalidParams(format!(
                    "'arguments' must be an object, got {}",
                    other
                )));
            }
        };
        tool.spec.input_schema.validate(&arguments)?;

        info!("Executing tool: {}", params.name);
        let handler = tool.handler();
        let task = tokio::task::spawn_blocking(move || handler.call(&arguments));

        match tokio::time::timeout(self.handler_timeout, task).await {
            Ok(Ok(Ok(output))) => {
                debug!("Tool {} output: {}", params.name, output);
                encode(&CallToolResult::from_output(output))
            }
            Ok(Ok(Err(e))) => {
                warn!("Tool {} failed: {}", params.name, e);
                Err(RpcError::Handler(e.message))
            }
            Ok(Err(join_error)) => {
                error!("Tool {} panicked: {}", params.name, join_error);
                Err(RpcError::Handler(format!(
                    "tool '{}' failed unexpectedly",
                    params.name
                )))
            }
            Err(_) => {
                error!(
                    "Tool {} exceeded {:?}",
                    params.name, self.handler_timeout
                );
                Err(RpcError::ToolTimeout {
                    tool: params.name,
                    timeout_ms: self.handler_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn handle_shutdown(&self, session: &mut Session) -> Result<Value, RpcError> {
        info!("Shutdown requested");
        session.close();
        Ok(json!({}))
    }

    pub fn handle_unknown(&self, method: &str) -> Result<Value, RpcError> {
        warn!("Unknown method: {}", method);
        Err(RpcError::MethodNotFound(method.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{HandlerError, InputSchema, ParamType, ToolSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(name: &str, schema: InputSchema) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: name.into(),
            input_schema: schema,
        }
    }

    fn handler_with(registry: ToolRegistry) -> RequestHandler {
        RequestHandler::new(
            Arc::new(registry),
            Implementation {
                name: "test-server".into(),
                version: "0.0.1".into(),
            },
        )
        .with_handler_timeout(Duration::from_millis(200))
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_validation_failure_never_runs_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec(
                    "count",
                    InputSchema::new().required("n", ParamType::Integer, "n"),
                ),
                move |_: &Map<String, Value>| -> Result<Value, HandlerError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                },
            )
            .unwrap();
        let handler = handler_with(registry);

        let err = handler
            .handle_call_tool(&params(json!({"name": "count", "arguments": {}})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32602);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handler
            .handle_call_tool(&params(json!({"name": "count", "arguments": {"n": 1}})))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_object_arguments_are_invalid_params() {
        let mut registry = ToolRegistry::new();
        registry
            .register(spec("noop", InputSchema::new()), |_: &Map<String, Value>| {
                Ok::<Value, HandlerError>(json!("ok"))
            })
            .unwrap();
        let handler = handler_with(registry);
        let err = handler
            .handle_call_tool(&params(json!({"name": "noop", "arguments": [1, 2]})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));

        let ok = handler
            .handle_call_tool(&params(json!({"name": "noop"})))
            .await
            .unwrap();
        assert_eq!(ok["structuredContent"], "ok");
    }

    #[tokio::test]
    async fn test_missing_tool_name_is_invalid_params() {
        let handler = handler_with(ToolRegistry::new());
        let err = handler.handle_call_tool(&Map::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));

        let err = handler
            .handle_call_tool(&params(json!({"name": "ghost"})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::UnknownTool("ghost".into()));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_handler_error() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec("explode", InputSchema::new()),
                |_: &Map<String, Value>| -> Result<Value, HandlerError> { panic!("kaboom") },
            )
            .unwrap();
        let handler = handler_with(registry);
        let err = handler
            .handle_call_tool(&params(json!({"name": "explode"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32001);
        assert!(!err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec("slow", InputSchema::new()),
                |_: &Map<String, Value>| -> Result<Value, HandlerError> {
                    std::thread::sleep(Duration::from_secs(1));
                    Ok(json!(1))
                },
            )
            .unwrap();
        let handler = handler_with(registry);
        let err = handler
            .handle_call_tool(&params(json!({"name": "slow"})))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::ToolTimeout {
                tool: "slow".into(),
                timeout_ms: 200
            }
        );
    }

    #[test]
    fn test_initialize_negotiates_and_reports_server_info() {
        let handler = handler_with(ToolRegistry::new());
        let mut session = Session::new();
        let result = handler
            .handle_initialize(
                &mut session,
                &params(json!({"protocolVersion": "2024-11-05", "capabilities": {}})),
            )
            .unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);

        let err = handler
            .handle_initialize(&mut session, &params(json!({"protocolVersion": "2024-11-05"})))
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
    }
}
