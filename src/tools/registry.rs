use super::schema::InputSchema;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Public description of a tool, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: InputSchema,
}

/// Domain failure raised by a tool handler. Surfaces to clients as a
/// handler error, distinct from protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::new(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(format!("failed to encode result: {}", err))
    }
}

/// Synchronous tool body. Handlers receive already-validated arguments and
/// may block; the server runs them off the async executor.
pub trait ToolHandler: Send + Sync {
    fn call(&self, args: &Map<String, Value>) -> Result<Value, HandlerError>;
}

impl<F> ToolHandler for F
where
    F: Fn(&Map<String, Value>) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, args: &Map<String, Value>) -> Result<Value, HandlerError> {
        self(args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
}

pub struct RegisteredTool {
    pub spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

impl RegisteredTool {
    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }
}

/// Tools in registration order, looked up by name.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: impl ToolHandler + 'static,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateTool(spec.name));
        }
        debug!("Registering tool: {}", spec.name);
        self.index.insert(spec.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            spec,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn resolve(&self, name: &str) -> Result<&RegisteredTool, RegistryError> {
        self.index
            .get(name)
            .and_then(|&i| self.tools.get(i))
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::ParamType;
    use serde_json::json;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: InputSchema::new().required("x", ParamType::Integer, "input"),
        }
    }

    fn echo(args: &Map<String, Value>) -> Result<Value, HandlerError> {
        Ok(Value::Object(args.clone()))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("echo"), echo).unwrap();
        let tool = registry.resolve("echo").unwrap();
        assert_eq!(tool.spec.name, "echo");

        let args = json!({"x": 1}).as_object().cloned().unwrap();
        assert_eq!(tool.handler().call(&args).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("echo"), echo).unwrap();
        let err = registry.register(spec("echo"), echo).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTool("echo".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("nope"),
            Err(RegistryError::UnknownTool(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(spec(name), echo).unwrap();
        }
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_closure_handlers() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec("fail"),
                |_: &Map<String, Value>| -> Result<Value, HandlerError> {
                    Err(HandlerError::new("boom"))
                },
            )
            .unwrap();
        let err = registry.resolve("fail").unwrap().handler().call(&Map::new()).unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_spec_serializes_input_schema_key() {
        let value = serde_json::to_value(spec("echo")).unwrap();
        assert_eq!(value["inputSchema"]["type"], "object");
        assert_eq!(value["inputSchema"]["required"], json!(["x"]));
    }
}
