pub mod catalog;
pub mod registry;
pub mod schema;

pub use catalog::{GameTool, build_registry, register_catalog};
pub use registry::{HandlerError, RegisteredTool, RegistryError, ToolHandler, ToolRegistry, ToolSpec};
pub use schema::{InputSchema, ParamSpec, ParamType, SchemaViolation};
