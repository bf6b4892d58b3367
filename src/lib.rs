pub mod agent;
pub mod app;
pub mod config;
pub mod mcp;
pub mod store;
pub mod tools;

pub use agent::{Agent, AgentOptions, OllamaBackend, ToolGateway};
pub use mcp::{LineTransport, McpServer, RpcClient};
pub use store::{GameStore, PostgresStore, SqliteStore};
pub use tools::{GameTool, ToolRegistry, build_registry};
