use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::transport::{LineTransport, TransportError};
use super::{
    CallToolResult, Implementation, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, LATEST_PROTOCOL_VERSION, ListToolsResult, RequestId, methods,
};
use crate::tools::ToolSpec;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("connection closed while waiting for response to request {0}")]
    Closed(RequestId),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Sequential JSON-RPC client. One request is in flight at a time; responses
/// carrying any other id are stale and skipped.
pub struct RpcClient<R, W> {
    transport: LineTransport<R, W>,
    next_id: i64,
    server: Option<InitializeResult>,
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(transport: LineTransport<R, W>) -> Self {
        Self {
            transport,
            next_id: 1,
            server: None,
        }
    }

    /// Server details from the handshake, once it has completed.
    pub fn server(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    pub async fn request(
        &mut self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;
        debug!("Sending request {} ({})", id, method);
        self.transport
            .send(&JsonRpcRequest::new(id.clone(), method, params))
            .await?;

        // A null-id error answers some frame the server could not read. Ours
        // are well formed, so it only becomes the answer if the server hangs up.
        let mut unattributed = None;
        loop {
            let Some(frame) = self.transport.next_frame().await? else {
                return Err(match unattributed {
                    Some(error) => ClientError::Rpc(error),
                    None => ClientError::Closed(id),
                });
            };
            let value: Value = serde_json::from_str(&frame)
                .map_err(|e| ClientError::Protocol(format!("unparsable frame: {}", e)))?;
            if value.get("method").is_some() {
                debug!("Ignoring server-initiated message");
                continue;
            }
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            if response.id == id {
                return response.into_result().map_err(ClientError::Rpc);
            }
            if response.id == RequestId::Null {
                warn!("Server reported an error for an unidentified message while waiting for {}", id);
                if let Err(error) = response.into_result() {
                    unattributed = Some(error);
                }
                continue;
            }
            warn!("Discarding stale response {} while waiting for {}", response.id, id);
        }
    }

    async fn request_as<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<T, ClientError> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub async fn notify(&mut self, method: &str, params: Map<String, Value>) -> Result<(), ClientError> {
        self.transport
            .send(&JsonRpcRequest::notification(method, params))
            .await?;
        Ok(())
    }

    /// Handshake: `initialize` followed by the `initialized` notification.
    pub async fn initialize(&mut self, client_info: Implementation) -> Result<InitializeResult, ClientError> {
        let params = json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": client_info,
        });
        let result: InitializeResult = self
            .request_as(methods::INITIALIZE, as_object(params))
            .await?;
        self.notify(methods::INITIALIZED, Map::new()).await?;
        debug!(
            "Connected to {} {} (protocol {})",
            result.server_info.name, result.server_info.version, result.protocol_version
        );
        self.server = Some(result.clone());
        Ok(result)
    }

    pub async fn list_tools(&mut self) -> Result<Vec<ToolSpec>, ClientError> {
        let result: ListToolsResult = self.request_as(methods::LIST_TOOLS, Map::new()).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ClientError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request_as(methods::CALL_TOOL, as_object(params)).await
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.request(methods::PING, Map::new()).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.request(methods::SHUTDOWN, Map::new()).await?;
        Ok(())
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::McpServer;
    use crate::store::StubStore;
    use crate::tools::build_registry;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn client_info() -> Implementation {
        Implementation {
            name: "test-agent".into(),
            version: "0.1".into(),
        }
    }

    fn connect() -> RpcClient<
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    > {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let registry = build_registry(Arc::new(StubStore::with_games(3))).unwrap();
        let server = McpServer::new(Arc::new(registry));
        tokio::spawn(async move { server.serve(LineTransport::split(server_io)).await });
        RpcClient::new(LineTransport::split(client_io))
    }

    #[tokio::test]
    async fn test_handshake_list_and_call() {
        let mut client = connect();
        let info = client.initialize(client_info()).await.unwrap();
        assert_eq!(info.protocol_version, LATEST_PROTOCOL_VERSION);
        assert!(client.server().is_some());
        client.ping().await.unwrap();

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 9);

        let mut args = Map::new();
        args.insert("min_players".into(), json!(2));
        let result = client.call_tool("find_games", args).await.unwrap();
        assert_eq!(result.payload().as_array().map(Vec::len), Some(3));
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_responses_surface_as_rpc_errors() {
        let mut client = connect();
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(ref e) if e.code == -32002));

        client.initialize(client_info()).await.unwrap();
        let err = client.call_tool("ghost", Map::new()).await.unwrap_err();
        match err {
            ClientError::Rpc(e) => {
                assert_eq!(e.code, -32601);
                assert_eq!(e.data, Some(json!({"tool": "ghost"})));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stale_responses_are_discarded() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = RpcClient::new(LineTransport::split(client_io));

        let fake_server = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server_io);
            let mut lines = BufReader::new(read).lines();
            let request: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(request["method"], "ping");
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":999,\"result\":\"old\"}\n")
                .await
                .unwrap();
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
                .await
                .unwrap();
            let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
            write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            // Hold the pipe open until the client is done.
            let _ = lines.next_line().await;
        });

        client.ping().await.unwrap();
        drop(client);
        fake_server.await.unwrap();
    }

    #[tokio::test]
    async fn test_null_id_errors_do_not_answer_the_pending_request() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = RpcClient::new(LineTransport::split(client_io));

        let fake_server = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server_io);
            let mut lines = BufReader::new(read).lines();

            let request: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let orphan = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}});
            let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
            write
                .write_all(format!("{}\n{}\n", orphan, reply).as_bytes())
                .await
                .unwrap();

            // Second request: only the orphan error, then hang up.
            lines.next_line().await.unwrap().unwrap();
            write
                .write_all(format!("{}\n", orphan).as_bytes())
                .await
                .unwrap();
        });

        client.ping().await.unwrap();
        match client.ping().await.unwrap_err() {
            ClientError::Rpc(error) => assert_eq!(error.code, -32700),
            other => panic!("unexpected error: {other:?}"),
        }
        fake_server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        drop(server_io);
        let mut client = RpcClient::new(LineTransport::split(client_io));
        let err = client.ping().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Closed(RequestId::Number(1)) | ClientError::Transport(_)
        ));
    }
}
