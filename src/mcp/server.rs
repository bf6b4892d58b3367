use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::error::RpcError;
use super::handlers::RequestHandler;
use super::session::Session;
use super::transport::{LineTransport, TransportError};
use super::{Implementation, JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse, RequestId, methods};
use crate::tools::ToolRegistry;

/// Longest slice of an unparsable frame echoed back in the error data.
const ECHO_LIMIT: usize = 200;

/// The tool server. Cheap to clone; every connection gets its own
/// [`Connection`] and therefore its own session.
#[derive(Clone)]
pub struct McpServer {
    handler: Arc<RequestHandler>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_handler_timeout(registry, super::handlers::DEFAULT_HANDLER_TIMEOUT)
    }

    pub fn with_handler_timeout(registry: Arc<ToolRegistry>, handler_timeout: Duration) -> Self {
        let server_info = Implementation {
            name: "boardgame-mcp".to_string(),
            version: env!("BOARDGAME_MCP_VERSION").to_string(),
        };
        Self {
            handler: Arc::new(
                RequestHandler::new(registry, server_info).with_handler_timeout(handler_timeout),
            ),
        }
    }

    pub fn connection(&self) -> Connection {
        Connection {
            handler: Arc::clone(&self.handler),
            session: Session::new(),
        }
    }

    /// Serves one client until end of stream, a transport failure or an
    /// explicit shutdown.
    pub async fn serve<R, W>(&self, mut transport: LineTransport<R, W>) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut connection = self.connection();
        loop {
            let frame = match transport.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Connection closed");
                    break;
                }
                Err(TransportError::FrameTooLarge(limit)) => {
                    warn!("Dropping connection after a frame larger than {} bytes", limit);
                    let reply = JsonRpcResponse::failure(
                        RequestId::Null,
                        RpcError::Parse(format!("frame exceeds {} bytes", limit)).to_error_object(),
                    );
                    transport.send(&reply).await.context("Failed to write response")?;
                    break;
                }
                Err(e) => return Err(e).context("Failed to read request"),
            };

            if let Some(reply) = connection.handle_frame(&frame).await {
                transport.send(&reply).await.context("Failed to write response")?;
            }
            if connection.is_closed() {
                info!("Session shut down");
                break;
            }
        }
        Ok(())
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        info!("MCP server started on stdio, waiting for requests...");
        self.serve(LineTransport::stdio()).await
    }

    /// Accepts TCP clients forever, one session per socket.
    pub async fn serve_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("MCP server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await.context("Failed to accept")?;
            info!("Client connected: {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(LineTransport::split(stream)).await {
                    error!("Connection {} failed: {:#}", peer, e);
                }
            });
        }
    }
}

pub struct Connection {
    handler: Arc<RequestHandler>,
    session: Session,
}

impl Connection {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Handles one frame: a single message or a batch. Returns `None` when
    /// nothing must be written (notifications only).
    pub async fn handle_frame(&mut self, frame: &str) -> Option<Value> {
        let frame = frame.trim();
        if frame.is_empty() {
            return None;
        }
        let message: Value = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to parse JSON: {}", e);
                let mut echo: String = frame.chars().take(ECHO_LIMIT).collect();
                if echo.len() < frame.len() {
                    echo.push_str("...");
                }
                let mut error = RpcError::Parse(e.to_string()).to_error_object();
                error.data = Some(serde_json::json!({ "line": echo }));
                return to_reply(&JsonRpcResponse::failure(RequestId::Null, error));
            }
        };

        match message {
            Value::Array(batch) if batch.is_empty() => to_reply(&JsonRpcResponse::failure(
                RequestId::Null,
                RpcError::InvalidRequest("empty batch".to_string()).to_error_object(),
            )),
            Value::Array(batch) => {
                let mut replies = Vec::with_capacity(batch.len());
                for message in batch {
                    if let Some(reply) = self.handle_message(message).await {
                        replies.push(reply);
                    }
                }
                if replies.is_empty() {
                    None
                } else {
                    serde_json::to_value(replies).ok()
                }
            }
            message => {
                let reply = self.handle_message(message).await?;
                to_reply(&reply)
            }
        }
    }

    /// Handles one decoded message. Requests get exactly one response;
    /// notifications get none, even when they fail.
    pub async fn handle_message(&mut self, message: Value) -> Option<JsonRpcResponse> {
        let request = match parse_request(message) {
            Ok(request) => request,
            Err(rejection) => {
                warn!("Rejecting malformed request: {}", rejection.error);
                let id = rejection.reply_to?;
                return Some(JsonRpcResponse::failure(id, rejection.error.to_error_object()));
            }
        };
        match &request.id {
            Some(id) => info!("Received request: id={}, method={}", id, request.method),
            None => info!("Received notification: method={}", request.method),
        }

        let outcome = self.dispatch(&request).await;
        let Some(id) = request.id else {
            if let Err(e) = outcome {
                debug!("Notification {} failed: {}", request.method, e);
            }
            return None;
        };
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::failure(id, e.to_error_object()),
        })
    }

    async fn dispatch(&mut self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        self.session.admit(&request.method)?;
        let params = &request.params;
        match request.method.as_str() {
            methods::INITIALIZE => self.handler.handle_initialize(&mut self.session, params),
            methods::INITIALIZED => Ok(Value::Null),
            methods::PING => self.handler.handle_ping(),
            methods::LIST_TOOLS => self.handler.handle_list_tools(),
            methods::CALL_TOOL => self.handler.handle_call_tool(params).await,
            methods::SHUTDOWN => self.handler.handle_shutdown(&mut self.session),
            other => self.handler.handle_unknown(other),
        }
    }
}

fn to_reply(response: &JsonRpcResponse) -> Option<Value> {
    match serde_json::to_value(response) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            None
        }
    }
}

/// A message that failed the shape checks. `reply_to` is `None` when the
/// offending message was a notification and must go unanswered.
struct Rejection {
    reply_to: Option<RequestId>,
    error: RpcError,
}

impl Rejection {
    fn invalid(reason: &str) -> Self {
        Self {
            reply_to: Some(RequestId::Null),
            error: RpcError::InvalidRequest(reason.to_string()),
        }
    }
}

/// Shape checks for a decoded message. The id is read first so every
/// rejection of a request echoes it and rejected notifications stay silent.
/// A missing `jsonrpc` member is tolerated; a wrong one is not.
fn parse_request(message: Value) -> Result<JsonRpcRequest, Rejection> {
    let Value::Object(mut object) = message else {
        return Err(Rejection::invalid("request must be a JSON object"));
    };
    let id = match object.get("id") {
        None => None,
        Some(raw) => Some(
            RequestId::from_value(raw)
                .ok_or_else(|| Rejection::invalid("'id' must be a string, an integer or null"))?,
        ),
    };
    let reject = |error: RpcError| Rejection {
        reply_to: id.clone(),
        error,
    };
    match object.get("jsonrpc") {
        None => {}
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        Some(_) => {
            return Err(reject(RpcError::InvalidRequest(
                "'jsonrpc' must be \"2.0\"".to_string(),
            )));
        }
    }
    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        // Without a method there is no telling a notification apart.
        _ => {
            return Err(Rejection {
                reply_to: Some(id.clone().unwrap_or(RequestId::Null)),
                error: RpcError::InvalidRequest("'method' must be a string".to_string()),
            });
        }
    };
    let params = match object.remove("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(params)) => params,
        Some(other) => {
            return Err(reject(RpcError::InvalidParams(format!(
                "'params' of {} must be an object, got {}",
                method, other
            ))));
        }
    };
    Ok(JsonRpcRequest { id, method, params })
}
