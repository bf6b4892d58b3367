use super::error::RpcError;
use super::{Implementation, InitializeParams, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS, methods};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Ready,
    Closed,
}

/// Per-connection protocol state. Only the handshake and shutdown move it.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    protocol_version: Option<String>,
    client_info: Option<Implementation>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingHandshake,
            protocol_version: None,
            client_info: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn client_info(&self) -> Option<&Implementation> {
        self.client_info.as_ref()
    }

    pub fn negotiate(requested: &str) -> &'static str {
        SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .copied()
            .find(|v| *v == requested)
            .unwrap_or(LATEST_PROTOCOL_VERSION)
    }

    /// Gate applied before dispatch.
    pub fn admit(&self, method: &str) -> Result<(), RpcError> {
        match self.state {
            SessionState::Closed => Err(RpcError::InvalidRequest(
                "session is shutting down".to_string(),
            )),
            SessionState::AwaitingHandshake
                if method != methods::INITIALIZE && method != methods::PING =>
            {
                Err(RpcError::Uninitialized(method.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// `AwaitingHandshake -> Ready`. Returns the negotiated version.
    pub fn complete_handshake(&mut self, params: InitializeParams) -> Result<&'static str, RpcError> {
        if self.state != SessionState::AwaitingHandshake {
            return Err(RpcError::InvalidRequest(
                "session already initialized".to_string(),
            ));
        }
        let version = Self::negotiate(&params.protocol_version);
        if version != params.protocol_version {
            debug!(
                "Client requested protocol {}, answering with {}",
                params.protocol_version, version
            );
        }
        info!(
            "Session initialized for {} {} (protocol {})",
            params.client_info.name, params.client_info.version, version
        );
        self.state = SessionState::Ready;
        self.protocol_version = Some(version.to_string());
        debug!("Client capabilities: {}", params.capabilities);
        self.client_info = Some(params.client_info);
        Ok(version)
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
