use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::conversation::{Conversation, ToolCall};
use crate::tools::ToolSpec;

/// One decoded model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
    Final(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model did not answer within {0:?}")]
    Timeout(Duration),
    #[error("model returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// A chat model that can either answer or ask for tools.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, ModelError>;
}

#[cfg(test)]
pub(crate) use scripted::ScriptedModel;

#[cfg(test)]
mod scripted {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed script. Once exhausted the last step repeats.
    pub(crate) struct ScriptedModel {
        script: Mutex<Vec<Result<ModelTurn, String>>>,
        delay: Option<Duration>,
        seen: Mutex<Vec<Conversation>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(script: Vec<Result<ModelTurn, String>>) -> Self {
            Self {
                script: Mutex::new(script),
                delay: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn seen(&self) -> Vec<Conversation> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedModel {
        async fn complete(
            &self,
            conversation: &Conversation,
            _tools: &[ToolSpec],
        ) -> Result<ModelTurn, ModelError> {
            self.seen.lock().unwrap().push(conversation.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let step = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script
                        .first()
                        .cloned()
                        .unwrap_or_else(|| Err("script is empty".into()))
                }
            };
            step.map_err(ModelError::InvalidResponse)
        }
    }
}
