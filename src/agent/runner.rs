use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ToolGateway;
use super::conversation::{Conversation, ToolCall, ToolOutcome, ToolResult};
use super::model::{ModelBackend, ModelError, ModelTurn};
use crate::mcp::ClientError;
use crate::mcp::error::codes;
use crate::tools::ToolSpec;

pub const DEFAULT_MAX_TURNS: usize = 20;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

pub const SYSTEM_PROMPT: &str = "You are a boardgame recommendation assistant. Use tools to access a boardgame database. \
Workflow for game seed: get_games_by_name -> get_game_profile -> extract category/designer IDs -> candidate_by_categories/designers -> score_candidates -> fetch_game_cards. \
Workflow for category/designer: search_categories/designers -> extract IDs -> candidate_by_categories/designers -> score_candidates -> fetch_game_cards. \
Always show game/category/designer names to user, never IDs.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no final answer after {0} turns")]
    TurnLimitExceeded(usize),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("tool server unavailable: {0}")]
    Gateway(#[from] ClientError),
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// One line suitable for the terminal, without protocol payloads.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::TurnLimitExceeded(turns) => {
                format!("Gave up after {} steps without an answer. Try a simpler question.", turns)
            }
            AgentError::Model(ModelError::Timeout(_)) => "The model took too long to answer.".into(),
            AgentError::Model(ModelError::Network(_)) => {
                "Could not reach the model. Is Ollama running?".into()
            }
            AgentError::Model(ModelError::InvalidResponse(_)) => {
                "The model returned a response that could not be understood.".into()
            }
            AgentError::Gateway(_) => "The game database server is not responding.".into(),
            AgentError::Cancelled => "Cancelled.".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_turns: usize,
    pub tool_timeout: Duration,
    pub system_prompt: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub answer: String,
    /// Model invocations, including the one that produced the answer.
    pub turns: usize,
    pub tool_invocations: usize,
    pub conversation: Conversation,
}

pub struct Agent {
    model: Arc<dyn ModelBackend>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(model: Arc<dyn ModelBackend>, options: AgentOptions) -> Self {
        Self { model, options }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Answers one query. Cancellation is honoured while waiting on the
    /// model, while waiting on a tool, and between turns; a tool exchange
    /// only enters the conversation once every call in it has an outcome.
    pub async fn run<G>(
        &self,
        gateway: &mut G,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, AgentError>
    where
        G: ToolGateway + ?Sized,
    {
        let tools = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            tools = gateway.list_tools() => tools?,
        };
        debug!("Agent has {} tools", tools.len());

        let mut conversation = Conversation::new(&self.options.system_prompt);
        conversation.push_user(query);
        let (answer, turns, tool_invocations) =
            self.drive(gateway, &tools, &mut conversation, cancel).await?;
        Ok(AgentOutcome {
            answer,
            turns,
            tool_invocations,
            conversation,
        })
    }

    /// The turn loop. On error `conversation` holds only completed turns.
    async fn drive<G>(
        &self,
        gateway: &mut G,
        tools: &[ToolSpec],
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<(String, usize, usize), AgentError>
    where
        G: ToolGateway + ?Sized,
    {
        let mut tool_invocations = 0;

        for turn in 1..=self.options.max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            info!("Agent turn {}", turn);

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = self.model.complete(conversation, tools) => reply?,
            };

            match reply {
                ModelTurn::Final(answer) => {
                    conversation.push_answer(answer.clone());
                    return Ok((answer, turn, tool_invocations));
                }
                ModelTurn::ToolCalls { content, calls } => {
                    let mut exchange = Vec::with_capacity(calls.len());
                    for call in calls {
                        if cancel.is_cancelled() {
                            return Err(AgentError::Cancelled);
                        }
                        let outcome = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                            outcome = self.invoke(gateway, &call) => outcome,
                        };
                        tool_invocations += 1;
                        let result = ToolResult::new(&call, outcome);
                        exchange.push((call, result));
                    }
                    conversation.push_exchange(content, exchange);
                }
            }
        }

        warn!("Turn limit of {} reached", self.options.max_turns);
        Err(AgentError::TurnLimitExceeded(self.options.max_turns))
    }

    async fn invoke<G>(&self, gateway: &mut G, call: &ToolCall) -> ToolOutcome
    where
        G: ToolGateway + ?Sized,
    {
        info!("Calling tool {}", call.tool_name);
        debug!("Arguments: {}", serde_json::Value::Object(call.arguments.clone()));
        let timeout = self.options.tool_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            gateway.call_tool(&call.tool_name, call.arguments.clone()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ToolOutcome::Failure {
                code: codes::TOOL_TIMEOUT,
                message: format!("tool '{}' timed out", call.tool_name),
                data: Some(json!({
                    "tool": call.tool_name,
                    "timeout_ms": timeout.as_millis() as u64,
                })),
            },
        };
        if let ToolOutcome::Failure { code, message, .. } = &outcome {
            warn!("Tool {} failed ({}): {}", call.tool_name, code, message);
        }
        outcome
    }
}
