//! OpenAI-compatible chat completions backend (Ollama's `/v1` endpoint).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::conversation::{Conversation, ToolCall, Turn};
use super::model::{ModelBackend, ModelError, ModelTurn};
use crate::tools::ToolSpec;

#[derive(Clone)]
pub struct OllamaBackend {
    http: Client,
    endpoint: Url,
    model: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(endpoint: Url, model: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            model: model.into(),
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    temperature: f64,
    tools: Vec<Value>,
    tool_choice: &'static str,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, ModelError> {
        let payload = ChatRequest {
            model: &self.model,
            messages: to_messages(conversation),
            temperature: 0.0,
            tools: to_openai_tools(tools),
            tool_choice: "auto",
            stream: false,
        };

        info!(
            model = self.model.as_str(),
            messages = conversation.len(),
            "Sending chat request"
        );

        let response: ChatResponse = self
            .http
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.classify(e))?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| self.classify(e))?;

        let message = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .ok_or_else(|| ModelError::InvalidResponse("missing choices[0].message".into()))?;
        debug!("Model message: {:?}", message);
        decode_message(message, conversation.len())
    }
}

impl OllamaBackend {
    fn classify(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout(self.timeout)
        } else {
            ModelError::Network(err)
        }
    }
}

fn to_openai_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema.to_json(),
                }
            })
        })
        .collect()
}

fn to_messages(conversation: &Conversation) -> Vec<Value> {
    conversation
        .turns()
        .iter()
        .map(|turn| match turn {
            Turn::System(text) | Turn::User(text) => {
                json!({ "role": turn.role().as_str(), "content": text })
            }
            Turn::Assistant {
                content,
                tool_calls,
            } => {
                let mut message = json!({
                    "role": "assistant",
                    "content": content.clone().unwrap_or_default(),
                });
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.call_id,
                                "type": "function",
                                "function": {
                                    "name": call.tool_name,
                                    "arguments": Value::Object(call.arguments.clone()).to_string(),
                                }
                            })
                        })
                        .collect();
                    message["tool_calls"] = Value::Array(calls);
                }
                message
            }
            Turn::Tool(result) => json!({
                "role": "tool",
                "tool_call_id": result.call_id,
                "name": result.tool_name,
                "content": result.render(),
            }),
        })
        .collect()
}

/// Call ids are synthesised from the conversation position when the model
/// omits them, which keeps them unique within one query.
fn decode_message(message: ResponseMessage, position: usize) -> Result<ModelTurn, ModelError> {
    let content = message.content.filter(|text| !text.trim().is_empty());
    let wire_calls = message.tool_calls.unwrap_or_default();

    if wire_calls.is_empty() {
        return content
            .map(ModelTurn::Final)
            .ok_or_else(|| ModelError::InvalidResponse("neither content nor tool calls".into()));
    }

    let calls = wire_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| ToolCall {
            call_id: call
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}_{}", position, index)),
            arguments: decode_arguments(&call.function.name, call.function.arguments),
            tool_name: call.function.name,
        })
        .collect();
    Ok(ModelTurn::ToolCalls { content, calls })
}

fn decode_arguments(tool: &str, raw: Option<Value>) -> Map<String, Value> {
    match raw {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(Value::String(text)) if text.trim().is_empty() => Map::new(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("Unparsable arguments for {}: {}", tool, text);
                Map::new()
            }
        },
        Some(other) => {
            warn!("Unexpected arguments for {}: {}", tool, other);
            Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::conversation::{ToolOutcome, ToolResult};
    use crate::tools::{InputSchema, ParamType};

    fn message(value: Value) -> ResponseMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_tools_use_function_format() {
        let tools = vec![ToolSpec {
            name: "find_games".into(),
            description: "Find games".into(),
            input_schema: InputSchema::new().required("min_players", ParamType::Integer, "players"),
        }];
        let converted = to_openai_tools(&tools);
        assert_eq!(converted[0]["type"], "function");
        assert_eq!(converted[0]["function"]["name"], "find_games");
        assert_eq!(converted[0]["function"]["parameters"]["type"], "object");
        assert_eq!(
            converted[0]["function"]["parameters"]["required"],
            json!(["min_players"])
        );
    }

    #[test]
    fn test_decode_final_answer() {
        let turn = decode_message(message(json!({"content": "Try Ra."})), 3).unwrap();
        assert_eq!(turn, ModelTurn::Final("Try Ra.".into()));

        let err = decode_message(message(json!({"content": "  ", "tool_calls": null})), 3);
        assert!(matches!(err, Err(ModelError::InvalidResponse(_))));
    }

    #[test]
    fn test_decode_tool_calls_with_string_and_object_arguments() {
        let turn = decode_message(
            message(json!({
                "content": "",
                "tool_calls": [
                    {"id": "abc", "function": {"name": "get_game_profile", "arguments": "{\"g_id\": 3}"}},
                    {"function": {"name": "search_categories", "arguments": {"query": "coop"}}},
                    {"function": {"name": "find_games", "arguments": "{not json"}}
                ]
            })),
            4,
        )
        .unwrap();

        let ModelTurn::ToolCalls { content, calls } = turn else {
            panic!("expected tool calls");
        };
        assert_eq!(content, None);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].call_id, "abc");
        assert_eq!(calls[0].arguments["g_id"], 3);
        assert_eq!(calls[1].call_id, "call_4_1");
        assert_eq!(calls[1].arguments["query"], "coop");
        assert!(calls[2].arguments.is_empty());
    }

    #[test]
    fn test_messages_carry_tool_call_ids() {
        let mut conversation = Conversation::new("system");
        conversation.push_user("hi");
        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "find_games".into(),
            arguments: json!({"min_players": 2}).as_object().cloned().unwrap(),
        };
        let result = ToolResult::new(&call, ToolOutcome::Success(json!([1, 2])));
        conversation.push_exchange(None, vec![(call, result)]);

        let messages = to_messages(&conversation);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "c1");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"min_players":2}"#
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(messages[3]["content"], "[1,2]");
    }
}
