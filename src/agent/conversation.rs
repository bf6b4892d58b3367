use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl ToolOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ToolOutcome::Failure { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn new(call: &ToolCall, outcome: ToolOutcome) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome,
        }
    }

    /// Text handed back to the model. Failures keep their code so the model
    /// can tell an unknown tool from bad arguments.
    pub fn render(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success(value) => value.to_string(),
            ToolOutcome::Failure {
                code,
                message,
                data,
            } => {
                let mut error = json!({ "code": code, "message": message });
                if let Some(data) = data {
                    error["data"] = data.clone();
                }
                json!({ "error": error }).to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool(ToolResult),
}

impl Turn {
    pub fn role(&self) -> Role {
        match self {
            Turn::System(_) => Role::System,
            Turn::User(_) => Role::User,
            Turn::Assistant { .. } => Role::Assistant,
            Turn::Tool(_) => Role::Tool,
        }
    }
}

/// Ordered message history for one query.
///
/// Tool calls only enter the history together with their results, so every
/// call the model sees has exactly one outcome right after it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system_prompt: &str) -> Self {
        let mut conversation = Self::default();
        if !system_prompt.is_empty() {
            conversation.turns.push(Turn::System(system_prompt.to_string()));
        }
        conversation
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::User(text.into()));
    }

    pub fn push_answer(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::Assistant {
            content: Some(text.into()),
            tool_calls: Vec::new(),
        });
    }

    /// Appends an assistant turn and the results of all of its calls.
    pub fn push_exchange(&mut self, content: Option<String>, exchange: Vec<(ToolCall, ToolResult)>) {
        let (calls, results): (Vec<_>, Vec<_>) = exchange.into_iter().unzip();
        self.turns.push(Turn::Assistant {
            content,
            tool_calls: calls,
        });
        self.turns.extend(results.into_iter().map(Turn::Tool));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.turns.iter().filter_map(|turn| match turn {
            Turn::Tool(result) => Some(result),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: Map::new(),
        }
    }

    #[test]
    fn test_exchange_keeps_calls_and_results_adjacent() {
        let mut conversation = Conversation::new("be helpful");
        conversation.push_user("games like Risk");
        let a = call("a", "get_games_by_name");
        let b = call("b", "ghost");
        conversation.push_exchange(
            None,
            vec![
                (a.clone(), ToolResult::new(&a, ToolOutcome::Success(json!([])))),
                (
                    b.clone(),
                    ToolResult::new(
                        &b,
                        ToolOutcome::Failure {
                            code: -32601,
                            message: "unknown tool".into(),
                            data: None,
                        },
                    ),
                ),
            ],
        );

        let roles: Vec<Role> = conversation.turns().iter().map(Turn::role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Tool]
        );
        let ids: Vec<&str> = conversation.tool_results().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_render_failure_includes_code_and_data() {
        let c = call("x", "ghost");
        let result = ToolResult::new(
            &c,
            ToolOutcome::Failure {
                code: -32601,
                message: "Unknown tool: ghost".into(),
                data: Some(json!({"tool": "ghost"})),
            },
        );
        let rendered: Value = serde_json::from_str(&result.render()).unwrap();
        assert_eq!(rendered["error"]["code"], -32601);
        assert_eq!(rendered["error"]["data"]["tool"], "ghost");

        let ok = ToolResult::new(&c, ToolOutcome::Success(json!({"g_id": 1})));
        assert_eq!(ok.render(), r#"{"g_id":1}"#);
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        let conversation = Conversation::new("");
        assert!(conversation.is_empty());
    }
}
