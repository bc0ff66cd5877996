//! OpenAI-compatible client wrapper with native tool calling.
//!
//! This is the crate's bundled transport: it speaks the `chat/completions`
//! wire format used by OpenAI and the many providers that mirror it, forwards
//! native [`ToolDefinition`]s, and parses `tool_calls` from the assistant
//! response.  Point it at a different `base_url` to reach any compatible
//! endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use concord::client_wrapper::{ClientWrapper, Message, Role};
//! use concord::clients::openai::OpenAiCompatClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let key = std::env::var("OPEN_AI_SECRET")?;
//!     let client = OpenAiCompatClient::new(&key, "gpt-4.1-mini");
//!     let reply = client
//!         .send_message(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("List three negotiation tactics."),
//!                 tool_calls: vec![],
//!             }],
//!             None,
//!         )
//!         .await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```

use crate::concord::client_wrapper::{
    ClientWrapper, Message, NativeToolCall, Role, TokenUsage, ToolDefinition,
};
use crate::concord::http_client_pool::get_shared_http_client;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client wrapper for any endpoint exposing the OpenAI `chat/completions` surface.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    model: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl OpenAiCompatClient {
    /// Create a client against the default OpenAI base URL.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Create a client against a custom OpenAI-compatible base URL.
    ///
    /// Trailing slashes on `base_url` are tolerated.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            usage: Mutex::new(None),
        }
    }
}

/// Serialise messages to the OpenAI wire format.
///
/// | Message | Wire form |
/// |---|---|
/// | `System` | `{"role":"system","content":"..."}` |
/// | `User` | `{"role":"user","content":"..."}` |
/// | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
/// | `Assistant` without tool_calls | `{"role":"assistant","content":"..."}` |
/// | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| match &msg.role {
            Role::System => serde_json::json!({
                "role": "system",
                "content": msg.content.as_ref()
            }),
            Role::User => serde_json::json!({
                "role": "user",
                "content": msg.content.as_ref()
            }),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": msg.content.as_ref()
                    })
                } else {
                    let tool_calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_else(|_| "{}".to_string())
                                }
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": serde_json::Value::Null,
                        "tool_calls": tool_calls
                    })
                }
            }
            Role::Tool { call_id } => serde_json::json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": msg.content.as_ref()
            }),
        })
        .collect()
}

/// Serialise native tool definitions to the OpenAI `tools` array.
fn wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema
                }
            })
        })
        .collect()
}

#[async_trait]
impl ClientWrapper for OpenAiCompatClient {
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages(messages),
        });
        if let Some(defs) = &tools {
            if !defs.is_empty() {
                body["tools"] = serde_json::Value::Array(wire_tools(defs));
            }
        }

        let url = format!("{}/chat/completions", self.base_url);

        let resp = get_shared_http_client()
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAiCompatClient::send_message(...): HTTP {} from {}: {}",
                    status,
                    url,
                    text
                );
            }
            return Err(format!("OpenAiCompatClient: HTTP {} — {}", status, text).into());
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)?;

        // Store token usage
        if let Some(usage_obj) = parsed.get("usage") {
            let input = usage_obj
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let output = usage_obj
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            *self.usage.lock().await = Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            });
        }

        // Extract message from choices[0].message
        let choice_msg = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| -> Box<dyn Error + Send + Sync> {
                "OpenAiCompatClient: no choices in response".into()
            })?;

        let content: Arc<str> = choice_msg
            .get("content")
            .and_then(|c| c.as_str())
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(""));

        // Parse native tool calls if present
        let tool_calls: Vec<NativeToolCall> = choice_msg
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc.get("id")?.as_str()?.to_string();
                        let func = tc.get("function")?;
                        let name = func.get("name")?.as_str()?.to_string();
                        let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
                        let arguments: serde_json::Value = serde_json::from_str(args_str)
                            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                        Some(NativeToolCall {
                            id,
                            name,
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Message {
            role: Role::Assistant,
            content,
            tool_calls,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_roles() {
        let msgs = vec![
            Message::text(Role::System, "be brief"),
            Message::text(Role::User, "hello"),
            Message::text(
                Role::Tool {
                    call_id: "call_1".to_string(),
                },
                "result",
            ),
        ];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_wire_assistant_tool_calls() {
        let msg = Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: "call_9".to_string(),
                name: "ask_agent".to_string(),
                arguments: serde_json::json!({"agent_id": "a", "question": "q"}),
            }],
        };
        let wire = wire_messages(&[msg]);
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "ask_agent");
    }

    #[test]
    fn test_wire_tools_shape() {
        let defs = vec![ToolDefinition {
            name: "reject".to_string(),
            description: "No viable plan.".to_string(),
            parameters_schema: serde_json::json!({"type": "object"}),
        }];
        let wire = wire_tools(&defs);
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["name"], "reject");
    }
}
