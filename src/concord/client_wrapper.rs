//! Shared primitives for provider-agnostic LLM clients.
//!
//! The negotiation engine never talks to a vendor SDK directly: every skill
//! invocation goes through the [`ClientWrapper`] trait and the lightweight data
//! types defined in this module.  The trait abstracts over concrete provider
//! implementations while the supporting structs describe chat messages, native
//! tool calls, and token accounting.
//!
//! # Basic request/response
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
//!
//!     let response = client
//!         .send_message(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("Who are you?"),
//!                 tool_calls: vec![],
//!             }],
//!             None,
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", response.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A single tool call returned by the LLM in a native function-calling response.
///
/// Providers assign an opaque [`id`](NativeToolCall::id) to each call so that the
/// tool result can be correlated back in a follow-up `Role::Tool` message.
///
/// # Example
///
/// ```rust
/// use concord::client_wrapper::NativeToolCall;
///
/// let tc = NativeToolCall {
///     id: "call_abc123".to_string(),
///     name: "output_plan".to_string(),
///     arguments: serde_json::json!({"plan_text": "Book the venue first."}),
/// };
/// assert_eq!(tc.name, "output_plan");
/// ```
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    /// Provider-assigned call ID, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
///
/// The center's tool handlers each describe themselves as a `ToolDefinition`
/// (see [`ToolHandler::definition`](crate::concord::tool_handler::ToolHandler::definition));
/// the definitions are serialised as an OpenAI-compatible `tools` array entry
/// before transmission.
///
/// # Example
///
/// ```rust
/// use concord::client_wrapper::ToolDefinition;
///
/// let def = ToolDefinition {
///     name: "output_gap".to_string(),
///     description: "Declare an unfilled requirement.".to_string(),
///     parameters_schema: serde_json::json!({
///         "type": "object",
///         "properties": {
///             "description": {"type": "string"}
///         },
///         "required": ["description"]
///     }),
/// };
/// assert_eq!(def.name, "output_gap");
/// ```
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Represents the possible roles for a message.
#[derive(Debug, Clone)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (frequently a mirror of a human end-user request).
    User,
    /// An assistant authored message (model responses or developer supplied exemplars).
    Assistant,
    /// A tool-result message correlating with a prior assistant [`NativeToolCall`].
    ///
    /// Serialises as `{"role": "tool", "tool_call_id": "<call_id>", "content": "..."}`
    /// in the OpenAI wire format.
    Tool { call_id: String },
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Represents a generic message to be sent to an LLM.
///
/// The `tool_calls` field is populated by [`ClientWrapper::send_message`] when the
/// provider returns native function-calling results.  It defaults to an empty
/// `Vec` for all other message kinds.
#[derive(Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.  Stored as `Arc<str>` so that skill transcripts can be
    /// cheaply cloned by the engine and downstream components.
    pub content: Arc<str>,
    /// Native tool calls requested by the assistant.  Non-empty only on assistant
    /// messages returned by [`ClientWrapper::send_message`] when the provider
    /// responds with function-calling results.
    pub tool_calls: Vec<NativeToolCall>,
}

impl Message {
    /// Convenience constructor for a plain text message with no tool calls.
    pub fn text(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }
}

/// Trait-driven abstraction for a concrete completion provider.
///
/// A [`ClientWrapper`] instance is responsible for translating engine requests
/// into the provider specific wire format and for returning provider responses
/// in a uniform shape.  The abstraction deliberately excludes any conversation
/// bookkeeping: skills assemble their full message list on every invocation.
///
/// All implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between the per-session driver tasks.  Where a provider exposes token
/// accounting information, wrappers should capture it and make it visible via
/// [`ClientWrapper::get_last_usage`].
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// The `messages` slice must include any system priming messages the caller
    /// wishes to send.  The `tools` parameter carries native [`ToolDefinition`]s
    /// that are forwarded to the provider's function-calling API; when `None` or
    /// empty, implementations fall through to the standard completions path.
    ///
    /// On success the returned [`Message`] may contain non-empty
    /// [`Message::tool_calls`] when the provider selected one or more tools.
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>>;

    /// Return the identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;

    /// Hook to retrieve usage from the most recent [`ClientWrapper::send_message`] call.
    ///
    /// Wrappers that propagate token accounting should override
    /// [`ClientWrapper::usage_slot`].
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    /// Expose a shared mutable slot where the implementation can persist token usage.
    ///
    /// By default wrappers report no usage data.  Providers that expose billing
    /// information should return `Some(&Mutex<Option<TokenUsage>>)` so that
    /// [`ClientWrapper::get_last_usage`] can surface the recorded values to callers.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}
