//! Tool dispatch for the center loop.
//!
//! The center model acts by emitting tool calls; this module routes each call
//! to a [`ToolHandler`] by name and records the structured [`ToolResult`].
//! Handlers come in two classes: *terminating* handlers (`output_plan`,
//! `reject`) end the session, everything else keeps the loop going.
//!
//! An unknown tool name is a protocol error, not a crash: dispatch records a
//! failure result and the loop continues — repeated protocol errors simply
//! burn through the round cap.
//!
//! # Architecture
//!
//! ```text
//! Center model → tool calls → ToolHandlerRegistry → ToolHandler
//!                                  (name routing)      ├─ output_plan†
//!                                                      ├─ ask_agent
//!                                                      ├─ start_discovery
//!                                                      ├─ output_gap
//!                                                      └─ reject†
//! † terminating
//! ```

use crate::concord::client_wrapper::ToolDefinition;
use crate::concord::profile::AgentProfile;
use crate::concord::skill::{InquiryContext, InquirySkill, SkillRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A tool call as produced by the center model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Tool name to execute (must exist in the registry).
    pub name: String,
    /// JSON arguments for the handler.
    pub arguments: serde_json::Value,
}

/// Represents the result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool execution was successful.
    pub success: bool,
    /// The output data from the tool.
    pub output: serde_json::Value,
    /// Optional error message if execution failed.
    pub error: Option<String>,
    /// Metadata about the execution (timing, protocol flags, etc.).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    /// Convenience constructor for successful tool execution.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Convenience constructor for failed tool execution.
    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error),
            metadata: HashMap::new(),
        }
    }

    /// Attach application specific metadata to the result.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Error types for tool operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not registered.
    NotFound(String),
    /// The provided JSON arguments failed validation.
    InvalidArguments(String),
    /// Tool execution completed with an application level failure.
    ExecutionFailed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Result of a completed sub-negotiation, delivered back to the parent center
/// as the `start_discovery` tool result.
#[derive(Debug, Clone)]
pub struct SubNegotiationOutcome {
    pub child_session_id: String,
    pub plan_text: String,
}

/// Seam through which `start_discovery` spawns a child session.
///
/// Implemented by the engine; injected into handlers via [`ToolContext`] so
/// the registry stays free of engine internals.
#[async_trait]
pub trait SubNegotiator: Send + Sync {
    async fn negotiate(
        &self,
        parent_session_id: &str,
        topic: &str,
        participant_ids: &[String],
        depth: usize,
    ) -> Result<SubNegotiationOutcome, Box<dyn Error + Send + Sync>>;
}

/// Everything a handler may touch, assembled per dispatch by the engine.
///
/// Handlers see the session's confirmed demand and its participants, never
/// the engine's mutable state.
pub struct ToolContext<'a> {
    pub session_id: &'a str,
    pub demand: &'a str,
    /// Profiles of the selected agents (the session's participants).
    pub participants: &'a [AgentProfile],
    /// Recursion depth of the session whose center is dispatching.
    pub recursion_depth: usize,
    pub max_recursion_depth: usize,
    pub skills: &'a SkillRunner,
    pub sub_negotiator: &'a dyn SubNegotiator,
}

impl<'a> ToolContext<'a> {
    fn participant(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.participants.iter().find(|p| p.agent_id == agent_id)
    }
}

/// Name-keyed dispatch target for center tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The name the model must use to invoke this handler.
    fn tool_name(&self) -> &str;

    /// Terminating handlers end the session when dispatched successfully.
    fn terminating(&self) -> bool {
        false
    }

    /// The schema advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute the call.  Argument validation failures should surface as
    /// [`ToolError::InvalidArguments`].
    async fn handle(
        &self,
        ctx: &ToolContext<'_>,
        args: &serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;
}

/// Registry for the handlers available to a center loop.
pub struct ToolHandlerRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    order: Vec<String>,
}

impl ToolHandlerRegistry {
    /// An empty registry.  Most callers want [`ToolHandlerRegistry::default`],
    /// which carries the five built-in negotiation tools.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a handler, replacing any existing handler of the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.tool_name().to_string();
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(name)
    }

    /// Whether a successful dispatch of `name` ends the session.  Unknown
    /// names are never terminating.
    pub fn is_terminating(&self, name: &str) -> bool {
        self.handlers
            .get(name)
            .map(|h| h.terminating())
            .unwrap_or(false)
    }

    /// All advertised tool definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|h| h.definition())
            .collect()
    }

    /// Only the terminating tools — the forced terminal round's tool set.
    pub fn terminal_definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .filter(|h| h.terminating())
            .map(|h| h.definition())
            .collect()
    }

    /// Route one call to its handler.
    ///
    /// Unknown tools and handler errors both come back as failure results
    /// (with a `protocol_error` marker for the unknown-name case) so the
    /// center loop can record them and continue.
    pub async fn dispatch(&self, ctx: &ToolContext<'_>, call: &ToolCallRequest) -> ToolResult {
        match self.handlers.get(&call.name) {
            None => ToolResult::failure(ToolError::NotFound(call.name.clone()).to_string())
                .with_metadata("protocol_error", serde_json::Value::Bool(true)),
            Some(handler) => match handler.handle(ctx, &call.arguments).await {
                Ok(result) => result,
                Err(e) => ToolResult::failure(e.to_string()),
            },
        }
    }
}

impl Default for ToolHandlerRegistry {
    /// The standard negotiation tool set.
    fn default() -> Self {
        Self::empty()
            .with_handler(Arc::new(OutputPlanHandler))
            .with_handler(Arc::new(AskAgentHandler))
            .with_handler(Arc::new(StartDiscoveryHandler))
            .with_handler(Arc::new(OutputGapHandler))
            .with_handler(Arc::new(RejectHandler))
    }
}

fn required_str<'v>(
    args: &'v serde_json::Value,
    field: &str,
) -> Result<&'v str, Box<dyn Error + Send + Sync>> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Box::new(ToolError::InvalidArguments(format!(
                "missing required string field '{}'",
                field
            ))) as _
        })
}

// ── Built-in handlers ────────────────────────────────────────────────────

/// Terminal: emit the final plan.  `plan_text` is required, the structured
/// `plan_json` is optional and additive.
pub struct OutputPlanHandler;

#[async_trait]
impl ToolHandler for OutputPlanHandler {
    fn tool_name(&self) -> &str {
        "output_plan"
    }

    fn terminating(&self) -> bool {
        true
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "output_plan".to_string(),
            description: "Emit the final plan for the confirmed demand. Required when the \
                          collected offers cover the demand."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "plan_text": {
                        "type": "string",
                        "description": "Human-readable plan summary."
                    },
                    "plan_json": {
                        "type": "object",
                        "description": "Optional structured plan: summary, participants, tasks with prerequisites, topology edges."
                    }
                },
                "required": ["plan_text"]
            }),
        }
    }

    async fn handle(
        &self,
        _ctx: &ToolContext<'_>,
        args: &serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let plan_text = required_str(args, "plan_text")?;
        let mut output = serde_json::json!({ "plan_text": plan_text });
        if let Some(plan_json) = args.get("plan_json") {
            if !plan_json.is_null() {
                output["plan_json"] = plan_json.clone();
            }
        }
        Ok(ToolResult::success(output))
    }
}

/// Terminal: declare that no viable plan exists.
pub struct RejectHandler;

#[async_trait]
impl ToolHandler for RejectHandler {
    fn tool_name(&self) -> &str {
        "reject"
    }

    fn terminating(&self) -> bool {
        true
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "reject".to_string(),
            description: "Declare that no viable plan can be produced from the collected \
                          offers. Use only when the demand cannot be met."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"}
                },
                "required": ["reason"]
            }),
        }
    }

    async fn handle(
        &self,
        _ctx: &ToolContext<'_>,
        args: &serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let reason = required_str(args, "reason")?;
        Ok(ToolResult::success(serde_json::json!({ "reason": reason })))
    }
}

/// Request additional information from one participant.
pub struct AskAgentHandler;

#[async_trait]
impl ToolHandler for AskAgentHandler {
    fn tool_name(&self) -> &str {
        "ask_agent"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "ask_agent".to_string(),
            description: "Ask one participating agent a follow-up question about its offer."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "question": {"type": "string"}
                },
                "required": ["agent_id", "question"]
            }),
        }
    }

    async fn handle(
        &self,
        ctx: &ToolContext<'_>,
        args: &serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let agent_id = required_str(args, "agent_id")?;
        let question = required_str(args, "question")?;
        let profile = ctx.participant(agent_id).ok_or_else(|| {
            Box::new(ToolError::InvalidArguments(format!(
                "'{}' is not a participant of this session",
                agent_id
            ))) as Box<dyn Error + Send + Sync>
        })?;

        let answer = ctx
            .skills
            .run(
                &InquirySkill,
                &InquiryContext {
                    demand: ctx.demand.to_string(),
                    profile: profile.clone(),
                    question: question.to_string(),
                },
            )
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)?;

        Ok(ToolResult::success(serde_json::json!({
            "agent_id": agent_id,
            "answer": answer,
        })))
    }
}

/// Declare an unfilled requirement; typically precedes `start_discovery`.
pub struct OutputGapHandler;

#[async_trait]
impl ToolHandler for OutputGapHandler {
    fn tool_name(&self) -> &str {
        "output_gap"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "output_gap".to_string(),
            description: "Record a requirement of the demand that no current offer covers."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"}
                },
                "required": ["description"]
            }),
        }
    }

    async fn handle(
        &self,
        _ctx: &ToolContext<'_>,
        args: &serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let description = required_str(args, "description")?;
        Ok(ToolResult::success(serde_json::json!({
            "acknowledged": true,
            "description": description,
        })))
    }
}

/// Delegate a sub-negotiation over a narrower topic to a subset of participants.
pub struct StartDiscoveryHandler;

#[async_trait]
impl ToolHandler for StartDiscoveryHandler {
    fn tool_name(&self) -> &str {
        "start_discovery"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "start_discovery".to_string(),
            description: "Spawn a focused sub-negotiation on a topic with a subset of the \
                          participants; their resulting plan summary is returned to you."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string"},
                    "participant_ids": {
                        "type": "array",
                        "items": {"type": "string"}
                    }
                },
                "required": ["topic", "participant_ids"]
            }),
        }
    }

    async fn handle(
        &self,
        ctx: &ToolContext<'_>,
        args: &serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let topic = required_str(args, "topic")?;
        let participant_ids: Vec<String> = args
            .get("participant_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| item.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        if participant_ids.is_empty() {
            return Err(Box::new(ToolError::InvalidArguments(
                "participant_ids must name at least one agent".to_string(),
            )));
        }

        if ctx.recursion_depth >= ctx.max_recursion_depth {
            return Ok(ToolResult::failure(format!(
                "recursion depth limit ({}) reached; resolve the gap in this session",
                ctx.max_recursion_depth
            ))
            .with_metadata("depth_limited", serde_json::Value::Bool(true)));
        }

        let outcome = ctx
            .sub_negotiator
            .negotiate(
                ctx.session_id,
                topic,
                &participant_ids,
                ctx.recursion_depth + 1,
            )
            .await?;

        Ok(ToolResult::success(serde_json::json!({
            "child_session_id": outcome.child_session_id,
            "plan_summary": outcome.plan_text,
        })))
    }
}
