//! Skills: named, typed LLM invocations with validated output.
//!
//! A skill is the unit of model interaction in a negotiation.  Each skill
//! pairs a prompt constructor (typed context → chat request) with an output
//! validator (model response → typed result), and the [`SkillRunner`] executes
//! it under a deadline with a bounded retry budget that applies to
//! *validation* failures only — model and transport errors always propagate.
//!
//! Four skills drive the engine:
//!
//! - [`FormulationSkill`] — raw intent → structured demand text.
//! - [`OfferSkill`] — confirmed demand + one agent's own profile → that
//!   agent's proposal.  The prompt is built from that profile alone; peer
//!   names are only consulted by the validator, never rendered.
//! - [`CenterSkill`] — demand + offer views + prior round reasoning → a list
//!   of tool calls.
//! - [`InquirySkill`] — a follow-up question to one participant, used by the
//!   `ask_agent` tool.

use crate::concord::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use crate::concord::profile::AgentProfile;
use crate::concord::tool_handler::ToolCallRequest;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a skill invocation failed.
#[derive(Debug, Clone)]
pub enum SkillError {
    /// The model or transport errored; never retried by the runner.
    Client(String),
    /// The invocation exceeded the configured deadline.
    Timeout(Duration),
    /// The output never validated within the retry budget.
    Validation(String),
}

impl fmt::Display for SkillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillError::Client(msg) => write!(f, "Skill client error: {}", msg),
            SkillError::Timeout(d) => write!(f, "Skill timed out after {:?}", d),
            SkillError::Validation(msg) => write!(f, "Skill output invalid: {}", msg),
        }
    }
}

impl Error for SkillError {}

/// A fully rendered model request: priming messages plus optional native tools.
pub struct SkillRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
}

impl SkillRequest {
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Verdict of a skill's output validator.
pub enum Validation<T> {
    /// The output parsed into the typed result.
    Valid(T),
    /// The output was malformed in a way a re-prompt may fix.
    Retry(String),
    /// The output is unusable and retrying is pointless.
    Reject(String),
}

/// A named, typed LLM invocation.
///
/// `build_request` and `validate` are synchronous and pure: all model I/O
/// happens in the [`SkillRunner`], which keeps skills trivially testable.
pub trait Skill: Send + Sync {
    type Context: Send + Sync;
    type Output: Send + Sync;

    /// Stable skill identifier (`"formulation"`, `"offer"`, `"center"`, ...).
    fn name(&self) -> &str;

    /// Render the typed context into a model request.
    fn build_request(&self, ctx: &Self::Context) -> SkillRequest;

    /// Parse the model response back into the typed result.
    fn validate(&self, response: &Message, ctx: &Self::Context) -> Validation<Self::Output>;
}

/// Executes skills against a [`ClientWrapper`] with a deadline and a bounded
/// validation-retry budget.
///
/// On a `Retry` verdict the runner appends the rejected assistant response and
/// a corrective user message to the request, then re-sends — the model sees
/// what it got wrong.  On `Reject`, or when the budget is exhausted, the
/// invocation fails with [`SkillError::Validation`].
#[derive(Clone)]
pub struct SkillRunner {
    llm: Arc<dyn ClientWrapper>,
    timeout: Duration,
    max_validation_retries: usize,
}

impl SkillRunner {
    pub fn new(llm: Arc<dyn ClientWrapper>, timeout: Duration, max_validation_retries: usize) -> Self {
        Self {
            llm,
            timeout,
            max_validation_retries,
        }
    }

    /// The model identifier of the underlying client.
    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Execute one skill invocation to a validated, typed result.
    pub async fn run<S: Skill + ?Sized>(
        &self,
        skill: &S,
        ctx: &S::Context,
    ) -> Result<S::Output, SkillError> {
        let mut request = skill.build_request(ctx);
        let mut retries = 0;
        loop {
            let send = self.llm.send_message(&request.messages, request.tools.clone());
            let response = match tokio::time::timeout(self.timeout, send).await {
                Err(_) => return Err(SkillError::Timeout(self.timeout)),
                Ok(Err(e)) => return Err(SkillError::Client(e.to_string())),
                Ok(Ok(response)) => response,
            };

            match skill.validate(&response, ctx) {
                Validation::Valid(output) => return Ok(output),
                Validation::Reject(reason) => return Err(SkillError::Validation(reason)),
                Validation::Retry(reason) => {
                    if retries >= self.max_validation_retries {
                        return Err(SkillError::Validation(reason));
                    }
                    retries += 1;
                    log::debug!(
                        "skill '{}': retrying after validation failure: {}",
                        skill.name(),
                        reason
                    );
                    request.messages.push(response);
                    request.messages.push(Message::text(
                        Role::User,
                        format!(
                            "Your previous response was not usable: {}. \
                             Respond again, following the required format exactly.",
                            reason
                        ),
                    ));
                }
            }
        }
    }
}

/// Scan `text` for the first balanced JSON object and parse it.
///
/// Returns `None` when no parseable object is found.  Used by validators whose
/// skills are instructed to answer with a JSON object but may wrap it in prose.
pub(crate) fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a `{"tool_call": {"name": ..., "parameters": ...}}` fragment from a
/// plain-text response.
///
/// The fallback path for providers without native function calling; the
/// center prefers [`Message::tool_calls`] when present.
pub(crate) fn parse_tool_call_text(response: &str) -> Option<ToolCallRequest> {
    let marker_at = response.find("{\"tool_call\"")?;
    let parsed = extract_json_object(&response[marker_at..])?;
    let tool_call = parsed.get("tool_call")?;
    let name = tool_call.get("name")?.as_str()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let arguments = tool_call
        .get("parameters")
        .or_else(|| tool_call.get("arguments"))?
        .clone();
    Some(ToolCallRequest { name, arguments })
}

fn string_array(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

// ── Formulation ──────────────────────────────────────────────────────────

/// Input to [`FormulationSkill`].
pub struct FormulationContext {
    /// The user's raw intent, verbatim.
    pub raw_intent: String,
    /// Optional user-profile hints injected by the caller.
    pub profile_hints: Option<String>,
}

/// Output of [`FormulationSkill`].
#[derive(Debug)]
pub struct FormulatedDemand {
    pub formulated_text: String,
    pub enrichments: Vec<String>,
}

/// Turns a raw intent into a structured demand.
pub struct FormulationSkill;

impl Skill for FormulationSkill {
    type Context = FormulationContext;
    type Output = FormulatedDemand;

    fn name(&self) -> &str {
        "formulation"
    }

    fn build_request(&self, ctx: &Self::Context) -> SkillRequest {
        let system = "You turn a raw user intent into a clear, structured demand for a \
                      multi-agent negotiation. Preserve the user's meaning; make goals, \
                      constraints and success criteria explicit. Never invent participants \
                      or make commitments on the user's behalf.\n\
                      Respond with a JSON object:\n\
                      {\"formulated_text\": \"...\", \"enrichments\": [\"...\"]}";
        let mut user = format!("Raw intent:\n{}", ctx.raw_intent);
        if let Some(hints) = &ctx.profile_hints {
            user.push_str(&format!("\n\nUser context:\n{}", hints));
        }
        SkillRequest::from_messages(vec![
            Message::text(Role::System, system),
            Message::text(Role::User, user),
        ])
    }

    fn validate(&self, response: &Message, _ctx: &Self::Context) -> Validation<Self::Output> {
        if let Some(json) = extract_json_object(&response.content) {
            if let Some(text) = json.get("formulated_text").and_then(|v| v.as_str()) {
                let text = text.trim();
                if text.is_empty() {
                    return Validation::Retry("formulated_text was empty".to_string());
                }
                return Validation::Valid(FormulatedDemand {
                    formulated_text: text.to_string(),
                    enrichments: string_array(json.get("enrichments")),
                });
            }
        }
        // Providers that ignore the JSON instruction still produce a usable
        // demand; take the whole response as the formulated text.
        let fallback = response.content.trim();
        if fallback.is_empty() {
            Validation::Retry("response was empty".to_string())
        } else {
            Validation::Valid(FormulatedDemand {
                formulated_text: fallback.to_string(),
                enrichments: Vec::new(),
            })
        }
    }
}

// ── Offer ────────────────────────────────────────────────────────────────

/// Input to [`OfferSkill`].
///
/// `peer_names` is consulted by the validator only; it is never rendered into
/// the prompt.  Information isolation between agents is enforced here by
/// construction, not by instruction.
pub struct OfferContext {
    pub demand: String,
    pub profile: AgentProfile,
    /// Display names and ids of the *other* selected agents, for the
    /// no-cross-referencing check.
    pub peer_names: Vec<String>,
}

/// Output of [`OfferSkill`].
pub struct OfferDraft {
    pub content: String,
    pub capabilities: Vec<String>,
}

/// Produces one agent's proposal from its own profile and the confirmed demand.
pub struct OfferSkill;

impl Skill for OfferSkill {
    type Context = OfferContext;
    type Output = OfferDraft;

    fn name(&self) -> &str {
        "offer"
    }

    fn build_request(&self, ctx: &Self::Context) -> SkillRequest {
        let mut system = format!("You are {}.\n", ctx.profile.display_name);
        system.push_str(&format!("Your profile: {}\n", ctx.profile.profile_text));
        if !ctx.profile.capabilities.is_empty() {
            system.push_str(&format!(
                "Your declared capabilities: {}\n",
                ctx.profile.capabilities.join(", ")
            ));
        }
        system.push_str(
            "\nYou are preparing a proposal in response to a demand. Work strictly from \
             your own profile; do not speak for, name, or assume anything about other \
             participants.\n\
             Respond with a JSON object:\n\
             {\"content\": \"...\", \"capabilities\": [\"tag\", ...]}",
        );
        let user = format!("Demand:\n{}\n\nProduce your offer now.", ctx.demand);
        SkillRequest::from_messages(vec![
            Message::text(Role::System, system),
            Message::text(Role::User, user),
        ])
    }

    fn validate(&self, response: &Message, ctx: &Self::Context) -> Validation<Self::Output> {
        let draft = if let Some(json) = extract_json_object(&response.content) {
            match json.get("content").and_then(|v| v.as_str()) {
                Some(content) if !content.trim().is_empty() => OfferDraft {
                    content: content.trim().to_string(),
                    capabilities: string_array(json.get("capabilities")),
                },
                _ => return Validation::Retry("offer content was empty".to_string()),
            }
        } else {
            let fallback = response.content.trim();
            if fallback.is_empty() {
                return Validation::Retry("response was empty".to_string());
            }
            OfferDraft {
                content: fallback.to_string(),
                capabilities: Vec::new(),
            }
        };

        // An offer that talks about other participants was fabricated from
        // information the agent does not have.
        let lowered = draft.content.to_lowercase();
        for peer in &ctx.peer_names {
            if !peer.is_empty() && lowered.contains(&peer.to_lowercase()) {
                return Validation::Retry(format!(
                    "the offer references another participant ('{}'); describe only your own contribution",
                    peer
                ));
            }
        }

        Validation::Valid(draft)
    }
}

// ── Inquiry (ask_agent) ──────────────────────────────────────────────────

/// Input to [`InquirySkill`].
pub struct InquiryContext {
    pub demand: String,
    pub profile: AgentProfile,
    pub question: String,
}

/// Asks one participant a follow-up question on the center's behalf.
pub struct InquirySkill;

impl Skill for InquirySkill {
    type Context = InquiryContext;
    type Output = String;

    fn name(&self) -> &str {
        "inquiry"
    }

    fn build_request(&self, ctx: &Self::Context) -> SkillRequest {
        let system = format!(
            "You are {}.\nYour profile: {}\n\nThe negotiation coordinator has a \
             follow-up question about your offer. Answer it directly and concisely, \
             from your own knowledge only.",
            ctx.profile.display_name, ctx.profile.profile_text
        );
        let user = format!("Demand:\n{}\n\nQuestion: {}", ctx.demand, ctx.question);
        SkillRequest::from_messages(vec![
            Message::text(Role::System, system),
            Message::text(Role::User, user),
        ])
    }

    fn validate(&self, response: &Message, _ctx: &Self::Context) -> Validation<Self::Output> {
        let answer = response.content.trim();
        if answer.is_empty() {
            Validation::Retry("answer was empty".to_string())
        } else {
            Validation::Valid(answer.to_string())
        }
    }
}

// ── Center ───────────────────────────────────────────────────────────────

/// One offer as presented to the center (content possibly masked to a
/// deterministic summary on round 2+).
#[derive(Debug, Clone)]
pub struct OfferView {
    pub agent_id: String,
    pub display_name: String,
    pub content: String,
    pub capabilities: Vec<String>,
}

/// What the center remembers of a previous round: its own reasoning verbatim
/// plus one line per dispatched tool call.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round_number: usize,
    pub reasoning: String,
    pub tool_lines: Vec<String>,
}

/// Input to [`CenterSkill`].
pub struct CenterContext {
    pub demand: String,
    /// Offer views in canonical order.
    pub offers: Vec<OfferView>,
    /// Agents whose offer production failed; visible as such, never padded
    /// with placeholder offers.
    pub failed_agents: Vec<String>,
    pub prior_rounds: Vec<RoundSummary>,
    pub round_number: usize,
    /// True on the forced terminal round (only terminal tools available).
    pub forced: bool,
    /// Native tool definitions to expose (the registry's full or terminal set).
    pub tools: Vec<ToolDefinition>,
}

/// Output of [`CenterSkill`].
pub struct CenterDirective {
    /// The model's free-text reasoning accompanying the calls.
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The coordinating skill: consumes the offer set and produces tool calls.
pub struct CenterSkill {
    terminal_tools: Vec<String>,
}

impl CenterSkill {
    pub fn new() -> Self {
        Self {
            terminal_tools: vec!["output_plan".to_string(), "reject".to_string()],
        }
    }
}

impl Default for CenterSkill {
    fn default() -> Self {
        Self::new()
    }
}

impl Skill for CenterSkill {
    type Context = CenterContext;
    type Output = CenterDirective;

    fn name(&self) -> &str {
        "center"
    }

    fn build_request(&self, ctx: &Self::Context) -> SkillRequest {
        let system = "You are the center coordinator of a negotiation. You hold the \
                      confirmed demand and one proposal from each participating agent. \
                      Decide the next action by calling the provided tools: call \
                      output_plan when the offers cover the demand, ask_agent or \
                      output_gap or start_discovery when something is missing, and \
                      reject only when no viable plan can exist.";

        let mut user = format!("Demand (confirmed):\n{}\n\n", ctx.demand);

        if ctx.round_number <= 1 {
            user.push_str("Offers (canonical order):\n");
            for (idx, offer) in ctx.offers.iter().enumerate() {
                user.push_str(&format!(
                    "[{}] {} ({}) — capabilities: {}\n{}\n\n",
                    idx + 1,
                    offer.display_name,
                    offer.agent_id,
                    if offer.capabilities.is_empty() {
                        "none declared".to_string()
                    } else {
                        offer.capabilities.join(", ")
                    },
                    offer.content
                ));
            }
        } else {
            user.push_str("Offer summaries (condensed):\n");
            for offer in &ctx.offers {
                user.push_str(&format!("- {}\n", offer.content));
            }
            user.push('\n');
        }

        if !ctx.failed_agents.is_empty() {
            user.push_str(&format!(
                "No offer was produced by: {}.\n\n",
                ctx.failed_agents.join(", ")
            ));
        }

        for round in &ctx.prior_rounds {
            user.push_str(&format!(
                "Round {} reasoning:\n{}\n",
                round.round_number, round.reasoning
            ));
            if !round.tool_lines.is_empty() {
                user.push_str("Round tool activity:\n");
                for line in &round.tool_lines {
                    user.push_str(&format!("- {}\n", line));
                }
            }
            user.push('\n');
        }

        user.push_str(&format!("This is round {}.", ctx.round_number));
        if ctx.forced {
            user.push_str(
                " FINAL ROUND: only the output_plan and reject tools are available. \
                 You must conclude the negotiation now.",
            );
        }

        SkillRequest::from_messages(vec![
            Message::text(Role::System, system),
            Message::text(Role::User, user),
        ])
        .with_tools(ctx.tools.clone())
    }

    fn validate(&self, response: &Message, ctx: &Self::Context) -> Validation<Self::Output> {
        let mut tool_calls: Vec<ToolCallRequest> = response
            .tool_calls
            .iter()
            .map(|tc| ToolCallRequest {
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            })
            .collect();

        if tool_calls.is_empty() {
            if let Some(parsed) = parse_tool_call_text(&response.content) {
                tool_calls.push(parsed);
            }
        }

        if ctx.forced
            && !tool_calls
                .iter()
                .any(|call| self.terminal_tools.iter().any(|t| t == &call.name))
        {
            return Validation::Retry(
                "the final round requires a call to output_plan or reject".to_string(),
            );
        }

        Validation::Valid(CenterDirective {
            reasoning: response.content.to_string(),
            tool_calls,
        })
    }
}
