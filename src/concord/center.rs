//! The center tool-use loop.
//!
//! Once the offer barrier completes, the session enters synthesis: a bounded
//! loop that invokes the center skill, dispatches whatever tool calls it
//! produces, and exits when a terminating tool (`output_plan`, `reject`)
//! lands.  After the configured number of free rounds a terminal round is
//! forced: the model is re-invoked with only the terminating tools available.
//!
//! Two presentation rules are enforced here rather than by prompt etiquette:
//!
//! - **Canonical order.**  Offers are shown sorted by agent id, never in
//!   arrival order, so the model cannot anchor on whoever answered first.
//! - **Observation masking.**  From round 2 on, raw offer bodies are replaced
//!   by a deterministic summary (agent id, capabilities, first sentence);
//!   the confirmed demand and the center's own prior reasoning stay verbatim.

use crate::concord::engine::{run_until_cancel, EngineError, Interrupt};
use crate::concord::event::{EventBus, EventPayload};
use crate::concord::plan::{Plan, StructuredPlan};
use crate::concord::profile::AgentProfile;
use crate::concord::session::{
    CenterRound, OfferOutcome, Session, SessionInput, SessionState, ToolCallRecord,
};
use crate::concord::skill::{
    CenterContext, CenterDirective, OfferView, RoundSummary, Skill, SkillRunner,
};
use crate::concord::tool_handler::{
    SubNegotiator, ToolCallRequest, ToolContext, ToolHandlerRegistry, ToolResult,
};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

const SUMMARY_SENTENCE_CAP: usize = 160;

/// The first sentence of a text, capped at [`SUMMARY_SENTENCE_CAP`] characters.
fn first_sentence(text: &str) -> String {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(trimmed.len());
    let sentence = &trimmed[..end];
    if sentence.chars().count() <= SUMMARY_SENTENCE_CAP {
        sentence.to_string()
    } else {
        let capped: String = sentence.chars().take(SUMMARY_SENTENCE_CAP).collect();
        format!("{}…", capped)
    }
}

/// Deterministic masked view of an offer: a pure function of the offer's
/// contents (agent id, capability list, first sentence) so every center
/// invocation sees the same summary.
pub fn summarize_offer(agent_id: &str, capabilities: &[String], content: &str) -> String {
    let caps = if capabilities.is_empty() {
        "no declared capabilities".to_string()
    } else {
        capabilities.join(", ")
    };
    format!("{} — {} — {}", agent_id, caps, first_sentence(content))
}

/// One offer paired with its display name, pre-sorted into canonical order.
struct CanonicalOffer {
    agent_id: String,
    display_name: String,
    content: String,
    capabilities: Vec<String>,
}

/// Build the canonical presentation set from the session's offer table.
///
/// Successful offers only, sorted by agent id; the returned failure list
/// carries the agents that produced nothing.
fn canonical_offers(
    offers: &[OfferOutcome],
    participants: &[AgentProfile],
) -> (Vec<CanonicalOffer>, Vec<String>) {
    let display = |agent_id: &str| -> String {
        participants
            .iter()
            .find(|p| p.agent_id == agent_id)
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| agent_id.to_string())
    };

    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for outcome in offers {
        match outcome {
            OfferOutcome::Received(offer) => ok.push(CanonicalOffer {
                agent_id: offer.agent_id.clone(),
                display_name: display(&offer.agent_id),
                content: offer.content.clone(),
                capabilities: offer.capabilities.clone(),
            }),
            OfferOutcome::Failed { agent_id, .. } => failed.push(agent_id.clone()),
        }
    }
    ok.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    failed.sort();
    (ok, failed)
}

fn offer_views(offers: &[CanonicalOffer], masked: bool) -> Vec<OfferView> {
    offers
        .iter()
        .map(|offer| OfferView {
            agent_id: offer.agent_id.clone(),
            display_name: offer.display_name.clone(),
            content: if masked {
                summarize_offer(&offer.agent_id, &offer.capabilities, &offer.content)
            } else {
                offer.content.clone()
            },
            capabilities: offer.capabilities.clone(),
        })
        .collect()
}

fn tool_line(record: &ToolCallRecord) -> String {
    if record
        .result
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let output = record
            .result
            .get("output")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        let short: String = output.chars().take(200).collect();
        format!("{} -> ok: {}", record.tool_name, short)
    } else {
        let error = record
            .result
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        format!("{} -> failed: {}", record.tool_name, error)
    }
}

fn round_summaries(rounds: &[CenterRound]) -> Vec<RoundSummary> {
    rounds
        .iter()
        .map(|round| RoundSummary {
            round_number: round.round_number,
            reasoning: round.reasoning.clone(),
            tool_lines: round.tool_calls.iter().map(tool_line).collect(),
        })
        .collect()
}

/// Build the terminal [`Plan`] from a successful terminating call.
///
/// A malformed or invalid `plan_json` never fails the session: the structured
/// form is dropped with a warning and the plan carries text alone.
fn plan_from_terminal_call(call: &ToolCallRequest) -> Plan {
    if call.name == "reject" {
        let reason = call
            .arguments
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("no viable plan");
        return Plan::rejection(reason);
    }

    let text = call
        .arguments
        .get("plan_text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let mut plan = Plan::from_text(text);

    if let Some(raw) = call.arguments.get("plan_json") {
        if !raw.is_null() {
            match serde_json::from_value::<StructuredPlan>(raw.clone()) {
                Ok(structured) => match structured.validate() {
                    Ok(()) => plan = plan.with_structured(structured),
                    Err(e) => {
                        log::warn!(
                            "discarding structured plan that violates its invariants: {}",
                            e
                        );
                    }
                },
                Err(e) => {
                    log::warn!("discarding unparseable structured plan: {}", e);
                }
            }
        }
    }
    plan
}

/// How a center loop ended.
pub(crate) enum CenterFlow {
    Plan(Plan),
    Failed(String),
    Cancelled,
}

/// Everything the loop needs, borrowed from the session driver.
pub(crate) struct CenterLoopDeps<'a> {
    pub runner: &'a SkillRunner,
    pub center: &'a (dyn Skill<Context = CenterContext, Output = CenterDirective>),
    pub registry: &'a ToolHandlerRegistry,
    pub bus: &'a EventBus,
    pub session: &'a Arc<RwLock<Session>>,
    pub inbox: &'a mut mpsc::Receiver<SessionInput>,
    pub participants: &'a [AgentProfile],
    pub sub_negotiator: &'a dyn SubNegotiator,
    pub max_center_rounds: usize,
    pub max_recursion_depth: usize,
}

/// Run the bounded center loop to a terminal outcome.
pub(crate) async fn run_center_loop(deps: CenterLoopDeps<'_>) -> CenterFlow {
    let CenterLoopDeps {
        runner,
        center,
        registry,
        bus,
        session,
        inbox,
        participants,
        sub_negotiator,
        max_center_rounds,
        max_recursion_depth,
    } = deps;

    let (session_id, parent_id, depth, demand, base_offers, failed_agents) = {
        let guard = session.read().await;
        let (offers, failed) = canonical_offers(&guard.offers, participants);
        (
            guard.id.clone(),
            guard.parent_session_id.clone(),
            guard.depth,
            guard.demand.confirmed_text().to_string(),
            offers,
            failed,
        )
    };

    let mut rounds: Vec<CenterRound> = Vec::new();

    loop {
        let round_number = rounds.len() + 1;
        let forced = round_number > max_center_rounds;
        let masked = round_number >= 2;

        let tools = if forced {
            registry.terminal_definitions()
        } else {
            registry.definitions()
        };

        let ctx = CenterContext {
            demand: demand.clone(),
            offers: offer_views(&base_offers, masked),
            failed_agents: failed_agents.clone(),
            prior_rounds: round_summaries(&rounds),
            round_number,
            forced,
            tools,
        };

        let directive = match run_until_cancel(
            runner.run(center, &ctx),
            inbox,
            SessionState::Synthesizing,
        )
        .await
        {
            Interrupt::Cancelled => return CenterFlow::Cancelled,
            Interrupt::Done(Err(e)) => {
                return CenterFlow::Failed(format!("center_failed: {}", e));
            }
            Interrupt::Done(Ok(directive)) => directive,
        };

        let mut round = CenterRound {
            round_number,
            reasoning: directive.reasoning.clone(),
            tool_calls: Vec::new(),
            forced,
        };
        let mut terminal_plan: Option<Plan> = None;

        for call in &directive.tool_calls {
            // A cancel that arrived between dispatches wins over further work.
            match inbox.try_recv() {
                Ok(SessionInput::Cancel { reply }) => {
                    let _ = reply.send(());
                    return CenterFlow::Cancelled;
                }
                Ok(SessionInput::Confirm { reply, .. }) => {
                    let _ = reply.send(Err(EngineError::InvalidState {
                        operation: "confirm",
                        state: SessionState::Synthesizing,
                    }));
                }
                Err(_) => {}
            }

            let tool_ctx = ToolContext {
                session_id: &session_id,
                demand: &demand,
                participants,
                recursion_depth: depth,
                max_recursion_depth,
                skills: runner,
                sub_negotiator,
            };
            let result: ToolResult = registry.dispatch(&tool_ctx, call).await;
            let result_json =
                serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);

            let seq = bus
                .publish(
                    &session_id,
                    parent_id.as_deref(),
                    EventPayload::CenterToolCall {
                        round_number,
                        tool_name: call.name.clone(),
                        tool_args: call.arguments.clone(),
                        result: result_json.clone(),
                    },
                )
                .await;
            let terminating = registry.is_terminating(&call.name) && result.success;
            session.write().await.last_event_seq = seq;

            round.tool_calls.push(ToolCallRecord {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                result: result_json,
                terminating,
            });

            if terminating {
                // The plan is extracted from the call's arguments; any calls
                // the model queued after its terminal one are not dispatched.
                terminal_plan = Some(plan_from_terminal_call(call));
                break;
            }
        }

        rounds.push(round);
        {
            let mut guard = session.write().await;
            guard.rounds = rounds.clone();
        }

        if let Some(plan) = terminal_plan {
            return CenterFlow::Plan(plan);
        }
        if forced {
            // The forced round's validator demands a terminating call, so
            // reaching this point means its dispatch failed.
            return CenterFlow::Failed("center_exhausted".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concord::session::Offer;
    use chrono::Utc;

    #[test]
    fn test_first_sentence_and_cap() {
        assert_eq!(first_sentence("Short. And more."), "Short.");
        assert_eq!(first_sentence("No terminator here"), "No terminator here");
        let long = "word ".repeat(100);
        assert!(first_sentence(&long).chars().count() <= SUMMARY_SENTENCE_CAP + 1);
    }

    #[test]
    fn test_summarize_offer_is_deterministic() {
        let caps = vec!["catering".to_string(), "logistics".to_string()];
        let a = summarize_offer("caterer", &caps, "Full buffet. Many details follow.");
        let b = summarize_offer("caterer", &caps, "Full buffet. Many details follow.");
        assert_eq!(a, b);
        assert_eq!(a, "caterer — catering, logistics — Full buffet.");
    }

    #[test]
    fn test_canonical_order_ignores_arrival_order() {
        let offers = vec![
            OfferOutcome::Received(Offer {
                agent_id: "zeta".to_string(),
                content: "late alphabet, early arrival".to_string(),
                capabilities: vec![],
                model: None,
                received_at: Utc::now(),
            }),
            OfferOutcome::Failed {
                agent_id: "mid".to_string(),
                error: "boom".to_string(),
            },
            OfferOutcome::Received(Offer {
                agent_id: "alpha".to_string(),
                content: "early alphabet, late arrival".to_string(),
                capabilities: vec![],
                model: None,
                received_at: Utc::now(),
            }),
        ];
        let (ok, failed) = canonical_offers(&offers, &[]);
        let ids: Vec<&str> = ok.iter().map(|o| o.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(failed, vec!["mid".to_string()]);
    }

    #[test]
    fn test_plan_from_reject_call() {
        let plan = plan_from_terminal_call(&ToolCallRequest {
            name: "reject".to_string(),
            arguments: serde_json::json!({"reason": "offers cannot cover the demand"}),
        });
        assert!(!plan.viable);
        assert_eq!(plan.text, "offers cannot cover the demand");
    }

    #[test]
    fn test_invalid_plan_json_degrades_to_text_only() {
        let plan = plan_from_terminal_call(&ToolCallRequest {
            name: "output_plan".to_string(),
            arguments: serde_json::json!({
                "plan_text": "Run the meetup.",
                "plan_json": {
                    "summary": "Run the meetup.",
                    "tasks": [
                        {"id": "a", "title": "A", "assignee_id": "x", "prerequisites": ["b"]},
                        {"id": "b", "title": "B", "assignee_id": "x", "prerequisites": ["a"]}
                    ]
                }
            }),
        });
        assert!(plan.viable);
        assert_eq!(plan.text, "Run the meetup.");
        assert!(plan.structured.is_none(), "cyclic plan must be dropped");
    }

    #[test]
    fn test_valid_plan_json_is_attached() {
        let plan = plan_from_terminal_call(&ToolCallRequest {
            name: "output_plan".to_string(),
            arguments: serde_json::json!({
                "plan_text": "Run the meetup.",
                "plan_json": {
                    "summary": "Run the meetup.",
                    "participants": [
                        {"agent_id": "venue", "display_name": "Venue Scout", "role_in_plan": "books the room"}
                    ],
                    "tasks": [
                        {"id": "book", "title": "Book venue", "assignee_id": "venue", "prerequisites": []}
                    ],
                    "topology": {"edges": []}
                }
            }),
        });
        let structured = plan.structured.expect("valid plan_json should attach");
        assert_eq!(structured.tasks.len(), 1);
        assert_eq!(structured.participants[0].agent_id, "venue");
    }
}
