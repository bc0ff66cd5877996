//! Center loop behavior: round caps, the forced terminal round, observation
//! masking, and tool-call protocol errors.

use async_trait::async_trait;
use concord::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition};
use concord::config::EngineConfig;
use concord::engine::{NegotiationEngine, SubmitOptions};
use concord::event::{EventPayload, SessionEvent};
use concord::profile::{AgentProfile, InMemoryProfileSource};
use concord::resonance::Encoder;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

/// Selects every registered agent regardless of the demand text.
struct FlatEncoder;

#[async_trait]
impl Encoder for FlatEncoder {
    async fn encode(&self, _text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        Ok(vec![1.0])
    }
}

/// Scripted provider that records every center prompt it sees.
struct CenterProbeClient {
    center_script: TokioMutex<Vec<Message>>,
    center_prompts: Arc<TokioMutex<Vec<String>>>,
    offer_content: String,
}

impl CenterProbeClient {
    fn new(offer_content: &str, script: Vec<Message>) -> Self {
        Self {
            center_script: TokioMutex::new(script),
            center_prompts: Arc::new(TokioMutex::new(Vec::new())),
            offer_content: offer_content.to_string(),
        }
    }
}

fn directive(tool_name: &str, args: serde_json::Value) -> Message {
    Message {
        role: Role::Assistant,
        content: Arc::from(format!("Round action: {}.", tool_name)),
        tool_calls: vec![NativeToolCall {
            id: format!("call_{}", tool_name),
            name: tool_name.to_string(),
            arguments: args,
        }],
    }
}

#[async_trait]
impl ClientWrapper for CenterProbeClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let system = messages
            .first()
            .map(|m| m.content.as_ref().to_string())
            .unwrap_or_default();
        let joined: String = messages
            .iter()
            .map(|m| m.content.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        if system.starts_with("You turn a raw user intent") {
            return Ok(Message::text(
                Role::Assistant,
                "{\"formulated_text\": \"Structured demand under test\"}",
            ));
        }

        if system.contains("center coordinator of a negotiation") {
            self.center_prompts.lock().await.push(joined);
            let mut script = self.center_script.lock().await;
            if script.is_empty() {
                return Ok(directive(
                    "output_plan",
                    serde_json::json!({"plan_text": "fallback"}),
                ));
            }
            return Ok(script.remove(0));
        }

        if joined.contains("Question:") {
            return Ok(Message::text(Role::Assistant, "Sixty seats, wheelchair access."));
        }

        // Offer prompt for the single registered agent.
        Ok(Message::text(
            Role::Assistant,
            serde_json::json!({
                "content": self.offer_content,
                "capabilities": ["venues"]
            })
            .to_string(),
        ))
    }

    fn model_name(&self) -> &str {
        "center-probe-mock"
    }
}

async fn single_agent_profiles() -> Arc<InMemoryProfileSource> {
    let profiles = InMemoryProfileSource::new();
    profiles
        .register(
            AgentProfile::new("venue", "Venue Scout", "Venue booking for tech meetups.")
                .with_capability("venues"),
        )
        .await;
    Arc::new(profiles)
}

async fn run_to_terminal(
    engine: &NegotiationEngine,
    session_id: &str,
    rx: &mut mpsc::Receiver<SessionEvent>,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("stream ended early");
        if matches!(event.payload, EventPayload::FormulationReady { .. }) {
            engine.confirm(session_id, None).await.unwrap();
        }
        let done = matches!(
            event.payload.kind(),
            "plan.ready" | "session.failed" | "session.cancelled"
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_round_cap_forces_a_terminal_round() {
    let offer_body = "Large hall offer. Second sentence with extra detail.";
    let client = CenterProbeClient::new(
        offer_body,
        vec![
            directive(
                "ask_agent",
                serde_json::json!({"agent_id": "venue", "question": "Capacity?"}),
            ),
            directive(
                "output_gap",
                serde_json::json!({"description": "still no catering coverage"}),
            ),
            // Round 3 is forced; only output_plan/reject are acceptable.
            directive(
                "output_plan",
                serde_json::json!({"plan_text": "Concluded under the round cap."}),
            ),
        ],
    );
    let prompts = client.center_prompts.clone();
    let engine = NegotiationEngine::builder(Arc::new(client), single_agent_profiles().await)
        .with_encoder(Arc::new(FlatEncoder))
        .with_config(EngineConfig {
            skill_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        })
        .build();

    let session_id = engine
        .submit("book a venue", SubmitOptions::default())
        .await
        .unwrap();
    let mut rx = engine.subscribe(&session_id);
    let events = run_to_terminal(&engine, &session_id, &mut rx).await;

    // Three center.tool_call events, one per round, then the plan.
    let tool_calls: Vec<(usize, String)> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CenterToolCall {
                round_number,
                tool_name,
                ..
            } => Some((*round_number, tool_name.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        tool_calls,
        vec![
            (1, "ask_agent".to_string()),
            (2, "output_gap".to_string()),
            (3, "output_plan".to_string()),
        ]
    );

    match &events.last().unwrap().payload {
        EventPayload::PlanReady {
            plan_text,
            center_rounds,
            ..
        } => {
            assert_eq!(plan_text, "Concluded under the round cap.");
            assert_eq!(*center_rounds, 3);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let prompts = prompts.lock().await;
    assert_eq!(prompts.len(), 3);

    // Round 1 shows the raw offer.
    assert!(prompts[0].contains("Offers (canonical order):"));
    assert!(prompts[0].contains("Second sentence with extra detail."));

    // Round 2+ masks it to the deterministic summary: first sentence only.
    assert!(prompts[1].contains("Offer summaries (condensed):"));
    assert!(prompts[1].contains("Large hall offer."));
    assert!(!prompts[1].contains("Second sentence with extra detail."));
    // The confirmed demand stays verbatim in every round.
    assert!(prompts[1].contains("Structured demand under test"));
    // Prior-round reasoning is carried verbatim.
    assert!(prompts[1].contains("Round action: ask_agent."));
    assert!(prompts[1].contains("Sixty seats, wheelchair access."));

    // The forced round announces the restricted tool set.
    assert!(prompts[2].contains("FINAL ROUND"));
    assert!(!prompts[0].contains("FINAL ROUND"));
    assert!(!prompts[1].contains("FINAL ROUND"));
}

#[tokio::test]
async fn test_ask_agent_result_reaches_the_event_stream() {
    let client = CenterProbeClient::new(
        "Large hall offer.",
        vec![
            directive(
                "ask_agent",
                serde_json::json!({"agent_id": "venue", "question": "Capacity?"}),
            ),
            directive(
                "output_plan",
                serde_json::json!({"plan_text": "Plan with capacity confirmed."}),
            ),
        ],
    );
    let engine = NegotiationEngine::builder(Arc::new(client), single_agent_profiles().await)
        .with_encoder(Arc::new(FlatEncoder))
        .build();

    let session_id = engine
        .submit("book a venue", SubmitOptions::default())
        .await
        .unwrap();
    let mut rx = engine.subscribe(&session_id);
    let events = run_to_terminal(&engine, &session_id, &mut rx).await;

    let ask_result = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::CenterToolCall {
                tool_name, result, ..
            } if tool_name == "ask_agent" => Some(result.clone()),
            _ => None,
        })
        .expect("ask_agent tool call event expected");
    assert_eq!(ask_result["success"], true);
    assert_eq!(
        ask_result["output"]["answer"],
        "Sixty seats, wheelchair access."
    );
}

#[tokio::test]
async fn test_unknown_tool_is_recorded_and_the_loop_continues() {
    let client = CenterProbeClient::new(
        "Large hall offer.",
        vec![
            directive("summon_dragon", serde_json::json!({"size": "large"})),
            directive(
                "output_plan",
                serde_json::json!({"plan_text": "Recovered after the protocol error."}),
            ),
        ],
    );
    let engine = NegotiationEngine::builder(Arc::new(client), single_agent_profiles().await)
        .with_encoder(Arc::new(FlatEncoder))
        .build();

    let session_id = engine
        .submit("book a venue", SubmitOptions::default())
        .await
        .unwrap();
    let mut rx = engine.subscribe(&session_id);
    let events = run_to_terminal(&engine, &session_id, &mut rx).await;

    let unknown = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::CenterToolCall {
                tool_name,
                result,
                round_number,
                ..
            } if tool_name == "summon_dragon" => Some((*round_number, result.clone())),
            _ => None,
        })
        .expect("the unknown tool must still be recorded");
    assert_eq!(unknown.0, 1);
    assert_eq!(unknown.1["success"], false);
    assert_eq!(unknown.1["metadata"]["protocol_error"], true);

    match &events.last().unwrap().payload {
        EventPayload::PlanReady { plan_text, .. } => {
            assert_eq!(plan_text, "Recovered after the protocol error.");
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[tokio::test]
async fn test_reject_terminates_with_a_negative_plan() {
    let client = CenterProbeClient::new(
        "Large hall offer.",
        vec![directive(
            "reject",
            serde_json::json!({"reason": "the demand cannot be met indoors"}),
        )],
    );
    let engine = NegotiationEngine::builder(Arc::new(client), single_agent_profiles().await)
        .with_encoder(Arc::new(FlatEncoder))
        .build();

    let session_id = engine
        .submit("book a venue", SubmitOptions::default())
        .await
        .unwrap();
    let mut rx = engine.subscribe(&session_id);
    let events = run_to_terminal(&engine, &session_id, &mut rx).await;

    match &events.last().unwrap().payload {
        EventPayload::PlanReady {
            plan_text,
            plan_json,
            ..
        } => {
            assert_eq!(plan_text, "the demand cannot be met indoors");
            assert!(plan_json.is_none());
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let plan = engine.plan(&session_id).await.unwrap().unwrap();
    assert!(!plan.viable);
}

#[tokio::test]
async fn test_malformed_plan_json_degrades_to_text_only_event() {
    let client = CenterProbeClient::new(
        "Large hall offer.",
        vec![directive(
            "output_plan",
            serde_json::json!({
                "plan_text": "Plan text survives.",
                "plan_json": {
                    "summary": "Plan text survives.",
                    "tasks": [
                        {"id": "a", "title": "A", "assignee_id": "venue", "prerequisites": ["ghost"]}
                    ]
                }
            }),
        )],
    );
    let engine = NegotiationEngine::builder(Arc::new(client), single_agent_profiles().await)
        .with_encoder(Arc::new(FlatEncoder))
        .build();

    let session_id = engine
        .submit("book a venue", SubmitOptions::default())
        .await
        .unwrap();
    let mut rx = engine.subscribe(&session_id);
    let events = run_to_terminal(&engine, &session_id, &mut rx).await;

    match &events.last().unwrap().payload {
        EventPayload::PlanReady {
            plan_text,
            plan_json,
            ..
        } => {
            assert_eq!(plan_text, "Plan text survives.");
            assert!(
                plan_json.is_none(),
                "a dangling prerequisite must drop the structured form"
            );
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}
