//! Sub-negotiation: `start_discovery` children, depth bounds, and the
//! parent/child event relationship.

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

struct FlatEncoder;

#[async_trait]
impl Encoder for FlatEncoder {
    async fn encode(&self, _text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        Ok(vec![1.0])
    }
}

/// Scripted provider whose center directives are consumed in call order.
///
/// Within one test the order of center invocations is deterministic — the
/// parent blocks on its child — so a single queue scripts both sessions.
struct DiscoveryClient {
    center_script: TokioMutex<Vec<Message>>,
}

impl DiscoveryClient {
    fn new(script: Vec<Message>) -> Self {
        Self {
            center_script: TokioMutex::new(script),
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
impl ClientWrapper for DiscoveryClient {
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
            let raw = joined
                .split("Raw intent:\n")
                .nth(1)
                .unwrap_or("")
                .lines()
                .next()
                .unwrap_or("");
            return Ok(Message::text(
                Role::Assistant,
                serde_json::json!({ "formulated_text": format!("Structured: {}", raw) })
                    .to_string(),
            ));
        }

        if system.contains("center coordinator of a negotiation") {
            let mut script = self.center_script.lock().await;
            assert!(
                !script.is_empty(),
                "center invoked more often than scripted"
            );
            return Ok(script.remove(0));
        }

        if system.contains("You are Venue Scout.") {
            return Ok(Message::text(
                Role::Assistant,
                "{\"content\": \"Three candidate rooms, all bookable.\", \"capabilities\": [\"venues\"]}",
            ));
        }
        if system.contains("You are Caterer.") {
            return Ok(Message::text(
                Role::Assistant,
                "{\"content\": \"Standing buffet, 40 covers.\", \"capabilities\": [\"catering\"]}",
            ));
        }

        Err(format!("unexpected prompt: {}", system).into())
    }

    fn model_name(&self) -> &str {
        "discovery-mock"
    }
}

async fn two_agent_profiles() -> Arc<InMemoryProfileSource> {
    let profiles = InMemoryProfileSource::new();
    profiles
        .register(
            AgentProfile::new("venue", "Venue Scout", "Venue booking for tech meetups.")
                .with_capability("venues"),
        )
        .await;
    profiles
        .register(
            AgentProfile::new("caterer", "Caterer", "Catering for tech events.")
                .with_capability("catering"),
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

fn drain_history(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_discovery_child_completes_and_feeds_the_parent() {
    let client = DiscoveryClient::new(vec![
        // Parent round 1: delegate.
        directive(
            "start_discovery",
            serde_json::json!({
                "topic": "shortlist venues near downtown",
                "participant_ids": ["venue"]
            }),
        ),
        // Child round 1: conclude.
        directive(
            "output_plan",
            serde_json::json!({"plan_text": "Child plan: take the corner loft."}),
        ),
        // Parent round 2: conclude with the child's findings in hand.
        directive(
            "output_plan",
            serde_json::json!({"plan_text": "Parent plan: loft booked, buffet standing."}),
        ),
    ]);

    let profiles = two_agent_profiles().await;
    let engine = NegotiationEngine::builder(Arc::new(client), profiles)
        .with_encoder(Arc::new(FlatEncoder))
        .with_config(EngineConfig {
            skill_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        })
        .build();

    let parent_id = engine
        .submit("plan the meetup logistics", SubmitOptions::default())
        .await
        .unwrap();
    let mut parent_rx = engine.subscribe(&parent_id);
    let parent_events = run_to_terminal(&engine, &parent_id, &mut parent_rx).await;

    // The delegation is announced before its tool result is recorded.
    let parent_kinds: Vec<&str> = parent_events.iter().map(|e| e.payload.kind()).collect();
    let started_at = parent_kinds
        .iter()
        .position(|k| *k == "sub_negotiation.started")
        .expect("parent must announce the sub-negotiation");
    let discovery_call_at = parent_events
        .iter()
        .position(|e| {
            matches!(
                &e.payload,
                EventPayload::CenterToolCall { tool_name, .. } if tool_name == "start_discovery"
            )
        })
        .expect("start_discovery must be recorded");
    assert!(started_at < discovery_call_at);

    let (child_id, topic) = parent_events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::SubNegotiationStarted {
                child_session_id,
                topic,
                ..
            } => Some((child_session_id.clone(), topic.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(topic, "shortlist venues near downtown");

    // The child's plan summary came back as the tool result.
    let discovery_result = match &parent_events[discovery_call_at].payload {
        EventPayload::CenterToolCall { result, .. } => result.clone(),
        _ => unreachable!(),
    };
    assert_eq!(discovery_result["success"], true);
    assert_eq!(
        discovery_result["output"]["plan_summary"],
        "Child plan: take the corner loft."
    );
    assert_eq!(discovery_result["output"]["child_session_id"], child_id);

    match &parent_events.last().unwrap().payload {
        EventPayload::PlanReady { plan_text, .. } => {
            assert_eq!(plan_text, "Parent plan: loft booked, buffet standing.");
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    // History replay lets us audit the finished child session.
    let mut child_rx = engine.subscribe(&child_id);
    let child_events = drain_history(&mut child_rx);
    let child_kinds: Vec<&str> = child_events.iter().map(|e| e.payload.kind()).collect();
    assert_eq!(
        child_kinds,
        vec![
            "formulation.ready",
            "formulation.confirmed",
            "resonance.activated",
            "offer.received",
            "barrier.complete",
            "center.tool_call",
            "plan.ready",
        ],
        "the child runs the full state machine with auto-confirmation"
    );
    for event in &child_events {
        assert_eq!(event.parent_session_id.as_deref(), Some(parent_id.as_str()));
        assert_eq!(event.session_id, child_id);
    }

    // Only the named participant subset took part, with a snapshot score.
    match &child_events[2].payload {
        EventPayload::ResonanceActivated { agents, .. } => {
            assert_eq!(agents.len(), 1);
            assert_eq!(agents[0].agent_id, "venue");
            assert!((agents[0].resonance_score - 1.0).abs() < f32::EPSILON);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    // The child reached plan.ready before the parent did.
    let child_plan_seq = child_events.last().unwrap().timestamp;
    let parent_plan_seq = parent_events.last().unwrap().timestamp;
    assert!(child_plan_seq <= parent_plan_seq);
}

#[tokio::test]
async fn test_recursion_depth_is_bounded_at_one() {
    let client = DiscoveryClient::new(vec![
        // Parent round 1: delegate to a child.
        directive(
            "start_discovery",
            serde_json::json!({"topic": "venue shortlist", "participant_ids": ["venue"]}),
        ),
        // Child round 1: tries to recurse again — denied by the depth bound.
        directive(
            "start_discovery",
            serde_json::json!({"topic": "even deeper", "participant_ids": ["venue"]}),
        ),
        // Child round 2: concludes.
        directive(
            "output_plan",
            serde_json::json!({"plan_text": "Child plan without further recursion."}),
        ),
        // Parent round 2: concludes.
        directive(
            "output_plan",
            serde_json::json!({"plan_text": "Parent plan."}),
        ),
    ]);

    let profiles = two_agent_profiles().await;
    let engine = NegotiationEngine::builder(Arc::new(client), profiles)
        .with_encoder(Arc::new(FlatEncoder))
        .build();

    let parent_id = engine
        .submit("plan the meetup logistics", SubmitOptions::default())
        .await
        .unwrap();
    let mut parent_rx = engine.subscribe(&parent_id);
    let parent_events = run_to_terminal(&engine, &parent_id, &mut parent_rx).await;

    let child_id = parent_events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::SubNegotiationStarted {
                child_session_id, ..
            } => Some(child_session_id.clone()),
            _ => None,
        })
        .unwrap();

    let mut child_rx = engine.subscribe(&child_id);
    let child_events = drain_history(&mut child_rx);

    // The child's own start_discovery was refused at the depth bound, and no
    // grandchild session was ever announced.
    let refused = child_events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::CenterToolCall {
                tool_name, result, ..
            } if tool_name == "start_discovery" => Some(result.clone()),
            _ => None,
        })
        .expect("the child's recursion attempt must be recorded");
    assert_eq!(refused["success"], false);
    assert_eq!(refused["metadata"]["depth_limited"], true);
    assert!(child_events
        .iter()
        .all(|e| e.payload.kind() != "sub_negotiation.started"));

    match &parent_events.last().unwrap().payload {
        EventPayload::PlanReady { plan_text, .. } => assert_eq!(plan_text, "Parent plan."),
        other => panic!("unexpected payload: {:?}", other),
    }
}
