//! Session event fabric.
//!
//! Everything observable about a negotiation session flows through here: the
//! engine publishes a strictly ordered, per-session stream of [`SessionEvent`]s
//! that UI layers and operators consume either through an in-process
//! subscription ([`EventBus::subscribe`]) or through a fire-and-forget
//! [`EventSink`] (a WebSocket bridge, a log file, a message queue — the
//! transport is the caller's business).
//!
//! # Ordering guarantees
//!
//! - Events within a session carry a strictly increasing `seq` starting at 1,
//!   with no gaps.
//! - Events across sessions are not ordered; subscribers must not infer
//!   cross-session causality from timestamps.
//! - Two subscribers to the same session observe identical sequences: a
//!   subscriber attaching late first receives the session's history replay,
//!   then the live stream.
//!
//! # Backpressure
//!
//! Each subscriber owns a bounded delivery buffer.  A subscriber that stops
//! draining its buffer is disconnected rather than allowed to block the
//! engine; other subscribers are unaffected.
//!
//! # Example
//!
//! ```rust
//! use concord::event::{EventBus, EventPayload};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe("s-1");
//!
//! bus.publish(
//!     "s-1",
//!     None,
//!     EventPayload::FormulationConfirmed {
//!         formulated_text: "Organize a small AI meetup".to_string(),
//!     },
//! )
//! .await;
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.seq, 1);
//! assert_eq!(event.payload.kind(), "formulation.confirmed");
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One scored agent as carried by `resonance.activated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredAgent {
    pub agent_id: String,
    pub resonance_score: f32,
}

/// The nine externally observable occurrence kinds.
///
/// The wire form is `{"kind": "<dotted.name>", "payload": {...}}`; payload
/// fields are additive, so consumers must tolerate unknown fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventPayload {
    /// Formulation produced a structured demand; the confirmation gate is open.
    #[serde(rename = "formulation.ready")]
    FormulationReady {
        raw_intent: String,
        formulated_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enrichments: Option<Vec<String>>,
    },

    /// The user (or auto-confirmation, for sub-negotiations) released the gate.
    #[serde(rename = "formulation.confirmed")]
    FormulationConfirmed { formulated_text: String },

    /// Resonance selected the agents that will be asked for offers.
    #[serde(rename = "resonance.activated")]
    ResonanceActivated {
        agents: Vec<ScoredAgent>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filtered_agents: Vec<ScoredAgent>,
    },

    /// One agent's offer arrived (successful offers only; failures surface in
    /// `barrier.complete` counts).
    #[serde(rename = "offer.received")]
    OfferReceived {
        agent_id: String,
        content: String,
        capabilities: Vec<String>,
    },

    /// Every selected agent has been accounted for; the center may begin.
    #[serde(rename = "barrier.complete")]
    BarrierComplete {
        agent_count: usize,
        succeeded_count: usize,
    },

    /// The center dispatched one tool call and recorded its result.
    #[serde(rename = "center.tool_call")]
    CenterToolCall {
        round_number: usize,
        tool_name: String,
        tool_args: serde_json::Value,
        result: serde_json::Value,
    },

    /// The center delegated a sub-negotiation to a child session.
    #[serde(rename = "sub_negotiation.started")]
    SubNegotiationStarted {
        child_session_id: String,
        topic: String,
        participant_ids: Vec<String>,
    },

    /// The terminal artifact is available; the session is complete.
    #[serde(rename = "plan.ready")]
    PlanReady {
        plan_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan_json: Option<serde_json::Value>,
        center_rounds: usize,
        participating_agents: Vec<String>,
    },

    /// The session was cancelled (user action or confirmation timeout).
    #[serde(rename = "session.cancelled")]
    SessionCancelled { reason: String },

    /// The session failed with a machine-readable reason code.
    #[serde(rename = "session.failed")]
    SessionFailed { reason: String },
}

impl EventPayload {
    /// The dotted event kind string as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::FormulationReady { .. } => "formulation.ready",
            EventPayload::FormulationConfirmed { .. } => "formulation.confirmed",
            EventPayload::ResonanceActivated { .. } => "resonance.activated",
            EventPayload::OfferReceived { .. } => "offer.received",
            EventPayload::BarrierComplete { .. } => "barrier.complete",
            EventPayload::CenterToolCall { .. } => "center.tool_call",
            EventPayload::SubNegotiationStarted { .. } => "sub_negotiation.started",
            EventPayload::PlanReady { .. } => "plan.ready",
            EventPayload::SessionCancelled { .. } => "session.cancelled",
            EventPayload::SessionFailed { .. } => "session.failed",
        }
    }
}

/// An externally observable occurrence in one session's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// The session this event belongs to.
    pub session_id: String,
    /// Set on sub-negotiation sessions; references the delegating session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Strictly increasing per-session sequence number, starting at 1.
    pub seq: u64,
    /// Publication timestamp.  Monotonic within a session only in the sense
    /// that `seq` is authoritative; wall clocks may jitter.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Fire-and-forget delivery seam for external transports.
///
/// The engine awaits `push` inline on its driver task, so implementations must
/// return promptly — hand the event to a channel or spawn the slow work.  A
/// sink that blocks delays the session that produced the event (and only that
/// session).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn push(&self, event: &SessionEvent);
}

struct SessionChannel {
    next_seq: u64,
    history: Vec<SessionEvent>,
    subscribers: Vec<mpsc::Sender<SessionEvent>>,
}

impl SessionChannel {
    fn new() -> Self {
        Self {
            next_seq: 1,
            history: Vec::new(),
            subscribers: Vec::new(),
        }
    }
}

/// In-order, per-session event stream to N subscribers.
///
/// Owned by the engine; one instance serves every session.  See the module
/// docs for the ordering and backpressure contract.
pub struct EventBus {
    buffer: usize,
    sinks: Vec<Arc<dyn EventSink>>,
    channels: Mutex<HashMap<String, SessionChannel>>,
}

impl EventBus {
    /// Create a bus whose subscribers each get `buffer` slots of slack beyond
    /// the history replayed at attach time.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            sinks: Vec::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a fire-and-forget sink that observes every event on every session.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Publish one event, assigning the next sequence number for the session.
    ///
    /// Returns the assigned sequence number.  Subscribers whose buffers are
    /// full are disconnected here rather than being allowed to block.
    pub async fn publish(
        &self,
        session_id: &str,
        parent_session_id: Option<&str>,
        payload: EventPayload,
    ) -> u64 {
        let event = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            let channel = channels
                .entry(session_id.to_string())
                .or_insert_with(SessionChannel::new);
            let event = SessionEvent {
                session_id: session_id.to_string(),
                parent_session_id: parent_session_id.map(|p| p.to_string()),
                seq: channel.next_seq,
                timestamp: Utc::now(),
                payload,
            };
            channel.next_seq += 1;
            channel.history.push(event.clone());
            channel.subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "EventBus: disconnecting slow subscriber on session {} at seq {}",
                        session_id,
                        event.seq
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            event
        };

        for sink in &self.sinks {
            sink.push(&event).await;
        }
        event.seq
    }

    /// Subscribe to a session's event stream.
    ///
    /// The returned receiver first yields the session's history (identical to
    /// what earlier subscribers saw), then live events.  Dropping the receiver
    /// detaches the subscription without affecting anyone else.
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<SessionEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);
        let (tx, rx) = mpsc::channel(channel.history.len() + self.buffer);
        for event in &channel.history {
            // Capacity covers the full history, so this cannot fail here.
            let _ = tx.try_send(event.clone());
        }
        channel.subscribers.push(tx);
        rx
    }

    /// The last sequence number issued for a session (0 if none yet).
    pub fn last_seq(&self, session_id: &str) -> u64 {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(session_id)
            .map(|c| c.next_seq - 1)
            .unwrap_or(0)
    }

    /// Drop a session's history and subscriber list.
    ///
    /// Used when a terminal session is evicted; live subscribers observe
    /// end-of-stream.
    pub fn forget(&self, session_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(text: &str) -> EventPayload {
        EventPayload::FormulationConfirmed {
            formulated_text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_seq_is_strictly_increasing_without_gaps() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe("s");
        for i in 0..5 {
            bus.publish("s", None, confirmed(&format!("t{}", i))).await;
        }
        for expected in 1..=5u64 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.seq, expected);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_identical_sequence() {
        let bus = EventBus::new(8);
        let mut early = bus.subscribe("s");
        bus.publish("s", None, confirmed("a")).await;
        bus.publish("s", None, confirmed("b")).await;

        let mut late = bus.subscribe("s");
        bus.publish("s", None, confirmed("c")).await;

        let mut early_seen = Vec::new();
        let mut late_seen = Vec::new();
        for _ in 0..3 {
            early_seen.push(early.recv().await.unwrap());
            late_seen.push(late.recv().await.unwrap());
        }
        for (e, l) in early_seen.iter().zip(late_seen.iter()) {
            assert_eq!(e.seq, l.seq);
            assert_eq!(e.payload.kind(), l.payload.kind());
            assert_eq!(
                serde_json::to_value(e).unwrap(),
                serde_json::to_value(l).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected_not_blocking() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe("s");
        // One slot of slack: the second publish overflows and disconnects.
        bus.publish("s", None, confirmed("a")).await;
        bus.publish("s", None, confirmed("b")).await;
        bus.publish("s", None, confirmed("c")).await;

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        // The channel was closed on overflow; no further events arrive.
        assert!(rx.recv().await.is_none());
        // The bus itself kept going.
        assert_eq!(bus.last_seq("s"), 3);
    }

    #[tokio::test]
    async fn test_wire_form_carries_dotted_kind_tag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("s");
        bus.publish(
            "s",
            Some("parent-1"),
            EventPayload::BarrierComplete {
                agent_count: 3,
                succeeded_count: 2,
            },
        )
        .await;
        let event = rx.recv().await.unwrap();
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["kind"], "barrier.complete");
        assert_eq!(wire["payload"]["agent_count"], 3);
        assert_eq!(wire["payload"]["succeeded_count"], 2);
        assert_eq!(wire["parent_session_id"], "parent-1");
        assert_eq!(wire["seq"], 1);

        let back: SessionEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back.payload.kind(), "barrier.complete");
    }

    #[tokio::test]
    async fn test_forget_ends_streams() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("s");
        bus.publish("s", None, confirmed("a")).await;
        bus.forget("s");
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.last_seq("s"), 0);
    }
}
