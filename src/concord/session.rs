//! Session state: the data model of one negotiation run.
//!
//! A [`Session`] is exclusively owned by its engine driver task from `created`
//! to a terminal state; every external mutation (confirm, cancel) travels
//! through the driver's inbox so state transitions are serialized per session.
//! Concurrent readers (status queries) see a consistent snapshot through the
//! shared lock, which only the driver writes.

use crate::concord::engine::EngineError;
use crate::concord::plan::Plan;
use crate::concord::resonance::ResonanceMatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Opaque session identifier (UUID v4 in practice).
pub type SessionId = String;

/// The negotiation state machine's states.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; everything else
/// advances in the fixed order
/// `created → formulating → awaiting_confirmation → encoding → offering →
/// barrier_waiting → synthesizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Formulating,
    AwaitingConfirmation,
    Encoding,
    Offering,
    BarrierWaiting,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Formulating => "formulating",
            SessionState::AwaitingConfirmation => "awaiting_confirmation",
            SessionState::Encoding => "encoding",
            SessionState::Offering => "offering",
            SessionState::BarrierWaiting => "barrier_waiting",
            SessionState::Synthesizing => "synthesizing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// The demand under negotiation.
///
/// `raw_intent` is immutable; `formulated_text` may be amended until
/// confirmation freezes it.
#[derive(Debug, Clone)]
pub struct DemandSnapshot {
    pub raw_intent: String,
    pub formulated_text: Option<String>,
    pub confirmed: bool,
}

impl DemandSnapshot {
    pub fn new(raw_intent: impl Into<String>) -> Self {
        Self {
            raw_intent: raw_intent.into(),
            formulated_text: None,
            confirmed: false,
        }
    }

    /// Store the formulation result (pre-confirmation, still mutable).
    pub fn set_formulated(&mut self, text: impl Into<String>) {
        debug_assert!(!self.confirmed);
        self.formulated_text = Some(text.into());
    }

    /// Freeze the demand at confirmation time.  When the confirmation carries
    /// an amended text it wins over the formulated one.
    pub fn freeze(&mut self, amended: Option<String>) {
        if let Some(text) = amended {
            self.formulated_text = Some(text);
        }
        self.confirmed = true;
    }

    /// The confirmed text; empty until [`freeze`](Self::freeze) ran.
    pub fn confirmed_text(&self) -> &str {
        if self.confirmed {
            self.formulated_text.as_deref().unwrap_or("")
        } else {
            ""
        }
    }
}

/// One agent's successful proposal.
#[derive(Debug, Clone)]
pub struct Offer {
    pub agent_id: String,
    pub content: String,
    pub capabilities: Vec<String>,
    /// Model that produced the offer, when known (origin metadata).
    pub model: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// One entry of the offer table: every selected agent lands exactly one of
/// these before the barrier completes.
#[derive(Debug, Clone)]
pub enum OfferOutcome {
    Received(Offer),
    Failed { agent_id: String, error: String },
}

impl OfferOutcome {
    pub fn agent_id(&self) -> &str {
        match self {
            OfferOutcome::Received(offer) => &offer.agent_id,
            OfferOutcome::Failed { agent_id, .. } => agent_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OfferOutcome::Received(_))
    }
}

/// One dispatched tool call inside a center round.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
    pub terminating: bool,
}

/// One iteration of the center loop.
#[derive(Debug, Clone)]
pub struct CenterRound {
    pub round_number: usize,
    /// The center model's free-text reasoning, retained verbatim for later
    /// rounds.
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub forced: bool,
}

/// The frozen output of the resonance stage.
///
/// Snapshot isolation: later profile changes never alter an in-flight
/// session's selection.
#[derive(Debug, Clone)]
pub struct AgentSelection {
    /// Selected agents, best score first.
    pub selected: Vec<ResonanceMatch>,
    /// Agents excluded by the score threshold.
    pub filtered: Vec<ResonanceMatch>,
    pub selected_at: DateTime<Utc>,
}

/// One negotiation run.
pub struct Session {
    pub id: SessionId,
    pub parent_session_id: Option<SessionId>,
    /// 0 for root sessions; children add one per `start_discovery` hop.
    pub depth: usize,
    pub state: SessionState,
    pub demand: DemandSnapshot,
    pub selection: Option<AgentSelection>,
    /// Monotonic: entries are only ever appended.
    pub offers: Vec<OfferOutcome>,
    pub rounds: Vec<CenterRound>,
    pub plan: Option<Plan>,
    /// Machine-readable reason accompanying `Failed`/`Cancelled`.
    pub terminal_reason: Option<String>,
    /// Sub-negotiations skip the human confirmation gate.
    pub auto_confirm: bool,
    /// When set, the selection stage uses these agents verbatim instead of
    /// running resonance (sub-negotiations with a fixed participant subset).
    pub fixed_participants: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub last_event_seq: u64,
}

impl Session {
    pub fn new(
        id: SessionId,
        raw_intent: impl Into<String>,
        parent_session_id: Option<SessionId>,
        depth: usize,
    ) -> Self {
        Self {
            id,
            parent_session_id,
            depth,
            state: SessionState::Created,
            demand: DemandSnapshot::new(raw_intent),
            selection: None,
            offers: Vec::new(),
            rounds: Vec::new(),
            plan: None,
            terminal_reason: None,
            auto_confirm: false,
            fixed_participants: None,
            created_at: Utc::now(),
            last_event_seq: 0,
        }
    }

    /// Point-in-time view for status queries.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            state: self.state,
            last_event_seq: self.last_event_seq,
        }
    }

    /// Agent ids with a successful offer, in offer-table order.
    pub fn succeeded_agent_ids(&self) -> Vec<String> {
        self.offers
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.agent_id().to_string())
            .collect()
    }
}

/// What `get_status` returns.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub last_event_seq: u64,
}

/// External inputs merged into a session's driver loop.
pub(crate) enum SessionInput {
    Confirm {
        formulated_text: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
}

/// A live session as held by the store: the shared state plus the driver inbox.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) shared: Arc<RwLock<Session>>,
    pub(crate) inbox: mpsc::Sender<SessionInput>,
}

/// In-memory map of live (and recently terminal) sessions.
///
/// Reader-writer discipline: many concurrent readers, while each session's
/// state is written only by its own driver through the handle's lock.
pub(crate) struct SessionStore {
    sessions: std::sync::RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionStore {
    pub(crate) fn new() -> Self {
        Self {
            sessions: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, id: SessionId, handle: SessionHandle) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);
    }

    pub(crate) fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub(crate) fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
