//! The negotiation engine: the state machine that drives every session.
//!
//! One [`NegotiationEngine`] serves many concurrent sessions.  Each session is
//! owned by a dedicated driver task that walks the fixed state graph
//!
//! ```text
//! created → formulating → awaiting_confirmation → encoding → offering
//!        → barrier_waiting → synthesizing → completed | failed | cancelled
//! ```
//!
//! and is the *only* writer of that session's state.  External inputs —
//! `confirm`, `cancel` — are delivered through a per-session inbox and merged
//! into the driver loop, so transitions are serialized per session while any
//! number of status readers and event subscribers proceed concurrently.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use concord::clients::openai::OpenAiCompatClient;
//! use concord::engine::{NegotiationEngine, SubmitOptions};
//! use concord::profile::{AgentProfile, InMemoryProfileSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profiles = Arc::new(InMemoryProfileSource::new());
//!     profiles
//!         .register(AgentProfile::new(
//!             "venue",
//!             "Venue Scout",
//!             "Finds and books event venues.",
//!         ))
//!         .await;
//!
//!     let llm = Arc::new(OpenAiCompatClient::new(
//!         &std::env::var("OPEN_AI_SECRET")?,
//!         "gpt-4.1-mini",
//!     ));
//!
//!     let engine = NegotiationEngine::builder(llm, profiles).build();
//!     let session_id = engine
//!         .submit("organize a small AI meetup", SubmitOptions::default())
//!         .await?;
//!
//!     let mut events = engine.subscribe(&session_id);
//!     while let Some(event) = events.recv().await {
//!         println!("[{}] {}", event.seq, event.payload.kind());
//!         if let concord::event::EventPayload::FormulationReady { .. } = event.payload {
//!             engine.confirm(&session_id, None).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::concord::center::{run_center_loop, CenterFlow, CenterLoopDeps};
use crate::concord::client_wrapper::ClientWrapper;
use crate::concord::config::EngineConfig;
use crate::concord::event::{EventBus, EventPayload, EventSink, ScoredAgent, SessionEvent};
use crate::concord::plan::Plan;
use crate::concord::profile::{AgentProfile, ProfileSource};
use crate::concord::resonance::{
    AgentVector, CosineResonanceDetector, Encoder, EncodingCache, HashingEncoder,
    ResonanceDetector, ResonanceMatch, ResonanceOutcome,
};
use crate::concord::session::{
    AgentSelection, Offer, OfferOutcome, Session, SessionHandle, SessionId, SessionInput,
    SessionState, SessionStatus, SessionStore,
};
use crate::concord::skill::{
    CenterContext, CenterDirective, CenterSkill, FormulationContext, FormulationSkill,
    FormulatedDemand, OfferContext, OfferDraft, OfferSkill, Skill, SkillError, SkillRunner,
};
use crate::concord::tool_handler::{
    SubNegotiationOutcome, SubNegotiator, ToolHandler, ToolHandlerRegistry,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Client-facing engine errors.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// No live or terminal session under that id.
    SessionNotFound(String),
    /// The operation is not valid in the session's current state; the session
    /// itself is unaffected.
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    /// The engine is shutting down and cannot accept work.
    Unavailable,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            EngineError::InvalidState { operation, state } => write!(
                f,
                "'{}' is not valid while the session is {}",
                operation,
                state.as_str()
            ),
            EngineError::Unavailable => write!(f, "Engine is unavailable"),
        }
    }
}

impl Error for EngineError {}

/// Per-submission overrides carried alongside the raw intent.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Override the engine's `k_star` for this session.
    pub k_star: Option<usize>,
    /// Override the engine's minimum resonance score for this session.
    pub min_resonance_score: Option<f32>,
    /// Free-text user context forwarded to the formulation skill.
    pub profile_hints: Option<String>,
}

/// Outcome of awaiting a future while staying responsive to the inbox.
pub(crate) enum Interrupt<T> {
    Done(T),
    Cancelled,
}

/// Await `fut`, servicing the session inbox meanwhile.
///
/// A `Cancel` input wins over the pending work; a `Confirm` input in any state
/// that reaches here is answered with an invalid-state error and the wait
/// continues.  When the inbox detaches the future is simply driven to
/// completion.
pub(crate) async fn run_until_cancel<F, T>(
    fut: F,
    inbox: &mut mpsc::Receiver<SessionInput>,
    state: SessionState,
) -> Interrupt<T>
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    let mut inbox_open = true;
    loop {
        if !inbox_open {
            return Interrupt::Done(fut.await);
        }
        tokio::select! {
            out = &mut fut => return Interrupt::Done(out),
            maybe = inbox.recv() => match maybe {
                Some(SessionInput::Cancel { reply }) => {
                    let _ = reply.send(());
                    return Interrupt::Cancelled;
                }
                Some(SessionInput::Confirm { reply, .. }) => {
                    let _ = reply.send(Err(EngineError::InvalidState {
                        operation: "confirm",
                        state,
                    }));
                }
                None => inbox_open = false,
            },
        }
    }
}

enum GateOutcome {
    Confirmed(Option<String>),
    Cancelled(String),
}

type DynFormulationSkill =
    Arc<dyn Skill<Context = FormulationContext, Output = FormulatedDemand>>;
type DynOfferSkill = Arc<dyn Skill<Context = OfferContext, Output = OfferDraft>>;
type DynCenterSkill = Arc<dyn Skill<Context = CenterContext, Output = CenterDirective>>;

struct EngineCore {
    config: EngineConfig,
    profiles: Arc<dyn ProfileSource>,
    encoder: Arc<dyn Encoder>,
    detector: Arc<dyn ResonanceDetector>,
    registry: ToolHandlerRegistry,
    bus: Arc<EventBus>,
    store: SessionStore,
    runner: SkillRunner,
    cache: EncodingCache,
    formulation: DynFormulationSkill,
    offer: DynOfferSkill,
    center: DynCenterSkill,
    self_ref: Weak<EngineCore>,
}

/// Builder for [`NegotiationEngine`].
///
/// Only the LLM client and profile source are mandatory; every other seam has
/// a bundled default (hashing encoder, cosine detector, the standard tool
/// registry, the standard skills).
pub struct EngineBuilder {
    llm: Arc<dyn ClientWrapper>,
    profiles: Arc<dyn ProfileSource>,
    encoder: Arc<dyn Encoder>,
    detector: Arc<dyn ResonanceDetector>,
    registry: ToolHandlerRegistry,
    config: EngineConfig,
    sinks: Vec<Arc<dyn EventSink>>,
    formulation: DynFormulationSkill,
    offer: DynOfferSkill,
    center: DynCenterSkill,
}

impl EngineBuilder {
    fn new(llm: Arc<dyn ClientWrapper>, profiles: Arc<dyn ProfileSource>) -> Self {
        Self {
            llm,
            profiles,
            encoder: Arc::new(HashingEncoder::default()),
            detector: Arc::new(CosineResonanceDetector),
            registry: ToolHandlerRegistry::default(),
            config: EngineConfig::default(),
            sinks: Vec::new(),
            formulation: Arc::new(FormulationSkill),
            offer: Arc::new(OfferSkill),
            center: Arc::new(CenterSkill::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the bundled hashing encoder with a real embedding backend.
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn ResonanceDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Add (or replace) one tool handler in the center's registry.
    pub fn with_tool_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.registry.register(handler);
        self
    }

    /// Replace the whole tool registry.
    pub fn with_tool_registry(mut self, registry: ToolHandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Attach a fire-and-forget event sink observing every session.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_formulation_skill(mut self, skill: DynFormulationSkill) -> Self {
        self.formulation = skill;
        self
    }

    pub fn with_offer_skill(mut self, skill: DynOfferSkill) -> Self {
        self.offer = skill;
        self
    }

    pub fn with_center_skill(mut self, skill: DynCenterSkill) -> Self {
        self.center = skill;
        self
    }

    pub fn build(self) -> NegotiationEngine {
        let mut bus = EventBus::new(self.config.event_buffer);
        for sink in &self.sinks {
            bus = bus.with_sink(sink.clone());
        }
        let runner = SkillRunner::new(
            self.llm.clone(),
            self.config.skill_timeout,
            self.config.max_validation_retries,
        );
        let core = Arc::new_cyclic(|weak| EngineCore {
            config: self.config,
            profiles: self.profiles,
            encoder: self.encoder,
            detector: self.detector,
            registry: self.registry,
            bus: Arc::new(bus),
            store: SessionStore::new(),
            runner,
            cache: EncodingCache::new(),
            formulation: self.formulation,
            offer: self.offer,
            center: self.center,
            self_ref: weak.clone(),
        });
        NegotiationEngine { core }
    }
}

/// Coordinates negotiations: submission, confirmation, selection, the offer
/// barrier, the center loop, and the event stream.
///
/// Cheap to clone; all clones share the same engine state.
#[derive(Clone)]
pub struct NegotiationEngine {
    core: Arc<EngineCore>,
}

impl NegotiationEngine {
    /// Start configuring an engine around an LLM client and a profile source.
    pub fn builder(
        llm: Arc<dyn ClientWrapper>,
        profiles: Arc<dyn ProfileSource>,
    ) -> EngineBuilder {
        EngineBuilder::new(llm, profiles)
    }

    /// Create a session for `raw_intent` and begin formulation.
    ///
    /// Returns the session id immediately; progress is observable through
    /// [`subscribe`](Self::subscribe) and [`status`](Self::status).
    pub async fn submit(
        &self,
        raw_intent: &str,
        options: SubmitOptions,
    ) -> Result<SessionId, EngineError> {
        let (session_id, _handle) =
            EngineCore::spawn_session(&self.core, raw_intent, options, None, 0, false, None)
                .await?;
        Ok(session_id)
    }

    /// Release the confirmation gate, optionally amending the formulated text.
    ///
    /// Valid only while the session is `awaiting_confirmation`; confirming an
    /// already-confirmed (or otherwise progressed) session is an error and
    /// leaves the session untouched.
    pub async fn confirm(
        &self,
        session_id: &str,
        formulated_text: Option<String>,
    ) -> Result<(), EngineError> {
        let handle = self
            .core
            .store
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let state = handle.shared.read().await.state;
        if state != SessionState::AwaitingConfirmation {
            return Err(EngineError::InvalidState {
                operation: "confirm",
                state,
            });
        }

        let (reply, response) = oneshot::channel();
        handle
            .inbox
            .send(SessionInput::Confirm {
                formulated_text,
                reply,
            })
            .await
            .map_err(|_| EngineError::InvalidState {
                operation: "confirm",
                state: SessionState::Cancelled,
            })?;
        response.await.unwrap_or(Err(EngineError::InvalidState {
            operation: "confirm",
            state: SessionState::Cancelled,
        }))
    }

    /// Move the session toward `cancelled`.
    ///
    /// Cancelling a session that already reached a terminal state is a no-op
    /// and returns success.
    pub async fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        let handle = self
            .core
            .store
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if handle.shared.read().await.state.is_terminal() {
            return Ok(());
        }

        let (reply, response) = oneshot::channel();
        if handle
            .inbox
            .send(SessionInput::Cancel { reply })
            .await
            .is_err()
        {
            // Driver already gone: the session is terminal.
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }

    /// Current state and last event sequence number.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, EngineError> {
        let handle = self
            .core
            .store
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let mut status = handle.shared.read().await.status();
        // The bus assigns sequence numbers at publish time; the session's own
        // copy may trail it by one write.
        status.last_event_seq = status.last_event_seq.max(self.core.bus.last_seq(session_id));
        Ok(status)
    }

    /// The terminal plan, once the session completed.
    pub async fn plan(&self, session_id: &str) -> Result<Option<Plan>, EngineError> {
        let handle = self
            .core
            .store
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let plan = handle.shared.read().await.plan.clone();
        Ok(plan)
    }

    /// Subscribe to a session's ordered event stream (history replay + live).
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<SessionEvent> {
        self.core.bus.subscribe(session_id)
    }

    /// Drop a terminal session and its event history.
    pub async fn evict(&self, session_id: &str) -> Result<(), EngineError> {
        let handle = self
            .core
            .store
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let state = handle.shared.read().await.state;
        if !state.is_terminal() {
            return Err(EngineError::InvalidState {
                operation: "evict",
                state,
            });
        }
        self.core.store.remove(session_id);
        self.core.bus.forget(session_id);
        Ok(())
    }

    /// Number of sessions currently held (live and terminal, pre-eviction).
    pub fn session_count(&self) -> usize {
        self.core.store.len()
    }
}

impl EngineCore {
    async fn spawn_session(
        core: &Arc<EngineCore>,
        raw_intent: &str,
        options: SubmitOptions,
        parent_session_id: Option<SessionId>,
        depth: usize,
        auto_confirm: bool,
        fixed_participants: Option<Vec<String>>,
    ) -> Result<(SessionId, JoinHandle<()>), EngineError> {
        let session_id = Uuid::new_v4().to_string();
        let mut session = Session::new(
            session_id.clone(),
            raw_intent,
            parent_session_id,
            depth,
        );
        session.auto_confirm = auto_confirm;
        session.fixed_participants = fixed_participants;

        let shared = Arc::new(RwLock::new(session));
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        core.store.insert(
            session_id.clone(),
            SessionHandle {
                shared: shared.clone(),
                inbox: inbox_tx,
            },
        );

        let core = core.clone();
        let driver = tokio::spawn(async move {
            core.drive(shared, inbox_rx, options).await;
        });
        Ok((session_id, driver))
    }

    async fn set_state(&self, shared: &Arc<RwLock<Session>>, state: SessionState) {
        shared.write().await.state = state;
    }

    async fn emit(&self, shared: &Arc<RwLock<Session>>, payload: EventPayload) {
        let (session_id, parent_session_id) = {
            let guard = shared.read().await;
            (guard.id.clone(), guard.parent_session_id.clone())
        };
        let seq = self
            .bus
            .publish(&session_id, parent_session_id.as_deref(), payload)
            .await;
        shared.write().await.last_event_seq = seq;
    }

    async fn finish_completed(&self, shared: &Arc<RwLock<Session>>, plan: Plan) {
        let (plan_json, center_rounds, participating_agents) = {
            let mut guard = shared.write().await;
            guard.plan = Some(plan.clone());
            guard.state = SessionState::Completed;
            (
                guard
                    .plan
                    .as_ref()
                    .and_then(|p| p.structured.as_ref())
                    .and_then(|s| serde_json::to_value(s).ok()),
                guard.rounds.len(),
                guard.succeeded_agent_ids(),
            )
        };
        self.emit(
            shared,
            EventPayload::PlanReady {
                plan_text: plan.text,
                plan_json,
                center_rounds,
                participating_agents,
            },
        )
        .await;
    }

    async fn finish_failed(&self, shared: &Arc<RwLock<Session>>, reason: String) {
        {
            let mut guard = shared.write().await;
            guard.state = SessionState::Failed;
            guard.terminal_reason = Some(reason.clone());
        }
        self.emit(shared, EventPayload::SessionFailed { reason }).await;
    }

    async fn finish_cancelled(&self, shared: &Arc<RwLock<Session>>, reason: &str) {
        {
            let mut guard = shared.write().await;
            guard.state = SessionState::Cancelled;
            guard.terminal_reason = Some(reason.to_string());
        }
        self.emit(
            shared,
            EventPayload::SessionCancelled {
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn record_offer(&self, shared: &Arc<RwLock<Session>>, outcome: OfferOutcome) {
        shared.write().await.offers.push(outcome.clone());
        if let OfferOutcome::Received(offer) = outcome {
            self.emit(
                shared,
                EventPayload::OfferReceived {
                    agent_id: offer.agent_id,
                    content: offer.content,
                    capabilities: offer.capabilities,
                },
            )
            .await;
        }
    }

    async fn wait_for_confirmation(inbox: &mut mpsc::Receiver<SessionInput>) -> GateOutcome {
        match inbox.recv().await {
            Some(SessionInput::Confirm {
                formulated_text,
                reply,
            }) => {
                let _ = reply.send(Ok(()));
                GateOutcome::Confirmed(formulated_text)
            }
            Some(SessionInput::Cancel { reply }) => {
                let _ = reply.send(());
                GateOutcome::Cancelled("cancelled".to_string())
            }
            // Nobody left to confirm: the session can never proceed.
            None => GateOutcome::Cancelled("cancelled".to_string()),
        }
    }

    /// Resolve the selection stage: either the fixed participant subset of a
    /// sub-negotiation, or a full resonance pass over the active registry.
    async fn select_agents(
        &self,
        shared: &Arc<RwLock<Session>>,
        inbox: &mut mpsc::Receiver<SessionInput>,
        confirmed_demand: &str,
        k_star: usize,
        min_score: f32,
    ) -> Interrupt<Result<(Vec<AgentProfile>, ResonanceOutcome), String>> {
        let fixed = shared.read().await.fixed_participants.clone();

        if let Some(participant_ids) = fixed {
            let mut profiles = Vec::new();
            for agent_id in &participant_ids {
                match self.profiles.get_profile(agent_id).await {
                    Ok(profile) => profiles.push(profile),
                    Err(e) => {
                        log::warn!(
                            "sub-negotiation participant '{}' has no profile: {}",
                            agent_id,
                            e
                        );
                    }
                }
            }
            let outcome = ResonanceOutcome {
                selected: profiles
                    .iter()
                    .map(|p| ResonanceMatch {
                        agent_id: p.agent_id.clone(),
                        score: 1.0,
                    })
                    .collect(),
                filtered: Vec::new(),
            };
            return Interrupt::Done(Ok((profiles, outcome)));
        }

        let selection = async {
            let agent_ids = self
                .profiles
                .list_active_agents()
                .await
                .map_err(|e| format!("profile_source_failed: {}", e))?;

            let mut profiles = Vec::new();
            for agent_id in &agent_ids {
                match self.profiles.get_profile(agent_id).await {
                    Ok(profile) => profiles.push(profile),
                    Err(e) => log::warn!("skipping agent '{}': {}", agent_id, e),
                }
            }
            if profiles.is_empty() {
                return Ok((Vec::new(), ResonanceOutcome::default()));
            }

            let demand_vector = self
                .encoder
                .encode(confirmed_demand)
                .await
                .map_err(|e| format!("encoding_failed: {}", e))?;

            // Profile vectors are encoded concurrently and served from the
            // content-hash cache across sessions.
            let encoded = join_all(profiles.iter().map(|profile| async move {
                self.cache
                    .get_or_encode(&*self.encoder, &profile.profile_text)
                    .await
                    .map(|vector| AgentVector {
                        agent_id: profile.agent_id.clone(),
                        vector,
                    })
            }))
            .await;

            let mut agent_vectors = Vec::new();
            for (profile, result) in profiles.iter().zip(encoded) {
                match result {
                    Ok(av) => agent_vectors.push(av),
                    Err(e) => {
                        log::warn!("skipping agent '{}': encoding failed: {}", profile.agent_id, e)
                    }
                }
            }

            let outcome = self
                .detector
                .detect(&demand_vector, &agent_vectors, k_star, min_score);

            let selected_profiles: Vec<AgentProfile> = outcome
                .selected
                .iter()
                .filter_map(|m| {
                    profiles
                        .iter()
                        .find(|p| p.agent_id == m.agent_id)
                        .cloned()
                })
                .collect();
            Ok((selected_profiles, outcome))
        };

        run_until_cancel(selection, inbox, SessionState::Encoding).await
    }

    async fn drive(
        self: Arc<Self>,
        shared: Arc<RwLock<Session>>,
        mut inbox: mpsc::Receiver<SessionInput>,
        options: SubmitOptions,
    ) {
        let (raw_intent, auto_confirm) = {
            let guard = shared.read().await;
            (guard.demand.raw_intent.clone(), guard.auto_confirm)
        };
        let k_star = options.k_star.unwrap_or(self.config.k_star);
        let min_score = options
            .min_resonance_score
            .unwrap_or(self.config.min_resonance_score);

        // ── formulating ──────────────────────────────────────────────
        self.set_state(&shared, SessionState::Formulating).await;

        let formulation_ctx = FormulationContext {
            raw_intent,
            profile_hints: options.profile_hints.clone(),
        };
        let demand = match run_until_cancel(
            self.runner.run(&*self.formulation, &formulation_ctx),
            &mut inbox,
            SessionState::Formulating,
        )
        .await
        {
            Interrupt::Cancelled => {
                return self.finish_cancelled(&shared, "cancelled").await;
            }
            Interrupt::Done(Err(e)) => {
                return self
                    .finish_failed(&shared, format!("formulation_failed: {}", e))
                    .await;
            }
            Interrupt::Done(Ok(demand)) => demand,
        };

        {
            let mut guard = shared.write().await;
            guard.demand.set_formulated(&demand.formulated_text);
            guard.state = SessionState::AwaitingConfirmation;
        }
        self.emit(
            &shared,
            EventPayload::FormulationReady {
                raw_intent: formulation_ctx.raw_intent.clone(),
                formulated_text: demand.formulated_text.clone(),
                enrichments: if demand.enrichments.is_empty() {
                    None
                } else {
                    Some(demand.enrichments.clone())
                },
            },
        )
        .await;

        // ── confirmation gate ────────────────────────────────────────
        let amended = if auto_confirm {
            None
        } else {
            let gate = Self::wait_for_confirmation(&mut inbox);
            let outcome = match self.config.confirmation_timeout {
                Some(deadline) => tokio::time::timeout(deadline, gate)
                    .await
                    .unwrap_or(GateOutcome::Cancelled("confirmation_timeout".to_string())),
                None => gate.await,
            };
            match outcome {
                GateOutcome::Cancelled(reason) => {
                    return self.finish_cancelled(&shared, &reason).await;
                }
                GateOutcome::Confirmed(amended) => amended,
            }
        };

        let confirmed_demand = {
            let mut guard = shared.write().await;
            guard.demand.freeze(amended);
            guard.state = SessionState::Encoding;
            guard.demand.confirmed_text().to_string()
        };
        self.emit(
            &shared,
            EventPayload::FormulationConfirmed {
                formulated_text: confirmed_demand.clone(),
            },
        )
        .await;

        // ── encoding / resonance ─────────────────────────────────────
        let (selected_profiles, resonance) = match self
            .select_agents(&shared, &mut inbox, &confirmed_demand, k_star, min_score)
            .await
        {
            Interrupt::Cancelled => {
                return self.finish_cancelled(&shared, "cancelled").await;
            }
            Interrupt::Done(Err(reason)) => {
                return self.finish_failed(&shared, reason).await;
            }
            Interrupt::Done(Ok(result)) => result,
        };

        if selected_profiles.is_empty() {
            return self.finish_failed(&shared, "no_agents".to_string()).await;
        }

        {
            let mut guard = shared.write().await;
            guard.selection = Some(AgentSelection {
                selected: resonance.selected.clone(),
                filtered: resonance.filtered.clone(),
                selected_at: Utc::now(),
            });
            guard.state = SessionState::Offering;
        }
        self.emit(
            &shared,
            EventPayload::ResonanceActivated {
                agents: resonance
                    .selected
                    .iter()
                    .map(|m| ScoredAgent {
                        agent_id: m.agent_id.clone(),
                        resonance_score: m.score,
                    })
                    .collect(),
                filtered_agents: resonance
                    .filtered
                    .iter()
                    .map(|m| ScoredAgent {
                        agent_id: m.agent_id.clone(),
                        resonance_score: m.score,
                    })
                    .collect(),
            },
        )
        .await;

        // ── offering: fan out, then hold at the barrier ──────────────
        let total = selected_profiles.len();
        let (offer_tx, mut offer_rx) = mpsc::channel::<OfferOutcome>(total);
        let mut offer_tasks = Vec::with_capacity(total);

        for profile in &selected_profiles {
            let peer_names: Vec<String> = selected_profiles
                .iter()
                .filter(|p| p.agent_id != profile.agent_id)
                .flat_map(|p| {
                    vec![p.display_name.clone(), p.agent_id.clone()].into_iter()
                })
                .collect();
            let ctx = OfferContext {
                demand: confirmed_demand.clone(),
                profile: profile.clone(),
                peer_names,
            };
            let runner = self.runner.clone();
            let offer_skill = self.offer.clone();
            let offer_timeout = self.config.offer_timeout;
            let tx = offer_tx.clone();

            offer_tasks.push(tokio::spawn(async move {
                let model = runner.model_name().to_string();
                let run = runner.run(&*offer_skill, &ctx);
                let result = match offer_timeout {
                    Some(deadline) => match tokio::time::timeout(deadline, run).await {
                        Ok(result) => result,
                        Err(_) => Err(SkillError::Timeout(deadline)),
                    },
                    None => run.await,
                };
                let outcome = match result {
                    Ok(draft) => OfferOutcome::Received(Offer {
                        agent_id: ctx.profile.agent_id.clone(),
                        content: draft.content,
                        capabilities: draft.capabilities,
                        model: Some(model),
                        received_at: Utc::now(),
                    }),
                    Err(e) => OfferOutcome::Failed {
                        agent_id: ctx.profile.agent_id.clone(),
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(outcome).await;
            }));
        }
        drop(offer_tx);

        let mut received = 0usize;
        let mut inbox_open = true;
        while received < total {
            if inbox_open {
                tokio::select! {
                    maybe = offer_rx.recv() => match maybe {
                        Some(outcome) => {
                            self.record_offer(&shared, outcome).await;
                            received += 1;
                        }
                        None => break,
                    },
                    maybe = inbox.recv() => match maybe {
                        Some(SessionInput::Cancel { reply }) => {
                            // Abandon pending offer tasks; late results are
                            // discarded, not recorded.
                            for task in &offer_tasks {
                                task.abort();
                            }
                            let _ = reply.send(());
                            return self.finish_cancelled(&shared, "cancelled").await;
                        }
                        Some(SessionInput::Confirm { reply, .. }) => {
                            let _ = reply.send(Err(EngineError::InvalidState {
                                operation: "confirm",
                                state: SessionState::Offering,
                            }));
                        }
                        None => inbox_open = false,
                    },
                }
            } else {
                match offer_rx.recv().await {
                    Some(outcome) => {
                        self.record_offer(&shared, outcome).await;
                        received += 1;
                    }
                    None => break,
                }
            }
        }

        let succeeded = shared
            .read()
            .await
            .offers
            .iter()
            .filter(|o| o.is_success())
            .count();
        if succeeded == 0 {
            return self
                .finish_failed(&shared, "all_offers_failed".to_string())
                .await;
        }

        self.set_state(&shared, SessionState::BarrierWaiting).await;
        self.emit(
            &shared,
            EventPayload::BarrierComplete {
                agent_count: total,
                succeeded_count: succeeded,
            },
        )
        .await;
        self.set_state(&shared, SessionState::Synthesizing).await;

        // ── synthesizing: the center loop ────────────────────────────
        let flow = run_center_loop(CenterLoopDeps {
            runner: &self.runner,
            center: &*self.center,
            registry: &self.registry,
            bus: &self.bus,
            session: &shared,
            inbox: &mut inbox,
            participants: &selected_profiles,
            sub_negotiator: &*self,
            max_center_rounds: self.config.max_center_rounds,
            max_recursion_depth: self.config.max_recursion_depth,
        })
        .await;

        match flow {
            CenterFlow::Plan(plan) => self.finish_completed(&shared, plan).await,
            CenterFlow::Failed(reason) => self.finish_failed(&shared, reason).await,
            CenterFlow::Cancelled => self.finish_cancelled(&shared, "cancelled").await,
        }
    }
}

#[async_trait]
impl SubNegotiator for EngineCore {
    async fn negotiate(
        &self,
        parent_session_id: &str,
        topic: &str,
        participant_ids: &[String],
        depth: usize,
    ) -> Result<SubNegotiationOutcome, Box<dyn Error + Send + Sync>> {
        let core = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Box::new(EngineError::Unavailable) as Box<dyn Error + Send + Sync>)?;

        let (child_session_id, driver) = EngineCore::spawn_session(
            &core,
            topic,
            SubmitOptions::default(),
            Some(parent_session_id.to_string()),
            depth,
            true,
            Some(participant_ids.to_vec()),
        )
        .await
        .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)?;

        // Parent-scoped announcement; child events run under the child id
        // with `parent_session_id` set.
        if let Some(parent) = core.store.get(parent_session_id) {
            let grandparent = parent.shared.read().await.parent_session_id.clone();
            let seq = core
                .bus
                .publish(
                    parent_session_id,
                    grandparent.as_deref(),
                    EventPayload::SubNegotiationStarted {
                        child_session_id: child_session_id.clone(),
                        topic: topic.to_string(),
                        participant_ids: participant_ids.to_vec(),
                    },
                )
                .await;
            parent.shared.write().await.last_event_seq = seq;
        }

        let _ = driver.await;

        let child = core
            .store
            .get(&child_session_id)
            .ok_or_else(|| -> Box<dyn Error + Send + Sync> {
                "sub-negotiation session disappeared".into()
            })?;
        let guard = child.shared.read().await;
        match guard.state {
            SessionState::Completed => Ok(SubNegotiationOutcome {
                child_session_id: child_session_id.clone(),
                plan_text: guard
                    .plan
                    .as_ref()
                    .map(|p| p.text.clone())
                    .unwrap_or_default(),
            }),
            SessionState::Failed => Err(format!(
                "sub-negotiation failed: {}",
                guard.terminal_reason.as_deref().unwrap_or("unknown")
            )
            .into()),
            SessionState::Cancelled => Err("sub-negotiation was cancelled".into()),
            other => Err(format!(
                "sub-negotiation ended in non-terminal state {}",
                other.as_str()
            )
            .into()),
        }
    }
}
