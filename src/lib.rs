// src/lib.rs

// Import the top-level `concord` module.
pub mod concord;

// Surface the submodules at the crate root so callers write
// `concord::engine::...` instead of `concord::concord::engine::...`.
pub use concord::{
    center, client_wrapper, clients, config, engine, event, http_client_pool, plan, profile,
    resonance, session, skill, tool_handler,
};

// Re-exporting key items for easier external access.
pub use concord::client_wrapper::{ClientWrapper, Message, Role};
pub use concord::config::EngineConfig;
pub use concord::engine::{EngineBuilder, NegotiationEngine, SubmitOptions};
pub use concord::event::{EventPayload, EventSink, SessionEvent};
pub use concord::plan::Plan;
pub use concord::profile::{AgentProfile, InMemoryProfileSource, ProfileSource};
pub use concord::session::{SessionState, SessionStatus};
