//! Agent profiles and the profile lookup seam.
//!
//! An agent is a logical participant backed by a profile document.  The engine
//! treats profile storage as a keyed lookup behind [`ProfileSource`]; the
//! bundled [`InMemoryProfileSource`] covers tests and single-process
//! deployments, while database- or service-backed registries implement the
//! trait themselves.
//!
//! Registration is an admin-path concern: the engine only ever reads, and an
//! in-flight session works against the profile snapshot taken when its
//! resonance stage ran.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use tokio::sync::RwLock;

/// Identity and self-description of one registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Opaque stable identifier (e.g. `"venue-scout"`).
    pub agent_id: String,
    /// Human-readable display name (e.g. `"Venue Scout"`).
    pub display_name: String,
    /// Free-text self-description; this is what resonance encodes and what the
    /// offer skill primes the model with.
    pub profile_text: String,
    /// Free-form capability tags declared by the agent.
    pub capabilities: Vec<String>,
}

impl AgentProfile {
    pub fn new(
        agent_id: impl Into<String>,
        display_name: impl Into<String>,
        profile_text: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            profile_text: profile_text.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// Keyed lookup of agent profiles.
///
/// Writers (registration, profile edits) go through a separate admin path;
/// from the engine's view this is read-only.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Fetch one agent's profile.
    async fn get_profile(
        &self,
        agent_id: &str,
    ) -> Result<AgentProfile, Box<dyn Error + Send + Sync>>;

    /// List the ids of all agents currently eligible for selection.
    async fn list_active_agents(&self) -> Result<Vec<String>, Box<dyn Error + Send + Sync>>;
}

/// Error returned by [`InMemoryProfileSource`] for unknown agents.
#[derive(Debug, Clone)]
pub struct ProfileNotFound(pub String);

impl std::fmt::Display for ProfileNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Agent profile not found: {}", self.0)
    }
}

impl Error for ProfileNotFound {}

/// Map-backed profile source with an admin registration path.
///
/// Insertion order is preserved so `list_active_agents` is deterministic.
///
/// # Example
///
/// ```rust
/// use concord::profile::{AgentProfile, InMemoryProfileSource, ProfileSource};
///
/// # #[tokio::main]
/// # async fn main() {
/// let source = InMemoryProfileSource::new();
/// source
///     .register(AgentProfile::new(
///         "caterer",
///         "Caterer",
///         "Catering for tech events, dietary-constraint aware.",
///     ))
///     .await;
///
/// let ids = source.list_active_agents().await.unwrap();
/// assert_eq!(ids, vec!["caterer".to_string()]);
/// # }
/// ```
pub struct InMemoryProfileSource {
    profiles: RwLock<HashMap<String, AgentProfile>>,
    order: RwLock<Vec<String>>,
}

impl InMemoryProfileSource {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register or replace an agent profile (admin path).
    pub async fn register(&self, profile: AgentProfile) {
        let id = profile.agent_id.clone();
        let mut profiles = self.profiles.write().await;
        if profiles.insert(id.clone(), profile).is_none() {
            self.order.write().await.push(id);
        }
    }

    /// Remove an agent from the registry (admin path).
    pub async fn deregister(&self, agent_id: &str) -> Option<AgentProfile> {
        let removed = self.profiles.write().await.remove(agent_id);
        if removed.is_some() {
            self.order.write().await.retain(|id| id != agent_id);
        }
        removed
    }
}

impl Default for InMemoryProfileSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileSource for InMemoryProfileSource {
    async fn get_profile(
        &self,
        agent_id: &str,
    ) -> Result<AgentProfile, Box<dyn Error + Send + Sync>> {
        self.profiles
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Box::new(ProfileNotFound(agent_id.to_string())) as _)
    }

    async fn list_active_agents(&self) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        Ok(self.order.read().await.clone())
    }
}
