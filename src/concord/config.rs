//! Configuration for the negotiation engine.
//!
//! Provides the [`EngineConfig`] struct with sensible defaults for selection,
//! round caps, recursion bounds, and timeouts.  Users construct it manually —
//! no file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use concord::config::EngineConfig;
//!
//! // Use the defaults
//! let config = EngineConfig::default();
//! assert_eq!(config.k_star, 5);
//!
//! // Or adjust the knobs that matter to you
//! let config = EngineConfig {
//!     k_star: 3,
//!     confirmation_timeout: Some(Duration::from_secs(120)),
//!     ..EngineConfig::default()
//! };
//! ```

use std::time::Duration;

/// Tunables for a [`NegotiationEngine`](crate::concord::engine::NegotiationEngine).
///
/// This struct is intentionally minimal and users construct it however they
/// want.  No TOML, YAML, or other config-file parsing dependencies are
/// introduced.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of agents selected by resonance (the top-k bound).
    pub k_star: usize,
    /// Minimum cosine similarity an agent must reach to be selected.
    pub min_resonance_score: f32,
    /// Number of free center rounds before the terminal round is forced.
    pub max_center_rounds: usize,
    /// Maximum sub-negotiation depth.  The root session is depth 0; a value of
    /// 1 allows one layer of `start_discovery` children.
    pub max_recursion_depth: usize,
    /// Deadline applied to every individual skill invocation.
    pub skill_timeout: Duration,
    /// Optional deadline on the confirmation gate.  `None` waits indefinitely;
    /// expiry cancels the session with reason `confirmation_timeout`.
    pub confirmation_timeout: Option<Duration>,
    /// Optional per-agent deadline on offer production.  `None` lets offers
    /// wait indefinitely on the barrier.
    pub offer_timeout: Option<Duration>,
    /// How many times a skill is re-prompted after a validation failure before
    /// the invocation is considered failed.  Model/transport errors are never
    /// retried.
    pub max_validation_retries: usize,
    /// Capacity of each subscriber's event buffer beyond the replayed history.
    /// A subscriber that falls this far behind the live stream is disconnected.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    /// Defaults: k\*=5, threshold 0.3, two free center rounds, recursion depth
    /// 1, 60 s skill timeout, no confirmation/offer timeouts.
    ///
    /// # Example
    ///
    /// ```rust
    /// use concord::config::EngineConfig;
    ///
    /// let config = EngineConfig::default();
    /// assert_eq!(config.max_center_rounds, 2);
    /// assert_eq!(config.max_recursion_depth, 1);
    /// assert!(config.confirmation_timeout.is_none());
    /// ```
    fn default() -> Self {
        Self {
            k_star: 5,
            min_resonance_score: 0.3,
            max_center_rounds: 2,
            max_recursion_depth: 1,
            skill_timeout: Duration::from_secs(60),
            confirmation_timeout: None,
            offer_timeout: None,
            max_validation_retries: 1,
            event_buffer: 64,
        }
    }
}
