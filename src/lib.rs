//! Cadence - a rate-limited orchestrator for hosted text generation
//!
//! This library wraps a remote generation API with the operational machinery
//! a quota-bound deployment needs: a priority-ordered credential pool with
//! daily budgets and failover, an ordered model fallback chain, classified
//! retries with exponential backoff, a strict-FIFO rate-limited scheduler,
//! and chunked batch processing. A typed event stream reports every state
//! transition for external monitoring.
//!
//! The entry point is [`AiManager`]; everything underneath it is also public
//! for callers that want a single layer (say, just the credential pool).

use bon::Builder;
use serde::Serialize;
use std::time::Duration;

pub mod backend;
pub mod batch;
pub mod chain;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod test_utils;

pub use backend::{GenerationBackend, HttpBackend};
pub use chain::ModelConfig;
pub use clock::{Clock, SystemClock};
pub use config::{ManagerConfig, WatchedFile};
pub use errors::GenerationError;
pub use events::Event;
pub use manager::AiManager;

/// Advisory priority tag for a request. Recorded in scheduler logs; the
/// queue itself stays strictly FIFO so priorities can never starve or
/// reorder earlier submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-request knobs for a generation call.
///
/// `temperature` and `max_tokens` override the active model config for this
/// request only; unset fields fall back to the model's values.
#[derive(Debug, Clone, Builder)]
pub struct GenerateOptions {
    /// Total attempt budget, minimum 1.
    #[builder(default = 3)]
    pub retries: u32,
    /// Time box for a single attempt.
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    #[builder(default)]
    pub priority: Priority,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_builder_defaults() {
        let options = GenerateOptions::default();
        assert_eq!(options.retries, 3);
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert_eq!(options.temperature, None);
        assert_eq!(options.max_tokens, None);
        assert_eq!(options.priority, Priority::Normal);
    }
}
