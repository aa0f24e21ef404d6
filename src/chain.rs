//! Ordered model fallback chain
//!
//! Model configurations are listed most-preferred first; the only mutable
//! pointer is the active index. `fallback` walks toward older models and is
//! terminal at the last entry, while upgrades and migrations (driven by the
//! retry controller's probes) can walk back toward the front. Parameter
//! adjustment mutates the active config in place to recover from
//! provider-side payload rejections without burning a model switch.

use crate::clock::Clock;
use crate::errors::GenerationError;
use crate::events::{Event, EventBus};
use bon::Builder;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One entry of a model's safety policy, passed through to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub category: String,
    pub threshold: String,
}

/// A generation model configuration. Immutable once defined, except for the
/// in-place reductions applied by [`ModelChain::adjust_parameters`].
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct ModelConfig {
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub version: String,
    #[serde(default = "default_max_output_tokens")]
    #[builder(default = default_max_output_tokens())]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    #[builder(default = default_temperature())]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    #[builder(default = default_top_p())]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    #[builder(default = default_top_k())]
    pub top_k: u32,
    #[serde(default)]
    #[builder(default)]
    pub safety_policy: Vec<SafetyRule>,
    #[serde(default)]
    #[builder(into, default)]
    pub description: String,
}

fn default_max_output_tokens() -> u32 {
    4096
}
fn default_temperature() -> f64 {
    0.3
}
fn default_top_p() -> f64 {
    0.8
}
fn default_top_k() -> u32 {
    40
}

/// How a backward (more-preferred) index move was triggered, for event
/// naming: daily probes upgrade, operators migrate.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AdoptKind {
    Upgrade,
    Migrate,
}

/// Chain snapshot for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct ModelChainStats {
    pub current: ModelConfig,
    pub available: Vec<ModelConfig>,
    pub is_latest: bool,
}

struct ChainInner {
    configs: Vec<ModelConfig>,
    active: usize,
    last_probe: Option<NaiveDate>,
}

/// The ordered chain of model configurations.
pub struct ModelChain {
    inner: Mutex<ChainInner>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl fmt::Debug for ModelChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelChain").finish_non_exhaustive()
    }
}

impl ModelChain {
    pub fn new(
        configs: Vec<ModelConfig>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, GenerationError> {
        if configs.is_empty() {
            return Err(GenerationError::configuration("no models configured"));
        }
        Ok(Self {
            inner: Mutex::new(ChainInner {
                configs,
                active: 0,
                last_probe: None,
            }),
            clock,
            events,
        })
    }

    /// The active model configuration.
    pub async fn current(&self) -> ModelConfig {
        let inner = self.inner.lock().await;
        inner.configs[inner.active].clone()
    }

    /// Whether the active model is the most preferred one.
    pub async fn is_latest(&self) -> bool {
        self.inner.lock().await.active == 0
    }

    /// Move the active index one step toward less-preferred models.
    ///
    /// Returns false (and leaves state unchanged) when already at the last
    /// entry; callers then exhaust their retry budget rather than indexing
    /// past the chain.
    pub async fn fallback(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.active + 1 >= inner.configs.len() {
            warn!(
                model = %inner.configs[inner.active].name,
                "no fallback model available"
            );
            return false;
        }

        let from = inner.configs[inner.active].name.clone();
        inner.active += 1;
        let to = inner.configs[inner.active].name.clone();
        info!(from = %from, to = %to, "model fallback");
        self.events.publish(Event::ModelFallback { from, to });
        true
    }

    /// Monotonically reduce the active config's temperature (floor 0.2) and
    /// output budget (floor 2048) to recover from malformed-request errors.
    pub async fn adjust_parameters(&self) {
        let mut inner = self.inner.lock().await;
        let active = inner.active;
        let config = &mut inner.configs[active];

        if config.temperature > 0.2 {
            config.temperature = (config.temperature - 0.1).max(0.2);
        }
        if config.max_output_tokens > 2048 {
            config.max_output_tokens = config.max_output_tokens.saturating_sub(1024).max(2048);
        }

        info!(
            model = %config.name,
            temperature = config.temperature,
            max_output_tokens = config.max_output_tokens,
            "adjusted model parameters"
        );
        self.events.publish(Event::ParametersAdjusted {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        });
    }

    /// Whether the daily newer-model probe should run now. Records the
    /// attempt, so at most one probe pass happens per calendar day.
    pub(crate) async fn probe_due(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let today = self.clock.today();
        if inner.last_probe == Some(today) {
            return false;
        }
        inner.last_probe = Some(today);
        true
    }

    /// Configurations strictly more preferred than the active one, in
    /// preference order.
    pub(crate) async fn more_preferred(&self) -> Vec<(usize, ModelConfig)> {
        let inner = self.inner.lock().await;
        inner.configs[..inner.active]
            .iter()
            .cloned()
            .enumerate()
            .collect()
    }

    pub(crate) async fn find(&self, name: &str) -> Option<(usize, ModelConfig)> {
        let inner = self.inner.lock().await;
        inner
            .configs
            .iter()
            .position(|c| c.name == name)
            .map(|idx| (idx, inner.configs[idx].clone()))
    }

    /// Adopt a probed index as active. Used for upgrades (daily probe found
    /// a more preferred model answering) and migrations (operator request).
    pub(crate) async fn adopt(&self, index: usize, kind: AdoptKind) {
        let mut inner = self.inner.lock().await;
        if index >= inner.configs.len() || index == inner.active {
            return;
        }
        let from = inner.configs[inner.active].name.clone();
        inner.active = index;
        let to = inner.configs[index].name.clone();
        info!(from = %from, to = %to, ?kind, "model adopted");
        self.events.publish(match kind {
            AdoptKind::Upgrade => Event::ModelUpgraded { from, to },
            AdoptKind::Migrate => Event::ModelMigrated { from, to },
        });
    }

    pub async fn stats(&self) -> ModelChainStats {
        let inner = self.inner.lock().await;
        ModelChainStats {
            current: inner.configs[inner.active].clone(),
            available: inner.configs.clone(),
            is_latest: inner.active == 0,
        }
    }
}
