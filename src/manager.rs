//! Orchestrator facade
//!
//! [`AiManager`] wires the credential pool, model chain, retry controller
//! and scheduler together behind one handle and re-exposes their
//! administrative surfaces. Construction is ordinary dependency injection:
//! callers hand in a [`GenerationBackend`] (the HTTP one in production, a
//! scripted one in tests) and optionally a clock.

use crate::GenerateOptions;
use crate::backend::GenerationBackend;
use crate::batch::{BatchOptions, process_in_chunks};
use crate::chain::{ModelChain, ModelChainStats, ModelConfig};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigStream, ManagerConfig};
use crate::credentials::{CredentialPool, CredentialPoolStats};
use crate::errors::GenerationError;
use crate::events::{Event, EventBus};
use crate::retry::RetryController;
use crate::scheduler::{QueueStatus, Scheduler};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

/// Batch defaults for [`AiManager::generate_batch`]: small chunks with a
/// long pause, shaped for daily-quota-bound workloads.
const BATCH_CHUNK_SIZE: usize = 2;
const BATCH_CHUNK_DELAY: Duration = Duration::from_secs(120);

/// Combined model and scheduling view.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    #[serde(flatten)]
    pub chain: ModelChainStats,
    pub request_count: u64,
    pub daily_limit: u64,
}

/// One-call health overview of the whole orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub current_model: String,
    pub is_latest: bool,
    pub credentials: CredentialPoolStats,
    pub queue: QueueStatus,
}

/// The orchestration facade over credential failover, model fallback,
/// retries and rate-limited scheduling.
#[derive(Debug)]
pub struct AiManager {
    pool: Arc<CredentialPool>,
    chain: Arc<ModelChain>,
    controller: Arc<RetryController>,
    scheduler: Scheduler,
    events: EventBus,
}

impl AiManager {
    /// Build a manager from config with the system clock.
    pub fn new(
        config: ManagerConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, GenerationError> {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    /// Build a manager with an injected clock. Tests use this to drive
    /// calendar-day rollovers deterministically.
    pub fn with_clock(
        config: ManagerConfig,
        backend: Arc<dyn GenerationBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GenerationError> {
        let events = EventBus::default();

        let pool = Arc::new(CredentialPool::new(
            config.credential_seeds(),
            clock.clone(),
            events.clone(),
        )?);
        let chain = Arc::new(ModelChain::new(
            config.models,
            clock.clone(),
            events.clone(),
        )?);
        let controller = Arc::new(RetryController::new(
            backend,
            pool.clone(),
            chain.clone(),
            events.clone(),
            config.check_for_newer_models,
        ));
        let scheduler = Scheduler::new(
            config.scheduler,
            controller.clone(),
            clock.clone(),
            events.clone(),
        );

        let manager = Self {
            pool,
            chain,
            controller,
            scheduler,
            events,
        };
        Ok(manager)
    }

    /// Announce readiness on the event stream. Separate from construction so
    /// a subscriber attached right after `new` still sees it.
    pub async fn announce(&self) {
        let model = self.chain.current().await;
        let stats = self.pool.stats().await;
        info!(
            model = %model.name,
            credential = %stats.current,
            total_credentials = stats.total,
            "orchestrator initialized"
        );
        self.events.publish(Event::Initialized {
            model: model.name,
            credential: stats.current,
            total_credentials: stats.total,
        });
    }

    /// Generate text for one prompt, subject to scheduling, retries,
    /// credential failover and model fallback.
    pub async fn generate(
        &self,
        prompt: impl Into<String>,
        options: GenerateOptions,
    ) -> Result<String, GenerationError> {
        self.scheduler.submit(prompt.into(), options).await
    }

    /// Generate text for several prompts, chunked with long pauses between
    /// chunks. Results are in prompt order; the first failure aborts the
    /// rest of the batch.
    pub async fn generate_batch(
        &self,
        prompts: Vec<String>,
        options: GenerateOptions,
    ) -> Result<Vec<String>, GenerationError> {
        let batch = BatchOptions::builder()
            .chunk_size(BATCH_CHUNK_SIZE)
            .delay_between_chunks(BATCH_CHUNK_DELAY)
            .max_concurrent(1)
            .build();
        process_in_chunks(
            prompts,
            |prompt| {
                let options = options.clone();
                async move { self.generate(prompt, options).await }
            },
            &batch,
        )
        .await
    }

    /// Subscribe to the orchestrator's event stream.
    pub fn subscribe(&self) -> BroadcastStream<Event> {
        self.events.subscribe()
    }

    // --- model surface ---

    pub async fn current_model(&self) -> ModelConfig {
        self.chain.current().await
    }

    pub async fn model_stats(&self) -> ModelStats {
        let chain = self.chain.stats().await;
        let queue = self.scheduler.status().await;
        ModelStats {
            chain,
            request_count: queue.request_count,
            daily_limit: queue.daily_limit,
        }
    }

    /// Probe more preferred models and adopt the first one answering.
    /// Returns whether an upgrade happened.
    pub async fn check_for_newer_versions(&self) -> bool {
        self.controller.check_for_newer_versions().await
    }

    /// Probe a named model and switch to it if it answers.
    pub async fn migrate_to_model(&self, name: &str) -> bool {
        self.controller.migrate_to(name).await
    }

    // --- credential surface ---

    pub async fn api_key_stats(&self) -> CredentialPoolStats {
        self.pool.stats().await
    }

    pub async fn switch_to_api_key(&self, name: &str) -> Result<(), GenerationError> {
        self.pool.manual_switch(name).await
    }

    pub async fn reset_api_key_status(&self, name: &str) -> Result<(), GenerationError> {
        self.pool.reset_status(name).await
    }

    pub async fn add_api_key(
        &self,
        secret: &str,
        name: &str,
        daily_limit: u32,
    ) -> Result<(), GenerationError> {
        self.pool.add(secret, name, daily_limit).await
    }

    pub async fn remove_api_key(&self, name: &str) -> Result<(), GenerationError> {
        self.pool.remove(name).await
    }

    // --- scheduling surface ---

    pub async fn queue_status(&self) -> QueueStatus {
        self.scheduler.status().await
    }

    pub async fn set_daily_request_limit(&self, limit: u64) {
        self.scheduler.set_daily_limit(limit).await
    }

    pub async fn reset_daily_request_count(&self) {
        self.scheduler.reset_daily_count().await
    }

    pub async fn system_status(&self) -> SystemStatus {
        let chain = self.chain.stats().await;
        SystemStatus {
            current_model: chain.current.name,
            is_latest: chain.is_latest,
            credentials: self.pool.stats().await,
            queue: self.scheduler.status().await,
        }
    }

    /// Apply credential updates from a config stream (typically a watched
    /// config file): new entries are added, missing entries are removed.
    /// Models and scheduler limits are left untouched.
    pub async fn receive_credential_updates<S: ConfigStream + Send + 'static>(
        &self,
        stream: S,
    ) -> Result<(), anyhow::Error> {
        let pool = Arc::clone(&self.pool);
        let mut rx = stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(config) => {
                        info!("Config file changed, updating credentials...");
                        apply_credential_updates(&pool, &config).await;
                    }
                    Err(e) => {
                        error!("Failed to reload config: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

async fn apply_credential_updates(pool: &CredentialPool, config: &ManagerConfig) {
    let existing: HashSet<String> = pool
        .stats()
        .await
        .credentials
        .into_iter()
        .map(|c| c.name)
        .collect();
    let incoming: HashSet<&str> = config.credentials.iter().map(|c| c.name.as_str()).collect();

    for seed in &config.credentials {
        if !existing.contains(&seed.name) {
            if let Err(e) = pool.add(&seed.secret, &seed.name, seed.daily_limit).await {
                warn!(credential = %seed.name, error = %e, "failed to add credential from reload");
            }
        }
    }

    for name in &existing {
        if !incoming.contains(name.as_str()) {
            if let Err(e) = pool.remove(name).await {
                warn!(credential = %name, error = %e, "failed to remove credential from reload");
            }
        }
    }
}
