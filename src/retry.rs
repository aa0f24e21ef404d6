//! Retry controller - executes generation attempts and failure policy
//!
//! One `execute` call owns the whole retry budget for a request. Every
//! attempt re-reads the current credential and model, races the backend call
//! against the per-request timeout, and on failure classifies the error to
//! pick a corrective action: rotate credential (retry immediately), fall
//! back to an older model, shrink request parameters, or back off and retry.
//! Side effects are strictly ordered; the next attempt never starts until
//! the pool/chain mutation for the previous failure has landed.

use crate::GenerateOptions;
use crate::backend::{BackendError, GenerationBackend};
use crate::chain::{AdoptKind, ModelChain, ModelConfig};
use crate::credentials::{Credential, CredentialPool};
use crate::errors::GenerationError;
use crate::events::{Event, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Base delay after a quota-class failure with no alternate credential.
const QUOTA_BACKOFF_BASE: Duration = Duration::from_secs(30);
/// Cap on the quota backoff.
const QUOTA_BACKOFF_CAP: Duration = Duration::from_secs(300);
/// Base delay for transient failures.
const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
/// Cap on the transient backoff.
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(10);
/// Time box for availability probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimal prompt used to test whether a model version answers at all.
const PROBE_PROMPT: &str = "Availability check; reply with a single word.";

/// Corrective action implied by a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    /// Quota or auth problem on the current credential.
    Credential,
    /// The requested model version does not exist upstream.
    ModelNotFound,
    /// The provider rejected the request payload.
    BadRequest,
    /// Anything else, including timeouts; retry after backoff.
    Transient,
}

fn classify(error: &BackendError) -> FailureKind {
    match error.status {
        Some(429) | Some(403) | Some(401) => FailureKind::Credential,
        Some(404) => FailureKind::ModelNotFound,
        Some(400) => FailureKind::BadRequest,
        _ => {
            let lower = error.message.to_ascii_lowercase();
            if lower.contains("quota") {
                FailureKind::Credential
            } else if lower.contains("not found") {
                FailureKind::ModelNotFound
            } else if lower.contains("invalid") {
                FailureKind::BadRequest
            } else {
                FailureKind::Transient
            }
        }
    }
}

/// The typed error a failure surfaces as when the retry budget runs out.
fn typed_error(error: &BackendError, kind: FailureKind, timeout_ms: u64) -> GenerationError {
    match kind {
        FailureKind::Credential => match error.status {
            Some(403) | Some(401) => GenerationError::AuthDenied(error.message.clone()),
            _ => GenerationError::QuotaExceeded(error.message.clone()),
        },
        FailureKind::BadRequest => GenerationError::InvalidRequest(error.message.clone()),
        FailureKind::ModelNotFound => GenerationError::ServerError(error.message.clone()),
        FailureKind::Transient => {
            if error.message.contains("timed out") {
                GenerationError::Timeout(timeout_ms)
            } else {
                GenerationError::ServerError(error.message.clone())
            }
        }
    }
}

fn quota_backoff(attempt: u32) -> Duration {
    exponential(QUOTA_BACKOFF_BASE, attempt, QUOTA_BACKOFF_CAP)
}

fn transient_backoff(attempt: u32) -> Duration {
    exponential(TRANSIENT_BACKOFF_BASE, attempt, TRANSIENT_BACKOFF_CAP)
}

fn exponential(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    (base * factor).min(cap)
}

/// Executes generation attempts against the backend, coordinating the
/// credential pool and model chain on failure.
#[derive(Debug)]
pub struct RetryController {
    backend: Arc<dyn GenerationBackend>,
    pool: Arc<CredentialPool>,
    chain: Arc<ModelChain>,
    events: EventBus,
    /// Whether the once-per-day newer-model probe runs ahead of requests.
    /// Off by default: probes burn real quota purely to test availability.
    daily_version_probe: bool,
}

impl RetryController {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        pool: Arc<CredentialPool>,
        chain: Arc<ModelChain>,
        events: EventBus,
        daily_version_probe: bool,
    ) -> Self {
        Self {
            backend,
            pool,
            chain,
            events,
            daily_version_probe,
        }
    }

    /// Run one generation request through the full retry budget.
    pub async fn execute(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, GenerationError> {
        if self.daily_version_probe && self.chain.probe_due().await {
            // Best-effort; a failed probe never fails the request.
            self.check_for_newer_versions().await;
        }

        let retries = options.retries.max(1);
        let timeout_ms = options.timeout.as_millis() as u64;
        let mut last_error: Option<GenerationError> = None;

        for attempt in 1..=retries {
            // Re-read on every attempt; a previous failure may have rotated
            // either selection.
            let credential = self.pool.current().await;
            let model = self.chain.current().await;
            debug!(
                attempt,
                retries,
                model = %model.name,
                credential = %credential.name,
                priority = ?options.priority,
                "generation attempt"
            );

            let error = match self.attempt(&credential, &model, prompt, options).await {
                Ok(text) => {
                    self.pool.increment_usage().await;
                    info!(
                        model = %model.name,
                        credential = %credential.name,
                        chars = text.len(),
                        attempt,
                        "generation succeeded"
                    );
                    self.events.publish(Event::ContentGenerated {
                        model: model.name,
                        credential: credential.name,
                        chars: text.len(),
                        attempt,
                    });
                    return Ok(text);
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            warn!(attempt, kind = ?kind, error = %error, "generation attempt failed");
            self.events.publish(Event::GenerationError {
                model: model.name.clone(),
                attempt,
                error: error.to_string(),
            });
            last_error = Some(typed_error(&error, kind, timeout_ms));

            match kind {
                FailureKind::Credential => {
                    if self.pool.mark_failed(&error.to_string()).await {
                        // A usable alternate took over; retry immediately on
                        // the remaining attempt budget.
                        continue;
                    }
                    if attempt < retries {
                        tokio::time::sleep(quota_backoff(attempt)).await;
                    }
                    self.chain.fallback().await;
                }
                FailureKind::ModelNotFound => {
                    self.chain.fallback().await;
                }
                FailureKind::BadRequest => {
                    self.chain.adjust_parameters().await;
                }
                FailureKind::Transient => {
                    if attempt < retries {
                        tokio::time::sleep(transient_backoff(attempt)).await;
                    }
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts were made".to_string());
        let model = self.chain.current().await.name;
        warn!(retries, model = %model, last_error = %last_error, "generation failed after all retries");
        self.events.publish(Event::GenerationFailed {
            model,
            retries,
            last_error: last_error.clone(),
        });
        Err(GenerationError::exhausted(retries, last_error))
    }

    /// One time-boxed backend call. A blank response counts as a failure so
    /// the attempt loop retries it instead of returning empty text.
    async fn attempt(
        &self,
        credential: &Credential,
        model: &ModelConfig,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, BackendError> {
        let call = self.backend.generate(credential, model, prompt, options);
        match timeout(options.timeout, call).await {
            Ok(Ok(text)) if text.trim().is_empty() => {
                Err(BackendError::transport("empty response from model"))
            }
            Ok(result) => result,
            Err(_) => Err(BackendError::transport(format!(
                "request timed out after {}ms",
                options.timeout.as_millis()
            ))),
        }
    }

    /// Probe every model more preferred than the active one, adopting the
    /// first that answers. Returns whether an upgrade happened.
    pub async fn check_for_newer_versions(&self) -> bool {
        for (index, config) in self.chain.more_preferred().await {
            debug!(model = %config.name, "probing more-preferred model");
            if self.probe_model(&config).await {
                self.chain.adopt(index, AdoptKind::Upgrade).await;
                return true;
            }
        }
        false
    }

    /// Forced switch to a named model, validated by a one-shot probe. The
    /// active config is untouched when the probe fails.
    pub async fn migrate_to(&self, name: &str) -> bool {
        let Some((index, config)) = self.chain.find(name).await else {
            warn!(model = %name, "migration target not in the configured chain");
            return false;
        };
        if self.probe_model(&config).await {
            self.chain.adopt(index, AdoptKind::Migrate).await;
            true
        } else {
            warn!(model = %name, "migration probe failed; keeping current model");
            false
        }
    }

    /// A single low-cost generation against a specific config. Successful
    /// probes still consume quota and are counted as usage.
    async fn probe_model(&self, config: &ModelConfig) -> bool {
        let credential = self.pool.current().await;
        let options = GenerateOptions::builder()
            .retries(1)
            .timeout(PROBE_TIMEOUT)
            .build();
        let call = self
            .backend
            .generate(&credential, config, PROBE_PROMPT, &options);
        match timeout(PROBE_TIMEOUT, call).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                self.pool.increment_usage().await;
                true
            }
            _ => false,
        }
    }
}
