//! Credential pool with daily budgets and failover
//!
//! The pool holds interchangeable API credentials in priority order: the
//! first usable credential wins, so a primary credential stays dominant and
//! the rest only absorb traffic when it is exhausted or unhealthy. Failures
//! are classified onto the credential that caused them, and a calendar-day
//! rollover clears usage and relaxes quota-exceeded credentials back to
//! active (a half-open circuit breaker).
//!
//! All mutation goes through one lock. The scheduler guarantees a single
//! in-flight attempt, so there is no contention in the hot path; the lock
//! exists for the administrative surface.

use crate::clock::Clock;
use crate::errors::GenerationError;
use crate::events::{Event, EventBus, SwitchReason};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Health of a single credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    /// Hit its provider-side quota; relaxed back to `Active` at the next
    /// daily rollover.
    QuotaExceeded,
    /// Rejected with 401/403; stays blocked until an operator resets it.
    Blocked,
    /// Any other classified failure.
    Failed,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialStatus::Active => "active",
            CredentialStatus::QuotaExceeded => "quota_exceeded",
            CredentialStatus::Blocked => "blocked",
            CredentialStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One API credential with its own daily budget and health status.
#[derive(Debug, Clone)]
pub struct Credential {
    pub secret: String,
    pub name: String,
    pub daily_limit: u32,
    pub used: u32,
    pub last_reset: NaiveDate,
    pub status: CredentialStatus,
    pub last_error: Option<String>,
}

impl Credential {
    /// Usable means healthy and under its daily budget. The budget is a
    /// target, not a hard wall: an in-flight request may still push `used`
    /// past it before the provider rejects the next call.
    fn usable(&self) -> bool {
        self.status == CredentialStatus::Active && self.used < self.daily_limit
    }
}

/// Classify a provider failure onto a credential status.
///
/// Status codes arrive embedded in the error text (the backend formats them
/// in), so plain substring matching covers both shapes.
pub(crate) fn classify_failure(error: &str) -> CredentialStatus {
    let lower = error.to_ascii_lowercase();
    if lower.contains("quota") || lower.contains("429") {
        CredentialStatus::QuotaExceeded
    } else if lower.contains("403") || lower.contains("401") {
        CredentialStatus::Blocked
    } else {
        CredentialStatus::Failed
    }
}

/// Per-credential view for the stats surface. Never carries the secret.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub name: String,
    pub status: CredentialStatus,
    pub used: u32,
    pub daily_limit: u32,
    pub usage_percentage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Aggregate pool view for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialPoolStats {
    pub current: String,
    pub total: usize,
    pub active: usize,
    pub quota_exceeded: usize,
    pub failed: usize,
    pub credentials: Vec<CredentialStats>,
}

struct PoolInner {
    credentials: Vec<Credential>,
    current: usize,
}

/// Priority-ordered pool of interchangeable credentials.
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool").finish_non_exhaustive()
    }
}

impl CredentialPool {
    /// Build a pool from `(secret, name, daily_limit)` seeds.
    ///
    /// Fails with [`GenerationError::Configuration`] when no usable seed is
    /// provided; the orchestrator refuses to start without at least one
    /// credential.
    pub fn new(
        seeds: Vec<(String, String, u32)>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, GenerationError> {
        let today = clock.today();
        let credentials: Vec<Credential> = seeds
            .into_iter()
            .filter(|(secret, _, _)| !secret.trim().is_empty())
            .map(|(secret, name, daily_limit)| Credential {
                secret: secret.trim().to_string(),
                name,
                daily_limit,
                used: 0,
                last_reset: today,
                status: CredentialStatus::Active,
                last_error: None,
            })
            .collect();

        if credentials.is_empty() {
            return Err(GenerationError::configuration(
                "no usable credentials configured",
            ));
        }

        info!(total = credentials.len(), "credential pool initialized");
        Ok(Self {
            inner: Mutex::new(PoolInner {
                credentials,
                current: 0,
            }),
            clock,
            events,
        })
    }

    /// The credential the next attempt should use.
    ///
    /// Scans in pool order for the first active, under-budget credential. If
    /// every credential is exhausted or unhealthy, returns the first one
    /// anyway so the provider surfaces the real quota/auth error instead of
    /// the pool inventing one.
    pub async fn current(&self) -> Credential {
        let mut inner = self.inner.lock().await;
        self.roll_daily(&mut inner);

        if let Some(idx) = inner.credentials.iter().position(Credential::usable) {
            inner.current = idx;
        } else {
            inner.current = 0;
        }
        inner.credentials[inner.current].clone()
    }

    /// Rotate to the next usable credential, wrapping around pool order.
    ///
    /// Returns whether a usable alternate was found. Emits an
    /// `apiKeySwitched` event on success.
    pub async fn advance(&self, reason: SwitchReason) -> bool {
        let mut inner = self.inner.lock().await;
        self.advance_locked(&mut inner, reason, None)
    }

    fn advance_locked(
        &self,
        inner: &mut PoolInner,
        reason: SwitchReason,
        skip: Option<usize>,
    ) -> bool {
        let len = inner.credentials.len();
        let from = inner.current;
        let found = (1..=len)
            .map(|offset| (from + offset) % len)
            .find(|&idx| Some(idx) != skip && inner.credentials[idx].usable());

        match found {
            Some(idx) => {
                inner.current = idx;
                let to = inner.credentials[idx].name.clone();
                let from_name = inner.credentials[from].name.clone();
                info!(from = %from_name, to = %to, ?reason, "switched credential");
                if idx != from {
                    self.events.publish(Event::ApiKeySwitched {
                        from: from_name,
                        to,
                        reason,
                    });
                }
                true
            }
            None => {
                warn!("no usable alternate credential available");
                false
            }
        }
    }

    /// Classify a failure onto the currently selected credential, then try
    /// to rotate to an alternate. Returns whether the rotation found one.
    pub async fn mark_failed(&self, error: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let status = classify_failure(error);
        let current = inner.current;
        {
            let cred = &mut inner.credentials[current];
            cred.status = status;
            cred.last_error = Some(error.to_string());
            warn!(credential = %cred.name, %status, error = %error, "credential marked unhealthy");
        }
        self.advance_locked(&mut inner, SwitchReason::Fallback, None)
    }

    /// Count one request against the current credential's daily budget.
    pub async fn increment_usage(&self) {
        let mut inner = self.inner.lock().await;
        let current = inner.current;
        let cred = &mut inner.credentials[current];
        cred.used += 1;
        if cred.used * 10 >= cred.daily_limit * 9 {
            warn!(
                credential = %cred.name,
                used = cred.used,
                daily_limit = cred.daily_limit,
                "credential approaching daily limit"
            );
        }
    }

    /// Calendar-day rollover: clear usage on stale credentials and relax
    /// `QuotaExceeded` back to `Active`. Idempotent within a day.
    fn roll_daily(&self, inner: &mut PoolInner) {
        let today = self.clock.today();
        for cred in &mut inner.credentials {
            if cred.last_reset != today {
                debug!(credential = %cred.name, "daily usage rollover");
                cred.used = 0;
                cred.last_reset = today;
                if cred.status == CredentialStatus::QuotaExceeded {
                    cred.status = CredentialStatus::Active;
                    cred.last_error = None;
                }
            }
        }
    }

    /// Add a credential to the back of the pool.
    pub async fn add(
        &self,
        secret: &str,
        name: &str,
        daily_limit: u32,
    ) -> Result<(), GenerationError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(GenerationError::configuration("empty credential secret"));
        }

        let mut inner = self.inner.lock().await;
        if inner
            .credentials
            .iter()
            .any(|c| c.secret == secret || c.name == name)
        {
            return Err(GenerationError::configuration(format!(
                "credential '{name}' already exists"
            )));
        }

        inner.credentials.push(Credential {
            secret: secret.to_string(),
            name: name.to_string(),
            daily_limit,
            used: 0,
            last_reset: self.clock.today(),
            status: CredentialStatus::Active,
            last_error: None,
        });

        let total = inner.credentials.len();
        info!(credential = %name, daily_limit, total, "credential added");
        self.events.publish(Event::ApiKeyAdded {
            name: name.to_string(),
            daily_limit,
            total_credentials: total,
        });
        Ok(())
    }

    /// Remove a credential by name.
    ///
    /// Rejects the removal when it would empty the pool, or when it targets
    /// the active credential and no live alternate exists to take over.
    pub async fn remove(&self, name: &str) -> Result<(), GenerationError> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .credentials
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                GenerationError::configuration(format!("credential '{name}' not found"))
            })?;

        if inner.credentials.len() == 1 {
            return Err(GenerationError::configuration(
                "cannot remove the last credential",
            ));
        }

        if idx == inner.current
            && !self.advance_locked(&mut inner, SwitchReason::Fallback, Some(idx))
        {
            return Err(GenerationError::configuration(
                "cannot remove the active credential: no usable alternate",
            ));
        }

        inner.credentials.remove(idx);
        if inner.current > idx {
            inner.current -= 1;
        }

        let total = inner.credentials.len();
        info!(credential = %name, total, "credential removed");
        self.events.publish(Event::ApiKeyRemoved {
            name: name.to_string(),
            total_credentials: total,
        });
        Ok(())
    }

    /// Operator-requested switch to a named credential. The target must be
    /// active and under its daily budget.
    pub async fn manual_switch(&self, name: &str) -> Result<(), GenerationError> {
        let mut inner = self.inner.lock().await;
        self.roll_daily(&mut inner);

        let idx = inner
            .credentials
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                GenerationError::configuration(format!("credential '{name}' not found"))
            })?;

        let target = &inner.credentials[idx];
        if target.status != CredentialStatus::Active {
            return Err(GenerationError::configuration(format!(
                "credential '{name}' is not active (status: {})",
                target.status
            )));
        }
        if target.used >= target.daily_limit {
            return Err(GenerationError::configuration(format!(
                "credential '{name}' has exceeded its daily limit"
            )));
        }

        let from = inner.credentials[inner.current].name.clone();
        inner.current = idx;
        info!(from = %from, to = %name, "manual credential switch");
        self.events.publish(Event::ApiKeySwitched {
            from,
            to: name.to_string(),
            reason: SwitchReason::Manual,
        });
        Ok(())
    }

    /// Reset a credential's status back to active, clearing its last error.
    /// Useful for recovering a credential blocked by a transient upstream
    /// misclassification.
    pub async fn reset_status(&self, name: &str) -> Result<(), GenerationError> {
        let mut inner = self.inner.lock().await;
        let cred = inner
            .credentials
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                GenerationError::configuration(format!("credential '{name}' not found"))
            })?;

        let previous = cred.status;
        cred.status = CredentialStatus::Active;
        cred.last_error = None;
        info!(credential = %name, %previous, "credential status reset");
        self.events.publish(Event::ApiKeyStatusReset {
            name: name.to_string(),
            previous_status: previous.to_string(),
        });
        Ok(())
    }

    /// Snapshot of every credential's health and usage.
    pub async fn stats(&self) -> CredentialPoolStats {
        let mut inner = self.inner.lock().await;
        self.roll_daily(&mut inner);

        let credentials: Vec<CredentialStats> = inner
            .credentials
            .iter()
            .map(|c| CredentialStats {
                name: c.name.clone(),
                status: c.status,
                used: c.used,
                daily_limit: c.daily_limit,
                usage_percentage: if c.daily_limit == 0 {
                    100
                } else {
                    c.used * 100 / c.daily_limit
                },
                last_error: c.last_error.clone(),
            })
            .collect();

        CredentialPoolStats {
            current: inner.credentials[inner.current].name.clone(),
            total: inner.credentials.len(),
            active: count_status(&inner.credentials, CredentialStatus::Active),
            quota_exceeded: count_status(&inner.credentials, CredentialStatus::QuotaExceeded),
            failed: count_status(&inner.credentials, CredentialStatus::Failed)
                + count_status(&inner.credentials, CredentialStatus::Blocked),
            credentials,
        }
    }
}

fn count_status(credentials: &[Credential], status: CredentialStatus) -> usize {
    credentials.iter().filter(|c| c.status == status).count()
}
