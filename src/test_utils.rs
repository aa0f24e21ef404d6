//! Deterministic doubles for tests: a manually advanced clock and a
//! scripted generation backend.
//!
//! Kept in the library (not behind `cfg(test)`) so integration tests and
//! downstream crates can drive the orchestrator without real time or a real
//! provider.

use crate::GenerateOptions;
use crate::backend::{BackendError, GenerationBackend};
use crate::chain::ModelConfig;
use crate::clock::Clock;
use crate::credentials::Credential;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        // An arbitrary fixed midday instant, away from day boundaries.
        Self::starting_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// What one scripted backend call should do.
#[derive(Debug, Clone)]
enum ScriptedResponse {
    Text(String),
    Failure {
        status: Option<u16>,
        message: String,
    },
    /// Never resolves; exercises the caller's timeout race.
    Hang,
}

/// One recorded call to [`MockBackend::generate`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub credential: String,
    pub model: String,
    pub prompt: String,
}

/// A [`GenerationBackend`] that replays a scripted response per call and
/// records what it was asked. With an empty script every call succeeds with
/// `"ok"`, which keeps high-volume scheduler tests short.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    script: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_text(&self, text: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedResponse::Text(text.into()));
    }

    pub fn enqueue_failure(&self, status: Option<u16>, message: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedResponse::Failure {
                status,
                message: message.into(),
            });
    }

    pub fn enqueue_hang(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedResponse::Hang);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn generate(
        &self,
        credential: &Credential,
        model: &ModelConfig,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push(RecordedCall {
            credential: credential.name.clone(),
            model: model.name.clone(),
            prompt: prompt.to_string(),
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            None => Ok("ok".to_string()),
            Some(ScriptedResponse::Text(text)) => Ok(text),
            Some(ScriptedResponse::Failure { status, message }) => Err(match status {
                Some(code) => BackendError::upstream(code, message),
                None => BackendError::transport(message),
            }),
            Some(ScriptedResponse::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
