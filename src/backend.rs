//! Generation backend abstraction
//!
//! This module provides the seam between the orchestrator and the remote
//! text-generation endpoint, allowing different implementations (hyper,
//! scripted mocks for testing, etc.) to be used interchangeably. The wire
//! schema is deliberately kept to loose JSON; the orchestrator only cares
//! about the extracted text and the failure class.

use crate::GenerateOptions;
use crate::chain::ModelConfig;
use crate::credentials::Credential;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde_json::{Value, json};
use url::Url;

/// Default endpoint of the hosted generation API.
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

/// A failed backend call, carrying the upstream status when one was
/// received. The status is also embedded in the message so downstream
/// classification works on text alone.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: format!("status {status}: {}", message.into()),
        }
    }
}

/// One attempt against the remote generation endpoint.
///
/// Implementations must not retry internally; retry policy belongs to the
/// retry controller, which also owns the timeout race around this call.
#[async_trait]
pub trait GenerationBackend: Send + Sync + std::fmt::Debug {
    async fn generate(
        &self,
        credential: &Credential,
        model: &ModelConfig,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, BackendError>;
}

type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Full<Bytes>,
>;

/// Production backend speaking the provider's `generateContent` protocol
/// over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: HyperClient,
    endpoint: Url,
}

impl HttpBackend {
    pub fn new(endpoint: Url) -> Self {
        let https = hyper_tls::HttpsConnector::new();
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(hyper_util::rt::TokioTimer::new())
            .build(https);
        Self { client, endpoint }
    }

    fn request_url(&self, model: &ModelConfig, credential: &Credential) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint.as_str().trim_end_matches('/'),
            model.name,
            credential.secret
        )
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn generate(
        &self,
        credential: &Credential,
        model: &ModelConfig,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, BackendError> {
        let body = request_body(model, prompt, options);
        let payload =
            serde_json::to_vec(&body).map_err(|e| BackendError::transport(e.to_string()))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.request_url(model, credential))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| BackendError::transport(format!("failed to build request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| BackendError::transport(format!("request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BackendError::transport(format!("failed to read response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(BackendError::upstream(
                status.as_u16(),
                upstream_message(&bytes),
            ));
        }

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::transport(format!("malformed response body: {e}")))?;
        extract_text(&value)
            .ok_or_else(|| BackendError::transport("unexpected response shape from provider"))
    }
}

/// Build the provider request body, letting per-request options override the
/// model config's generation parameters.
fn request_body(model: &ModelConfig, prompt: &str, options: &GenerateOptions) -> Value {
    let mut body = json!({
        "contents": [{
            "parts": [{ "text": prompt }]
        }],
        "generationConfig": {
            "temperature": options.temperature.unwrap_or(model.temperature),
            "topP": model.top_p,
            "topK": model.top_k,
            "maxOutputTokens": options.max_tokens.unwrap_or(model.max_output_tokens),
        }
    });

    if !model.safety_policy.is_empty() {
        body["safetySettings"] = Value::Array(
            model
                .safety_policy
                .iter()
                .map(|rule| {
                    json!({
                        "category": rule.category,
                        "threshold": rule.threshold,
                    })
                })
                .collect(),
        );
    }

    body
}

/// Pull the first candidate's text out of a provider response.
fn extract_text(value: &Value) -> Option<String> {
    value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

/// Prefer the provider's structured error message over the raw body.
fn upstream_message(bytes: &[u8]) -> String {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}
