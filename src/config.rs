//! Configuration file loading and live credential updates
//!
//! The orchestrator is configured from a JSON file: credentials, the ordered
//! model chain, scheduler limits, and the provider endpoint. The file can
//! additionally be watched at runtime; only the credential list is applied
//! from reloads (keys get added and revoked far more often than the model
//! chain changes, and model/scheduler changes deserve a restart).

use crate::backend::DEFAULT_ENDPOINT;
use crate::chain::ModelConfig;
use crate::scheduler::SchedulerConfig;
use anyhow::anyhow;
use async_trait::async_trait;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

/// One credential entry of the config file. `secret` is the API key itself;
/// `name` is the stable identifier used in events and stats.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSeed {
    pub secret: String,
    pub name: String,
    #[serde(default = "default_credential_daily_limit")]
    pub daily_limit: u32,
}

fn default_credential_daily_limit() -> u32 {
    300
}

fn default_endpoint() -> Url {
    DEFAULT_ENDPOINT
        .parse()
        .expect("default endpoint is a valid URL")
}

/// The root of the orchestrator config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,
    pub credentials: Vec<CredentialSeed>,
    /// Most preferred model first.
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Opt-in once-per-day probe for more preferred models. Off by default
    /// because probes consume real quota.
    #[serde(default)]
    pub check_for_newer_models: bool,
}

impl ManagerConfig {
    pub async fn from_config_file(config_path: &PathBuf) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let config = Self::from_json(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        info!(
            "Loaded {} credentials and {} models from {}",
            config.credentials.len(),
            config.models.len(),
            config_path.display()
        );
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Credential seeds in the tuple shape the pool constructor takes.
    pub fn credential_seeds(&self) -> Vec<(String, String, u32)> {
        self.credentials
            .iter()
            .map(|c| (c.secret.clone(), c.name.clone(), c.daily_limit))
            .collect()
    }
}

/// A source of configuration reloads.
#[async_trait]
pub trait ConfigStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<ManagerConfig, anyhow::Error>>, anyhow::Error>;
}

/// Watches the config file on disk and emits a reloaded config on every
/// modification.
pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl ConfigStream for WatchedFile {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<ManagerConfig, anyhow::Error>>, anyhow::Error> {
        let (config_tx, config_rx) = mpsc::channel(100);
        let (event_tx, mut event_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let config_path = self.0.clone();
        tokio::spawn(async move {
            // The task owns the watcher; dropping it when the subscriber
            // goes away unregisters the filesystem watch.
            let _watcher = watcher;
            while let Some(res) = event_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Config file changed, reloading...");
                        ManagerConfig::from_config_file(&config_path).await
                    }
                    Ok(_) => continue,
                    Err(e) => Err(anyhow!("Watch error: {}", e)),
                };
                if let Err(e) = &update {
                    error!("Failed to reload config: {}", e);
                }
                if config_tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        Ok(config_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "credentials": [
            { "secret": "sk-1", "name": "primary" },
            { "secret": "sk-2", "name": "backup", "daily_limit": 50 }
        ],
        "models": [
            { "name": "model-a", "version": "2.0" },
            { "name": "model-b", "version": "1.0", "temperature": 0.5 }
        ]
    }"#;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let config = ManagerConfig::from_json(MINIMAL).unwrap();

        assert_eq!(config.endpoint.as_str(), format!("{DEFAULT_ENDPOINT}/"));
        assert_eq!(config.credentials[0].daily_limit, 300);
        assert_eq!(config.credentials[1].daily_limit, 50);
        assert_eq!(config.models[0].max_output_tokens, 4096);
        assert!((config.models[1].temperature - 0.5).abs() < 1e-9);
        assert_eq!(config.scheduler.daily_request_limit, 300);
        assert!(!config.check_for_newer_models);
    }

    #[test]
    fn credential_seeds_carry_secret_name_and_limit() {
        let config = ManagerConfig::from_json(MINIMAL).unwrap();
        let seeds = config.credential_seeds();
        assert_eq!(seeds[0], ("sk-1".to_string(), "primary".to_string(), 300));
        assert_eq!(seeds[1], ("sk-2".to_string(), "backup".to_string(), 50));
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert!(ManagerConfig::from_json("{}").is_err());
        assert!(ManagerConfig::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn watched_file_emits_reloaded_config_on_modification() {
        let path = std::env::temp_dir().join(format!("cadence-watch-{}.json", std::process::id()));
        tokio::fs::write(&path, MINIMAL).await.unwrap();

        let mut rx = WatchedFile(path.clone()).receive().await.unwrap();

        tokio::fs::write(&path, MINIMAL.replace("model-a", "model-c"))
            .await
            .unwrap();

        let config = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(Ok(config)) => break config,
                    // A truncate event can race the reload; wait for the
                    // next one.
                    Some(Err(_)) => continue,
                    None => panic!("watcher task stopped"),
                }
            }
        })
        .await
        .expect("no reload arrived within 5s");

        assert_eq!(config.models[0].name, "model-c");
        tokio::fs::remove_file(&path).await.ok();
    }
}
