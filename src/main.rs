use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{error, info};

use cadence::{AiManager, GenerateOptions, HttpBackend, ManagerConfig, WatchedFile};

/// Rate-limited text generation from the command line: reads one prompt per
/// line on stdin and prints the generated text.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the JSON config file (credentials, models, scheduler limits)
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: PathBuf,

    /// Watch the config file and apply credential changes at runtime
    #[arg(long, default_value_t = false)]
    watch: bool,

    /// Override the provider endpoint from the config file
    #[arg(long, env = "CADENCE_ENDPOINT")]
    endpoint: Option<url::Url>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ManagerConfig::from_config_file(&args.config).await?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    let backend = Arc::new(HttpBackend::new(config.endpoint.clone()));
    let manager = Arc::new(
        AiManager::new(config, backend)
            .map_err(|e| anyhow::anyhow!("Failed to start orchestrator: {}", e))?,
    );

    if args.watch {
        manager
            .receive_credential_updates(WatchedFile(args.config))
            .await?;
    }

    // Mirror the event stream into the log.
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(Ok(event)) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "orchestrator event"),
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    });
    manager.announce().await;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        match manager.generate(prompt, GenerateOptions::default()).await {
            Ok(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(e) => error!("Generation failed: {}", e),
        }
    }

    Ok(())
}
