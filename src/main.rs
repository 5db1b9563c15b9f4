mod config;
mod error;
mod languages;
mod monitor;
mod orchestrator;
mod runtime;
mod types;
mod validator;
mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::EngineConfig;
use crate::orchestrator::Orchestrator;
use crate::runtime::ContainerRuntime;
use crate::types::ExecutionRequest;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codebox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let languages_path = std::env::var("CODEBOX_LANGUAGES_CONFIG")
        .unwrap_or_else(|_| "./files/languages.toml".into());
    languages::init_languages(&languages_path)?;
    info!("Loaded language profiles from {}", languages_path);

    let config = Arc::new(EngineConfig::from_env());
    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| format!("Failed to create workspace root {:?}", config.workspace_root))?;

    let runtime = Arc::new(ContainerRuntime::new(config.clone()).await?);
    info!("Connected to the container engine");

    let orchestrator = Orchestrator::new(config, runtime);

    let request = read_request().await?;
    let result = orchestrator.execute(&request).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Read the execution request from the file named on the command line, or
/// from stdin when no argument is given
async fn read_request() -> Result<ExecutionRequest> {
    let raw = match std::env::args().nth(1) {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read request file {}", path))?,
        None => {
            use tokio::io::AsyncReadExt;
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("Failed to read request from stdin")?;
            buffer
        }
    };

    serde_json::from_str(&raw).context("Failed to parse execution request")
}
