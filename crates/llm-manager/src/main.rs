// LLM Studio / crates/llm-manager/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use llm_manager::{config::Config, run_server, telemetry};
#[cfg(feature = "cli")]
use std::path::PathBuf;

/// Local LLM hosting service
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "llm-manager", version, about)]
struct Cli {
    /// Address to bind the HTTP API to (overrides API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port for the HTTP API (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Directory for model files and downloads (overrides MODEL_DIR)
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// JSON file of models to load at startup (overrides MODELS_CONFIG)
    #[arg(long)]
    models_config: Option<PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(host) = cli.host {
        cfg.api_host = host;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if let Some(model_dir) = cli.model_dir {
        cfg.model_dir = model_dir;
    }
    if let Some(models_config) = cli.models_config {
        cfg.models_config = Some(models_config);
    }

    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
