//! CLI command definitions and handlers

use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::GatewayConfig;
use crate::core::models::{EventKind, GenerationRequest};
use crate::gateway::Gateway;
use crate::server::run_server;

/// Commands for the generation gateway
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP API server
    Serve {
        /// Bind address (defaults to SERVER_HOST or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (defaults to SERVER_PORT or 8080)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stream one generation to stdout
    Generate {
        /// Prompt text
        prompt: String,

        /// User the generation is accounted to
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Model name (defaults to DEFAULT_MODEL)
        #[arg(short, long)]
        model: Option<String>,

        /// Project id for event fan-out
        #[arg(long)]
        project: Option<String>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f64>,

        /// Language hint added to the prompt
        #[arg(short, long)]
        language: Option<String>,
    },

    /// List available models
    Models,
}

/// Handle server command
pub async fn handle_serve(
    mut config: GatewayConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let gateway = Gateway::from_config(config)?;
    run_server(gateway).await
}

/// Handle generate command
pub async fn handle_generate(config: GatewayConfig, request: GenerationRequest) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let gateway = Gateway::from_config(config)?;

    info!("Starting generation for user {}", request.user_id);

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message("Waiting for first chunk...");
    pb.enable_steady_tick(Duration::from_millis(100));

    let (tx, mut rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let orchestrator = gateway.orchestrator.clone();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move { orchestrator.execute(request, tx, task_cancel).await });

    let mut stdout = std::io::stdout();
    let mut first = true;
    let mut failure = None;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                break;
            }
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };

        if first {
            pb.finish_and_clear();
            first = false;
        }

        match event.kind {
            EventKind::Chunk => {
                write!(stdout, "{}", event.content)?;
                stdout.flush()?;
            }
            EventKind::Complete => {
                writeln!(stdout)?;
            }
            EventKind::Error => {
                failure = event.error;
            }
        }
    }
    pb.finish_and_clear();

    let outcome = task.await?;
    if let Some(message) = failure {
        anyhow::bail!("Generation failed: {}", message);
    }
    let outcome = outcome?;

    info!(
        "Generation completed in {:.2}s: {} tokens, model {}",
        start_time.elapsed().as_secs_f64(),
        outcome.total_tokens,
        outcome.model
    );
    Ok(())
}

/// Handle models command
pub async fn handle_models(config: GatewayConfig) -> anyhow::Result<()> {
    let gateway = Gateway::from_config(config)?;
    let models = gateway.orchestrator.models().await;

    println!("{:<32} {:<10} {:>10}  DESCRIPTION", "ID", "PROVIDER", "MAX TOKENS");
    for model in models {
        println!(
            "{:<32} {:<10} {:>10}  {}",
            model.id, model.provider, model.max_tokens, model.description
        );
    }
    Ok(())
}
