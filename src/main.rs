//! Main entry point for the Stream Gateway CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stream_gateway::cli::commands::{self, Commands};
use stream_gateway::core::config::GatewayConfig;
use stream_gateway::GenerationRequest;

/// Stream Gateway - streaming LLM generation with rate limiting and quotas
#[derive(Parser, Debug)]
#[command(name = "stream-gateway", version, about, long_about = None)]
struct Args {
    /// YAML configuration file (environment variables are used otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// LLM backend base URL (optional, defaults to LLM_BASE_URL env var)
    #[arg(long)]
    base_url: Option<String>,

    /// API key for the backend (optional, defaults to LLM_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = if verbose {
        EnvFilter::new(format!("stream_gateway={0},tower_http={0}", default_level))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("stream_gateway={0},tower_http={0}", default_level)))
    };

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = GatewayConfig::load(args.config.as_deref())?;

    // Override config with CLI args if provided
    config.override_backend(args.base_url.as_deref(), args.api_key.as_deref());
    config.validate()?;

    if config.is_stub_mode() {
        info!("No LLM backend configured, running in stub mode");
    } else {
        info!("Using LLM backend at {}", config.llm_base_url.as_deref().unwrap_or_default());
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;

    match args.command {
        Some(Commands::Serve { host, port }) => {
            commands::handle_serve(config, host, port).await?;
        }
        Some(Commands::Generate {
            prompt,
            user,
            model,
            project,
            max_tokens,
            temperature,
            language,
        }) => {
            let mut request = GenerationRequest::new(prompt, user);
            request.model = model;
            request.project_id = project;
            request.max_tokens = max_tokens;
            request.temperature = temperature;
            request.language = language;
            commands::handle_generate(config, request).await?;
        }
        Some(Commands::Models) => {
            commands::handle_models(config).await?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}
