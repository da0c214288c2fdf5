//! CLI commands for Pipeliner.

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use pipeliner_api::RestServer;
use pipeliner_events::{EventBus, InMemoryEventStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{Config, LogFormat};
use crate::demo::run_demo;
use crate::logging::init_logging;

/// Command-line interface for the Pipeliner build event server
#[derive(Parser, Debug)]
#[command(name = "pipeliner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve build event streams over HTTP
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Generate shell completions
    #[command(name = "completions")]
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (overridden by RUST_LOG)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Publish a sample build (id 1) to stream from
    #[arg(long, default_value = "false")]
    demo: bool,

    /// Delay between demo events, in milliseconds
    #[arg(long, default_value = "500")]
    demo_interval_ms: u64,
}

#[derive(Args, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(short, long)]
    shell: String,
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();

    match args.command {
        Commands::Serve(serve_args) => serve(serve_args).await,
        Commands::Completions(completions_args) => generate_completions(completions_args),
    }
}

/// Loads the config file and applies command-line overrides.
fn resolve_config(args: &ServeArgs) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }

    Ok(config)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    init_logging(&config.log_level, config.log_format);

    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(EventBus::with_config(store, config.stream.sink_config()));

    if args.demo {
        let interval = Duration::from_millis(args.demo_interval_ms);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            if let Err(e) = run_demo(bus, interval).await {
                error!(error = %e, "Demo build failed");
            }
        });
    }

    // Builds are whatever producers have started on the bus.
    let server = RestServer::new(config.api_config(), Arc::clone(&bus), bus);
    server
        .serve(shutdown_signal())
        .await
        .context("REST API server failed")?;

    info!("pipeliner stopped");
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn generate_completions(args: CompletionsArgs) -> Result<()> {
    use clap_complete::Shell;

    let shell = match args.shell.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        _ => anyhow::bail!("Unsupported shell: {}", args.shell),
    };

    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "pipeliner", &mut std::io::stdout());

    Ok(())
}
