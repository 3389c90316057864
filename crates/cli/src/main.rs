mod artifact_commands;
mod run_commands;
mod sandbox_commands;

use std::{path::PathBuf, process::ExitCode};

use {
    clap::{Parser, Subcommand},
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    sandjob_config::SandjobConfig,
    sandjob_engine::{AdmissionController, ArtifactStore, Engine, SandboxRuntime},
};

#[derive(Parser)]
#[command(name = "sandjob", about = "Sandjob: run untrusted scripts in throwaway containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./sandjob.toml, then ~/.config/sandjob/).
    #[arg(long, short, global = true, env = "SANDJOB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script in a sandbox.
    Run(run_commands::RunArgs),
    /// Execution image status and preparation.
    Image {
        #[command(subcommand)]
        action: sandbox_commands::ImageAction,
    },
    /// Persisted execution outputs.
    Artifacts {
        #[command(subcommand)]
        action: artifact_commands::ArtifactAction,
    },
    /// Print effective limits and admission stats as JSON.
    Stats,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Logs go to stderr so script output on stdout stays clean.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SandjobConfig> {
    match cli.config {
        Some(ref path) => sandjob_config::load_config(path),
        None => Ok(sandjob_config::discover_and_load()),
    }
}

/// Engine for commands that only inspect state: no image preparation and
/// no background sweep.
async fn idle_engine(config: &SandjobConfig) -> anyhow::Result<Engine> {
    let runtime = SandboxRuntime::connect(&config.sandbox).await?;
    let artifacts = match config.artifacts.dir {
        Some(ref dir) => Some(ArtifactStore::open(dir, config.artifacts.ttl())?),
        None => None,
    };
    let admission = AdmissionController::new(
        config.admission.max_workers,
        config.admission.acquire_timeout(),
    );
    Ok(Engine::with_parts(admission, runtime, artifacts))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "sandjob starting");
    let config = load_config(&cli)?;
    debug!(config = ?config, "effective configuration");

    match cli.command {
        Commands::Run(args) => {
            let engine = Engine::connect(&config).await?;
            let code = run_commands::handle_run(&engine, args).await;
            engine.shutdown().await;
            code
        },
        Commands::Image { action } => sandbox_commands::handle_image(&config, action).await,
        Commands::Artifacts { action } => {
            artifact_commands::handle_artifacts(&config, action).await?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Stats => {
            let engine = idle_engine(&config).await?;
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
            Ok(ExitCode::SUCCESS)
        },
    }
}
