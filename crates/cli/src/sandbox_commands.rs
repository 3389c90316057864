use std::{process::ExitCode, time::Duration};

use {anyhow::Result, clap::Subcommand};

use {
    sandjob_config::SandjobConfig,
    sandjob_engine::{ImageState, SandboxRuntime},
};

#[derive(Subcommand)]
pub enum ImageAction {
    /// Show whether the execution image is present locally.
    Status,
    /// Pull the execution image, building it locally if the pull fails.
    Ensure {
        /// Seconds to wait for preparation to finish.
        #[arg(long, default_value_t = 1800)]
        wait: u64,
    },
}

pub async fn handle_image(config: &SandjobConfig, action: ImageAction) -> Result<ExitCode> {
    let runtime = SandboxRuntime::connect(&config.sandbox).await?;
    match action {
        ImageAction::Status => status(&runtime).await,
        ImageAction::Ensure { wait } => ensure(&runtime, Duration::from_secs(wait)).await,
    }
}

async fn status(runtime: &SandboxRuntime) -> Result<ExitCode> {
    let present = runtime.image_present().await?;
    println!("Image:   {}", runtime.settings().image);
    println!("Backend: {}", runtime.backend_name());
    println!(
        "Present: {}",
        if present {
            "yes"
        } else {
            "no"
        }
    );
    Ok(ExitCode::SUCCESS)
}

async fn ensure(runtime: &SandboxRuntime, wait: Duration) -> Result<ExitCode> {
    let image = &runtime.settings().image;
    if runtime.ensure_image().await == ImageState::Building {
        println!("Preparing {image}...");
    }
    let state = runtime.wait_until_ready(wait).await;
    runtime.shutdown().await;

    match state {
        ImageState::Ready => {
            println!("Image ready: {image}");
            Ok(ExitCode::SUCCESS)
        },
        ImageState::Failed(error) => {
            eprintln!("Image preparation failed: {error}");
            Ok(ExitCode::FAILURE)
        },
        ImageState::Unknown | ImageState::Building => {
            eprintln!("Image still preparing after {}s; try again later.", wait.as_secs());
            Ok(ExitCode::FAILURE)
        },
    }
}
