use std::{path::PathBuf, process::ExitCode, time::Duration};

use {
    anyhow::{Context, Result},
    clap::Args,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use sandjob_engine::{Engine, ExecutionRequest};

#[derive(Args)]
pub struct RunArgs {
    /// Python script to run.
    pub script: PathBuf,

    /// Input file, mounted read-only under /data. Repeatable; `upload://<id>`
    /// references are accepted when an upload store is attached.
    #[arg(long = "input", short = 'i')]
    pub inputs: Vec<String>,

    /// Timeout in seconds (defaults to sandbox.execution_timeout_secs).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// How long to wait for the execution image on first start.
    #[arg(long, default_value_t = 600)]
    pub image_wait: u64,

    /// Print the whole result as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn handle_run(engine: &Engine, args: RunArgs) -> Result<ExitCode> {
    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read script {}", args.script.display()))?;
    let inputs = engine.resolve_inputs(&args.inputs)?;

    let state = engine
        .wait_until_ready(Duration::from_secs(args.image_wait))
        .await;
    info!(%state, "execution image");

    let mut request = ExecutionRequest::new(script).with_inputs(inputs);
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping sandbox");
            on_interrupt.cancel();
        }
    });

    let run = engine.run(request, &cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print!("{}", run.result.stdout);
        eprint!("{}", run.result.stderr);
        if let Some(message) = run.result.error_message() {
            eprintln!("error: {message}");
        }
        if let Some(ref id) = run.execution_id {
            eprintln!("execution: {id}");
            for file in &run.files {
                eprintln!("  {file}");
            }
        }
    }
    Ok(ExitCode::from(exit_status(run.result.exit_code)))
}

/// Process exit status for a sandbox exit code; anything outside `0..=255`
/// becomes 1.
fn exit_status(code: i64) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
