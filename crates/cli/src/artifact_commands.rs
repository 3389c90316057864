use std::{io::Write, path::PathBuf};

use {
    anyhow::{Result, bail},
    clap::Subcommand,
};

use {sandjob_config::SandjobConfig, sandjob_engine::ArtifactStore};

#[derive(Subcommand)]
pub enum ArtifactAction {
    /// List persisted executions.
    List,
    /// List the files one execution produced.
    Files { id: String },
    /// Print (or save) one output file.
    Get {
        id: String,
        name: String,
        /// Write to this path instead of stdout.
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Delete one execution directory.
    Delete { id: String },
    /// Delete every execution directory.
    Purge,
}

pub async fn handle_artifacts(config: &SandjobConfig, action: ArtifactAction) -> Result<()> {
    let Some(ref dir) = config.artifacts.dir else {
        bail!("artifacts.dir is not configured, output persistence is off");
    };
    let store = ArtifactStore::open(dir, config.artifacts.ttl())?;
    match action {
        ArtifactAction::List => list(&store).await,
        ArtifactAction::Files { id } => {
            for file in store.list_files(&id).await? {
                println!("{file}");
            }
            Ok(())
        },
        ArtifactAction::Get { id, name, out } => {
            let data = store.get_file(&id, &name).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    println!("Wrote {} bytes to {}", data.len(), path.display());
                },
                None => std::io::stdout().write_all(&data)?,
            }
            Ok(())
        },
        ArtifactAction::Delete { id } => {
            store.delete_execution(&id).await?;
            println!("Deleted: {id}");
            Ok(())
        },
        ArtifactAction::Purge => {
            let count = store.delete_all_executions().await?;
            if count == 0 {
                println!("No executions to remove.");
            } else {
                println!(
                    "Removed {count} execution{}.",
                    if count == 1 {
                        ""
                    } else {
                        "s"
                    }
                );
            }
            Ok(())
        },
    }
}

async fn list(store: &ArtifactStore) -> Result<()> {
    let executions = store.list_executions().await?;
    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }
    println!("{:<16} {:<20} {:<20} FILES", "ID", "CREATED", "EXPIRES");
    for exec in &executions {
        println!(
            "{:<16} {:<20} {:<20} {}",
            exec.execution_id,
            exec.created_at.format("%Y-%m-%d %H:%M:%S"),
            exec.expires_at.format("%Y-%m-%d %H:%M:%S"),
            exec.files.len()
        );
    }
    Ok(())
}
