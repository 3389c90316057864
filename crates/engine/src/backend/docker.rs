use std::process::{Output, Stdio};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    tokio::process::Command,
    tracing::{debug, info},
};

use super::{ContainerBackend, ContainerLogs, ContainerSpec, CPU_PERIOD_US};

/// Docker-API backend driven through the `docker` CLI.
///
/// Works against any Docker-compatible daemon (Docker, Colima, Lima, Podman,
/// Rancher Desktop) once pointed at its control socket.
#[derive(Debug, Clone)]
pub struct DockerCli {
    cli: String,
    host: Option<String>,
}

impl DockerCli {
    /// Talk to the daemon at `host` (e.g. `unix:///var/run/docker.sock`).
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            cli: "docker".into(),
            host: Some(host.into()),
        }
    }

    /// Use whatever daemon the CLI itself resolves.
    pub fn from_env() -> Self {
        Self {
            cli: "docker".into(),
            host: None,
        }
    }

    /// Override the CLI binary (e.g. `podman`, which accepts the same verbs).
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cli);
        if let Some(ref host) = self.host {
            cmd.args(["--host", host]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        debug!(cli = %self.cli, args = ?args, "container cli");
        self.command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", self.cli, args.join(" ")))
    }

    /// Run and require success; returns trimmed stdout.
    async fn checked(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} {} failed: {}",
                self.cli,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Liveness probe: asks the daemon for its version.
    pub async fn ping(&self) -> Result<String> {
        let version = self
            .checked(&strings(&["version", "--format", "{{.Server.Version}}"]))
            .await?;
        if version.is_empty() {
            bail!("daemon returned an empty server version");
        }
        Ok(version)
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = strings(&["create", "--workdir", &spec.working_dir]);

        args.extend([
            "--memory".to_string(),
            spec.limits.memory_bytes.to_string(),
            // No swap on top of the memory ceiling.
            "--memory-swap".to_string(),
            spec.limits.memory_bytes.to_string(),
            "--cpu-period".to_string(),
            CPU_PERIOD_US.to_string(),
            "--cpu-quota".to_string(),
            spec.limits.cpu_quota_us().to_string(),
        ]);
        if let Some(pids) = spec.limits.pids {
            args.extend(["--pids-limit".to_string(), pids.to_string()]);
        }

        if !spec.network_enabled {
            args.push("--network=none".to_string());
        }
        args.extend(strings(&[
            "--security-opt",
            "no-new-privileges",
            "--cap-drop",
            "ALL",
        ]));

        for (k, v) in &spec.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }

        for mount in &spec.mounts {
            let mut value = format!(
                "type=bind,{},{}",
                csv_field(&format!("source={}", mount.source.display())),
                csv_field(&format!("target={}", mount.target))
            );
            if mount.read_only {
                value.push_str(",readonly");
            }
            args.extend(["--mount".to_string(), value]);
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

/// `--mount` values are parsed as one CSV record; quote any field that
/// would otherwise split or inject keys.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl ContainerBackend for DockerCli {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.output(&strings(&["image", "inspect", image])).await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling sandbox image");
        self.checked(&strings(&["pull", image])).await?;
        info!(image, "pulled sandbox image");
        Ok(())
    }

    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<()> {
        let tmp_dir =
            std::env::temp_dir().join(format!("sandjob-build-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&tmp_dir)?;
        let dockerfile_path = tmp_dir.join("Dockerfile");
        std::fs::write(&dockerfile_path, dockerfile)?;

        info!(image, "building sandbox image");
        let mut args = strings(&["build", "-t", image, "-f"]);
        args.push(dockerfile_path.display().to_string());
        args.push(tmp_dir.display().to_string());
        let result = self.checked(&args).await;

        // Clean up temp dir regardless of result.
        let _ = std::fs::remove_dir_all(&tmp_dir);
        result?;

        // Some daemons accept the build but drop the tag; verify it stuck.
        if !self.image_exists(image).await? {
            bail!("build completed but image {image} is not tagged");
        }
        info!(image, "built sandbox image");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.checked(&Self::create_args(spec)).await?;
        if id.is_empty() {
            bail!("{} create returned no container id", self.cli);
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.checked(&strings(&["start", id])).await.map(|_| ())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let out = self.checked(&strings(&["wait", id])).await?;
        out.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse::<i64>()
            .with_context(|| format!("unexpected wait output for {id}: {out:?}"))
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs> {
        let output = self.output(&strings(&["logs", id])).await?;
        if !output.status.success() {
            bail!(
                "{} logs failed: {}",
                self.cli,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        // The CLI demultiplexes the container's streams onto its own.
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.checked(&strings(&["kill", "--signal", "KILL", id]))
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.checked(&strings(&["rm", "-f", id])).await.map(|_| ())
    }
}
