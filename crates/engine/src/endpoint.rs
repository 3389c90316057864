//! Discovery of the local container-runtime control endpoint.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use {
    anyhow::{Result, anyhow},
    async_trait::async_trait,
    tracing::{debug, info},
};

use crate::backend::DockerCli;

/// Environment variable that pins the endpoint explicitly.
pub const HOST_ENV: &str = "DOCKER_HOST";

/// How long a candidate gets to answer the liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness check against a candidate endpoint.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn probe(&self, host: &str) -> Result<()>;
}

/// Probes by asking the daemon for its version through the `docker` CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct CliProbe;

#[async_trait]
impl EndpointProbe for CliProbe {
    async fn probe(&self, host: &str) -> Result<()> {
        DockerCli::new(host).ping().await.map(|_| ())
    }
}

/// Well-known control sockets, in the order they are tried.
pub fn candidate_sockets(home: &Path, uid: u32) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/var/run/docker.sock"),
        // Colima
        home.join(".colima/default/docker.sock"),
        home.join(".colima/docker/docker.sock"),
        // Lima
        home.join(".lima/default/sock/docker.sock"),
        home.join(".lima/docker/sock/docker.sock"),
        // Podman rootless
        PathBuf::from(format!("/run/user/{uid}/podman/podman.sock")),
        // Rancher Desktop
        home.join(".rd/docker.sock"),
        // Docker Desktop
        home.join(".docker/run/docker.sock"),
        home.join("Library/Containers/com.docker.docker/Data/docker.raw.sock"),
    ]
}

/// Candidates for the current user.
pub async fn default_candidates() -> Vec<PathBuf> {
    let home = directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_default();
    candidate_sockets(&home, current_uid().await)
}

/// Numeric uid of the current user, via `id -u`.
async fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        tokio::process::Command::new("id")
            .arg("-u")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|uid| parse_uid(&uid))
            .unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        0
    }
}

fn parse_uid(out: &str) -> Option<u32> {
    out.trim().parse().ok()
}

/// Resolve the endpoint to use.
///
/// An explicit override is probed and returned as-is; otherwise every
/// existing candidate socket is probed in order and the first live one wins.
/// The error names everything that was tried.
pub async fn discover(
    override_host: Option<&str>,
    candidates: &[PathBuf],
    probe: &dyn EndpointProbe,
    probe_timeout: Duration,
) -> Result<String> {
    if let Some(host) = override_host.filter(|h| !h.trim().is_empty()) {
        info!(host, "using container endpoint from {HOST_ENV}");
        return probe_within(probe, host, probe_timeout)
            .await
            .map(|()| host.to_string())
            .map_err(|e| anyhow!("failed to reach container endpoint {HOST_ENV}={host}: {e:#}"));
    }

    let mut last_error = None;
    for socket in candidates {
        if !socket.exists() {
            continue;
        }
        let host = format!("unix://{}", socket.display());
        match probe_within(probe, &host, probe_timeout).await {
            Ok(()) => {
                info!(host, "found working container endpoint");
                return Ok(host);
            },
            Err(e) => {
                debug!(host, error = %e, "container endpoint probe failed");
                last_error = Some(anyhow!("socket {} exists but probe failed: {e:#}", socket.display()));
            },
        }
    }

    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(match last_error {
        Some(e) => anyhow!(
            "no working container endpoint found (last error: {e:#}); tried: {tried}. \
             Start Docker, Colima, Lima, Podman or Rancher Desktop, or set {HOST_ENV}"
        ),
        None => anyhow!(
            "no container endpoint found; tried: {tried}. \
             Start Docker, Colima, Lima, Podman or Rancher Desktop, or set {HOST_ENV}"
        ),
    })
}

async fn probe_within(probe: &dyn EndpointProbe, host: &str, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, probe.probe(host))
        .await
        .map_err(|_| anyhow!("no answer within {}s", timeout.as_secs_f64()))?
}
