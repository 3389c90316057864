//! Seam between the sandbox runtime and the container runtime that actually
//! isolates processes.

mod docker;

use std::path::PathBuf;

use {anyhow::Result, async_trait::async_trait, serde::Serialize};

pub use docker::DockerCli;

/// CPU scheduling period the CPU ceiling is expressed against, in µs.
pub const CPU_PERIOD_US: u64 = 100_000;

/// A bind mount into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: PathBuf, target: impl Into<String>) -> Self {
        Self {
            source,
            target: target.into(),
            read_only: true,
        }
    }

    pub fn writable(source: PathBuf, target: impl Into<String>) -> Self {
        Self {
            source,
            target: target.into(),
            read_only: false,
        }
    }
}

/// Resource ceilings applied to one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Cores; translated to a quota of [`CPU_PERIOD_US`].
    pub cpus: f64,
    pub pids: Option<u32>,
}

impl ResourceLimits {
    pub fn cpu_quota_us(&self) -> u64 {
        (self.cpus * CPU_PERIOD_US as f64).round().max(1000.0) as u64
    }
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub limits: ResourceLimits,
    pub network_enabled: bool,
    pub env: Vec<(String, String)>,
    pub working_dir: String,
}

/// Captured output streams of a finished (or killed) container.
#[derive(Debug, Clone, Default)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Operations the runtime needs from a container engine.
///
/// Implementations report failures with context; the runtime decides which
/// of them are fatal.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Human-readable backend name (e.g. "docker").
    fn backend_name(&self) -> &'static str;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Build `image` from the given Dockerfile contents.
    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<()>;

    /// Create (but do not start) a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Block until the container stops; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    async fn logs(&self, id: &str) -> Result<ContainerLogs>;

    /// Force-terminate a running container.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Remove a container, stopping it first if needed.
    async fn remove(&self, id: &str) -> Result<()>;
}
