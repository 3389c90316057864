/// Config schema types (admission, sandbox, artifacts).
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default execution image, pulled from the registry on first start.
pub const DEFAULT_IMAGE: &str = "sandjob/runner:latest";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandjobConfig {
    pub admission: AdmissionConfig,
    pub sandbox: SandboxConfig,
    pub artifacts: ArtifactsConfig,
}

/// Concurrency ceiling for sandbox executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of sandboxes running at once.
    pub max_workers: usize,
    /// How long a caller waits for a free slot before being told to retry.
    pub acquire_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            acquire_timeout_secs: 30,
        }
    }
}

impl AdmissionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Where the fallback image build gets its Dockerfile from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Path to a Dockerfile. Relative paths are searched in the working
    /// directory and next to the executable.
    pub dockerfile: Option<PathBuf>,
    /// Inline Dockerfile text; wins over `dockerfile` when both are set.
    pub dockerfile_inline: Option<String>,
}

/// Execution image and per-sandbox resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub build: BuildConfig,
    /// Skip the registry pull and always build locally.
    pub build_local: bool,
    pub memory_limit_mb: u64,
    /// CPU ceiling in cores (1.0 = one full core).
    pub cpu_limit: f64,
    pub pids_limit: Option<u32>,
    pub network_enabled: bool,
    pub execution_timeout_secs: u64,
    /// Host directory for ephemeral workspaces. Must be visible to the
    /// container runtime (VM-backed runtimes only share some host paths).
    pub staging_dir: Option<PathBuf>,
    /// When non-empty, inputs must resolve inside one of these directories.
    pub allowed_input_roots: Vec<PathBuf>,
    /// Command prefix used to run the staged script.
    pub interpreter: Vec<String>,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.into(),
            build: BuildConfig::default(),
            build_local: false,
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            pids_limit: Some(256),
            network_enabled: false,
            execution_timeout_secs: 60,
            staging_dir: None,
            allowed_input_roots: Vec::new(),
            interpreter: vec!["python3".into()],
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }
}

/// Output persistence. Disabled when `dir` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub dir: Option<PathBuf>,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl ArtifactsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
