//! Sandbox runtime: image readiness plus the per-request container lifecycle.

pub mod image;
pub mod workspace;

use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use {
    anyhow::Context,
    serde::{Serialize, Serializer},
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use sandjob_config::schema::SandboxConfig;

use self::{
    image::{BuildSource, ImageManager, ImageState, PrepareStrategy},
    workspace::{SCRIPT_TARGET, ValidatedInput, Workspace, default_staging_root, validate_inputs},
};

use crate::{
    backend::{ContainerBackend, ContainerLogs, ContainerSpec, DockerCli, Mount, ResourceLimits},
    deadline::{Deadline, StopReason},
    endpoint::{self, CliProbe, PROBE_TIMEOUT},
    error::{Error, Failure, Result},
};

/// Exit code reported when the deadline killed the script.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Exit code reported when the caller cancelled the run.
pub const CANCELLED_EXIT_CODE: i64 = 130;
/// Exit code for runs rejected before a sandbox was started.
pub const REJECTED_EXIT_CODE: i64 = 1;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// One script run. Immutable once submitted.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub script: String,
    pub inputs: Vec<PathBuf>,
    /// Overrides the configured default when positive.
    pub timeout: Option<Duration>,
    /// Host directory bound at `/output` instead of a throwaway one.
    pub output_dir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Outcome of [`SandboxRuntime::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ExecutionResult {
    fn rejected(failure: Failure, started: Instant) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: REJECTED_EXIT_CODE,
            duration: started.elapsed(),
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Human-readable failure description, if any.
    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }
}

/// Effective settings for every sandbox this runtime launches.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub image: String,
    pub limits: ResourceLimits,
    pub network_enabled: bool,
    pub default_timeout: Duration,
    pub staging_root: PathBuf,
    pub allowed_input_roots: Vec<PathBuf>,
    pub interpreter: Vec<String>,
    pub max_output_bytes: usize,
    pub strategies: Vec<PrepareStrategy>,
}

impl From<&SandboxConfig> for RuntimeSettings {
    fn from(cfg: &SandboxConfig) -> Self {
        let interpreter = if cfg.interpreter.is_empty() {
            vec!["python3".to_string()]
        } else {
            cfg.interpreter.clone()
        };
        Self {
            image: cfg.image.clone(),
            limits: ResourceLimits {
                memory_bytes: cfg.memory_limit_bytes(),
                cpus: cfg.cpu_limit,
                pids: cfg.pids_limit,
            },
            network_enabled: cfg.network_enabled,
            default_timeout: cfg.execution_timeout(),
            staging_root: cfg.staging_dir.clone().unwrap_or_else(default_staging_root),
            allowed_input_roots: cfg.allowed_input_roots.clone(),
            interpreter,
            max_output_bytes: cfg.max_output_bytes,
            strategies: PrepareStrategy::plan(cfg.build_local, BuildSource::from_config(&cfg.build)),
        }
    }
}

/// Runs scripts in throwaway containers.
pub struct SandboxRuntime {
    settings: RuntimeSettings,
    backend: Arc<dyn ContainerBackend>,
    images: ImageManager,
}

impl SandboxRuntime {
    /// Discover the local control endpoint and drive it through the `docker`
    /// CLI.
    pub async fn connect(config: &SandboxConfig) -> Result<Self> {
        let override_host = std::env::var(endpoint::HOST_ENV).ok();
        let host = endpoint::discover(
            override_host.as_deref(),
            &endpoint::default_candidates().await,
            &CliProbe,
            PROBE_TIMEOUT,
        )
        .await
        .map_err(Error::infra)?;
        info!(%host, "connected to container runtime");
        Ok(Self::with_backend(
            RuntimeSettings::from(config),
            Arc::new(DockerCli::new(host)),
        ))
    }

    pub fn with_backend(settings: RuntimeSettings, backend: Arc<dyn ContainerBackend>) -> Self {
        let images = ImageManager::new(
            settings.image.clone(),
            settings.strategies.clone(),
            Arc::clone(&backend),
        );
        Self {
            settings,
            backend,
            images,
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn image_state(&self) -> ImageState {
        self.images.state()
    }

    /// Ask the backend whether the image exists, without preparing it.
    pub async fn image_present(&self) -> Result<bool> {
        self.backend
            .image_exists(&self.settings.image)
            .await
            .map_err(Error::infra)
    }

    /// Kick off image preparation; never blocks on a pull or build.
    pub async fn ensure_image(&self) -> ImageState {
        self.images.ensure().await
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> ImageState {
        self.images.wait_until_ready(timeout).await
    }

    /// Stop background image preparation and wait for it to exit.
    pub async fn shutdown(&self) {
        self.images.shutdown().await;
    }

    /// Where each input will appear inside the sandbox.
    pub fn container_paths(&self, inputs: &[PathBuf]) -> Vec<(PathBuf, String)> {
        workspace::container_paths(inputs)
    }

    /// Run one script to completion, timeout or cancellation.
    ///
    /// Rejections, script failures, timeouts and cancellation are reported
    /// in the result; only runtime faults come back as `Err`.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();

        match self.images.state() {
            ImageState::Ready => {},
            ImageState::Failed(message) => {
                return Ok(ExecutionResult::rejected(
                    Failure::ImageBuildFailed { message },
                    started,
                ));
            },
            ImageState::Unknown | ImageState::Building => {
                return Ok(ExecutionResult::rejected(Failure::ImageNotReady, started));
            },
        }

        let inputs = match validate_inputs(&request.inputs, &self.settings.allowed_input_roots) {
            Ok(inputs) => inputs,
            Err(reason) => {
                warn!(%reason, "rejected execution input");
                return Ok(ExecutionResult::rejected(
                    Failure::InputValidationFailed { reason },
                    started,
                ));
            },
        };

        let timeout = request
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.settings.default_timeout);

        let workspace = Workspace::create(
            &self.settings.staging_root,
            &request.script,
            request.output_dir.as_deref(),
        )
        .context("failed to stage workspace")
        .map_err(Error::infra)?;

        let result = self
            .run_container(&workspace, &inputs, timeout, cancel, started)
            .await;
        drop(workspace);

        #[cfg(feature = "metrics")]
        if let Ok(ref r) = result {
            let outcome = match r.failure {
                None => "success",
                Some(Failure::ExecutionTimeout { .. }) => "timeout",
                Some(Failure::Cancelled) => "cancelled",
                Some(_) => "failed",
            };
            counter!("sandjob_executions_total", "outcome" => outcome).increment(1);
            histogram!("sandjob_execution_duration_seconds").record(r.duration.as_secs_f64());
        }
        result
    }

    async fn run_container(
        &self,
        workspace: &Workspace,
        inputs: &[ValidatedInput],
        timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let deadline = Deadline::after(timeout, cancel);
        let spec = self.container_spec(workspace.mounts(inputs));

        let id = self
            .backend
            .create(&spec)
            .await
            .context("failed to create container")
            .map_err(Error::infra)?;
        let container = ContainerGuard::new(Arc::clone(&self.backend), id);
        debug!(container = container.id(), workspace = %workspace.root().display(), "container created");

        if let Err(e) = self.backend.start(container.id()).await {
            container.remove().await;
            return Err(Error::infra(e.context("failed to start container")));
        }

        let waited = tokio::select! {
            code = self.backend.wait(container.id()) => Ok(code),
            reason = deadline.expired() => Err(reason),
        };

        let result = match waited {
            Ok(Ok(exit_code)) => match self.backend.logs(container.id()).await {
                Ok(logs) => Ok(self.finish(logs, exit_code, None, started)),
                Err(e) => Err(Error::infra(e.context("failed to read container logs"))),
            },
            Ok(Err(e)) => Err(Error::infra(e.context("container wait failed"))),
            Err(reason) => {
                if let Err(e) = self.backend.kill(container.id()).await {
                    warn!(container = container.id(), error = %e, "failed to kill container");
                }
                // Whatever the script printed before it was stopped.
                let logs = self.backend.logs(container.id()).await.unwrap_or_else(|e| {
                    debug!(container = container.id(), error = %e, "no partial logs");
                    ContainerLogs::default()
                });
                let (exit_code, failure) = match reason {
                    StopReason::Timeout => {
                        warn!(
                            container = container.id(),
                            timeout_ms = timeout.as_millis() as u64,
                            "execution timed out"
                        );
                        (TIMEOUT_EXIT_CODE, Failure::ExecutionTimeout { timeout })
                    },
                    StopReason::Cancelled => {
                        info!(container = container.id(), "execution cancelled");
                        (CANCELLED_EXIT_CODE, Failure::Cancelled)
                    },
                };
                Ok(self.finish(logs, exit_code, Some(failure), started))
            },
        };

        container.remove().await;
        result
    }

    fn finish(
        &self,
        logs: ContainerLogs,
        exit_code: i64,
        failure: Option<Failure>,
        started: Instant,
    ) -> ExecutionResult {
        let limit = self.settings.max_output_bytes;
        let failure =
            failure.or_else(|| (exit_code != 0).then_some(Failure::ExecutionFailed { exit_code }));
        let result = ExecutionResult {
            stdout: truncate_output(logs.stdout, limit),
            stderr: truncate_output(logs.stderr, limit),
            exit_code,
            duration: started.elapsed(),
            failure,
        };
        info!(
            exit_code,
            duration_ms = result.duration.as_millis() as u64,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "execution finished"
        );
        result
    }

    fn container_spec(&self, mounts: Vec<Mount>) -> ContainerSpec {
        let mut command = self.settings.interpreter.clone();
        command.push(SCRIPT_TARGET.to_string());
        ContainerSpec {
            image: self.settings.image.clone(),
            command,
            mounts,
            limits: self.settings.limits.clone(),
            network_enabled: self.settings.network_enabled,
            env: vec![
                ("PYTHONUNBUFFERED".into(), "1".into()),
                ("PYTHONDONTWRITEBYTECODE".into(), "1".into()),
            ],
            working_dir: "/".into(),
        }
    }
}

/// Cut `s` to at most `limit` bytes on a char boundary and mark the cut.
pub fn truncate_output(mut s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push_str(TRUNCATION_MARKER);
    s
}

/// Removes its container exactly once: explicitly through
/// [`ContainerGuard::remove`], or from `Drop` when the owning future was
/// abandoned mid-run.
struct ContainerGuard {
    backend: Arc<dyn ContainerBackend>,
    id: String,
    removed: bool,
}

impl ContainerGuard {
    fn new(backend: Arc<dyn ContainerBackend>, id: String) -> Self {
        Self {
            backend,
            id,
            removed: false,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn remove(mut self) {
        self.removed = true;
        remove_container(self.backend.as_ref(), &self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(container = %id, "scheduling removal of abandoned container");
                handle.spawn(async move { remove_container(backend.as_ref(), &id).await });
            },
            Err(_) => warn!(container = %id, "no async runtime left to remove container"),
        }
    }
}

async fn remove_container(backend: &dyn ContainerBackend, id: &str) {
    match tokio::time::timeout(REMOVE_TIMEOUT, backend.remove(id)).await {
        Ok(Ok(())) => debug!(container = id, "container removed"),
        Ok(Err(e)) => warn!(container = id, error = %e, "failed to remove container"),
        Err(_) => warn!(container = id, "timed out removing container"),
    }
}
