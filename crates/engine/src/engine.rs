//! Caller-side orchestration: admission, execution and artifact registration.

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use sandjob_config::SandjobConfig;

use crate::{
    admission::{AdmissionController, AdmissionStats},
    artifacts::{ArtifactStore, generate_execution_id},
    backend::ResourceLimits,
    collaborators::{UploadResolver, resolve_input_refs},
    error::{Error, Failure, Result},
    runtime::{ExecutionRequest, ExecutionResult, SandboxRuntime, image::ImageState},
};

/// What one [`Engine::run`] produced.
#[derive(Debug, Clone, Serialize)]
pub struct EngineRun {
    /// Set when the run's `/output` was persisted to the artifact store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(flatten)]
    pub result: ExecutionResult,
    /// Files the script left in `/output`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub backend: &'static str,
    pub image: String,
    pub image_state: ImageState,
    pub limits: ResourceLimits,
    pub network_enabled: bool,
    pub default_timeout_secs: u64,
    pub admission: AdmissionStats,
    pub artifacts_enabled: bool,
}

pub struct Engine {
    admission: AdmissionController,
    runtime: SandboxRuntime,
    artifacts: Option<ArtifactStore>,
    uploads: Option<Arc<dyn UploadResolver>>,
}

impl Engine {
    /// Connect to the local container runtime, open the artifact store and
    /// start preparing the execution image in the background.
    pub async fn connect(config: &SandjobConfig) -> Result<Self> {
        let runtime = SandboxRuntime::connect(&config.sandbox).await?;
        let artifacts = ArtifactStore::from_config(&config.artifacts)?;
        let admission = AdmissionController::new(
            config.admission.max_workers,
            config.admission.acquire_timeout(),
        );
        let engine = Self::with_parts(admission, runtime, artifacts);
        let state = engine.runtime.ensure_image().await;
        info!(
            image = %engine.runtime.settings().image,
            %state,
            max_workers = engine.admission.capacity(),
            "engine started"
        );
        Ok(engine)
    }

    pub fn with_parts(
        admission: AdmissionController,
        runtime: SandboxRuntime,
        artifacts: Option<ArtifactStore>,
    ) -> Self {
        Self {
            admission,
            runtime,
            artifacts,
            uploads: None,
        }
    }

    pub fn with_upload_resolver(mut self, resolver: Arc<dyn UploadResolver>) -> Self {
        self.uploads = Some(resolver);
        self
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn runtime(&self) -> &SandboxRuntime {
        &self.runtime
    }

    pub fn artifacts(&self) -> Result<&ArtifactStore> {
        self.artifacts.as_ref().ok_or(Error::ArtifactsDisabled)
    }

    /// Map caller input references (plain paths or `upload://` ids) to host
    /// paths.
    pub fn resolve_inputs(&self, refs: &[String]) -> Result<Vec<PathBuf>> {
        resolve_input_refs(refs, self.uploads.as_deref())
    }

    pub async fn ensure_image(&self) -> ImageState {
        self.runtime.ensure_image().await
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> ImageState {
        self.runtime.wait_until_ready(timeout).await
    }

    /// Run one script under an admission slot.
    ///
    /// With persistence on and no explicit `output_dir`, `/output` is bound
    /// to a fresh artifact directory whose id is returned. The directory is
    /// dropped again if the run never reached a sandbox.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<EngineRun> {
        let slot = self.admission.acquire(cancel).await?;

        let mut request = request;
        let execution_id = match (&self.artifacts, &request.output_dir) {
            (Some(store), None) => {
                let id = generate_execution_id();
                request.output_dir = Some(store.create_execution_dir(&id).await?);
                Some(id)
            },
            _ => None,
        };

        let outcome = self.runtime.execute(&request, cancel).await;
        self.admission.release(slot);

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.discard(execution_id.as_deref()).await;
                return Err(e);
            },
        };

        if result.failure.as_ref().is_some_and(never_started) {
            self.discard(execution_id.as_deref()).await;
            return Ok(EngineRun {
                execution_id: None,
                result,
                files: Vec::new(),
            });
        }

        let files = match (&execution_id, &self.artifacts) {
            (Some(id), Some(store)) => store.list_files(id).await.unwrap_or_else(|e| {
                warn!(execution_id = %id, error = %e, "failed to list output files");
                Vec::new()
            }),
            _ => Vec::new(),
        };
        debug!(execution_id = ?execution_id, files = files.len(), "run complete");
        Ok(EngineRun {
            execution_id,
            result,
            files,
        })
    }

    pub fn stats(&self) -> EngineStats {
        let settings = self.runtime.settings();
        EngineStats {
            backend: self.runtime.backend_name(),
            image: settings.image.clone(),
            image_state: self.runtime.image_state(),
            limits: settings.limits.clone(),
            network_enabled: settings.network_enabled,
            default_timeout_secs: settings.default_timeout.as_secs(),
            admission: self.admission.stats(),
            artifacts_enabled: self.artifacts.is_some(),
        }
    }

    /// Stop image preparation and the artifact sweep, waiting for both.
    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
        if let Some(store) = &self.artifacts {
            store.shutdown().await;
        }
        info!("engine stopped");
    }

    async fn discard(&self, execution_id: Option<&str>) {
        if let (Some(id), Some(store)) = (execution_id, &self.artifacts)
            && let Err(e) = store.delete_execution(id).await
        {
            warn!(execution_id = id, error = %e, "failed to discard execution directory");
        }
    }
}

/// Rejections returned before any container was created.
fn never_started(failure: &Failure) -> bool {
    matches!(
        failure,
        Failure::ImageNotReady | Failure::ImageBuildFailed { .. } | Failure::InputValidationFailed { .. }
    )
}
