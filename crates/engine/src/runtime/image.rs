//! Execution-image readiness: a one-shot, monotonic state machine driven by
//! an owned background preparation task.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    serde::Serialize,
    tokio::{
        sync::{Mutex, watch},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::backend::ContainerBackend;

/// Readiness of the execution image.
///
/// Transitions only move forward: `Unknown` → `Building` → `Ready` or
/// `Failed`, with `Unknown` → `Ready` when the image is already present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ImageState {
    Unknown,
    Building,
    Ready,
    Failed(String),
}

impl ImageState {
    fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Building => 1,
            Self::Ready | Self::Failed(_) => 2,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// `Ready` or `Failed`: nothing will change any more.
    pub fn is_settled(&self) -> bool {
        self.rank() == 2
    }
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Building => f.write_str("building"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Where a local build gets its Dockerfile from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSource {
    Inline(String),
    /// Relative paths are looked up in the working directory, then next to
    /// the running executable.
    File(PathBuf),
}

impl BuildSource {
    pub fn from_config(build: &sandjob_config::schema::BuildConfig) -> Option<Self> {
        if let Some(ref text) = build.dockerfile_inline {
            return Some(Self::Inline(text.clone()));
        }
        build.dockerfile.clone().map(Self::File)
    }

    fn load(&self) -> Result<String> {
        match self {
            Self::Inline(text) => Ok(text.clone()),
            Self::File(path) => {
                let searched = dockerfile_search_paths(path);
                for candidate in &searched {
                    if let Ok(text) = std::fs::read_to_string(candidate) {
                        info!(path = %candidate.display(), "using Dockerfile");
                        return Ok(text);
                    }
                }
                let listed = searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                bail!("Dockerfile {} not found; searched: {listed}", path.display())
            },
        }
    }
}

fn dockerfile_search_paths(path: &Path) -> Vec<PathBuf> {
    if path.is_absolute() {
        return vec![path.to_path_buf()];
    }
    let mut paths = vec![path.to_path_buf()];
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        paths.push(dir.join(path));
    }
    paths
}

/// One way of making the image available locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareStrategy {
    Pull,
    Build(Option<BuildSource>),
}

impl PrepareStrategy {
    /// `[Pull, Build]`, or `[Build]` alone when local builds are forced.
    pub fn plan(build_local: bool, source: Option<BuildSource>) -> Vec<Self> {
        if build_local {
            vec![Self::Build(source)]
        } else {
            vec![Self::Pull, Self::Build(source)]
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Build(_) => "build",
        }
    }

    async fn run(&self, backend: &dyn ContainerBackend, image: &str) -> Result<()> {
        match self {
            Self::Pull => backend.pull_image(image).await,
            Self::Build(None) => bail!("no Dockerfile configured for a local build"),
            Self::Build(Some(source)) => {
                let dockerfile = source.load()?;
                backend
                    .build_image(image, &dockerfile)
                    .await
                    .with_context(|| format!("failed to build image {image}"))
            },
        }
    }
}

struct Inner {
    image: String,
    strategies: Vec<PrepareStrategy>,
    backend: Arc<dyn ContainerBackend>,
    state: watch::Sender<ImageState>,
}

impl Inner {
    /// Apply `next` only if it moves the state forward.
    fn publish(&self, next: ImageState) -> bool {
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    async fn prepare(&self, cancel: CancellationToken) {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    failures.push("preparation cancelled".to_string());
                    break;
                },
                r = strategy.run(self.backend.as_ref(), &self.image) => r,
            };
            match attempt {
                Ok(()) => {
                    info!(image = %self.image, strategy = strategy.name(), "sandbox image is ready");
                    #[cfg(feature = "metrics")]
                    counter!("sandjob_image_prepared_total", "strategy" => strategy.name())
                        .increment(1);
                    self.publish(ImageState::Ready);
                    return;
                },
                Err(e) => {
                    warn!(image = %self.image, strategy = strategy.name(), error = %e, "image preparation attempt failed");
                    failures.push(format!("{}: {e:#}", strategy.name()));
                },
            }
        }

        let message = format!(
            "could not prepare image {}: {}",
            self.image,
            failures.join("; ")
        );
        warn!(image = %self.image, %message, "sandbox image preparation failed");
        #[cfg(feature = "metrics")]
        counter!("sandjob_image_failed_total").increment(1);
        self.publish(ImageState::Failed(message));
    }
}

/// Owns the readiness state and the background task that drives it.
pub struct ImageManager {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ImageManager {
    pub fn new(
        image: impl Into<String>,
        strategies: Vec<PrepareStrategy>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        let (state, _) = watch::channel(ImageState::Unknown);
        Self {
            inner: Arc::new(Inner {
                image: image.into(),
                strategies,
                backend,
                state,
            }),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.inner.image
    }

    /// The newest published state.
    pub fn state(&self) -> ImageState {
        self.inner.state.borrow().clone()
    }

    /// Make sure the image is present, preparing it in the background if not.
    ///
    /// Only the first call does anything; it returns `Ready` when the image
    /// already exists and `Building` once the preparation task is launched.
    pub async fn ensure(&self) -> ImageState {
        let mut task = self.task.lock().await;
        let current = self.state();
        if current != ImageState::Unknown || task.is_some() {
            return current;
        }

        let image = self.inner.image.as_str();
        match self.inner.backend.image_exists(image).await {
            Ok(true) => {
                info!(image, "sandbox image found locally");
                self.inner.publish(ImageState::Ready);
                return self.state();
            },
            Ok(false) => {
                info!(image, "sandbox image not found locally, preparing in background");
            },
            Err(e) => {
                warn!(image, error = %e, "could not inspect sandbox image, preparing in background");
            },
        }

        self.inner.publish(ImageState::Building);
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.child_token();
        *task = Some(tokio::spawn(async move { inner.prepare(cancel).await }));
        self.state()
    }

    /// Wait until the image settles or `timeout` elapses, returning the
    /// state observed last.
    pub async fn wait_until_ready(&self, timeout: Duration) -> ImageState {
        let mut rx = self.inner.state.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(ImageState::is_settled)).await;
        match settled {
            Ok(Ok(state)) => state.clone(),
            _ => self.state(),
        }
    }

    /// Cancel a running preparation and wait for its task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "image preparation task did not exit cleanly");
        }
    }

    #[cfg(test)]
    fn force(&self, next: ImageState) -> bool {
        self.inner.publish(next)
    }
}
