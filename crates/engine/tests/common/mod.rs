//! Scripted container backend shared by the integration tests.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    tokio::sync::Notify,
};

use sandjob_engine::{
    ContainerBackend, ContainerLogs, ContainerSpec, PrepareStrategy, ResourceLimits,
    RuntimeSettings, SandboxRuntime,
    runtime::{image::BuildSource, workspace::OUTPUT_TARGET},
};

/// Pretends to be a container engine. Every "container" runs for
/// `run_for`, prints `stdout` and exits with `exit_code`.
#[derive(Default)]
pub struct FakeBackend {
    pub image_present: AtomicBool,
    /// Holds a pull until notified.
    pub pull_gate: Option<Arc<Notify>>,
    pub pull_error: Option<String>,
    pub build_error: Option<String>,
    pub create_error: Option<String>,
    /// Returned by `wait` once `run_for` has elapsed.
    pub wait_error: Option<String>,
    pub run_for: Duration,
    pub exit_code: i64,
    pub stdout: String,
    /// Written into the `/output` mount when a container starts.
    pub output_file: Option<(String, String)>,

    pub pulls: AtomicUsize,
    pub builds: AtomicUsize,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub kills: AtomicUsize,
    pub removes: AtomicUsize,
    pub last_spec: Mutex<Option<ContainerSpec>>,
}

impl FakeBackend {
    pub fn ready() -> Self {
        Self {
            image_present: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> ContainerSpec {
        self.last_spec.lock().unwrap().clone().expect("no container created")
    }

    fn output_mount(&self) -> Option<PathBuf> {
        self.last_spec.lock().unwrap().as_ref().and_then(|spec| {
            spec.mounts
                .iter()
                .find(|m| m.target == OUTPUT_TARGET)
                .map(|m| m.source.clone())
        })
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.pull_gate {
            gate.notified().await;
        }
        if let Some(e) = &self.pull_error {
            bail!("pull {image}: {e}");
        }
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn build_image(&self, image: &str, _dockerfile: &str) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.build_error {
            bail!("build {image}: {e}");
        }
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.create_error {
            bail!("{e}");
        }
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        Ok(format!("fake-{n}"))
    }

    async fn start(&self, _id: &str) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let (Some((name, contents)), Some(dir)) = (&self.output_file, self.output_mount()) {
            std::fs::write(dir.join(name), contents)?;
        }
        Ok(())
    }

    async fn wait(&self, _id: &str) -> Result<i64> {
        tokio::time::sleep(self.run_for).await;
        if let Some(e) = &self.wait_error {
            bail!("{e}");
        }
        Ok(self.exit_code)
    }

    async fn logs(&self, _id: &str) -> Result<ContainerLogs> {
        Ok(ContainerLogs {
            stdout: self.stdout.clone(),
            stderr: String::new(),
        })
    }

    async fn kill(&self, _id: &str) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn settings(staging_root: &Path) -> RuntimeSettings {
    RuntimeSettings {
        image: "sandjob/runner:test".into(),
        limits: ResourceLimits {
            memory_bytes: 512 * 1024 * 1024,
            cpus: 1.0,
            pids: Some(256),
        },
        network_enabled: false,
        default_timeout: Duration::from_secs(30),
        staging_root: staging_root.to_path_buf(),
        allowed_input_roots: Vec::new(),
        interpreter: vec!["python3".into()],
        max_output_bytes: 1024 * 1024,
        strategies: PrepareStrategy::plan(
            false,
            Some(BuildSource::Inline("FROM python:3.12-slim\n".into())),
        ),
    }
}

pub fn runtime(backend: &Arc<FakeBackend>, staging_root: &Path) -> SandboxRuntime {
    SandboxRuntime::with_backend(settings(staging_root), Arc::clone(backend) as Arc<dyn ContainerBackend>)
}
