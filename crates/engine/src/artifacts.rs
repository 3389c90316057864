//! TTL-scoped output directories, one per execution.
//!
//! Layout under the base directory:
//!
//! ```text
//! exec-1a2b3c4d/
//!   .metadata.json    {execution_id, created_at, expires_at}
//!   result.csv        written by the script through /output
//! ```

use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    error::{Error, Result},
    runtime::workspace::make_world_writable,
    sweeper::Sweeper,
};

pub const METADATA_FILE: &str = ".metadata.json";
pub const EXECUTION_PREFIX: &str = "exec-";

/// New identifier: `exec-` plus the first 8 hex digits of a v4 UUID.
pub fn generate_execution_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{EXECUTION_PREFIX}{}", &id[..8])
}

/// Sidecar persisted next to the outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ExecutionMetadata {
    execution_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// One execution directory as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub files: Vec<String>,
    pub output_path: PathBuf,
}

struct Store {
    base_dir: PathBuf,
    ttl: Duration,
    /// Serializes foreground mutations with the sweep.
    lock: RwLock<()>,
}

impl Store {
    fn expiry_from(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Resolve `id` to its directory; the id must be one plain path segment.
    fn execution_dir(&self, id: &str) -> Result<PathBuf> {
        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == id && !id.starts_with('.') => {
                Ok(self.base_dir.join(id))
            },
            _ => Err(Error::InvalidExecutionId(id.to_string())),
        }
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.execution_dir(id)?;
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }

    fn execution_entries(&self) -> io::Result<Vec<std::fs::DirEntry>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|e| e.file_name().to_string_lossy().starts_with(EXECUTION_PREFIX))
            .collect())
    }

    /// Recorded metadata, or an estimate from the directory mtime.
    fn metadata_for(&self, dir: &Path) -> io::Result<ExecutionMetadata> {
        if let Some(meta) = read_metadata(dir) {
            return Ok(meta);
        }
        let modified: DateTime<Utc> = std::fs::metadata(dir)?.modified()?.into();
        Ok(ExecutionMetadata {
            execution_id: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            created_at: modified,
            expires_at: self.expiry_from(modified),
        })
    }

    fn info_for(&self, dir: &Path) -> io::Result<ExecutionInfo> {
        let meta = self.metadata_for(dir)?;
        Ok(ExecutionInfo {
            execution_id: meta.execution_id,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
            files: list_files_in(dir).unwrap_or_default(),
            output_path: dir.to_path_buf(),
        })
    }

    /// Remove expired directories. The caller holds the write lock.
    fn sweep_locked(&self, now: DateTime<Utc>) -> usize {
        let entries = match self.execution_entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.base_dir.display(), error = %e, "sweep: failed to read artifact directory");
                return 0;
            },
        };

        let mut removed = 0;
        for entry in entries {
            let dir = entry.path();
            let expires_at = match self.metadata_for(&dir) {
                Ok(meta) => meta.expires_at,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "sweep: cannot date directory, skipping");
                    continue;
                },
            };
            if now <= expires_at {
                continue;
            }
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) => warn!(dir = %dir.display(), error = %e, "sweep: failed to remove expired execution"),
            }
        }

        if removed > 0 {
            info!(removed, "removed expired executions");
            #[cfg(feature = "metrics")]
            counter!("sandjob_artifacts_swept_total").increment(removed as u64);
        }
        removed
    }
}

/// Take the write lock, then walk the base directory on the blocking pool.
async fn sweep(store: &Arc<Store>, now: DateTime<Utc>) -> usize {
    let _guard = store.lock.write().await;
    let inner = Arc::clone(store);
    match tokio::task::spawn_blocking(move || inner.sweep_locked(now)).await {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "artifact sweep panicked");
            0
        },
    }
}

fn read_metadata(dir: &Path) -> Option<ExecutionMetadata> {
    let data = std::fs::read(dir.join(METADATA_FILE)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn list_files_in(dir: &Path) -> io::Result<Vec<String>> {
    let mut files: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != METADATA_FILE)
        .collect();
    files.sort();
    Ok(files)
}

/// Execution output directories with automatic expiry.
pub struct ArtifactStore {
    store: Arc<Store>,
    sweeper: Option<Sweeper>,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `base_dir`. No background
    /// sweep runs until [`ArtifactStore::start_sweeper`].
    pub fn open(base_dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            store: Arc::new(Store {
                base_dir,
                ttl,
                lock: RwLock::new(()),
            }),
            sweeper: None,
        })
    }

    /// Open a store and start sweeping it; `None` when persistence is off.
    pub fn from_config(cfg: &sandjob_config::schema::ArtifactsConfig) -> Result<Option<Self>> {
        let Some(ref dir) = cfg.dir else {
            debug!("artifact directory not configured, persistence disabled");
            return Ok(None);
        };
        let mut store = Self::open(dir, cfg.ttl())?;
        store.start_sweeper(cfg.sweep_interval());
        info!(
            dir = %dir.display(),
            ttl_secs = cfg.ttl_secs,
            interval_secs = cfg.sweep_interval().as_secs(),
            "artifact store ready"
        );
        Ok(Some(store))
    }

    /// Sweep once now and then every `interval`. Must be called inside a
    /// tokio runtime. A second call is ignored.
    pub fn start_sweeper(&mut self, interval: Duration) {
        if self.sweeper.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        self.sweeper = Some(Sweeper::spawn("artifacts", interval, move || {
            let store = Arc::clone(&store);
            async move {
                sweep(&store, Utc::now()).await;
            }
        }));
    }

    pub fn base_dir(&self) -> &Path {
        &self.store.base_dir
    }

    pub fn ttl(&self) -> Duration {
        self.store.ttl
    }

    /// Create the directory for `id` (mode 0777 so any container uid can
    /// write) and record its expiry.
    pub async fn create_execution_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.store.execution_dir(id)?;
        let _guard = self.store.lock.write().await;
        std::fs::create_dir_all(&dir)?;
        make_world_writable(&dir)?;

        let created_at = Utc::now();
        let meta = ExecutionMetadata {
            execution_id: id.to_string(),
            created_at,
            expires_at: self.store.expiry_from(created_at),
        };
        let data = serde_json::to_vec_pretty(&meta).map_err(io::Error::other)?;
        std::fs::write(dir.join(METADATA_FILE), data)?;
        debug!(execution_id = id, expires_at = %meta.expires_at, "created execution directory");
        Ok(dir)
    }

    /// Every execution directory, oldest first.
    pub async fn list_executions(&self) -> Result<Vec<ExecutionInfo>> {
        let _guard = self.store.lock.read().await;
        let mut executions = Vec::new();
        for entry in self.store.execution_entries()? {
            match self.store.info_for(&entry.path()) {
                Ok(info) => executions.push(info),
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "skipping unreadable execution");
                },
            }
        }
        executions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(executions)
    }

    pub async fn execution_info(&self, id: &str) -> Result<ExecutionInfo> {
        let _guard = self.store.lock.read().await;
        let dir = self.store.existing_dir(id)?;
        Ok(self.store.info_for(&dir)?)
    }

    /// File names in the execution directory, metadata excluded.
    pub async fn list_files(&self, id: &str) -> Result<Vec<String>> {
        let _guard = self.store.lock.read().await;
        let dir = self.store.existing_dir(id)?;
        Ok(list_files_in(&dir)?)
    }

    /// Read one result file.
    ///
    /// Only the final component of `name` is used, and the resolved file
    /// (after following links) must still live inside the execution
    /// directory. An unknown execution is [`Error::NotFound`], a missing
    /// file in a known one [`Error::FileNotFound`].
    pub async fn get_file(&self, id: &str, name: &str) -> Result<Vec<u8>> {
        let _guard = self.store.lock.read().await;
        let dir = self.store.existing_dir(id)?;
        let base = Path::new(name)
            .file_name()
            .filter(|n| *n != METADATA_FILE)
            .ok_or_else(|| Error::PathTraversal(name.to_string()))?;

        let path = dir.join(base);
        let not_found = || Error::FileNotFound {
            execution_id: id.to_string(),
            name: base.to_string_lossy().into_owned(),
        };
        let resolved = match std::fs::canonicalize(&path) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let root = std::fs::canonicalize(&dir)?;
        if !resolved.starts_with(&root) {
            warn!(execution_id = id, name, "blocked read outside execution directory");
            return Err(Error::PathTraversal(name.to_string()));
        }
        if !resolved.is_file() {
            return Err(not_found());
        }
        Ok(std::fs::read(&resolved)?)
    }

    pub async fn delete_execution(&self, id: &str) -> Result<()> {
        let _guard = self.store.lock.write().await;
        let dir = self.store.existing_dir(id)?;
        std::fs::remove_dir_all(&dir)?;
        info!(execution_id = id, "deleted execution");
        Ok(())
    }

    /// Remove every execution directory; failures are logged and skipped.
    pub async fn delete_all_executions(&self) -> Result<usize> {
        let _guard = self.store.lock.write().await;
        let mut deleted = 0;
        for entry in self.store.execution_entries()? {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(dir = %entry.path().display(), error = %e, "failed to delete execution"),
            }
        }
        info!(deleted, "deleted all executions");
        Ok(deleted)
    }

    /// One sweep pass against the current time.
    pub async fn sweep_now(&self) -> usize {
        sweep(&self.store, Utc::now()).await
    }

    /// One sweep pass as if the clock read `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        sweep(&self.store, now).await
    }

    /// Stop the background sweep and wait for it.
    pub async fn shutdown(&self) {
        if let Some(ref sweeper) = self.sweeper {
            sweeper.shutdown().await;
        }
    }
}
