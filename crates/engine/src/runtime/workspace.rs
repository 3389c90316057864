//! Input validation and the per-request staging workspace.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{backend::Mount, error::InputRejection};

/// In-sandbox location of the staged script.
pub const SCRIPT_TARGET: &str = "/sandbox/script.py";
/// In-sandbox location of the writable output directory.
pub const OUTPUT_TARGET: &str = "/output";

/// In-sandbox path of the `index`-th declared input.
pub fn input_target(index: usize, path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    format!("/data/input_{index}/{base}")
}

/// Map each input to the path it will have inside the sandbox.
pub fn container_paths(inputs: &[PathBuf]) -> Vec<(PathBuf, String)> {
    inputs
        .iter()
        .enumerate()
        .map(|(i, p)| (p.clone(), input_target(i, p)))
        .collect()
}

/// Purely lexical normalization: drops `.` and folds `name/..` pairs.
/// Leading `..` segments of relative paths survive.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                },
                // `/..` is `/`
                Some(Component::RootDir | Component::Prefix(_)) => {},
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// An input that passed validation; `source` is canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput {
    pub source: PathBuf,
    pub target: String,
}

/// Check every declared input before anything is provisioned.
///
/// Rules, in order: no `..` after lexical cleaning, must exist, must be a
/// regular file (symlinks followed), and must resolve inside one of
/// `allowed_roots` when that list is non-empty.
pub fn validate_inputs(
    inputs: &[PathBuf],
    allowed_roots: &[PathBuf],
) -> Result<Vec<ValidatedInput>, InputRejection> {
    let roots: Vec<PathBuf> = allowed_roots
        .iter()
        .filter_map(|r| std::fs::canonicalize(r).ok())
        .collect();

    inputs
        .iter()
        .enumerate()
        .map(|(index, path)| validate_one(index, path, allowed_roots, &roots))
        .collect()
}

fn validate_one(
    index: usize,
    path: &Path,
    allowed_roots: &[PathBuf],
    canonical_roots: &[PathBuf],
) -> Result<ValidatedInput, InputRejection> {
    let cleaned = lexical_clean(path);
    if cleaned
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(InputRejection::ParentTraversal(path.to_path_buf()));
    }

    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InputRejection::NotFound(path.to_path_buf()));
        },
        Err(e) => {
            debug!(path = %path.display(), error = %e, "input not accessible");
            return Err(InputRejection::Inaccessible(path.to_path_buf()));
        },
    };
    if !meta.is_file() {
        return Err(InputRejection::NotRegularFile(path.to_path_buf()));
    }

    let resolved = std::fs::canonicalize(path)
        .map_err(|_| InputRejection::Inaccessible(path.to_path_buf()))?;
    if !allowed_roots.is_empty() && !canonical_roots.iter().any(|r| resolved.starts_with(r)) {
        return Err(InputRejection::OutsideAllowedRoots(path.to_path_buf()));
    }

    // Mount exactly the file that was checked against the roots.
    Ok(ValidatedInput {
        source: resolved,
        target: input_target(index, path),
    })
}

/// Directory workspaces are created under when none is configured.
pub fn default_staging_root() -> PathBuf {
    sandjob_config::cache_dir()
        .map(|d| d.join("tmp"))
        .unwrap_or_else(std::env::temp_dir)
}

/// Ephemeral per-request host directory holding the script and, unless the
/// caller supplied one, the output directory. Removed on drop.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    script: PathBuf,
    output: PathBuf,
}

impl Workspace {
    /// Create a workspace under `staging_root`, falling back to the system
    /// temp directory when the root cannot be created.
    pub fn create(staging_root: &Path, script: &str, output: Option<&Path>) -> io::Result<Self> {
        let parent = match std::fs::create_dir_all(staging_root) {
            Ok(()) => staging_root.to_path_buf(),
            Err(e) => {
                warn!(root = %staging_root.display(), error = %e, "staging root unusable, using system temp dir");
                std::env::temp_dir()
            },
        };
        let root = parent.join(format!("exec-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&root)?;

        // From here on, dropping `ws` cleans up a half-built workspace.
        let mut ws = Self {
            script: root.join("script.py"),
            output: root.join("output"),
            root,
        };
        std::fs::write(&ws.script, script)?;

        match output {
            Some(dir) => ws.output = dir.to_path_buf(),
            None => {
                std::fs::create_dir_all(&ws.output)?;
                make_world_writable(&ws.output)?;
            },
        }
        debug!(root = %ws.root.display(), "staged workspace");
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    /// Script, output and one read-only mount per input.
    pub fn mounts(&self, inputs: &[ValidatedInput]) -> Vec<Mount> {
        let mut mounts = vec![
            Mount::read_only(self.script.clone(), SCRIPT_TARGET),
            Mount::writable(self.output.clone(), OUTPUT_TARGET),
        ];
        mounts.extend(
            inputs
                .iter()
                .map(|i| Mount::read_only(i.source.clone(), i.target.clone())),
        );
        mounts
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(root = %self.root.display(), error = %e, "failed to remove workspace");
        }
    }
}

/// Containers may run as any uid; the output directory must accept writes
/// from all of them.
#[cfg(unix)]
pub(crate) fn make_world_writable(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
}

#[cfg(not(unix))]
pub(crate) fn make_world_writable(_dir: &Path) -> io::Result<()> {
    Ok(())
}
