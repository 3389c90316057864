use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::SandjobConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "sandjob.toml",
    "sandjob.yaml",
    "sandjob.yml",
    "sandjob.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SandjobConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    expand_paths(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./sandjob.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/sandjob/sandjob.{toml,yaml,yml,json}` (user-global)
///
/// Returns `SandjobConfig::default()` if no usable config file is found.
pub fn discover_and_load() -> SandjobConfig {
    discover_in(&default_search_dirs())
}

/// Same as [`discover_and_load`] but over an explicit list of directories.
pub fn discover_in(dirs: &[PathBuf]) -> SandjobConfig {
    let Some(path) = find_config_file(dirs) else {
        debug!("no config file found, using defaults");
        return SandjobConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            SandjobConfig::default()
        },
    }
}

fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(dir) = config_dir() {
        dirs.push(dir);
    }
    dirs
}

/// Find the first config file in `dirs`.
fn find_config_file(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// Returns `~/.config/sandjob/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("sandjob"))
}

/// Returns `~/.cache/sandjob/`, the default parent for staging workspaces.
pub fn cache_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".cache").join("sandjob"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn expand_paths(config: &mut SandjobConfig) {
    if let Some(dir) = config.sandbox.staging_dir.as_mut() {
        *dir = expand_home(dir);
    }
    if let Some(dir) = config.artifacts.dir.as_mut() {
        *dir = expand_home(dir);
    }
    if let Some(file) = config.sandbox.build.dockerfile.as_mut() {
        *file = expand_home(file);
    }
    for root in &mut config.sandbox.allowed_input_roots {
        *root = expand_home(root);
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SandjobConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
