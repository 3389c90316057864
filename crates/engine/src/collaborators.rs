//! Contracts for services the engine consumes but does not implement:
//! upload storage and malware scanning.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::warn,
};

use crate::error::{Error, Result};

/// Scheme marking an input as a reference to previously uploaded data.
pub const UPLOAD_SCHEME: &str = "upload://";

/// Maps upload references to files on the host.
pub trait UploadResolver: Send + Sync {
    /// `reference` is the part after [`UPLOAD_SCHEME`]. Unknown or expired
    /// references yield [`Error::NotFound`].
    fn resolve(&self, reference: &str) -> Result<PathBuf>;
}

/// Turn caller-facing input references into host paths.
///
/// Plain paths pass through untouched; `upload://` references need a
/// resolver.
pub fn resolve_input_refs(
    refs: &[String],
    resolver: Option<&dyn UploadResolver>,
) -> Result<Vec<PathBuf>> {
    refs.iter()
        .map(|r| match r.strip_prefix(UPLOAD_SCHEME) {
            None => Ok(PathBuf::from(r)),
            Some(id) => match resolver {
                Some(resolver) => resolver.resolve(id),
                None => Err(Error::NotFound(format!(
                    "{r} (upload references are not supported here)"
                ))),
            },
        })
        .collect()
}

/// Outcome of scanning one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum ScanVerdict {
    Clean,
    Threat(String),
    /// The scanner could not run; says nothing about the file.
    Error(String),
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    async fn scan(&self, path: &Path) -> ScanVerdict;
}

/// What to do with a file when the scanner is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFailurePolicy {
    #[default]
    Reject,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanRejection {
    #[error("malware detected: {0}")]
    MalwareDetected(String),

    #[error("malware scanner unavailable")]
    ScannerUnavailable,
}

impl ScanFailurePolicy {
    /// Decide whether a scanned file may be used.
    pub fn admit(self, path: &Path, verdict: ScanVerdict) -> Result<(), ScanRejection> {
        match verdict {
            ScanVerdict::Clean => Ok(()),
            ScanVerdict::Threat(threat) => {
                warn!(path = %path.display(), %threat, "rejected infected file");
                Err(ScanRejection::MalwareDetected(threat))
            },
            ScanVerdict::Error(e) => match self {
                Self::Allow => {
                    warn!(path = %path.display(), error = %e, "scanner unavailable, allowing file unscanned");
                    Ok(())
                },
                Self::Reject => Err(ScanRejection::ScannerUnavailable),
            },
        }
    }
}
