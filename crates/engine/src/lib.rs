//! Sandboxed script execution.
//!
//! Admission bounds how many sandboxes run at once, the runtime prepares the
//! execution image and runs each script in a throwaway container, and the
//! artifact store keeps `/output` directories around until their TTL passes.

pub mod admission;
pub mod artifacts;
pub mod backend;
pub mod collaborators;
pub mod deadline;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod sweeper;

pub use {
    admission::{AdmissionController, AdmissionSlot, AdmissionStats},
    artifacts::{ArtifactStore, ExecutionInfo},
    backend::{ContainerBackend, ContainerLogs, ContainerSpec, DockerCli, Mount, ResourceLimits},
    collaborators::{MalwareScanner, ScanFailurePolicy, ScanVerdict, UploadResolver},
    deadline::{Deadline, StopReason},
    engine::{Engine, EngineRun, EngineStats},
    error::{Error, Failure, InputRejection, Result},
    runtime::{
        ExecutionRequest, ExecutionResult, RuntimeSettings, SandboxRuntime,
        image::{BuildSource, ImageState, PrepareStrategy},
    },
};
