//! Error taxonomy for the execution engine
//!
//! Validation and path/quota errors are the caller's fault and are surfaced
//! before execution starts. Workspace and sandbox errors are infrastructure
//! failures that the orchestrator converts into a failed `ExecutionResult`.
//! Cleanup failures are never represented here; they are logged where they
//! occur because they happen after the primary result is already determined.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Request rejected before any resource was allocated
    #[error("invalid execution request: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// File path would escape the workspace
    #[error("invalid file path: {0}")]
    InvalidPath(String),

    #[error("file {path} is {size} bytes, exceeding the per-file limit of {limit} bytes")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("workspace size {size} bytes exceeds the limit of {limit} bytes")]
    QuotaExceeded { size: u64, limit: u64 },

    #[error("failed to create workspace: {0}")]
    WorkspaceCreation(#[source] std::io::Error),

    #[error("failed to write input file: {0}")]
    FileWrite(#[source] std::io::Error),

    #[error("failed to collect output files: {0}")]
    OutputCollection(#[source] std::io::Error),

    #[error("failed to create sandbox: {0}")]
    SandboxCreate(String),

    #[error("sandbox execution failed: {0}")]
    SandboxExec(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
