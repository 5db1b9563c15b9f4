//! Request and result types for the execution engine

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One input file staged into a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDefinition {
    /// Path relative to the workspace root; absolute paths and `..` segments
    /// are rejected at validation
    pub path: String,
    pub content: String,
    /// Written mode 0755 instead of 0644
    #[serde(default)]
    pub executable: bool,
}

/// A single execution request, delivered by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: String,
    /// Language tag selecting the sandbox image profile
    #[serde(default)]
    pub language: String,
    pub files: Vec<FileDefinition>,
    /// Shell command run inside the sandbox
    pub command: String,
    /// Wall-clock timeout in milliseconds, bounded by the hard ceiling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Human-readable memory limit, e.g. "512m"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    /// Fractional CPU limit, e.g. "0.5"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    /// Extra environment variables for the sandboxed command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
}

/// A file found in the workspace after execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// Path relative to the workspace root
    pub path: String,
    pub content: String,
    /// Size in bytes
    pub size: u64,
    /// SHA-256 of the content, lowercase hex
    pub hash: String,
    /// True if the path was not among the original input files
    pub created: bool,
}

/// Summarized resource consumption of one execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// CPU usage percentage (peak observed by default, see CpuUsagePolicy)
    pub cpu_usage: f64,
    /// Last observed memory usage in bytes, page cache excluded
    pub memory_usage: u64,
    /// Peak observed memory usage in bytes
    pub peak_memory: u64,
    /// Total bytes read from block devices
    pub disk_read: u64,
    /// Total bytes written to block devices
    pub disk_write: u64,
}

/// Outcome of one execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    /// True only for a non-timed-out run exiting with code 0
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the command; -1 when it could not be determined
    pub exit_code: i64,
    /// Wall-clock duration of the whole request in milliseconds
    pub duration_ms: u64,
    pub resource_usage: ResourceMetrics,
    pub files: Vec<GeneratedFile>,
    /// Present when the run failed or timed out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
