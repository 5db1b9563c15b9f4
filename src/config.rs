//! Engine configuration
//!
//! One immutable configuration value loaded from the environment and handed
//! to components at construction. Nothing reads it through a global, so
//! tests can run several stores against distinct workspace roots in
//! parallel.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// How the monitor reduces per-sample CPU percentages into one number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuUsagePolicy {
    /// Running maximum across samples; short execution bursts dominate
    #[default]
    Peak,
    /// Running mean of the observed samples
    Average,
}

impl FromStr for CpuUsagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "peak" => Ok(Self::Peak),
            "average" | "avg" => Ok(Self::Average),
            other => Err(format!("unknown cpu usage policy: {}", other)),
        }
    }
}

/// Engine-wide settings, all overridable via `CODEBOX_*` environment variables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory under which per-request workspaces are created
    pub workspace_root: PathBuf,
    /// Per-file size cap, input and output alike (default: 10MB)
    pub max_file_size: u64,
    /// Aggregate workspace size cap (default: 100MB)
    pub max_workspace_size: u64,
    /// Unix socket of the container engine, for the raw exec output stream
    pub docker_socket: PathBuf,
    /// Name of the internal-only network sandboxes are attached to
    pub network_name: String,
    /// User the sandboxed command runs as (uid:gid)
    pub sandbox_user: String,
    /// Memory limit applied when neither request nor language profile sets one
    pub default_memory_limit: String,
    /// CPU limit (fractional cores) applied by default
    pub default_cpu_limit: String,
    /// Process-count limit inside a sandbox (fork-bomb defense)
    pub pids_limit: i64,
    /// Execution timeout when the request does not supply one
    pub default_timeout_ms: u64,
    /// Ceiling applied to request-supplied timeouts
    pub max_timeout_ms: u64,
    /// Delay before a finished request's workspace is purged
    pub cleanup_delay: Duration,
    /// CPU percentage reduction policy for the resource monitor
    pub cpu_usage_policy: CpuUsagePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/codebox-workspaces"),
            max_file_size: 10 * 1024 * 1024,
            max_workspace_size: 100 * 1024 * 1024,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            network_name: "codebox-internal".to_string(),
            sandbox_user: "1000:1000".to_string(),
            default_memory_limit: "512m".to_string(),
            default_cpu_limit: "0.5".to_string(),
            pids_limit: 128,
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            cleanup_delay: Duration::from_secs(300),
            cpu_usage_policy: CpuUsagePolicy::Peak,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: env_var("CODEBOX_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            max_file_size: env_parse("CODEBOX_MAX_FILE_SIZE", defaults.max_file_size),
            max_workspace_size: env_parse("CODEBOX_MAX_WORKSPACE_SIZE", defaults.max_workspace_size),
            docker_socket: env_var("CODEBOX_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.docker_socket),
            network_name: env_parse("CODEBOX_NETWORK", defaults.network_name),
            sandbox_user: env_parse("CODEBOX_SANDBOX_USER", defaults.sandbox_user),
            default_memory_limit: env_parse("CODEBOX_MEMORY_LIMIT", defaults.default_memory_limit),
            default_cpu_limit: env_parse("CODEBOX_CPU_LIMIT", defaults.default_cpu_limit),
            pids_limit: env_parse("CODEBOX_PIDS_LIMIT", defaults.pids_limit),
            default_timeout_ms: env_parse("CODEBOX_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            max_timeout_ms: env_parse("CODEBOX_MAX_TIMEOUT_MS", defaults.max_timeout_ms),
            cleanup_delay: Duration::from_secs(env_parse(
                "CODEBOX_CLEANUP_DELAY_SECS",
                defaults.cleanup_delay.as_secs(),
            )),
            cpu_usage_policy: env_parse("CODEBOX_CPU_USAGE_POLICY", defaults.cpu_usage_policy),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_var(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value for {}: {:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}
