//! Execution orchestrator
//!
//! Drives one request through validation, workspace staging, sandbox
//! creation, monitored execution, output collection, and teardown. The
//! sandbox is destroyed exactly once no matter where the pipeline fails;
//! the workspace is purged on a delay so failed runs stay inspectable.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::languages;
use crate::runtime::{ExecOutput, SandboxRuntime, SandboxSpec};
use crate::types::{ExecutionRequest, ExecutionResult, GeneratedFile, ResourceMetrics};
use crate::validator::validate_execution_request;
use crate::workspace::WorkspaceStore;

/// How long the monitor gets to deliver its finalized metrics
const MONITOR_GRACE: Duration = Duration::from_millis(100);
/// Captured stdout/stderr are cut off beyond this many characters
const MAX_OUTPUT_CHARS: usize = 100_000;
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Coordinates the full lifecycle of execution requests
pub struct Orchestrator {
    workspaces: WorkspaceStore,
    runtime: Arc<dyn SandboxRuntime>,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    pub fn new(config: Arc<EngineConfig>, runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            workspaces: WorkspaceStore::new(config.clone()),
            runtime,
            config,
        }
    }

    /// Run one request end to end.
    ///
    /// Only a rejected request produces `Err`; once resources have been
    /// allocated, every failure is folded into a failed [`ExecutionResult`]
    /// so the caller always gets output, metrics, and a duration back.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionError> {
        let errors = validate_execution_request(request);
        if !errors.is_empty() {
            return Err(ExecutionError::Validation(errors));
        }

        let execution_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        info!(
            "Executing request {} (task={}, language={})",
            execution_id, request.task_id, request.language
        );

        let mut workspace: Option<PathBuf> = None;
        let mut sandbox: Option<String> = None;
        let outcome = self.run(request, &mut workspace, &mut sandbox).await;

        // Teardown happens here, on every path out of run()
        if let Some(id) = sandbox {
            self.runtime.destroy_sandbox(&id).await;
        }
        if let Some(path) = workspace {
            self.workspaces.schedule_cleanup(path);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok((output, resource_usage, files)) => {
                let success = !output.timed_out && output.exit_code == 0;
                let error = output
                    .timed_out
                    .then(|| "execution timed out".to_string());
                ExecutionResult {
                    execution_id,
                    success,
                    stdout: truncate_output(output.stdout),
                    stderr: truncate_output(output.stderr),
                    exit_code: output.exit_code,
                    duration_ms,
                    resource_usage,
                    files,
                    error,
                }
            }
            Err(e) => {
                warn!("Execution {} failed: {}", execution_id, e);
                let message = e.to_string();
                ExecutionResult {
                    execution_id,
                    success: false,
                    stdout: String::new(),
                    stderr: message.clone(),
                    exit_code: crate::runtime::SENTINEL_EXIT_CODE,
                    duration_ms,
                    resource_usage: ResourceMetrics::default(),
                    files: Vec::new(),
                    error: Some(message),
                }
            }
        };

        info!(
            "Execution {} finished in {}ms (success={}, exit={})",
            result.execution_id, result.duration_ms, result.success, result.exit_code
        );
        Ok(result)
    }

    /// The fallible middle of the pipeline. Allocated resources are handed
    /// out through the two slots so the caller can tear them down on any
    /// return path.
    async fn run(
        &self,
        request: &ExecutionRequest,
        workspace: &mut Option<PathBuf>,
        sandbox: &mut Option<String>,
    ) -> Result<(ExecOutput, ResourceMetrics, Vec<GeneratedFile>), ExecutionError> {
        let path = self.workspaces.create_workspace(&request.task_id).await?;
        *workspace = Some(path.clone());

        let written = self.workspaces.write_files(&path, &request.files).await?;
        let original: HashSet<PathBuf> = written.into_iter().collect();

        let spec = self.sandbox_spec(request, path.clone());
        let sandbox_id = self.runtime.create_sandbox(&spec).await?;
        *sandbox = Some(sandbox_id.clone());

        let timeout = self.effective_timeout(request);
        let monitor = self.runtime.start_monitor(&sandbox_id);
        let exec_result = self
            .runtime
            .exec_in_sandbox(&sandbox_id, &request.command, timeout)
            .await;
        // The monitor is finalized before the error check so a failed exec
        // still stops its sampling task.
        let metrics = monitor.finish(MONITOR_GRACE).await;
        let output = exec_result?;

        let files = self.workspaces.collect_output(&path, &original).await?;
        Ok((output, metrics, files))
    }

    /// Resolve limits in precedence order: request, language profile,
    /// engine defaults.
    fn sandbox_spec(&self, request: &ExecutionRequest, workspace: PathBuf) -> SandboxSpec {
        let profile = languages::profile_for(&request.language);

        let memory_limit = request
            .memory_limit
            .clone()
            .or(profile.memory_limit)
            .unwrap_or_else(|| self.config.default_memory_limit.clone());
        let cpu_limit = request
            .cpu_limit
            .clone()
            .or(profile.cpu_limit)
            .unwrap_or_else(|| self.config.default_cpu_limit.clone());

        let mut environment: Vec<String> = request
            .environment
            .iter()
            .flatten()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        environment.sort();

        SandboxSpec {
            workspace,
            image: profile.image,
            memory_limit,
            cpu_limit,
            environment,
        }
    }

    fn effective_timeout(&self, request: &ExecutionRequest) -> Duration {
        let requested = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        Duration::from_millis(requested.min(self.config.max_timeout_ms))
    }
}

/// Cut `text` off at the output cap, on a character boundary. The marker is
/// appended only when something was actually dropped.
fn truncate_output(mut text: String) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((offset, _)) => {
            text.truncate(offset);
            text.push_str(TRUNCATION_MARKER);
            text
        }
        None => text,
    }
}
