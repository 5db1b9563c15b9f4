//! Request validation
//!
//! Pre-flight checks run before any resource is allocated. Returns
//! human-readable violation strings; an empty list means the request is
//! valid. Path safety is re-checked by the workspace store at write time,
//! but a request that fails here never touches the file system at all.

use std::path::{Component, Path};

use crate::types::ExecutionRequest;

/// Hard wall-clock ceiling for a single execution (5 minutes)
pub const HARD_TIMEOUT_CEILING_MS: u64 = 300_000;

/// Validate a request, returning every violation found
pub fn validate_execution_request(request: &ExecutionRequest) -> Vec<String> {
    let mut violations = Vec::new();

    if request.task_id.trim().is_empty() {
        violations.push("task_id is required".to_string());
    }
    if request.command.trim().is_empty() {
        violations.push("command is required".to_string());
    }
    if request.files.is_empty() {
        violations.push("files must not be empty".to_string());
    }
    if let Some(timeout) = request.timeout_ms {
        if timeout > HARD_TIMEOUT_CEILING_MS {
            violations.push(format!(
                "timeout {}ms exceeds the {}ms ceiling",
                timeout, HARD_TIMEOUT_CEILING_MS
            ));
        }
    }
    for file in &request.files {
        if let Some(reason) = unsafe_path_reason(&file.path) {
            violations.push(format!("invalid file path {:?}: {}", file.path, reason));
        }
    }

    violations
}

/// Why `path` may not be staged into a workspace, if anything
pub(crate) fn unsafe_path_reason(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        return Some("path is empty");
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Some("absolute paths are not allowed");
    }
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Some("parent directory segments are not allowed");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileDefinition;

    fn base_request() -> ExecutionRequest {
        ExecutionRequest {
            task_id: "t1".to_string(),
            language: "python".to_string(),
            files: vec![FileDefinition {
                path: "main.py".to_string(),
                content: "print('hi')".to_string(),
                executable: false,
            }],
            command: "python3 main.py".to_string(),
            timeout_ms: Some(10_000),
            memory_limit: None,
            cpu_limit: None,
            environment: None,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_execution_request(&base_request()).is_empty());
    }

    #[test]
    fn test_missing_fields() {
        let mut request = base_request();
        request.task_id = "  ".to_string();
        request.command = String::new();
        request.files.clear();

        let violations = validate_execution_request(&request);
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().any(|v| v.contains("task_id")));
        assert!(violations.iter().any(|v| v.contains("command")));
        assert!(violations.iter().any(|v| v.contains("files")));
    }

    #[test]
    fn test_timeout_ceiling() {
        let mut request = base_request();
        request.timeout_ms = Some(HARD_TIMEOUT_CEILING_MS + 1);

        let violations = validate_execution_request(&request);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("ceiling"));
    }

    #[test]
    fn test_escape_paths_rejected() {
        for path in ["../../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            let mut request = base_request();
            request.files[0].path = path.to_string();
            let violations = validate_execution_request(&request);
            assert!(
                violations.iter().any(|v| v.contains("invalid file path")),
                "expected {:?} to be rejected",
                path
            );
        }
    }

    #[test]
    fn test_nested_relative_path_allowed() {
        let mut request = base_request();
        request.files[0].path = "src/deep/nested/mod.rs".to_string();
        assert!(validate_execution_request(&request).is_empty());
    }
}
