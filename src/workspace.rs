//! Workspace store
//!
//! Per-request isolated staging directories under a configured root.
//! Caller-supplied files are written with path-escape checks and size
//! limits; after execution the workspace is scanned into an output file set
//! with content hashes. Purging is deferred so failed runs stay inspectable
//! for a window, and is safe to repeat.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::types::{FileDefinition, GeneratedFile};
use crate::validator::unsafe_path_reason;

/// Directories skipped when scanning a workspace for output files
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    "target",
    ".venv",
    ".cache",
];

/// Owns the workspace root and the lifecycle of directories under it
#[derive(Clone)]
pub struct WorkspaceStore {
    config: Arc<EngineConfig>,
}

impl WorkspaceStore {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Allocate a fresh workspace directory named `{task_id}-{random}`
    pub async fn create_workspace(&self, task_id: &str) -> Result<PathBuf, ExecutionError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", sanitize_task_id(task_id), &suffix[..8]);
        let workspace = self.config.workspace_root.join(name);

        fs::create_dir_all(&workspace)
            .await
            .map_err(ExecutionError::WorkspaceCreation)?;
        // The sandboxed command runs as a non-root mapped user against a
        // bind mount of this directory and must be able to write outputs.
        fs::set_permissions(&workspace, std::fs::Permissions::from_mode(0o777))
            .await
            .map_err(ExecutionError::WorkspaceCreation)?;

        info!("Created workspace {:?}", workspace);
        Ok(workspace)
    }

    /// Write the request's input files into `workspace`, returning the
    /// absolute paths written (the original input set).
    ///
    /// Rejects any path that would land outside the workspace before a
    /// single byte is written, and enforces the per-file and aggregate size
    /// caps. An over-quota workspace is removed rather than left behind.
    pub async fn write_files(
        &self,
        workspace: &Path,
        files: &[FileDefinition],
    ) -> Result<Vec<PathBuf>, ExecutionError> {
        for file in files {
            resolve_in_workspace(workspace, &file.path)?;
            let size = file.content.len() as u64;
            if size > self.config.max_file_size {
                return Err(ExecutionError::FileTooLarge {
                    path: file.path.clone(),
                    size,
                    limit: self.config.max_file_size,
                });
            }
        }

        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let absolute = resolve_in_workspace(workspace, &file.path)?;
            if let Some(parent) = absolute.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(ExecutionError::FileWrite)?;
            }
            fs::write(&absolute, &file.content)
                .await
                .map_err(ExecutionError::FileWrite)?;

            let mode = if file.executable { 0o755 } else { 0o644 };
            fs::set_permissions(&absolute, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(ExecutionError::FileWrite)?;

            written.push(absolute);
        }

        let total = dir_size(workspace)
            .await
            .map_err(ExecutionError::FileWrite)?;
        if total > self.config.max_workspace_size {
            // Do not leave an over-quota workspace behind
            self.cleanup_workspace(workspace).await;
            return Err(ExecutionError::QuotaExceeded {
                size: total,
                limit: self.config.max_workspace_size,
            });
        }

        debug!(
            "Wrote {} files ({} bytes) to {:?}",
            files.len(),
            total,
            workspace
        );
        Ok(written)
    }

    /// Scan the workspace into an output file set, diffing against the
    /// original input paths. Oversized files are skipped, not fatal.
    pub async fn collect_output(
        &self,
        workspace: &Path,
        original: &HashSet<PathBuf>,
    ) -> Result<Vec<GeneratedFile>, ExecutionError> {
        let mut outputs = Vec::new();
        let mut pending = vec![workspace.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(ExecutionError::OutputCollection)?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(ExecutionError::OutputCollection)?
            {
                let path = entry.path();
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(ExecutionError::OutputCollection)?;

                // The executed command may have planted symlinks pointing
                // outside the workspace; reading through them would leak
                // host files into the result.
                if metadata.file_type().is_symlink() {
                    warn!("Skipping symlink {:?} in workspace output", path);
                    continue;
                }

                if metadata.is_dir() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if SKIPPED_DIRS.contains(&name.as_ref()) {
                        continue;
                    }
                    pending.push(path);
                    continue;
                }

                if metadata.len() > self.config.max_file_size {
                    warn!(
                        "Skipping oversized output file {:?} ({} bytes)",
                        path,
                        metadata.len()
                    );
                    continue;
                }

                let bytes = fs::read(&path)
                    .await
                    .map_err(ExecutionError::OutputCollection)?;
                let relative = path
                    .strip_prefix(workspace)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();

                outputs.push(GeneratedFile {
                    path: relative,
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                    size: metadata.len(),
                    hash: format!("{:x}", Sha256::digest(&bytes)),
                    created: !original.contains(&path),
                });
            }
        }

        outputs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(outputs)
    }

    /// Remove a workspace tree. Idempotent; refuses paths outside the
    /// configured root. Failures are logged, never propagated.
    pub async fn cleanup_workspace(&self, workspace: &Path) {
        if !workspace.starts_with(&self.config.workspace_root) {
            warn!(
                "Refusing to remove {:?}: outside workspace root {:?}",
                workspace, self.config.workspace_root
            );
            return;
        }

        match fs::remove_dir_all(workspace).await {
            Ok(()) => info!("Removed workspace {:?}", workspace),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {:?}: {}", workspace, e),
        }
    }

    /// Purge `workspace` after the configured cooldown delay
    pub fn schedule_cleanup(&self, workspace: PathBuf) {
        let store = self.clone();
        let delay = self.config.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.cleanup_workspace(&workspace).await;
        });
    }
}

/// Resolve a request-relative path inside `workspace`, rejecting escapes
fn resolve_in_workspace(workspace: &Path, relative: &str) -> Result<PathBuf, ExecutionError> {
    if unsafe_path_reason(relative).is_some() {
        return Err(ExecutionError::InvalidPath(relative.to_string()));
    }
    let absolute = workspace.join(relative);
    if !absolute.starts_with(workspace) {
        return Err(ExecutionError::InvalidPath(relative.to_string()));
    }
    Ok(absolute)
}

/// Task ids come from callers; keep the directory name shell- and path-safe
fn sanitize_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

async fn dir_size(root: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.file_type().is_symlink() {
                continue;
            }
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_root(root: &TempDir) -> WorkspaceStore {
        let config = EngineConfig {
            workspace_root: root.path().to_path_buf(),
            ..EngineConfig::default()
        };
        WorkspaceStore::new(Arc::new(config))
    }

    fn file(path: &str, content: &str) -> FileDefinition {
        FileDefinition {
            path: path.to_string(),
            content: content.to_string(),
            executable: false,
        }
    }

    #[tokio::test]
    async fn test_write_and_collect_roundtrip() {
        let root = TempDir::new().unwrap();
        let store = store_with_root(&root);

        let workspace = store.create_workspace("t1").await.unwrap();
        let written = store
            .write_files(&workspace, &[file("hello.txt", "Hello from file!")])
            .await
            .unwrap();
        let original: HashSet<PathBuf> = written.into_iter().collect();

        let outputs = store.collect_output(&workspace, &original).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].path, "hello.txt");
        assert_eq!(outputs[0].content, "Hello from file!");
        assert_eq!(outputs[0].size, 16);
        assert!(!outputs[0].created);
        assert_eq!(
            outputs[0].hash,
            format!("{:x}", Sha256::digest(b"Hello from file!"))
        );
    }

    #[tokio::test]
    async fn test_rejects_escape_paths_before_writing() {
        let root = TempDir::new().unwrap();
        let store = store_with_root(&root);
        let workspace = store.create_workspace("t1").await.unwrap();

        for path in ["../../etc/passwd", "/etc/passwd", "a/../../b"] {
            let result = store.write_files(&workspace, &[file(path, "x")]).await;
            assert!(matches!(result, Err(ExecutionError::InvalidPath(_))));
        }

        // Nothing was written
        let outputs = store
            .collect_output(&workspace, &HashSet::new())
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_per_file_size_cap() {
        let root = TempDir::new().unwrap();
        let config = EngineConfig {
            workspace_root: root.path().to_path_buf(),
            max_file_size: 8,
            ..EngineConfig::default()
        };
        let store = WorkspaceStore::new(Arc::new(config));
        let workspace = store.create_workspace("t1").await.unwrap();

        let result = store
            .write_files(&workspace, &[file("big.txt", "123456789")])
            .await;
        assert!(matches!(result, Err(ExecutionError::FileTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_workspace_quota_removes_partial_workspace() {
        let root = TempDir::new().unwrap();
        let config = EngineConfig {
            workspace_root: root.path().to_path_buf(),
            max_file_size: 1024,
            max_workspace_size: 10,
            ..EngineConfig::default()
        };
        let store = WorkspaceStore::new(Arc::new(config));
        let workspace = store.create_workspace("t1").await.unwrap();

        let result = store
            .write_files(
                &workspace,
                &[file("a.txt", "123456"), file("b.txt", "abcdef")],
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::QuotaExceeded { .. })));
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_collect_marks_new_files_created() {
        let root = TempDir::new().unwrap();
        let store = store_with_root(&root);
        let workspace = store.create_workspace("t1").await.unwrap();

        let written = store
            .write_files(&workspace, &[file("input.txt", "in")])
            .await
            .unwrap();
        let original: HashSet<PathBuf> = written.into_iter().collect();

        // Simulate the executed command producing a file
        std::fs::write(workspace.join("output.txt"), "out").unwrap();

        let outputs = store.collect_output(&workspace, &original).await.unwrap();
        assert_eq!(outputs.len(), 2);
        let input = outputs.iter().find(|f| f.path == "input.txt").unwrap();
        let output = outputs.iter().find(|f| f.path == "output.txt").unwrap();
        assert!(!input.created);
        assert!(output.created);
    }

    #[tokio::test]
    async fn test_collect_skips_noise_dirs_and_oversized_files() {
        let root = TempDir::new().unwrap();
        let config = EngineConfig {
            workspace_root: root.path().to_path_buf(),
            max_file_size: 4,
            ..EngineConfig::default()
        };
        let store = WorkspaceStore::new(Arc::new(config));
        let workspace = store.create_workspace("t1").await.unwrap();

        std::fs::create_dir(workspace.join(".git")).unwrap();
        std::fs::write(workspace.join(".git").join("HEAD"), "ref").unwrap();
        std::fs::write(workspace.join("ok.txt"), "ok").unwrap();
        std::fs::write(workspace.join("big.txt"), "too large").unwrap();

        let outputs = store
            .collect_output(&workspace, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].path, "ok.txt");
    }

    #[tokio::test]
    async fn test_collect_skips_symlinks_out_of_workspace() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let store = store_with_root(&root);
        let workspace = store.create_workspace("t1").await.unwrap();

        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "TOP SECRET HOST DATA").unwrap();
        std::os::unix::fs::symlink(&secret, workspace.join("leak.txt")).unwrap();
        std::fs::write(workspace.join("ok.txt"), "ok").unwrap();

        let outputs = store
            .collect_output(&workspace, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].path, "ok.txt");
        assert!(outputs.iter().all(|f| f.content != "TOP SECRET HOST DATA"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let root = TempDir::new().unwrap();
        let store = store_with_root(&root);
        let workspace = store.create_workspace("t1").await.unwrap();

        store.cleanup_workspace(&workspace).await;
        assert!(!workspace.exists());
        // Second removal of a gone path is a no-op
        store.cleanup_workspace(&workspace).await;
    }

    #[tokio::test]
    async fn test_cleanup_refuses_paths_outside_root() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let store = store_with_root(&root);

        let victim = other.path().join("precious");
        std::fs::create_dir(&victim).unwrap();

        store.cleanup_workspace(&victim).await;
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn test_task_id_is_sanitized() {
        let root = TempDir::new().unwrap();
        let store = store_with_root(&root);

        let workspace = store.create_workspace("../sneaky/id").await.unwrap();
        assert!(workspace.starts_with(root.path()));
        assert!(workspace.exists());
    }
}
