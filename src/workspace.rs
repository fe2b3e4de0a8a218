use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use wildmatch::WildMatch;

use crate::git::{GitError, GitRepo};
use crate::lock::{LockError, LockFactory, LockGuard, WorkspaceLock};

/// Names never copied between workspaces: version-control internals, the
/// ledger files (owned by the integration workspace), and build or cache
/// artifacts. Matched fnmatch-style against individual path components.
const IGNORE_PATTERNS: &[&str] = &[
    ".git*",
    ".issues.json",
    ".pull_requests.json",
    "target",
    "node_modules",
    "__pycache__",
    "*.pyc",
    "*.pyo",
    "*.log",
    ".DS_Store",
    "Thumbs.db",
    ".env",
    ".env.*",
    ".venv",
    "venv",
];

/// Errors from workspace provisioning and synchronization.
#[derive(Debug)]
pub enum WorkspaceError {
    /// A git operation inside a workspace failed.
    Git(GitError),
    /// The workspace's lock could not be acquired.
    Lock(LockError),
    /// A filesystem operation failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The named worker has no provisioned workspace.
    UnknownWorker { worker: String },
}

impl std::fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceError::Git(e) => write!(f, "workspace git operation: {e}"),
            WorkspaceError::Lock(e) => write!(f, "workspace lock: {e}"),
            WorkspaceError::Io { path, source } => {
                write!(f, "workspace I/O at {}: {source}", path.display())
            }
            WorkspaceError::UnknownWorker { worker } => {
                write!(f, "no workspace provisioned for worker '{worker}'")
            }
        }
    }
}

impl std::error::Error for WorkspaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkspaceError::Git(e) => Some(e),
            WorkspaceError::Lock(e) => Some(e),
            WorkspaceError::Io { source, .. } => Some(source),
            WorkspaceError::UnknownWorker { .. } => None,
        }
    }
}

impl From<GitError> for WorkspaceError {
    fn from(e: GitError) -> Self {
        WorkspaceError::Git(e)
    }
}

impl From<LockError> for WorkspaceError {
    fn from(e: LockError) -> Self {
        WorkspaceError::Lock(e)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// How `copy_tree` treats files already present at the destination.
#[derive(Clone, Copy, PartialEq)]
enum CopyMode {
    /// Copy only files the destination does not have.
    AbsentOnly,
    /// Copy everything, replacing destination content.
    Overwrite,
}

/// Totals from a propagation sweep across all worker workspaces.
#[derive(Debug, Default)]
pub struct PropagationReport {
    /// Workers successfully synchronized.
    pub workers: usize,
    /// Files added across all workers.
    pub files_added: usize,
    /// Workers whose sync failed (logged, not fatal).
    pub failures: usize,
}

/// Provisions one isolated git workspace per worker plus the shared
/// integration workspace, and moves content between them. Propagation is
/// non-destructive: a file the worker already has is never overwritten, so
/// in-flight work survives merges landing in integration.
pub struct WorkspaceManager {
    integration_dir: PathBuf,
    workers_dir: PathBuf,
    ignore: Vec<WildMatch>,
    locks: Arc<dyn LockFactory>,
    lock_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(
        integration_dir: impl Into<PathBuf>,
        workers_dir: impl Into<PathBuf>,
        locks: Arc<dyn LockFactory>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            integration_dir: integration_dir.into(),
            workers_dir: workers_dir.into(),
            ignore: IGNORE_PATTERNS.iter().map(|p| WildMatch::new(p)).collect(),
            locks,
            lock_timeout,
        }
    }

    /// Handle to the integration workspace repository. Call
    /// `provision_integration` first on a fresh data directory.
    pub fn integration_repo(&self) -> GitRepo {
        GitRepo::new(&self.integration_dir)
    }

    /// The lock guarding the integration workspace. The ledgers live inside
    /// integration, so this is also the lock every ledger operation takes.
    pub fn integration_lock(&self) -> Arc<dyn WorkspaceLock> {
        self.locks.lock_for("integration")
    }

    /// The lock guarding one worker's workspace.
    pub fn worker_lock(&self, worker_id: &str) -> Arc<dyn WorkspaceLock> {
        self.locks.lock_for(worker_id)
    }

    /// Acquires exclusive use of the integration workspace for git mutations
    /// that bypass the ledger layer.
    pub async fn lock_integration(&self) -> Result<LockGuard, WorkspaceError> {
        Ok(self.integration_lock().acquire(self.lock_timeout).await?)
    }

    /// Acquires exclusive use of one worker's workspace, serializing that
    /// worker's own branch work against sync sweeps touching the same
    /// checkout.
    pub async fn lock_worker(&self, worker_id: &str) -> Result<LockGuard, WorkspaceError> {
        Ok(self.worker_lock(worker_id).acquire(self.lock_timeout).await?)
    }

    /// Creates the integration workspace if absent. Idempotent.
    pub async fn provision_integration(&self) -> Result<GitRepo, WorkspaceError> {
        let readme = "# integration workspace\n\nShared trunk that accepted changes merge into.\n";
        self.provision_at(&self.integration_dir, "integration", readme)
            .await
    }

    /// Creates a worker workspace if absent. Idempotent; the directory's
    /// existence is what registers the worker.
    pub async fn provision_worker(&self, worker_id: &str) -> Result<GitRepo, WorkspaceError> {
        let dir = self.workers_dir.join(worker_id);
        let readme =
            format!("# {worker_id} workspace\n\nIsolated workspace for worker {worker_id}.\n");
        self.provision_at(&dir, worker_id, &readme).await
    }

    async fn provision_at(
        &self,
        dir: &Path,
        identity: &str,
        readme: &str,
    ) -> Result<GitRepo, WorkspaceError> {
        if dir.join(".git").exists() {
            debug!(workspace = identity, "workspace already provisioned");
            return Ok(GitRepo::new(dir));
        }
        let repo = GitRepo::init(dir).await?;
        repo.set_local_identity(identity, &format!("{identity}@foreman.local"))
            .await?;
        let readme_path = dir.join("README.md");
        std::fs::write(&readme_path, readme).map_err(|e| io_error(&readme_path, e))?;
        repo.commit_paths("Initial commit", &["README.md"]).await?;
        repo.rename_branch("main").await?;
        info!(workspace = identity, dir = %dir.display(), "workspace provisioned");
        Ok(repo)
    }

    /// Handle to an existing worker workspace.
    pub fn worker_repo(&self, worker_id: &str) -> Result<GitRepo, WorkspaceError> {
        let dir = self.workers_dir.join(worker_id);
        if !dir.join(".git").exists() {
            return Err(WorkspaceError::UnknownWorker {
                worker: worker_id.to_string(),
            });
        }
        Ok(GitRepo::new(dir))
    }

    /// Ids of all provisioned workers, sorted.
    pub fn worker_ids(&self) -> Result<Vec<String>, WorkspaceError> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.workers_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(io_error(&self.workers_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.workers_dir, e))?;
            let path = entry.path();
            if path.join(".git").exists()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes a worker's workspace directory. Returns false if there was
    /// nothing to remove.
    pub fn remove_worker(&self, worker_id: &str) -> Result<bool, WorkspaceError> {
        let dir = self.workers_dir.join(worker_id);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        info!(worker = worker_id, "worker workspace removed");
        Ok(true)
    }

    /// Copies integration files into every worker workspace, adding only
    /// files the worker does not already have, and commits the additions per
    /// worker. A failing worker is logged and skipped; the sweep continues.
    /// Re-running is safe: a second pass finds nothing left to add.
    pub async fn propagate_to_workers(&self) -> Result<PropagationReport, WorkspaceError> {
        let mut report = PropagationReport::default();
        for worker_id in self.worker_ids()? {
            match self.propagate_to_worker(&worker_id).await {
                Ok(added) => {
                    report.workers += 1;
                    report.files_added += added;
                }
                Err(e) => {
                    warn!(worker = %worker_id, error = %e, "propagation to worker failed");
                    report.failures += 1;
                }
            }
        }
        debug!(
            workers = report.workers,
            files = report.files_added,
            failures = report.failures,
            "propagation sweep finished"
        );
        Ok(report)
    }

    /// Absent-only copy from integration into one worker. The worker may be
    /// sitting on a feature branch; syncs always land on main. Holds both
    /// workspace locks for the duration, worker before integration.
    pub async fn propagate_to_worker(&self, worker_id: &str) -> Result<usize, WorkspaceError> {
        let repo = self.worker_repo(worker_id)?;
        let _worker_guard = self.lock_worker(worker_id).await?;
        let _integration_guard = self.lock_integration().await?;
        if repo.current_branch().await? != "main" {
            repo.checkout("main").await?;
        }
        let copied = self.copy_tree(&self.integration_dir, repo.dir(), CopyMode::AbsentOnly);
        if !copied.is_empty() {
            let refs: Vec<&str> = copied.iter().map(String::as_str).collect();
            repo.commit_paths("Sync from integration repository", &refs)
                .await?;
            debug!(worker = worker_id, files = copied.len(), "propagated integration state");
        }
        Ok(copied.len())
    }

    /// Bulk path folding a worker's output back outside the PR flow: copies
    /// every non-ignored file from the worker into the integration workspace,
    /// replacing existing content, and commits there. Lock order matches
    /// propagation, worker before integration.
    pub async fn reconcile_to_integration(
        &self,
        worker_id: &str,
        integration: &GitRepo,
    ) -> Result<usize, WorkspaceError> {
        let worker = self.worker_repo(worker_id)?;
        let _worker_guard = self.lock_worker(worker_id).await?;
        let _integration_guard = self.lock_integration().await?;
        let copied = self.copy_tree(worker.dir(), integration.dir(), CopyMode::Overwrite);
        if !copied.is_empty() {
            let refs: Vec<&str> = copied.iter().map(String::as_str).collect();
            integration
                .commit_paths(&format!("Sync from {worker_id}"), &refs)
                .await?;
            info!(worker = worker_id, files = copied.len(), "reconciled into integration");
        }
        Ok(copied.len())
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|p| p.matches(name))
    }

    /// Walks `src` and copies eligible files under `dest`, returning the
    /// relative paths copied. Individual file failures are warnings; the walk
    /// keeps going.
    fn copy_tree(&self, src: &Path, dest: &Path, mode: CopyMode) -> Vec<String> {
        let mut copied = Vec::new();
        self.copy_dir(src, dest, Path::new(""), mode, &mut copied);
        copied.sort();
        copied
    }

    fn copy_dir(
        &self,
        src_root: &Path,
        dest_root: &Path,
        rel: &Path,
        mode: CopyMode,
        copied: &mut Vec<String>,
    ) {
        let src_dir = src_root.join(rel);
        let entries = match std::fs::read_dir(&src_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %src_dir.display(), error = %e, "cannot read directory, skipping");
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %src_dir.display(), error = %e, "cannot read entry, skipping");
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(dir = %src_dir.display(), "skipping non-UTF-8 file name");
                continue;
            };
            if self.is_ignored(name) {
                continue;
            }
            let entry_rel = rel.join(name);
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "cannot stat entry, skipping");
                    continue;
                }
            };
            if file_type.is_dir() {
                self.copy_dir(src_root, dest_root, &entry_rel, mode, copied);
            } else if file_type.is_file() {
                let dest_path = dest_root.join(&entry_rel);
                if mode == CopyMode::AbsentOnly && dest_path.exists() {
                    continue;
                }
                if let Some(parent) = dest_path.parent()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    warn!(path = %dest_path.display(), error = %e, "cannot create parent, skipping file");
                    continue;
                }
                match std::fs::copy(entry.path(), &dest_path) {
                    Ok(_) => copied.push(entry_rel.to_string_lossy().replace('\\', "/")),
                    Err(e) => {
                        warn!(path = %dest_path.display(), error = %e, "copy failed, skipping file")
                    }
                }
            }
            // Symlinks and other special files are not propagated.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockFactory;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> WorkspaceManager {
        WorkspaceManager::new(
            dir.path().join("integration"),
            dir.path().join("workers"),
            Arc::new(MemoryLockFactory::new()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_provision_worker_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let repo = mgr.provision_worker("worker-1").await.unwrap();
        assert!(repo.dir().join("README.md").exists());
        assert_eq!(repo.current_branch().await.unwrap(), "main");

        // Second provision returns the same workspace without a new commit.
        mgr.provision_worker("worker-1").await.unwrap();
        assert_eq!(repo.log_oneline(10).await.unwrap().len(), 1);

        let readme = std::fs::read_to_string(repo.dir().join("README.md")).unwrap();
        assert!(readme.contains("# worker-1 workspace"));
    }

    #[tokio::test]
    async fn test_worker_ids_lists_provisioned_sorted() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        assert!(mgr.worker_ids().unwrap().is_empty());
        mgr.provision_worker("worker-2").await.unwrap();
        mgr.provision_worker("worker-1").await.unwrap();
        assert_eq!(mgr.worker_ids().unwrap(), vec!["worker-1", "worker-2"]);
    }

    #[tokio::test]
    async fn test_worker_repo_unknown_worker() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(matches!(
            mgr.worker_repo("ghost"),
            Err(WorkspaceError::UnknownWorker { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_worker_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        mgr.provision_worker("worker-1").await.unwrap();
        assert!(mgr.remove_worker("worker-1").unwrap());
        assert!(!mgr.remove_worker("worker-1").unwrap());
        assert!(mgr.worker_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_propagation_adds_absent_files_only() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let integration = mgr.provision_integration().await.unwrap();
        let worker = mgr.provision_worker("worker-1").await.unwrap();

        // The worker has local, uncommitted content for shared.txt.
        std::fs::write(worker.dir().join("shared.txt"), "worker edit").unwrap();
        std::fs::write(integration.dir().join("shared.txt"), "integration version").unwrap();
        std::fs::create_dir_all(integration.dir().join("src")).unwrap();
        std::fs::write(integration.dir().join("src/new.rs"), "pub fn new() {}").unwrap();
        integration.commit_all("Add shared and new").await.unwrap();

        let report = mgr.propagate_to_workers().await.unwrap();
        assert_eq!(report.workers, 1);
        assert_eq!(report.failures, 0);

        // Absent file arrived, existing file untouched.
        assert_eq!(
            std::fs::read_to_string(worker.dir().join("src/new.rs")).unwrap(),
            "pub fn new() {}"
        );
        assert_eq!(
            std::fs::read_to_string(worker.dir().join("shared.txt")).unwrap(),
            "worker edit"
        );
        let log = worker.log_oneline(10).await.unwrap();
        assert!(log.iter().any(|l| l.contains("Sync from integration repository")));
    }

    #[tokio::test]
    async fn test_propagation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let integration = mgr.provision_integration().await.unwrap();
        mgr.provision_worker("worker-1").await.unwrap();

        std::fs::write(integration.dir().join("lib.rs"), "pub mod a;").unwrap();
        integration.commit_all("Add lib").await.unwrap();

        let first = mgr.propagate_to_workers().await.unwrap();
        assert_eq!(first.files_added, 1);
        let second = mgr.propagate_to_workers().await.unwrap();
        assert_eq!(second.files_added, 0);
    }

    #[tokio::test]
    async fn test_propagation_returns_worker_to_main() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let integration = mgr.provision_integration().await.unwrap();
        let worker = mgr.provision_worker("worker-1").await.unwrap();
        worker.create_branch("feature/abc-worker-1").await.unwrap();

        std::fs::write(integration.dir().join("x.txt"), "x").unwrap();
        integration.commit_all("Add x").await.unwrap();

        mgr.propagate_to_worker("worker-1").await.unwrap();
        assert_eq!(worker.current_branch().await.unwrap(), "main");
        assert!(worker.dir().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_propagation_skips_ignored_names() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let integration = mgr.provision_integration().await.unwrap();
        let worker = mgr.provision_worker("worker-1").await.unwrap();

        std::fs::write(integration.dir().join(".issues.json"), "{\"issues\":[]}").unwrap();
        std::fs::create_dir_all(integration.dir().join("target")).unwrap();
        std::fs::write(integration.dir().join("target/out.log"), "junk").unwrap();
        std::fs::write(integration.dir().join("keep.txt"), "keep").unwrap();
        integration.commit_all("Add files").await.unwrap();

        mgr.propagate_to_worker("worker-1").await.unwrap();
        assert!(worker.dir().join("keep.txt").exists());
        assert!(!worker.dir().join(".issues.json").exists());
        assert!(!worker.dir().join("target").exists());
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_integration_content() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let integration = mgr.provision_integration().await.unwrap();
        let worker = mgr.provision_worker("worker-1").await.unwrap();

        std::fs::write(integration.dir().join("data.txt"), "old").unwrap();
        integration.commit_all("Add data").await.unwrap();
        std::fs::write(worker.dir().join("data.txt"), "new").unwrap();
        std::fs::write(worker.dir().join("extra.txt"), "extra").unwrap();
        worker.commit_all("Worker changes").await.unwrap();

        let copied = mgr
            .reconcile_to_integration("worker-1", &integration)
            .await
            .unwrap();
        assert!(copied >= 2);
        assert_eq!(
            std::fs::read_to_string(integration.dir().join("data.txt")).unwrap(),
            "new"
        );
        assert!(integration.dir().join("extra.txt").exists());
        let log = integration.log_oneline(10).await.unwrap();
        assert!(log.iter().any(|l| l.contains("Sync from worker-1")));
    }
}
