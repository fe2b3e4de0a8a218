use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

/// Errors from the git subprocess wrapper.
#[derive(Debug)]
pub enum GitError {
    /// A git command exited non-zero for a reason we don't tolerate.
    Command { op: String, detail: String },
    /// The named branch does not exist.
    BranchMissing(String),
    /// Refusing to delete the currently checked-out branch.
    BranchCheckedOut(String),
    /// Spawning or waiting on the git process failed.
    Io(std::io::Error),
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::Command { op, detail } => write!(f, "git {op} failed: {detail}"),
            GitError::BranchMissing(b) => write!(f, "branch not found: {b}"),
            GitError::BranchCheckedOut(b) => {
                write!(f, "cannot delete checked-out branch: {b}")
            }
            GitError::Io(e) => write!(f, "I/O error running git: {e}"),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        GitError::Io(e)
    }
}

/// One git working copy, addressed by its root directory. All operations
/// shell out to the `git` binary; commit ids are returned as opaque strings.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    /// Wrap an existing working copy. No validation happens here; the
    /// first operation fails naturally if the directory is not a repo.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Initialize a fresh repository at `dir`, creating the directory if
    /// needed.
    pub async fn init(dir: &Path) -> Result<Self, GitError> {
        std::fs::create_dir_all(dir)?;
        let repo = Self::new(dir);
        repo.run(&["init"]).await?;
        Ok(repo)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Set a repository-local committer identity so commits succeed in
    /// environments without a global git config.
    pub async fn set_local_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run(&["config", "user.name", name]).await?;
        self.run(&["config", "user.email", email]).await?;
        Ok(())
    }

    /// Stage the given paths.
    pub async fn add(&self, paths: &[&str]) -> Result<(), GitError> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run(&args).await?;
        Ok(())
    }

    /// Stage everything, including deletions and untracked files.
    pub async fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"]).await?;
        Ok(())
    }

    /// Commit whatever is staged. "Nothing to commit" is not a failure:
    /// the current HEAD is returned instead, so callers can treat an
    /// empty change set as already applied.
    pub async fn commit(&self, message: &str) -> Result<String, GitError> {
        match self.run(&["commit", "-m", message]).await {
            Ok(_) => self.head_commit().await,
            Err(GitError::Command { detail, .. }) if is_nothing_to_commit(&detail) => {
                debug!(dir = %self.dir.display(), "nothing to commit");
                self.head_commit().await
            }
            Err(e) => Err(e),
        }
    }

    /// Stage `paths` and commit them in one step.
    pub async fn commit_paths(&self, message: &str, paths: &[&str]) -> Result<String, GitError> {
        self.add(paths).await?;
        self.commit(message).await
    }

    /// Stage all changes and commit them.
    pub async fn commit_all(&self, message: &str) -> Result<String, GitError> {
        self.add_all().await?;
        self.commit(message).await
    }

    /// Check whether a local branch exists.
    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let status = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .current_dir(&self.dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    /// Create `branch` and switch to it. If the branch already exists,
    /// just switch (matches the idempotent submit path: resubmission
    /// reuses the same source branch).
    pub async fn create_branch(&self, branch: &str) -> Result<(), GitError> {
        if self.branch_exists(branch).await? {
            debug!(branch, "branch exists, checking out");
            return self.checkout(branch).await;
        }
        self.run(&["checkout", "-b", branch]).await?;
        Ok(())
    }

    /// Switch to an existing branch.
    pub async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        if !self.branch_exists(branch).await? {
            return Err(GitError::BranchMissing(branch.to_string()));
        }
        self.run(&["checkout", branch]).await?;
        Ok(())
    }

    /// Force-delete a branch. A missing branch is fine (already gone);
    /// the currently checked-out branch is refused.
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        if !self.branch_exists(branch).await? {
            debug!(branch, "branch already gone");
            return Ok(());
        }
        if self.current_branch().await? == branch {
            return Err(GitError::BranchCheckedOut(branch.to_string()));
        }
        self.run(&["branch", "-D", branch]).await?;
        Ok(())
    }

    /// List local branch names.
    pub async fn list_branches(&self) -> Result<Vec<String>, GitError> {
        let out = self
            .run(&["branch", "--format=%(refname:short)"])
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Rename the current branch (used to normalize the default branch).
    pub async fn rename_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", "-M", name]).await?;
        Ok(())
    }

    /// Name of the current branch, falling back to `main` when detached.
    pub async fn current_branch(&self) -> Result<String, GitError> {
        let out = self.run(&["branch", "--show-current"]).await?;
        let name = out.trim();
        if name.is_empty() {
            return Ok("main".to_string());
        }
        Ok(name.to_string())
    }

    /// Merge `branch` into the current branch and return the resulting
    /// commit id.
    pub async fn merge_branch(
        &self,
        branch: &str,
        message: Option<&str>,
    ) -> Result<String, GitError> {
        if !self.branch_exists(branch).await? {
            return Err(GitError::BranchMissing(branch.to_string()));
        }
        let default_msg = format!("Merge branch '{branch}'");
        let msg = message.unwrap_or(&default_msg);
        self.run(&["merge", branch, "-m", msg]).await?;
        self.head_commit().await
    }

    /// Current HEAD commit id.
    pub async fn head_commit(&self) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// `git status --porcelain` output.
    pub async fn status_porcelain(&self) -> Result<String, GitError> {
        self.run(&["status", "--porcelain"]).await
    }

    /// Recent commits, one `--oneline` entry per element. An unborn
    /// repository yields an empty list rather than an error.
    pub async fn log_oneline(&self, limit: usize) -> Result<Vec<String>, GitError> {
        let count = limit.to_string();
        match self.run(&["log", "--oneline", "-n", &count]).await {
            Ok(out) => Ok(out.lines().map(|l| l.to_string()).collect()),
            Err(GitError::Command { detail, .. })
                if detail.contains("does not have any commits") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Configured remote names.
    pub async fn remotes(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["remote"]).await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Push to origin. Returns false (and skips quietly) when no origin
    /// remote is configured, which is the normal single-host setup.
    pub async fn push(&self) -> Result<bool, GitError> {
        if !self.remotes().await?.iter().any(|r| r == "origin") {
            debug!(dir = %self.dir.display(), "no origin remote, skipping push");
            return Ok(false);
        }
        self.run(&["push", "origin"]).await?;
        Ok(true)
    }

    /// Pull from origin, skipping quietly when no origin is configured.
    pub async fn pull(&self) -> Result<bool, GitError> {
        if !self.remotes().await?.iter().any(|r| r == "origin") {
            debug!(dir = %self.dir.display(), "no origin remote, skipping pull");
            return Ok(false);
        }
        self.run(&["pull"]).await?;
        Ok(true)
    }

    /// Run a git subcommand in this working copy, returning stdout.
    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(GitError::Command {
                op: args.first().unwrap_or(&"git").to_string(),
                detail,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_nothing_to_commit(detail: &str) -> bool {
    detail.contains("nothing to commit")
        || detail.contains("nothing added to commit")
        || detail.contains("no changes added to commit")
}
