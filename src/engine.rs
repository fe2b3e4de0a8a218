use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::git::{GitError, GitRepo};
use crate::ledger::{Ledger, LedgerError, Transition};
use crate::model::{Issue, IssueStatus, PrStatus, PullRequest, ReviewComment};
use crate::workspace::{WorkspaceError, WorkspaceManager};

/// Errors from pull-request lifecycle operations.
#[derive(Debug)]
pub enum EngineError {
    /// A ledger read or transition failed.
    Ledger(LedgerError),
    /// A git operation in a workspace failed.
    Git(GitError),
    /// A workspace could not be resolved or synchronized.
    Workspace(WorkspaceError),
    /// Writing a change-set file failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A change set named a path outside the workspace root.
    UnsafePath { path: String },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Ledger(e) => write!(f, "ledger: {e}"),
            EngineError::Git(e) => write!(f, "git: {e}"),
            EngineError::Workspace(e) => write!(f, "workspace: {e}"),
            EngineError::Io { path, source } => {
                write!(f, "writing change set at {}: {source}", path.display())
            }
            EngineError::UnsafePath { path } => {
                write!(f, "change set path escapes the workspace: {path}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Ledger(e) => Some(e),
            EngineError::Git(e) => Some(e),
            EngineError::Workspace(e) => Some(e),
            EngineError::Io { source, .. } => Some(source),
            EngineError::UnsafePath { .. } => None,
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::Ledger(e)
    }
}

impl From<GitError> for EngineError {
    fn from(e: GitError) -> Self {
        EngineError::Git(e)
    }
}

impl From<WorkspaceError> for EngineError {
    fn from(e: WorkspaceError) -> Self {
        EngineError::Workspace(e)
    }
}

/// Result of a claim attempt. Losing the race is a normal outcome.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Issue),
    /// Another worker holds the issue, it is finished, or it is unknown.
    AlreadyClaimed,
}

/// Result of a review.
#[derive(Debug)]
pub enum ReviewOutcome {
    /// Approved and landed in the integration workspace.
    Merged(PullRequest),
    /// Approval recorded but the merge was refused; `merge` can be retried.
    ApprovedPendingMerge(PullRequest),
    /// Not approved. The PR stays open with the comment appended so the
    /// author can resubmit through the same PR id.
    ChangesRequested(PullRequest),
    /// The PR is not open (or not present); nothing was recorded.
    NotReviewable,
}

/// Result of a merge attempt.
#[derive(Debug)]
pub enum MergeOutcome {
    Merged(PullRequest),
    /// The PR is not in the approved state (never approved, already
    /// merged, or unknown).
    NotMergeable,
}

/// Result of a resubmission attempt.
#[derive(Debug)]
pub enum ResubmitOutcome {
    Updated(PullRequest),
    /// The PR is not open, not owned by the caller, or unknown.
    NotResubmittable,
}

/// Drives the pull-request lifecycle: submission out of a worker workspace,
/// review, merge into the integration workspace, branch cleanup, and the
/// propagation that follows a merge.
///
/// Every ledger write happens only after the corresponding workspace-level
/// commit has succeeded, so a failure mid-operation leaves the ledger at its
/// prior consistent state. Git mutations run under the owning workspace's
/// lock; ledger calls acquire the integration lock themselves, so no guard is
/// ever held across one.
pub struct CollaborationEngine {
    issues: Ledger<Issue>,
    prs: Ledger<PullRequest>,
    integration: GitRepo,
    workspaces: Arc<WorkspaceManager>,
}

impl CollaborationEngine {
    pub fn new(
        issues: Ledger<Issue>,
        prs: Ledger<PullRequest>,
        integration: GitRepo,
        workspaces: Arc<WorkspaceManager>,
    ) -> Self {
        Self {
            issues,
            prs,
            integration,
            workspaces,
        }
    }

    /// Creates both ledger files if absent.
    pub async fn init(&self) -> Result<(), EngineError> {
        self.issues.init().await?;
        self.prs.init().await?;
        Ok(())
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn integration(&self) -> &GitRepo {
        &self.integration
    }

    // Issue operations

    pub async fn create_issue(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Issue, EngineError> {
        let issue = Issue::new(title, description);
        self.issues
            .create(&issue, &format!("Create issue: {}", issue.title))
            .await?;
        info!(issue = %issue.id, title = %issue.title, "issue created");
        Ok(issue)
    }

    pub async fn issue(&self, id: Uuid) -> Result<Option<Issue>, EngineError> {
        Ok(self.issues.get(id).await?)
    }

    pub async fn issues(&self) -> Result<Vec<Issue>, EngineError> {
        let mut all = self.issues.all().await?;
        all.sort_by_key(|i| i.created_at);
        Ok(all)
    }

    /// Open issues, oldest first, so workers drain the backlog in order.
    pub async fn open_issues(&self) -> Result<Vec<Issue>, EngineError> {
        let mut open = self
            .issues
            .read(|i| i.status == IssueStatus::Open)
            .await?;
        open.sort_by_key(|i| i.created_at);
        Ok(open)
    }

    /// Atomically assigns an open issue to a worker. Exactly one concurrent
    /// claimant wins; the rest see `AlreadyClaimed`.
    pub async fn claim_issue(
        &self,
        issue_id: Uuid,
        worker_id: &str,
    ) -> Result<ClaimOutcome, EngineError> {
        let worker = worker_id.to_string();
        let message = format!("Assign issue {issue_id} to {worker_id}");
        let outcome = self
            .issues
            .transition(
                issue_id,
                &message,
                |i| i.status == IssueStatus::Open,
                move |i| {
                    i.status = IssueStatus::Assigned;
                    i.assigned_to = Some(worker.clone());
                },
            )
            .await?;
        match outcome {
            Transition::Applied(issue) => {
                info!(issue = %issue.id, worker = worker_id, "issue claimed");
                Ok(ClaimOutcome::Claimed(issue))
            }
            Transition::Refused => {
                debug!(issue = %issue_id, worker = worker_id, "claim lost");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
        }
    }

    // Pull-request operations

    pub async fn pull_request(&self, id: Uuid) -> Result<Option<PullRequest>, EngineError> {
        Ok(self.prs.get(id).await?)
    }

    pub async fn pull_requests(&self) -> Result<Vec<PullRequest>, EngineError> {
        let mut all = self.prs.all().await?;
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }

    pub async fn open_pull_requests(&self) -> Result<Vec<PullRequest>, EngineError> {
        let mut open = self.prs.read(|p| p.status == PrStatus::Open).await?;
        open.sort_by_key(|p| p.created_at);
        Ok(open)
    }

    /// PRs approved but not yet merged, e.g. after a merge refused mid-way.
    pub async fn approved_pull_requests(&self) -> Result<Vec<PullRequest>, EngineError> {
        let mut approved = self.prs.read(|p| p.status == PrStatus::Approved).await?;
        approved.sort_by_key(|p| p.created_at);
        Ok(approved)
    }

    /// Opens a pull request for a claimed issue: commits the change set on a
    /// feature branch in the author's workspace, then records the PR in the
    /// ledger. The workspace commit comes first; if it fails, no PR exists.
    pub async fn submit(
        &self,
        issue_id: Uuid,
        author: &str,
        title: impl Into<String>,
        description: impl Into<String>,
        changes: BTreeMap<String, String>,
    ) -> Result<PullRequest, EngineError> {
        let pr = PullRequest::new(issue_id, author, title, description, changes);
        let repo = self.workspaces.worker_repo(author)?;
        {
            let _workspace = self.workspaces.lock_worker(author).await?;
            repo.create_branch(&pr.source_branch).await?;
            let paths = write_changes(repo.dir(), &pr.code_changes)?;
            let message = format!(
                "feat: {}\n\nImplements #{}\n\nPR: #{}",
                pr.title, pr.issue_id, pr.id
            );
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            repo.commit_paths(&message, &refs).await?;
        }

        self.prs.create(&pr, &format!("Open PR: {}", pr.id)).await?;
        info!(
            pr = %pr.id,
            issue = %pr.issue_id,
            author,
            branch = %pr.source_branch,
            files = pr.code_changes.len(),
            "pull request opened"
        );
        Ok(pr)
    }

    /// Replaces the change set of an open PR owned by `author`: re-commits on
    /// the same source branch, then updates the record and bumps its
    /// `revision`. Review history is kept.
    pub async fn resubmit(
        &self,
        pr_id: Uuid,
        author: &str,
        changes: BTreeMap<String, String>,
    ) -> Result<ResubmitOutcome, EngineError> {
        let Some(current) = self.prs.get(pr_id).await? else {
            return Ok(ResubmitOutcome::NotResubmittable);
        };
        if current.status != PrStatus::Open || current.author != author {
            debug!(pr = %pr_id, author, "resubmission refused");
            return Ok(ResubmitOutcome::NotResubmittable);
        }

        let repo = self.workspaces.worker_repo(author)?;
        let message = format!("Update PR: {pr_id}");
        {
            let _workspace = self.workspaces.lock_worker(author).await?;
            repo.create_branch(&current.source_branch).await?;
            let paths = write_changes(repo.dir(), &changes)?;
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            repo.commit_paths(&message, &refs).await?;
        }

        let author_owned = author.to_string();
        let expected = current.revision;
        let outcome = self
            .prs
            .transition(
                pr_id,
                &message,
                move |p| {
                    p.status == PrStatus::Open
                        && p.author == author_owned
                        && p.revision == expected
                },
                move |p| {
                    p.code_changes = changes.clone();
                    p.revision = expected + 1;
                },
            )
            .await?;
        match outcome {
            Transition::Applied(pr) => {
                info!(
                    pr = %pr.id,
                    author,
                    revision = pr.revision,
                    files = pr.code_changes.len(),
                    "pull request updated"
                );
                Ok(ResubmitOutcome::Updated(pr))
            }
            Transition::Refused => Ok(ResubmitOutcome::NotResubmittable),
        }
    }

    /// Records a review verdict. Approval marks the PR approved and
    /// immediately attempts the merge; a negative verdict leaves the PR open
    /// with the comment appended.
    pub async fn review(
        &self,
        pr_id: Uuid,
        reviewer: &str,
        approved: bool,
        comments: impl Into<String>,
    ) -> Result<ReviewOutcome, EngineError> {
        // Timestamps and the comment are fixed up front so the ledger
        // mutation is deterministic.
        let now = Utc::now();
        let comment = ReviewComment {
            reviewer: reviewer.to_string(),
            approved,
            comments: comments.into(),
            timestamp: now,
        };
        let reviewer_owned = reviewer.to_string();
        let verdict = if approved { "approved" } else { "changes requested" };
        let message = format!("Review PR {pr_id}: {verdict}");

        let outcome = self
            .prs
            .transition(
                pr_id,
                &message,
                |p| p.status == PrStatus::Open,
                move |p| {
                    if approved {
                        p.status = PrStatus::Approved;
                    }
                    p.reviewed_at = Some(now);
                    p.reviewer = Some(reviewer_owned.clone());
                    if !p.review_comments.contains(&comment) {
                        p.review_comments.push(comment.clone());
                    }
                },
            )
            .await?;

        let pr = match outcome {
            Transition::Applied(pr) => pr,
            Transition::Refused => {
                debug!(pr = %pr_id, "review refused, PR not open");
                return Ok(ReviewOutcome::NotReviewable);
            }
        };

        if !approved {
            info!(pr = %pr.id, reviewer, "changes requested");
            return Ok(ReviewOutcome::ChangesRequested(pr));
        }

        info!(pr = %pr.id, reviewer, "pull request approved");
        match self.merge(pr_id).await? {
            MergeOutcome::Merged(merged) => Ok(ReviewOutcome::Merged(merged)),
            MergeOutcome::NotMergeable => {
                warn!(pr = %pr.id, "approved but merge refused");
                Ok(ReviewOutcome::ApprovedPendingMerge(pr))
            }
        }
    }

    /// Lands an approved PR: writes its change set into the integration
    /// workspace and commits, marks the PR merged with the commit id,
    /// completes the linked issue, then propagates the new state to all
    /// worker workspaces (best effort).
    pub async fn merge(&self, pr_id: Uuid) -> Result<MergeOutcome, EngineError> {
        let Some(pr) = self.prs.get(pr_id).await? else {
            debug!(pr = %pr_id, "merge refused, unknown PR");
            return Ok(MergeOutcome::NotMergeable);
        };
        if pr.status != PrStatus::Approved {
            debug!(pr = %pr_id, status = %pr.status, "merge refused, not approved");
            return Ok(MergeOutcome::NotMergeable);
        }

        // Integration commit first; the ledger only records merges that
        // durably landed. The guard must drop before the ledger transitions
        // below, which take the same integration lock.
        let message = format!(
            "Merge PR #{}: {}\n\nCloses #{}",
            pr.id, pr.title, pr.issue_id
        );
        let commit = {
            let _workspace = self.workspaces.lock_integration().await?;
            let paths = write_changes(self.integration.dir(), &pr.code_changes)?;
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            self.integration.commit_paths(&message, &refs).await?
        };

        let commit_owned = commit.clone();
        let outcome = self
            .prs
            .transition(
                pr_id,
                &format!("Update PR {pr_id} status to merged"),
                |p| p.status == PrStatus::Approved,
                move |p| {
                    p.status = PrStatus::Merged;
                    p.merge_commit = Some(commit_owned.clone());
                },
            )
            .await?;
        let merged = match outcome {
            Transition::Applied(pr) => pr,
            Transition::Refused => {
                warn!(pr = %pr_id, "merge lost a race at the ledger stage");
                return Ok(MergeOutcome::NotMergeable);
            }
        };

        self.complete_issue(&merged).await?;

        match self.workspaces.propagate_to_workers().await {
            Ok(report) => debug!(
                workers = report.workers,
                files = report.files_added,
                failures = report.failures,
                "post-merge propagation finished"
            ),
            Err(e) => warn!(pr = %merged.id, error = %e, "post-merge propagation failed"),
        }

        info!(pr = %merged.id, issue = %merged.issue_id, commit = %commit, "pull request merged");
        Ok(MergeOutcome::Merged(merged))
    }

    /// Marks the linked issue completed and stores the merged change set as
    /// its submission.
    async fn complete_issue(&self, pr: &PullRequest) -> Result<(), EngineError> {
        let submission = render_submission(&pr.code_changes);
        let outcome = self
            .issues
            .transition(
                pr.issue_id,
                &format!("Update issue {} status to completed", pr.issue_id),
                |i| i.status != IssueStatus::Completed,
                move |i| {
                    i.status = IssueStatus::Completed;
                    i.code_submission = Some(submission.clone());
                },
            )
            .await?;
        if !outcome.is_applied() {
            warn!(issue = %pr.issue_id, pr = %pr.id, "merged PR references an unknown or finished issue");
        }
        Ok(())
    }

    /// Deletes the now-merged PR's source branch in the author's workspace.
    /// Failure to delete is logged, not fatal.
    pub async fn cleanup(&self, pr_id: Uuid) -> Result<(), EngineError> {
        let Some(pr) = self.prs.get(pr_id).await? else {
            return Ok(());
        };
        if pr.status != PrStatus::Merged {
            debug!(pr = %pr.id, status = %pr.status, "cleanup skipped, PR not merged");
            return Ok(());
        }
        if let Err(e) = self.delete_source_branch(&pr).await {
            warn!(pr = %pr.id, branch = %pr.source_branch, error = %e, "branch cleanup failed");
        }
        Ok(())
    }

    async fn delete_source_branch(&self, pr: &PullRequest) -> Result<(), EngineError> {
        let repo = self.workspaces.worker_repo(&pr.author)?;
        let _workspace = self.workspaces.lock_worker(&pr.author).await?;
        // The author often still sits on the feature branch after submit.
        if repo.current_branch().await? == pr.source_branch {
            repo.checkout("main").await?;
        }
        repo.delete_branch(&pr.source_branch).await?;
        debug!(branch = %pr.source_branch, author = %pr.author, "deleted merged source branch");
        Ok(())
    }
}

/// Writes every file in the change set under `root`, creating parent
/// directories as needed. Returns the sorted relative paths written.
fn write_changes(
    root: &Path,
    changes: &BTreeMap<String, String>,
) -> Result<Vec<String>, EngineError> {
    let mut written = Vec::with_capacity(changes.len());
    for (rel, content) in changes {
        let rel_path = safe_relative(rel)?;
        let full = root.join(&rel_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&full, content).map_err(|e| EngineError::Io {
            path: full.clone(),
            source: e,
        })?;
        written.push(rel.clone());
    }
    Ok(written)
}

/// Accepts only plain relative paths: no root, no drive prefix, no `..`.
fn safe_relative(rel: &str) -> Result<PathBuf, EngineError> {
    let path = Path::new(rel);
    let ok = !rel.is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path.to_path_buf())
    } else {
        Err(EngineError::UnsafePath {
            path: rel.to_string(),
        })
    }
}

/// Renders a merged change set into the text stored on the completed issue.
fn render_submission(changes: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (path, content) in changes {
        out.push_str("--- ");
        out.push_str(path);
        out.push_str(" ---\n");
        out.push_str(content);
        if !content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
