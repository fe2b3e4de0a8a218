use uuid::Uuid;

use crate::engine::{CollaborationEngine, EngineError};
use crate::model::{Issue, IssueStatus, PrStatus, PullRequest};

/// Snapshot of the ledgers and workspaces for the `status` command.
#[derive(Debug)]
pub struct StatusReport {
    pub issues: Vec<Issue>,
    pub pull_requests: Vec<PullRequest>,
    pub workers: Vec<String>,
    pub recent_commits: Vec<String>,
}

/// Reads ledger state, provisioned workers, and recent integration history.
pub async fn collect(engine: &CollaborationEngine) -> Result<StatusReport, EngineError> {
    let issues = engine.issues().await?;
    let pull_requests = engine.pull_requests().await?;
    let workers = engine.workspaces().worker_ids()?;
    // A freshly provisioned integration workspace has no history yet.
    let recent_commits = engine
        .integration()
        .log_oneline(8)
        .await
        .unwrap_or_default();
    Ok(StatusReport {
        issues,
        pull_requests,
        workers,
        recent_commits,
    })
}

impl StatusReport {
    fn issue_count(&self, status: IssueStatus) -> usize {
        self.issues.iter().filter(|i| i.status == status).count()
    }

    fn pr_count(&self, status: PrStatus) -> usize {
        self.pull_requests
            .iter()
            .filter(|p| p.status == status)
            .count()
    }

    /// Plain-text rendering printed by the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "Issues: {} ({} open, {} assigned, {} completed)\n",
            self.issues.len(),
            self.issue_count(IssueStatus::Open),
            self.issue_count(IssueStatus::Assigned),
            self.issue_count(IssueStatus::Completed),
        ));
        for issue in &self.issues {
            let assignee = issue
                .assigned_to
                .as_deref()
                .map(|w| format!(" -> {w}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  [{:<9}] {}  {}{}\n",
                issue.status.to_string(),
                short(issue.id),
                issue.title,
                assignee,
            ));
        }

        out.push_str(&format!(
            "Pull requests: {} ({} open, {} approved, {} merged)\n",
            self.pull_requests.len(),
            self.pr_count(PrStatus::Open),
            self.pr_count(PrStatus::Approved),
            self.pr_count(PrStatus::Merged),
        ));
        for pr in &self.pull_requests {
            out.push_str(&format!(
                "  [{:<9}] {}  {}  by {}{}{}\n",
                pr.status.to_string(),
                short(pr.id),
                pr.title,
                pr.author,
                if pr.revision > 0 {
                    format!("  rev {}", pr.revision)
                } else {
                    String::new()
                },
                if pr.review_comments.is_empty() {
                    String::new()
                } else {
                    format!("  reviews {}", pr.review_comments.len())
                },
            ));
        }

        if self.workers.is_empty() {
            out.push_str("Workers: none provisioned\n");
        } else {
            out.push_str(&format!(
                "Workers: {} ({})\n",
                self.workers.len(),
                self.workers.join(", ")
            ));
        }

        if !self.recent_commits.is_empty() {
            out.push_str("Recent integration commits:\n");
            for line in &self.recent_commits {
                out.push_str(&format!("  {line}\n"));
            }
        }

        out
    }
}

/// First hex group of the id, enough to tell records apart in a listing.
fn short(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::lock::MemoryLockFactory;
    use crate::retry::RetryPolicy;
    use crate::workspace::WorkspaceManager;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn empty_report() -> StatusReport {
        StatusReport {
            issues: Vec::new(),
            pull_requests: Vec::new(),
            workers: Vec::new(),
            recent_commits: Vec::new(),
        }
    }

    #[test]
    fn test_short_is_id_prefix() {
        let id = Uuid::new_v4();
        let s = short(id);
        assert_eq!(s.len(), 8);
        assert!(id.to_string().starts_with(&s));
    }

    #[test]
    fn test_render_empty_report() {
        let rendered = empty_report().render();
        assert!(rendered.contains("Issues: 0 (0 open, 0 assigned, 0 completed)"));
        assert!(rendered.contains("Pull requests: 0 (0 open, 0 approved, 0 merged)"));
        assert!(rendered.contains("Workers: none provisioned"));
        assert!(!rendered.contains("Recent integration commits"));
    }

    #[test]
    fn test_render_lists_records() {
        let mut assigned = Issue::new("Add config parser", "d");
        assigned.status = IssueStatus::Assigned;
        assigned.assigned_to = Some("worker-1".to_string());
        let open = Issue::new("Add status command", "d");

        let mut merged = PullRequest::new(
            assigned.id,
            "worker-1",
            "Add config parser",
            "d",
            BTreeMap::new(),
        );
        merged.status = PrStatus::Merged;
        merged.revision = 1;

        let report = StatusReport {
            issues: vec![open.clone(), assigned.clone()],
            pull_requests: vec![merged.clone()],
            workers: vec!["worker-1".to_string(), "worker-2".to_string()],
            recent_commits: vec!["3f2e1d0 Merge PR".to_string()],
        };
        let rendered = report.render();

        assert!(rendered.contains("Issues: 2 (1 open, 1 assigned, 0 completed)"));
        assert!(rendered.contains(&short(assigned.id)));
        assert!(rendered.contains("Add config parser -> worker-1"));
        assert!(rendered.contains("Pull requests: 1 (0 open, 0 approved, 1 merged)"));
        assert!(rendered.contains("by worker-1  rev 1"));
        assert!(rendered.contains("Workers: 2 (worker-1, worker-2)"));
        assert!(rendered.contains("  3f2e1d0 Merge PR"));
    }

    #[tokio::test]
    async fn test_collect_reflects_engine_state() {
        let dir = TempDir::new().unwrap();
        let mgr = Arc::new(WorkspaceManager::new(
            dir.path().join("integration"),
            dir.path().join("workers"),
            Arc::new(MemoryLockFactory::new()),
            Duration::from_secs(5),
        ));
        let integration = mgr.provision_integration().await.unwrap();
        mgr.provision_worker("worker-1").await.unwrap();
        let retry = RetryPolicy::default();
        let timeout = Duration::from_secs(5);
        let issues = Ledger::new(
            integration.clone(),
            mgr.integration_lock(),
            retry.clone(),
            timeout,
        );
        let prs = Ledger::new(integration.clone(), mgr.integration_lock(), retry, timeout);
        let engine = CollaborationEngine::new(issues, prs, integration, mgr);
        engine.init().await.unwrap();

        let issue = engine.create_issue("Add parser", "Write it").await.unwrap();
        engine.claim_issue(issue.id, "worker-1").await.unwrap();
        let mut changes = BTreeMap::new();
        changes.insert(
            "src/parser.rs".to_string(),
            "pub fn parse() {}".to_string(),
        );
        let pr = engine
            .submit(issue.id, "worker-1", "Add parser", "d", changes)
            .await
            .unwrap();
        engine.review(pr.id, "reviewer-1", true, "ok").await.unwrap();

        let report = collect(&engine).await.unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].status, IssueStatus::Completed);
        assert_eq!(report.pull_requests.len(), 1);
        assert_eq!(report.pull_requests[0].status, PrStatus::Merged);
        assert_eq!(report.workers, vec!["worker-1".to_string()]);
        assert!(
            report
                .recent_commits
                .iter()
                .any(|l| l.contains(&format!("Merge PR #{}", pr.id)))
        );

        let rendered = report.render();
        assert!(rendered.contains("Issues: 1 (0 open, 0 assigned, 1 completed)"));
        assert!(rendered.contains("merged"));
    }
}
