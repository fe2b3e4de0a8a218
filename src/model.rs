use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an issue. Issues are never deleted, only transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Assigned,
    Completed,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueStatus::Open => write!(f, "open"),
            IssueStatus::Assigned => write!(f, "assigned"),
            IssueStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A unit of work. Claimed by exactly one worker via an atomic ledger
/// transition; `status == Assigned` implies `assigned_to` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: IssueStatus,
    pub assigned_to: Option<String>,
    pub code_submission: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: IssueStatus::Open,
            assigned_to: None,
            code_submission: None,
            created_at: Utc::now(),
        }
    }
}

/// Pull request lifecycle: `Open -> Approved -> Merged`. A rejected review
/// leaves the PR `Open` with the comment appended; `Merged` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    Open,
    Approved,
    Merged,
}

impl std::fmt::Display for PrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrStatus::Open => write!(f, "open"),
            PrStatus::Approved => write!(f, "approved"),
            PrStatus::Merged => write!(f, "merged"),
        }
    }
}

/// One review entry. Appended on every review, approving or not, so the
/// full review history of a PR survives resubmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub reviewer: String,
    pub approved: bool,
    pub comments: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub title: String,
    pub description: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub status: PrStatus,
    pub source_branch: String,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    pub code_changes: BTreeMap<String, String>,
    /// Bumped on every resubmission. Lets a reviewer tell a resubmitted
    /// change set from one it already judged, even when the content is
    /// byte-identical.
    #[serde(default)]
    pub revision: u32,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer: Option<String>,
    pub review_comments: Vec<ReviewComment>,
    pub merge_commit: Option<String>,
}

fn default_target_branch() -> String {
    "main".to_string()
}

impl PullRequest {
    pub fn new(
        issue_id: Uuid,
        author: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        code_changes: BTreeMap<String, String>,
    ) -> Self {
        let author = author.into();
        Self {
            id: Uuid::new_v4(),
            issue_id,
            title: title.into(),
            description: description.into(),
            source_branch: Self::branch_for(issue_id, &author),
            author,
            created_at: Utc::now(),
            status: PrStatus::Open,
            target_branch: default_target_branch(),
            code_changes,
            revision: 0,
            reviewed_at: None,
            reviewer: None,
            review_comments: Vec::new(),
            merge_commit: None,
        }
    }

    /// Source branch name for a PR: `feature/{issue_id}-{author}`.
    pub fn branch_for(issue_id: Uuid, author: &str) -> String {
        format!("feature/{issue_id}-{author}")
    }
}

/// A record type the ledger can persist: knows its own file name, its id,
/// and how to encode/decode the ledger file wrapper for its kind.
pub trait Record: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Ledger file name inside the integration workspace.
    const FILE_NAME: &'static str;
    /// Human-readable kind used in log messages.
    const KIND: &'static str;

    fn id(&self) -> Uuid;

    fn decode_ledger(text: &str) -> Result<Vec<Self>, serde_json::Error>;

    fn encode_ledger(records: &[Self]) -> Result<String, serde_json::Error>;
}

#[derive(Serialize, Deserialize, Default)]
struct IssueLedgerFile {
    issues: Vec<Issue>,
}

impl Record for Issue {
    const FILE_NAME: &'static str = ".issues.json";
    const KIND: &'static str = "issue";

    fn id(&self) -> Uuid {
        self.id
    }

    fn decode_ledger(text: &str) -> Result<Vec<Self>, serde_json::Error> {
        let file: IssueLedgerFile = serde_json::from_str(text)?;
        Ok(file.issues)
    }

    fn encode_ledger(records: &[Self]) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&IssueLedgerFile {
            issues: records.to_vec(),
        })
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PullRequestLedgerFile {
    pull_requests: Vec<PullRequest>,
}

impl Record for PullRequest {
    const FILE_NAME: &'static str = ".pull_requests.json";
    const KIND: &'static str = "pull request";

    fn id(&self) -> Uuid {
        self.id
    }

    fn decode_ledger(text: &str) -> Result<Vec<Self>, serde_json::Error> {
        let file: PullRequestLedgerFile = serde_json::from_str(text)?;
        Ok(file.pull_requests)
    }

    fn encode_ledger(records: &[Self]) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&PullRequestLedgerFile {
            pull_requests: records.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_issue_is_open_and_unassigned() {
        let issue = Issue::new("Add parser", "Parse the input format");
        assert_eq!(issue.status, IssueStatus::Open);
        assert!(issue.assigned_to.is_none());
        assert!(issue.code_submission.is_none());
    }

    #[test]
    fn test_issue_ledger_shape() {
        let issue = Issue::new("Add parser", "Parse the input format");
        let text = Issue::encode_ledger(&[issue.clone()]).unwrap();

        // Top-level wrapper key and lowercase status are part of the file format
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let issues = value.get("issues").unwrap().as_array().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0]["status"], "open");
        assert_eq!(issues[0]["id"], issue.id.to_string());

        let decoded = Issue::decode_ledger(&text).unwrap();
        assert_eq!(decoded[0].id, issue.id);
    }

    #[test]
    fn test_pr_ledger_shape() {
        let issue_id = Uuid::new_v4();
        let mut changes = BTreeMap::new();
        changes.insert("src/lib.rs".to_string(), "pub fn x() {}".to_string());
        let pr = PullRequest::new(issue_id, "worker-1", "Add x", "adds x", changes);

        let text = PullRequest::encode_ledger(&[pr.clone()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let prs = value.get("pull_requests").unwrap().as_array().unwrap();
        assert_eq!(prs[0]["status"], "open");
        assert_eq!(prs[0]["target_branch"], "main");
        assert_eq!(prs[0]["author"], "worker-1");

        let decoded = PullRequest::decode_ledger(&text).unwrap();
        assert_eq!(decoded[0].id, pr.id);
        assert_eq!(decoded[0].source_branch, pr.source_branch);
    }

    #[test]
    fn test_branch_name_format() {
        let issue_id = Uuid::new_v4();
        let branch = PullRequest::branch_for(issue_id, "worker-2");
        assert_eq!(branch, format!("feature/{issue_id}-worker-2"));
    }

    #[test]
    fn test_target_branch_defaults_on_decode() {
        // Older ledgers may omit target_branch entirely
        let issue_id = Uuid::new_v4();
        let pr = PullRequest::new(issue_id, "worker-1", "t", "d", BTreeMap::new());
        let mut value = serde_json::to_value(&pr).unwrap();
        value.as_object_mut().unwrap().remove("target_branch");
        let text = format!("{{\"pull_requests\": [{value}]}}");

        let decoded = PullRequest::decode_ledger(&text).unwrap();
        assert_eq!(decoded[0].target_branch, "main");
    }
}
