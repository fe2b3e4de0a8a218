use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tracing::info;

use crate::config::ForemanConfig;
use crate::data_dir::DataDir;
use crate::engine::{CollaborationEngine, EngineError};
use crate::ledger::Ledger;
use crate::lock::{FileLockFactory, LockFactory};
use crate::model::{IssueStatus, PrStatus};
use crate::provider::Provider;
use crate::reviewer::{Reviewer, ReviewerSummary};
use crate::signals::SignalHandler;
use crate::worker::{Worker, WorkerSummary};
use crate::workspace::{WorkspaceError, WorkspaceManager};

/// Errors that can occur while setting up or running a session.
#[derive(Debug)]
pub enum SessionError {
    /// The data directory could not be created.
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The seed file could not be read.
    Seed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The seed file is not a JSON array of issues.
    SeedParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Engine(EngineError),
    Workspace(WorkspaceError),
    /// A spawned worker or reviewer task panicked or was aborted.
    Join {
        role: String,
        source: tokio::task::JoinError,
    },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::DataDir { path, source } => {
                write!(
                    f,
                    "failed to initialize data directory {}: {source}",
                    path.display()
                )
            }
            SessionError::Seed { path, source } => {
                write!(f, "failed to read seed file {}: {source}", path.display())
            }
            SessionError::SeedParse { path, source } => {
                write!(f, "failed to parse seed file {}: {source}", path.display())
            }
            SessionError::Engine(e) => write!(f, "engine: {e}"),
            SessionError::Workspace(e) => write!(f, "workspace: {e}"),
            SessionError::Join { role, source } => write!(f, "{role} task failed: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::DataDir { source, .. } => Some(source),
            SessionError::Seed { source, .. } => Some(source),
            SessionError::SeedParse { source, .. } => Some(source),
            SessionError::Engine(e) => Some(e),
            SessionError::Workspace(e) => Some(e),
            SessionError::Join { source, .. } => Some(source),
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        SessionError::Engine(e)
    }
}

impl From<WorkspaceError> for SessionError {
    fn from(e: WorkspaceError) -> Self {
        SessionError::Workspace(e)
    }
}

/// One backlog entry from a seed file. The file is a JSON array of these.
#[derive(Debug, Deserialize)]
pub struct SeedIssue {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Reads a seed file into backlog entries.
pub fn load_seed(path: &Path) -> Result<Vec<SeedIssue>, SessionError> {
    let contents = std::fs::read_to_string(path).map_err(|e| SessionError::Seed {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&contents).map_err(|e| SessionError::SeedParse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Wires locks, workspaces and ledgers into an engine rooted at `data`. Both
/// ledgers take the integration workspace's lock, so ledger writes and
/// integration commits exclude each other even across processes.
pub fn build_engine(config: &ForemanConfig, data: &DataDir) -> Arc<CollaborationEngine> {
    let locks: Arc<dyn LockFactory> = Arc::new(FileLockFactory::new(
        data.locks_dir(),
        config.lock_poll_interval(),
    ));
    let workspaces = Arc::new(WorkspaceManager::new(
        data.integration_dir(),
        data.workers_dir(),
        locks,
        config.lock_timeout(),
    ));
    let integration = workspaces.integration_repo();
    let retry = config.retry_policy();
    let issues = Ledger::new(
        integration.clone(),
        workspaces.integration_lock(),
        retry.clone(),
        config.lock_timeout(),
    );
    let prs = Ledger::new(
        integration.clone(),
        workspaces.integration_lock(),
        retry,
        config.lock_timeout(),
    );
    Arc::new(CollaborationEngine::new(issues, prs, integration, workspaces))
}

/// Final accounting for one session.
#[derive(Debug)]
pub struct SessionSummary {
    pub issues_completed: usize,
    pub issues_total: usize,
    pub prs_merged: usize,
    pub prs_total: usize,
    pub workers: Vec<WorkerSummary>,
    pub reviewer: ReviewerSummary,
}

/// One full collaboration run: seeds the backlog, provisions the integration
/// and worker workspaces, then drives the reviewer and `workers.count`
/// workers as concurrent tasks until each winds down on its own exit
/// condition.
///
/// The reviewer outlives the workers. Once every worker has finished, the
/// session flags `workers_done` so the reviewer stops waiting for
/// resubmissions that will never come.
pub struct Session {
    config: ForemanConfig,
    data: DataDir,
    signals: SignalHandler,
    provider: Arc<dyn Provider>,
}

impl Session {
    pub fn new(config: ForemanConfig, signals: SignalHandler, provider: Arc<dyn Provider>) -> Self {
        let data = DataDir::new(config.data.dir.clone());
        Self {
            config,
            data,
            signals,
            provider,
        }
    }

    pub async fn run(&self, seed: Option<&Path>) -> Result<SessionSummary, SessionError> {
        self.data
            .ensure_initialized()
            .map_err(|e| SessionError::DataDir {
                path: self.data.root().to_path_buf(),
                source: e,
            })?;

        let engine = build_engine(&self.config, &self.data);
        engine.workspaces().provision_integration().await?;
        engine.init().await?;

        if let Some(path) = seed {
            let entries = load_seed(path)?;
            info!(count = entries.len(), path = %path.display(), "seeding backlog");
            for entry in &entries {
                engine
                    .create_issue(entry.title.clone(), entry.description.clone())
                    .await?;
            }
        }

        let worker_ids: Vec<String> = (1..=self.config.workers.count)
            .map(|i| format!("worker-{i}"))
            .collect();
        for id in &worker_ids {
            engine.workspaces().provision_worker(id).await?;
        }

        let stop_file = self.data.stop_file();
        let workers_done = Arc::new(AtomicBool::new(false));

        let reviewer = Reviewer::new(
            Arc::clone(&engine),
            Arc::clone(&self.provider),
            self.signals.clone(),
            stop_file.clone(),
            Arc::clone(&workers_done),
            &self.config.review,
        );
        let reviewer_handle = tokio::spawn(reviewer.run());

        let mut worker_handles = Vec::with_capacity(worker_ids.len());
        for id in &worker_ids {
            let worker = Worker::new(
                id.clone(),
                Arc::clone(&engine),
                Arc::clone(&self.provider),
                self.signals.clone(),
                stop_file.clone(),
                &self.config.workers,
            );
            worker_handles.push(tokio::spawn(worker.run()));
        }
        info!(
            workers = worker_ids.len(),
            reviewer = %self.config.review.reviewer,
            "session started"
        );

        let mut workers = Vec::with_capacity(worker_handles.len());
        for handle in worker_handles {
            let summary = handle.await.map_err(|e| SessionError::Join {
                role: "worker".to_string(),
                source: e,
            })?;
            workers.push(summary);
        }
        // No resubmissions can arrive anymore; let the reviewer wind down.
        workers_done.store(true, Ordering::SeqCst);
        let reviewer = reviewer_handle.await.map_err(|e| SessionError::Join {
            role: "reviewer".to_string(),
            source: e,
        })?;

        let issues = engine.issues().await?;
        let prs = engine.pull_requests().await?;
        let summary = SessionSummary {
            issues_completed: issues
                .iter()
                .filter(|i| i.status == IssueStatus::Completed)
                .count(),
            issues_total: issues.len(),
            prs_merged: prs.iter().filter(|p| p.status == PrStatus::Merged).count(),
            prs_total: prs.len(),
            workers,
            reviewer,
        };
        info!(
            issues_completed = summary.issues_completed,
            issues_total = summary.issues_total,
            prs_merged = summary.prs_merged,
            prs_total = summary.prs_total,
            "session finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::worker::ExitReason;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> ForemanConfig {
        let mut config = ForemanConfig::default();
        config.data.dir = dir.join(".foreman");
        config.workers.count = 2;
        config.workers.poll_interval_secs = 0;
        config.workers.max_idle_polls = 2;
        config.review.poll_interval_secs = 0;
        config.review.max_idle_polls = 2;
        config
    }

    fn test_session(config: ForemanConfig) -> Session {
        Session::new(config, SignalHandler::new(), Arc::new(ScriptedProvider))
    }

    fn write_seed(dir: &Path) -> PathBuf {
        let path = dir.join("backlog.json");
        std::fs::write(
            &path,
            r#"[
  {"title": "Add config parser", "description": "Parse TOML into a typed config"},
  {"title": "Add status command", "description": "Summarize ledger state"}
]"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_load_seed_parses_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(
            &path,
            r#"[{"title": "A", "description": "a"}, {"title": "B"}]"#,
        )
        .unwrap();

        let entries = load_seed(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "A");
        assert_eq!(entries[0].description, "a");
        assert_eq!(entries[1].title, "B");
        assert_eq!(entries[1].description, "");
    }

    #[test]
    fn test_load_seed_missing_file() {
        let err = load_seed(Path::new("/nonexistent/seed.json")).unwrap_err();
        assert!(matches!(err, SessionError::Seed { .. }));
    }

    #[test]
    fn test_load_seed_rejects_malformed_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(&path, r#"{"title": "not an array"}"#).unwrap();

        let err = load_seed(&path).unwrap_err();
        assert!(matches!(err, SessionError::SeedParse { .. }));
        assert!(err.to_string().contains("seed.json"));
    }

    #[tokio::test]
    async fn test_session_completes_seeded_backlog() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let seed = write_seed(dir.path());

        let session = test_session(config.clone());
        let summary = tokio::time::timeout(Duration::from_secs(120), session.run(Some(&seed)))
            .await
            .expect("session did not finish")
            .unwrap();

        assert_eq!(summary.issues_total, 2);
        assert_eq!(summary.issues_completed, 2);
        assert_eq!(summary.prs_total, 2);
        assert_eq!(summary.prs_merged, 2);
        assert_eq!(summary.workers.len(), 2);
        let claimed: u32 = summary.workers.iter().map(|w| w.claimed).sum();
        assert_eq!(claimed, 2);
        for worker in &summary.workers {
            assert_eq!(worker.exit_reason, ExitReason::NoWork);
        }
        assert_eq!(summary.reviewer.exit_reason, ExitReason::NoWork);
        assert_eq!(summary.reviewer.merged, 2);

        // The data directory has the expected shape afterwards.
        let data = DataDir::new(config.data.dir.clone());
        assert!(data.integration_dir().join(".issues.json").exists());
        assert!(data.integration_dir().join(".pull_requests.json").exists());
        assert!(data.worker_dir("worker-1").join(".git").exists());
        assert!(data.worker_dir("worker-2").join(".git").exists());
    }

    #[tokio::test]
    async fn test_session_with_empty_backlog() {
        let dir = TempDir::new().unwrap();
        let session = test_session(test_config(dir.path()));

        let summary = tokio::time::timeout(Duration::from_secs(60), session.run(None))
            .await
            .expect("session did not finish")
            .unwrap();

        assert_eq!(summary.issues_total, 0);
        assert_eq!(summary.prs_total, 0);
        for worker in &summary.workers {
            assert_eq!(worker.exit_reason, ExitReason::NoWork);
            assert_eq!(worker.claimed, 0);
        }
        assert_eq!(summary.reviewer.reviewed, 0);
    }

    #[tokio::test]
    async fn test_second_session_sees_completed_backlog() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let seed = write_seed(dir.path());

        let first = test_session(config.clone());
        tokio::time::timeout(Duration::from_secs(120), first.run(Some(&seed)))
            .await
            .expect("first session did not finish")
            .unwrap();

        // A rerun over the same data directory finds everything done and
        // claims nothing.
        let second = test_session(config);
        let summary = tokio::time::timeout(Duration::from_secs(60), second.run(None))
            .await
            .expect("second session did not finish")
            .unwrap();

        assert_eq!(summary.issues_completed, 2);
        assert_eq!(summary.prs_merged, 2);
        let claimed: u32 = summary.workers.iter().map(|w| w.claimed).sum();
        assert_eq!(claimed, 0);
    }
}
