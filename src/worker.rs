use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::WorkersConfig;
use crate::engine::{ClaimOutcome, CollaborationEngine, EngineError, ResubmitOutcome};
use crate::model::PullRequest;
use crate::provider::{ChangeProposal, Provider, ProviderError};
use crate::signals::SignalHandler;

/// Errors a worker loop can hit.
#[derive(Debug)]
pub enum WorkerError {
    Engine(EngineError),
    Provider(ProviderError),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Engine(e) => write!(f, "engine: {e}"),
            WorkerError::Provider(e) => write!(f, "provider: {e}"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Engine(e) => Some(e),
            WorkerError::Provider(e) => Some(e),
        }
    }
}

impl From<EngineError> for WorkerError {
    fn from(e: EngineError) -> Self {
        WorkerError::Engine(e)
    }
}

impl From<ProviderError> for WorkerError {
    fn from(e: ProviderError) -> Self {
        WorkerError::Provider(e)
    }
}

/// Why a worker or reviewer loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Nothing left to do and nothing in flight.
    NoWork,
    /// STOP file detected.
    StopFile,
    /// SIGINT or SIGTERM received.
    Signal,
    /// Fatal error.
    Error(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::NoWork => write!(f, "no work"),
            ExitReason::StopFile => write!(f, "stop file"),
            ExitReason::Signal => write!(f, "signal"),
            ExitReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// What one worker got done.
#[derive(Debug)]
pub struct WorkerSummary {
    pub worker_id: String,
    /// Issues claimed (each claim opens one PR).
    pub claimed: u32,
    /// Resubmissions after a changes-requested review.
    pub resubmitted: u32,
    pub exit_reason: ExitReason,
}

/// What one worker did in a single poll.
enum Progress {
    Claimed,
    Resubmitted,
    Idle { in_flight: bool },
}

/// Per-PR record of how the worker has responded to reviews: how many
/// resubmissions it has spent, and how many review comments it had seen at
/// its last resubmission.
#[derive(Default)]
struct ReviewResponse {
    attempts: u32,
    responded: usize,
}

/// One autonomous worker: claims open issues, asks the provider for an
/// implementation, opens a PR, and answers changes-requested reviews with a
/// bounded number of resubmissions.
///
/// The loop exits when shutdown is requested, a STOP file appears, or the
/// backlog is drained and none of its PRs can advance any further.
pub struct Worker {
    id: String,
    engine: Arc<CollaborationEngine>,
    provider: Arc<dyn Provider>,
    signals: SignalHandler,
    stop_file: PathBuf,
    poll_interval: Duration,
    max_idle_polls: u32,
    max_resubmissions: u32,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        engine: Arc<CollaborationEngine>,
        provider: Arc<dyn Provider>,
        signals: SignalHandler,
        stop_file: PathBuf,
        settings: &WorkersConfig,
    ) -> Self {
        Self {
            id: id.into(),
            engine,
            provider,
            signals,
            stop_file,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_idle_polls: settings.max_idle_polls,
            max_resubmissions: settings.max_resubmissions,
        }
    }

    pub async fn run(self) -> WorkerSummary {
        info!(worker = %self.id, "worker started");
        let mut claimed = 0u32;
        let mut resubmitted = 0u32;
        let mut idle_polls = 0u32;
        let mut responses: HashMap<Uuid, ReviewResponse> = HashMap::new();

        let exit_reason = loop {
            if self.signals.shutdown_requested() {
                info!(worker = %self.id, "shutdown requested, stopping worker");
                break ExitReason::Signal;
            }
            if self.signals.check_stop_file(&self.stop_file).is_detected() {
                info!(worker = %self.id, "STOP file detected, stopping worker");
                break ExitReason::StopFile;
            }

            match self.poll_once(&mut responses).await {
                Ok(Progress::Claimed) => {
                    idle_polls = 0;
                    claimed += 1;
                }
                Ok(Progress::Resubmitted) => {
                    idle_polls = 0;
                    resubmitted += 1;
                }
                Ok(Progress::Idle { in_flight }) => {
                    idle_polls += 1;
                    debug!(worker = %self.id, idle_polls, in_flight, "nothing to do this poll");
                    if idle_polls >= self.max_idle_polls && !in_flight {
                        info!(worker = %self.id, "backlog drained, stopping worker");
                        break ExitReason::NoWork;
                    }
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "worker loop failed");
                    break ExitReason::Error(e.to_string());
                }
            }

            self.signals.wait(self.poll_interval).await;
        };

        info!(
            worker = %self.id,
            claimed,
            resubmitted,
            exit = %exit_reason,
            "worker finished"
        );
        WorkerSummary {
            worker_id: self.id,
            claimed,
            resubmitted,
            exit_reason,
        }
    }

    async fn poll_once(
        &self,
        responses: &mut HashMap<Uuid, ReviewResponse>,
    ) -> Result<Progress, WorkerError> {
        // Answer reviews first; the reviewer is waiting on us.
        if let Some(pr) = self.next_unanswered_rejection(responses).await? {
            match self.engine.issue(pr.issue_id).await? {
                Some(issue) => {
                    let proposals = self.provider.propose_change(&issue).await?;
                    match self
                        .engine
                        .resubmit(pr.id, &self.id, change_map(proposals))
                        .await?
                    {
                        ResubmitOutcome::Updated(updated) => {
                            let entry = responses.entry(pr.id).or_default();
                            entry.attempts += 1;
                            entry.responded = updated.review_comments.len();
                            info!(worker = %self.id, pr = %pr.id, attempt = entry.attempts, "resubmitted after review");
                            return Ok(Progress::Resubmitted);
                        }
                        ResubmitOutcome::NotResubmittable => {
                            debug!(worker = %self.id, pr = %pr.id, "resubmission refused, moving on");
                        }
                    }
                }
                None => {
                    debug!(worker = %self.id, pr = %pr.id, "PR references a missing issue, abandoning");
                    responses.entry(pr.id).or_default().attempts = self.max_resubmissions;
                }
            }
        }

        // Then try to claim fresh work. A refused claim means another worker
        // won the race; move on to the next issue.
        for issue in self.engine.open_issues().await? {
            match self.engine.claim_issue(issue.id, &self.id).await? {
                ClaimOutcome::Claimed(issue) => {
                    let proposals = self.provider.propose_change(&issue).await?;
                    let description = format!("Implementation for issue: {}", issue.title);
                    let pr = self
                        .engine
                        .submit(
                            issue.id,
                            &self.id,
                            issue.title.clone(),
                            description,
                            change_map(proposals),
                        )
                        .await?;
                    debug!(worker = %self.id, issue = %issue.id, pr = %pr.id, "opened pull request");
                    return Ok(Progress::Claimed);
                }
                ClaimOutcome::AlreadyClaimed => continue,
            }
        }

        let in_flight = self.has_work_in_flight(responses).await?;
        Ok(Progress::Idle { in_flight })
    }

    /// The oldest open PR of ours whose latest review requested changes and
    /// which we still have budget to answer.
    async fn next_unanswered_rejection(
        &self,
        responses: &HashMap<Uuid, ReviewResponse>,
    ) -> Result<Option<PullRequest>, WorkerError> {
        let open = self.engine.open_pull_requests().await?;
        Ok(open.into_iter().find(|pr| {
            if pr.author != self.id {
                return false;
            }
            let Some(last) = pr.review_comments.last() else {
                return false;
            };
            if last.approved {
                return false;
            }
            let attempts = responses.get(&pr.id).map_or(0, |r| r.attempts);
            let responded = responses.get(&pr.id).map_or(0, |r| r.responded);
            attempts < self.max_resubmissions && pr.review_comments.len() > responded
        }))
    }

    /// True while any of our open PRs can still advance: awaiting first
    /// review, resubmitted and awaiting re-review, or rejected with
    /// resubmission budget left. A rejected PR with no budget left is
    /// abandoned and does not keep the worker alive.
    async fn has_work_in_flight(
        &self,
        responses: &HashMap<Uuid, ReviewResponse>,
    ) -> Result<bool, WorkerError> {
        let open = self.engine.open_pull_requests().await?;
        Ok(open.iter().any(|pr| {
            if pr.author != self.id {
                return false;
            }
            match pr.review_comments.last() {
                None => true,
                Some(last) if last.approved => true,
                Some(_) => {
                    let attempts = responses.get(&pr.id).map_or(0, |r| r.attempts);
                    let responded = responses.get(&pr.id).map_or(0, |r| r.responded);
                    responded >= pr.review_comments.len() || attempts < self.max_resubmissions
                }
            }
        }))
    }
}

fn change_map(proposals: Vec<ChangeProposal>) -> BTreeMap<String, String> {
    proposals.into_iter().map(|p| (p.path, p.content)).collect()
}
