use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReviewConfig;
use crate::engine::{CollaborationEngine, EngineError, MergeOutcome, ReviewOutcome};
use crate::model::{IssueStatus, PrStatus};
use crate::provider::{Provider, ProviderError};
use crate::signals::SignalHandler;
use crate::worker::ExitReason;

/// Errors the reviewer loop can hit.
#[derive(Debug)]
pub enum ReviewerError {
    Engine(EngineError),
    Provider(ProviderError),
}

impl std::fmt::Display for ReviewerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewerError::Engine(e) => write!(f, "engine: {e}"),
            ReviewerError::Provider(e) => write!(f, "provider: {e}"),
        }
    }
}

impl std::error::Error for ReviewerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReviewerError::Engine(e) => Some(e),
            ReviewerError::Provider(e) => Some(e),
        }
    }
}

impl From<EngineError> for ReviewerError {
    fn from(e: EngineError) -> Self {
        ReviewerError::Engine(e)
    }
}

impl From<ProviderError> for ReviewerError {
    fn from(e: ProviderError) -> Self {
        ReviewerError::Provider(e)
    }
}

/// What the reviewer got done.
#[derive(Debug)]
pub struct ReviewerSummary {
    pub reviewer_id: String,
    /// Verdicts recorded, approving or not.
    pub reviewed: u32,
    /// PRs landed in integration, including merge retries.
    pub merged: u32,
    /// Negative verdicts within `reviewed`.
    pub changes_requested: u32,
    pub exit_reason: ExitReason,
}

/// What one poll accomplished.
#[derive(Default)]
struct SweepOutcome {
    reviewed: u32,
    merged: u32,
    changes_requested: u32,
}

impl SweepOutcome {
    fn acted(&self) -> bool {
        self.reviewed > 0 || self.merged > 0
    }
}

/// The single reviewer: polls open PRs, asks the provider for a verdict,
/// records it (merging on approval), and retries merges for PRs stuck in
/// the approved state.
///
/// Each PR revision is judged at most once; a resubmission bumps the
/// revision and earns a fresh review. The loop exits when the ledgers are
/// fully quiescent, or once `workers_done` is set and nothing actionable
/// remains (abandoned PRs stay open without pinning the reviewer alive),
/// or on shutdown/STOP.
pub struct Reviewer {
    id: String,
    engine: Arc<CollaborationEngine>,
    provider: Arc<dyn Provider>,
    signals: SignalHandler,
    stop_file: PathBuf,
    workers_done: Arc<AtomicBool>,
    poll_interval: Duration,
    max_idle_polls: u32,
}

impl Reviewer {
    pub fn new(
        engine: Arc<CollaborationEngine>,
        provider: Arc<dyn Provider>,
        signals: SignalHandler,
        stop_file: PathBuf,
        workers_done: Arc<AtomicBool>,
        settings: &ReviewConfig,
    ) -> Self {
        Self {
            id: settings.reviewer.clone(),
            engine,
            provider,
            signals,
            stop_file,
            workers_done,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_idle_polls: settings.max_idle_polls,
        }
    }

    pub async fn run(self) -> ReviewerSummary {
        info!(reviewer = %self.id, "reviewer started");
        let mut reviewed = 0u32;
        let mut merged = 0u32;
        let mut changes_requested = 0u32;
        let mut idle_polls = 0u32;
        // Revision last judged per PR id.
        let mut seen: HashMap<Uuid, u32> = HashMap::new();

        let exit_reason = loop {
            if self.signals.shutdown_requested() {
                info!(reviewer = %self.id, "shutdown requested, stopping reviewer");
                break ExitReason::Signal;
            }
            if self.signals.check_stop_file(&self.stop_file).is_detected() {
                info!(reviewer = %self.id, "STOP file detected, stopping reviewer");
                break ExitReason::StopFile;
            }

            match self.poll_once(&mut seen).await {
                Ok(sweep) => {
                    reviewed += sweep.reviewed;
                    merged += sweep.merged;
                    changes_requested += sweep.changes_requested;
                    if sweep.acted() {
                        idle_polls = 0;
                    } else {
                        match self.resting().await {
                            Ok(true) => {
                                idle_polls += 1;
                                debug!(reviewer = %self.id, idle_polls, "nothing to review");
                                if idle_polls >= self.max_idle_polls {
                                    info!(reviewer = %self.id, "no reviewable work left, stopping reviewer");
                                    break ExitReason::NoWork;
                                }
                            }
                            // Work may still arrive; keep waiting.
                            Ok(false) => idle_polls = 0,
                            Err(e) => {
                                error!(reviewer = %self.id, error = %e, "reviewer loop failed");
                                break ExitReason::Error(e.to_string());
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(reviewer = %self.id, error = %e, "reviewer loop failed");
                    break ExitReason::Error(e.to_string());
                }
            }

            self.signals.wait(self.poll_interval).await;
        };

        info!(
            reviewer = %self.id,
            reviewed,
            merged,
            changes_requested,
            exit = %exit_reason,
            "reviewer finished"
        );
        ReviewerSummary {
            reviewer_id: self.id,
            reviewed,
            merged,
            changes_requested,
            exit_reason,
        }
    }

    async fn poll_once(
        &self,
        seen: &mut HashMap<Uuid, u32>,
    ) -> Result<SweepOutcome, ReviewerError> {
        let mut sweep = SweepOutcome::default();

        for pr in self.engine.open_pull_requests().await? {
            if seen.get(&pr.id) == Some(&pr.revision) {
                continue;
            }
            let Some(issue) = self.engine.issue(pr.issue_id).await? else {
                warn!(reviewer = %self.id, pr = %pr.id, "PR references a missing issue, skipping");
                seen.insert(pr.id, pr.revision);
                continue;
            };
            let verdict = self
                .provider
                .evaluate_change(&issue, &pr.code_changes)
                .await?;
            match self
                .engine
                .review(pr.id, &self.id, verdict.approved, verdict.comments)
                .await?
            {
                ReviewOutcome::Merged(done) => {
                    sweep.reviewed += 1;
                    sweep.merged += 1;
                    seen.insert(pr.id, pr.revision);
                    self.engine.cleanup(done.id).await?;
                    info!(reviewer = %self.id, pr = %done.id, "approved and merged");
                }
                ReviewOutcome::ApprovedPendingMerge(_) => {
                    // The approved sweep below picks the merge up again.
                    sweep.reviewed += 1;
                    seen.insert(pr.id, pr.revision);
                }
                ReviewOutcome::ChangesRequested(_) => {
                    sweep.reviewed += 1;
                    sweep.changes_requested += 1;
                    seen.insert(pr.id, pr.revision);
                    info!(reviewer = %self.id, pr = %pr.id, "changes requested");
                }
                ReviewOutcome::NotReviewable => {
                    debug!(reviewer = %self.id, pr = %pr.id, "PR no longer reviewable");
                }
            }
        }

        for pr in self.engine.approved_pull_requests().await? {
            match self.engine.merge(pr.id).await? {
                MergeOutcome::Merged(done) => {
                    sweep.merged += 1;
                    self.engine.cleanup(done.id).await?;
                    info!(reviewer = %self.id, pr = %done.id, "merged previously approved PR");
                }
                MergeOutcome::NotMergeable => {
                    debug!(reviewer = %self.id, pr = %pr.id, "approved PR not mergeable");
                }
            }
        }

        Ok(sweep)
    }

    /// True when the reviewer may count this poll toward its idle exit:
    /// either the ledgers are fully settled, or every worker has finished
    /// and whatever remains open will never be resubmitted.
    async fn resting(&self) -> Result<bool, ReviewerError> {
        if self.workers_done.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let issues = self.engine.issues().await?;
        if issues.iter().any(|i| i.status != IssueStatus::Completed) {
            return Ok(false);
        }
        let prs = self.engine.pull_requests().await?;
        Ok(prs.iter().all(|p| p.status == PrStatus::Merged))
    }
}
