use std::future::Future;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::git::GitError;
use crate::lock::LockError;

/// Stderr patterns that mean "another operation is touching the same
/// repository right now" rather than a real failure.
static TRANSIENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)index\.lock").unwrap(),
        Regex::new(r"(?i)cannot lock ref").unwrap(),
        Regex::new(r"(?i)could not lock config file").unwrap(),
        Regex::new(r"(?i)unable to create .*\.lock").unwrap(),
        Regex::new(r"(?i)resource temporarily unavailable").unwrap(),
        Regex::new(r"(?i)another git process seems to be running").unwrap(),
    ]
});

/// Whether a fault is worth retrying. Contention faults are; malformed
/// input, missing branches and real I/O errors are not.
pub trait TransientFault {
    fn is_transient(&self) -> bool;
}

impl TransientFault for GitError {
    fn is_transient(&self) -> bool {
        match self {
            GitError::Command { detail, .. } => {
                TRANSIENT_PATTERNS.iter().any(|re| re.is_match(detail))
            }
            _ => false,
        }
    }
}

impl TransientFault for LockError {
    fn is_transient(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

/// Pure exponential backoff: `base * 2^attempt`, capped at `max`.
/// Overflow saturates at the cap.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(max.as_millis() as u64))
}

/// Bounded retry with exponential backoff and jitter for transient
/// contention on a repository. Between attempts, a stale `.git/index.lock`
/// left by a crashed git process is removed proactively.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Run `op`, retrying transient failures up to `max_attempts` total
    /// attempts. Non-transient failures propagate immediately; exhausting
    /// the budget surfaces the last fault.
    pub async fn run<T, E, F, Fut>(&self, repo_dir: &Path, mut op: F) -> Result<T, E>
    where
        E: TransientFault + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    clear_stale_index_lock(repo_dir);
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Backoff for the given attempt plus up to half a base delay of
    /// jitter, so contending operations don't retry in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(self.base_delay, attempt, self.max_delay);
        let half_base = self.base_delay.as_millis() as u64 / 2;
        let jitter = if half_base > 0 {
            rand::rng().random_range(0..=half_base)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

/// Remove a stale `index.lock` if one is present. Failure to remove is
/// logged and ignored; the next attempt will surface the real state.
fn clear_stale_index_lock(repo_dir: &Path) {
    let lock_path = repo_dir.join(".git").join("index.lock");
    if !lock_path.exists() {
        return;
    }
    match std::fs::remove_file(&lock_path) {
        Ok(()) => warn!(path = %lock_path.display(), "removed stale git index.lock"),
        Err(e) => debug!(path = %lock_path.display(), error = %e, "could not remove index.lock"),
    }
}
