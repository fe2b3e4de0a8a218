use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors from lock acquisition.
#[derive(Debug)]
pub enum LockError {
    /// The lock could not be acquired within the timeout, even after
    /// force-clearing the marker.
    Timeout { name: String },
    /// Creating or removing the marker failed for a non-contention reason.
    Io(std::io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout { name } => write!(f, "timed out acquiring lock: {name}"),
            LockError::Io(e) => write!(f, "lock I/O error: {e}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LockError {
    fn from(e: std::io::Error) -> Self {
        LockError::Io(e)
    }
}

/// Held lock. Releases on drop, so a cancelled task still releases at
/// whatever await point its future was dropped.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release explicitly. Dropping the guard does the same.
    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Advisory mutual exclusion over one workspace's mutation path. Injectable
/// so tests can run against an in-memory lock instead of the filesystem.
#[async_trait]
pub trait WorkspaceLock: Send + Sync {
    /// Block until the lock is held or `timeout` elapses.
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError>;

    fn name(&self) -> &str;
}

/// Filesystem-visible lock: acquisition atomically creates a marker file,
/// release removes it. Contenders poll with jittered sleep. After the
/// timeout the marker is force-cleared with a warning; a crashed holder
/// must not wedge the system forever, so bounded staleness is accepted.
pub struct FileLock {
    name: String,
    path: PathBuf,
    poll_interval: Duration,
}

impl FileLock {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            poll_interval,
        }
    }

    /// Try to create the marker exclusively. Ok(Some) on success, Ok(None)
    /// when another operation holds it.
    fn try_create(&self) -> Result<Option<LockGuard>, LockError> {
        use std::io::Write;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                // Owner info is diagnostic only, never parsed for correctness
                let _ = write!(file, "{} {}", std::process::id(), chrono::Utc::now());
                let path = self.path.clone();
                let name = self.name.clone();
                debug!(lock = %self.name, "acquired");
                Ok(Some(LockGuard::new(move || {
                    debug!(lock = %name, "released");
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(lock = %name, error = %e, "failed to remove lock marker");
                        }
                    }
                })))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn holder_info(&self) -> String {
        std::fs::read_to_string(&self.path)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn jittered_poll(&self) -> Duration {
        let base = self.poll_interval.as_millis() as u64;
        let jitter = if base >= 2 {
            rand::rng().random_range(0..base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

#[async_trait]
impl WorkspaceLock for FileLock {
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_create()? {
                return Ok(guard);
            }

            if start.elapsed() >= timeout {
                warn!(
                    lock = %self.name,
                    holder = %self.holder_info(),
                    timeout_ms = timeout.as_millis() as u64,
                    "lock timed out, force-clearing marker"
                );
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(LockError::Io(e)),
                }
                // One shot at the now-cleared marker; losing that race to
                // another contender surfaces as a timeout.
                return match self.try_create()? {
                    Some(guard) => Ok(guard),
                    None => Err(LockError::Timeout {
                        name: self.name.clone(),
                    }),
                };
            }

            tokio::time::sleep(self.jittered_poll()).await;
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory lock for tests and purely in-process coordination. There is
/// no force-clear: an in-process holder cannot crash without dropping its
/// guard, so a timeout here is a real timeout.
pub struct MemoryLock {
    name: String,
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[async_trait]
impl WorkspaceLock for MemoryLock {
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        match tokio::time::timeout(timeout, self.inner.clone().lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(move || drop(guard))),
            Err(_) => Err(LockError::Timeout {
                name: self.name.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Hands out the lock for a named workspace. Each workspace (integration,
/// every worker) has exactly one lock; all mutation paths for a workspace
/// must go through the lock this factory returns for its name.
pub trait LockFactory: Send + Sync {
    fn lock_for(&self, name: &str) -> Arc<dyn WorkspaceLock>;
}

/// Produces marker-file locks under a shared lock directory, one file per
/// workspace name. Separate factory calls for the same name contend on the
/// same marker, so cross-process exclusion holds.
pub struct FileLockFactory {
    locks_dir: PathBuf,
    poll_interval: Duration,
}

impl FileLockFactory {
    pub fn new(locks_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            poll_interval,
        }
    }
}

impl LockFactory for FileLockFactory {
    fn lock_for(&self, name: &str) -> Arc<dyn WorkspaceLock> {
        Arc::new(FileLock::new(
            name,
            self.locks_dir.join(format!("{name}.lock")),
            self.poll_interval,
        ))
    }
}

/// In-memory factory for tests: the same name always maps to the same lock
/// instance, so contention within one process is still exclusive.
#[derive(Default)]
pub struct MemoryLockFactory {
    locks: std::sync::Mutex<std::collections::HashMap<String, Arc<MemoryLock>>>,
}

impl MemoryLockFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockFactory for MemoryLockFactory {
    fn lock_for(&self, name: &str) -> Arc<dyn WorkspaceLock> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryLock::new(name)));
        Arc::clone(lock) as Arc<dyn WorkspaceLock>
    }
}
