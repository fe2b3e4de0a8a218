/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
/// First SIGINT or SIGTERM: workers finish their current operation, then
/// every loop exits. Second SIGINT: exit immediately.
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared shutdown state, accessible from signal handlers and every loop.
#[derive(Clone)]
pub struct SignalHandler {
    inner: Arc<SignalState>,
}

struct SignalState {
    /// Set on SIGINT, SIGTERM, or STOP file detection.
    shutdown_requested: AtomicBool,
    /// Notified when shutdown is requested, so sleeping loops wake early.
    shutdown_notify: Notify,
}

/// What the STOP-file check found.
#[derive(Debug, PartialEq)]
pub enum StopFileStatus {
    /// No STOP file present.
    NotPresent,
    /// STOP file was present and has been deleted.
    Detected,
}

impl StopFileStatus {
    pub fn is_detected(&self) -> bool {
        matches!(self, StopFileStatus::Detected)
    }
}

impl SignalHandler {
    /// Create shutdown state without installing OS signal listeners.
    /// Used by tests and by callers that drive shutdown themselves.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalState {
                shutdown_requested: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
            }),
        }
    }

    /// Create a new handler and spawn background tasks that listen for
    /// SIGINT and SIGTERM. Call this once at startup.
    pub fn install() -> Self {
        let handler = Self::new();
        handler.spawn_sigint_listener();
        handler.spawn_sigterm_listener();
        handler
    }

    /// Returns `true` if a graceful shutdown has been requested
    /// (SIGINT, SIGTERM, or STOP file detected).
    pub fn shutdown_requested(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Mark graceful shutdown (used by STOP file detection and signals) and
    /// wake everything sleeping in `wait`.
    pub fn request_shutdown(&self) {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
    }

    /// Sleep for `duration`, returning early if shutdown is requested.
    pub async fn wait(&self, duration: Duration) {
        if self.shutdown_requested() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.inner.shutdown_notify.notified() => {}
        }
    }

    /// Check for a STOP file. If present, delete it, mark shutdown, and
    /// return `Detected`. Otherwise return `NotPresent`.
    pub fn check_stop_file(&self, stop_path: &Path) -> StopFileStatus {
        if stop_path.exists() {
            tracing::info!(path = %stop_path.display(), "STOP file detected, requesting shutdown");
            if let Err(e) = std::fs::remove_file(stop_path) {
                tracing::warn!(path = %stop_path.display(), error = %e, "failed to delete STOP file");
            }
            self.request_shutdown();
            StopFileStatus::Detected
        } else {
            StopFileStatus::NotPresent
        }
    }

    /// Spawn a tokio task that listens for SIGINT.
    /// First SIGINT → graceful shutdown. Second SIGINT → exit immediately.
    fn spawn_sigint_listener(&self) {
        let state = self.inner.clone();
        tokio::spawn(async move {
            let Ok(mut sigint) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            else {
                tracing::warn!("failed to install SIGINT handler");
                return;
            };

            sigint.recv().await;
            tracing::warn!("caught SIGINT, finishing current operations (Ctrl+C again to exit now)");
            state.shutdown_requested.store(true, Ordering::SeqCst);
            state.shutdown_notify.notify_waiters();

            sigint.recv().await;
            tracing::warn!("double SIGINT: exiting immediately");
            std::process::exit(130);
        });
    }

    /// Spawn a tokio task that listens for SIGTERM (same as single SIGINT).
    fn spawn_sigterm_listener(&self) {
        let state = self.inner.clone();
        tokio::spawn(async move {
            let Ok(mut sigterm) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                tracing::warn!("failed to install SIGTERM handler");
                return;
            };

            sigterm.recv().await;
            tracing::warn!("caught SIGTERM, finishing current operations");
            state.shutdown_requested.store(true, Ordering::SeqCst);
            state.shutdown_notify.notify_waiters();
        });
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_initial_state() {
        let handler = SignalHandler::new();
        assert!(!handler.shutdown_requested());
    }

    #[test]
    fn test_request_shutdown() {
        let handler = SignalHandler::new();
        assert!(!handler.shutdown_requested());
        handler.request_shutdown();
        assert!(handler.shutdown_requested());
    }

    #[test]
    fn test_stop_file_not_present() {
        let handler = SignalHandler::new();
        let dir = tempdir().unwrap();
        let stop_path = dir.path().join("STOP");
        assert_eq!(
            handler.check_stop_file(&stop_path),
            StopFileStatus::NotPresent
        );
        assert!(!handler.shutdown_requested());
    }

    #[test]
    fn test_stop_file_detected_and_deleted() {
        let handler = SignalHandler::new();
        let dir = tempdir().unwrap();
        let stop_path = dir.path().join("STOP");
        fs::write(&stop_path, "").unwrap();
        assert!(stop_path.exists());

        assert_eq!(handler.check_stop_file(&stop_path), StopFileStatus::Detected);
        assert!(handler.shutdown_requested());
        assert!(!stop_path.exists(), "STOP file should be deleted");
    }

    #[test]
    fn test_handler_is_clone() {
        let handler = SignalHandler::new();
        let cloned = handler.clone();
        handler.request_shutdown();
        // Cloned handler sees the same state (Arc-shared).
        assert!(cloned.shutdown_requested());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_shutdown_set() {
        let handler = SignalHandler::new();
        handler.request_shutdown();
        // Far longer than the test timeout if the early return were missing.
        handler.wait(Duration::from_secs(3600)).await;
    }

    #[tokio::test]
    async fn test_wait_wakes_on_request_shutdown() {
        let handler = SignalHandler::new();
        let waiter = handler.clone();

        let join = tokio::spawn(async move {
            waiter.wait(Duration::from_secs(3600)).await;
            true
        });

        // Give the spawned task a moment to start waiting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.request_shutdown();

        let woke = tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("timed out waiting for shutdown notify")
            .expect("task panicked");
        assert!(woke);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_shutdown() {
        let handler = SignalHandler::new();
        let start = std::time::Instant::now();
        handler.wait(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!handler.shutdown_requested());
    }
}
