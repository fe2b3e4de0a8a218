use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::git::GitError;
use crate::git::GitRepo;
use crate::lock::{LockError, WorkspaceLock};
use crate::model::Record;
use crate::retry::{RetryPolicy, TransientFault};

/// Errors from ledger reads and transitions.
#[derive(Debug)]
pub enum LedgerError {
    /// The workspace lock could not be acquired.
    Lock(LockError),
    /// A git command against the ledger's repository failed.
    Git(GitError),
    /// Reading or writing the ledger file failed.
    Io(std::io::Error),
    /// The ledger contents could not be encoded as JSON.
    Encode(serde_json::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Lock(e) => write!(f, "ledger lock: {e}"),
            LedgerError::Git(e) => write!(f, "ledger git operation: {e}"),
            LedgerError::Io(e) => write!(f, "ledger file I/O: {e}"),
            LedgerError::Encode(e) => write!(f, "ledger encoding: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Lock(e) => Some(e),
            LedgerError::Git(e) => Some(e),
            LedgerError::Io(e) => Some(e),
            LedgerError::Encode(e) => Some(e),
        }
    }
}

impl From<LockError> for LedgerError {
    fn from(e: LockError) -> Self {
        LedgerError::Lock(e)
    }
}

impl From<GitError> for LedgerError {
    fn from(e: GitError) -> Self {
        LedgerError::Git(e)
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Io(e)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Encode(e)
    }
}

impl TransientFault for LedgerError {
    fn is_transient(&self) -> bool {
        match self {
            LedgerError::Lock(e) => e.is_transient(),
            LedgerError::Git(e) => e.is_transient(),
            LedgerError::Io(_) | LedgerError::Encode(_) => false,
        }
    }
}

/// Outcome of a conditional transition. `Refused` is a normal result, not an
/// error: it means the guard did not hold (the record was missing, or another
/// actor got there first), and nothing was written.
#[derive(Debug)]
pub enum Transition<R> {
    Applied(R),
    Refused,
}

impl<R> Transition<R> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn applied(self) -> Option<R> {
        match self {
            Transition::Applied(r) => Some(r),
            Transition::Refused => None,
        }
    }
}

/// A collection of records persisted as one JSON file inside a git
/// repository. Every mutation runs under the workspace lock and follows the
/// same sequence: load current state, check the guard, rewrite the whole file
/// through an atomic rename, commit.
///
/// Reads also take the lock so they never observe a half-applied transition.
/// Unreadable or missing ledger files load as empty rather than failing, so
/// one corrupt write cannot wedge every actor.
pub struct Ledger<R: Record> {
    repo: GitRepo,
    path: PathBuf,
    lock: Arc<dyn WorkspaceLock>,
    retry: RetryPolicy,
    lock_timeout: Duration,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Ledger<R> {
    pub fn new(
        repo: GitRepo,
        lock: Arc<dyn WorkspaceLock>,
        retry: RetryPolicy,
        lock_timeout: Duration,
    ) -> Self {
        let path = repo.dir().join(R::FILE_NAME);
        Self {
            repo,
            path,
            lock,
            retry,
            lock_timeout,
            _record: PhantomData,
        }
    }

    /// Path of the ledger file inside the repository.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Creates an empty ledger file and commits it if none exists yet.
    /// Idempotent; safe to call on every startup.
    pub async fn init(&self) -> Result<(), LedgerError> {
        if self.path.exists() {
            return Ok(());
        }
        self.retry.run(self.repo.dir(), || self.init_once()).await
    }

    async fn init_once(&self) -> Result<(), LedgerError> {
        let _guard = self.lock.acquire(self.lock_timeout).await?;
        if !self.path.exists() {
            self.write_atomic(&[])?;
        }
        self.repo
            .commit_paths(&format!("Initialize {} ledger", R::KIND), &[R::FILE_NAME])
            .await?;
        debug!(kind = R::KIND, path = %self.path.display(), "ledger initialized");
        Ok(())
    }

    /// Appends a new record and commits. If the record id is already present
    /// (a retried attempt whose commit failed last time) the append is
    /// skipped and only the commit is redone.
    pub async fn create(&self, record: &R, message: &str) -> Result<Uuid, LedgerError> {
        self.retry
            .run(self.repo.dir(), || self.create_once(record, message))
            .await
    }

    async fn create_once(&self, record: &R, message: &str) -> Result<Uuid, LedgerError> {
        let _guard = self.lock.acquire(self.lock_timeout).await?;
        let mut records = self.load_or_empty();
        if records.iter().any(|r| r.id() == record.id()) {
            debug!(kind = R::KIND, id = %record.id(), "record already present, committing only");
        } else {
            records.push(record.clone());
            self.write_atomic(&records)?;
        }
        self.repo.commit_paths(message, &[R::FILE_NAME]).await?;
        Ok(record.id())
    }

    /// Returns all records matching the filter, read under the lock.
    pub async fn read<F>(&self, filter: F) -> Result<Vec<R>, LedgerError>
    where
        F: Fn(&R) -> bool,
    {
        self.retry
            .run(self.repo.dir(), || self.read_once(&filter))
            .await
    }

    async fn read_once<F>(&self, filter: &F) -> Result<Vec<R>, LedgerError>
    where
        F: Fn(&R) -> bool,
    {
        let _guard = self.lock.acquire(self.lock_timeout).await?;
        Ok(self
            .load_or_empty()
            .into_iter()
            .filter(|r| filter(r))
            .collect())
    }

    /// Returns every record in the ledger.
    pub async fn all(&self) -> Result<Vec<R>, LedgerError> {
        self.read(|_| true).await
    }

    /// Looks up a single record by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<R>, LedgerError> {
        Ok(self.read(|r| r.id() == id).await?.into_iter().next())
    }

    /// Applies `mutate` to the record with the given id if `predicate` holds
    /// for its current state, then persists and commits. Returns `Refused`
    /// without writing when the record is missing or the predicate fails.
    ///
    /// The mutation must be deterministic: a retried attempt may find its own
    /// change already persisted when only the commit failed, and detects that
    /// by re-deriving the mutated record and comparing. Callers should
    /// compute timestamps and ids before building the closures.
    pub async fn transition<P, M>(
        &self,
        id: Uuid,
        message: &str,
        predicate: P,
        mutate: M,
    ) -> Result<Transition<R>, LedgerError>
    where
        P: Fn(&R) -> bool,
        M: Fn(&mut R),
    {
        self.retry
            .run(self.repo.dir(), || {
                self.transition_once(id, message, &predicate, &mutate)
            })
            .await
    }

    async fn transition_once<P, M>(
        &self,
        id: Uuid,
        message: &str,
        predicate: &P,
        mutate: &M,
    ) -> Result<Transition<R>, LedgerError>
    where
        P: Fn(&R) -> bool,
        M: Fn(&mut R),
    {
        let _guard = self.lock.acquire(self.lock_timeout).await?;
        let mut records = self.load_or_empty();
        let Some(pos) = records.iter().position(|r| r.id() == id) else {
            debug!(kind = R::KIND, %id, "transition target not in ledger");
            return Ok(Transition::Refused);
        };

        if predicate(&records[pos]) {
            let mut updated = records[pos].clone();
            mutate(&mut updated);
            records[pos] = updated.clone();
            self.write_atomic(&records)?;
            self.repo.commit_paths(message, &[R::FILE_NAME]).await?;
            return Ok(Transition::Applied(updated));
        }

        // The guard can fail because an earlier attempt of this same call
        // already persisted the mutation but died before committing. Re-derive
        // the mutated record; if it matches what is on disk, finish the commit.
        let mut rederived = records[pos].clone();
        mutate(&mut rederived);
        if rederived == records[pos] {
            self.repo.commit_paths(message, &[R::FILE_NAME]).await?;
            return Ok(Transition::Applied(rederived));
        }

        debug!(kind = R::KIND, %id, "transition refused");
        Ok(Transition::Refused)
    }

    /// Loads the ledger file, treating a missing or unreadable file as empty.
    fn load_or_empty(&self) -> Vec<R> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(kind = R::KIND, path = %self.path.display(), "ledger file absent");
                return Vec::new();
            }
            Err(e) => {
                warn!(kind = R::KIND, path = %self.path.display(), error = %e, "ledger file unreadable, treating as empty");
                return Vec::new();
            }
        };
        match R::decode_ledger(&text) {
            Ok(records) => records,
            Err(e) => {
                warn!(kind = R::KIND, path = %self.path.display(), error = %e, "ledger file corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    /// Writes the full record set to a temp file in the same directory and
    /// renames it over the ledger file, so readers only ever see a complete
    /// JSON document.
    fn write_atomic(&self, records: &[R]) -> Result<(), LedgerError> {
        let text = R::encode_ledger(records)?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| std::io::Error::other("ledger path has no parent directory"))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLock;
    use crate::model::{Issue, IssueStatus};
    use tempfile::TempDir;

    async fn test_ledger(dir: &TempDir) -> Ledger<Issue> {
        let repo = GitRepo::init(dir.path()).await.unwrap();
        repo.set_local_identity("tester", "tester@example.com")
            .await
            .unwrap();
        let ledger = Ledger::new(
            repo,
            Arc::new(MemoryLock::new("issues")),
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        ledger.init().await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_init_creates_empty_ledger_and_commit() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert!(text.contains("\"issues\""));
        let log = ledger.repo.log_oneline(10).await.unwrap();
        assert!(log.iter().any(|l| l.contains("Initialize issue ledger")));

        // Second init is a no-op.
        ledger.init().await.unwrap();
        assert_eq!(ledger.repo.log_oneline(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_get_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let issue = Issue::new("Add parser", "Parse the config header");
        let id = ledger
            .create(&issue, &format!("Create issue: {}", issue.title))
            .await
            .unwrap();
        assert_eq!(id, issue.id);

        let fetched = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Add parser");
        assert_eq!(fetched.status, IssueStatus::Open);

        let open = ledger
            .read(|i| i.status == IssueStatus::Open)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);

        let log = ledger.repo.log_oneline(10).await.unwrap();
        assert!(log.iter().any(|l| l.contains("Create issue: Add parser")));
    }

    #[tokio::test]
    async fn test_create_same_record_twice_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let issue = Issue::new("Once", "only once");
        ledger.create(&issue, "Create issue: Once").await.unwrap();
        ledger.create(&issue, "Create issue: Once").await.unwrap();

        assert_eq!(ledger.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        std::fs::remove_file(ledger.path()).unwrap();
        assert!(ledger.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty_and_recovers() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        std::fs::write(ledger.path(), "{ not json at all").unwrap();
        assert!(ledger.all().await.unwrap().is_empty());

        // The next write replaces the corrupt file with a valid one.
        let issue = Issue::new("Recover", "after corruption");
        ledger.create(&issue, "Create issue: Recover").await.unwrap();
        let all = ledger.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Recover");
    }

    #[tokio::test]
    async fn test_transition_applied_then_refused() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let issue = Issue::new("Claim me", "one winner");
        let id = ledger.create(&issue, "Create issue: Claim me").await.unwrap();

        let first = ledger
            .transition(
                id,
                "Assign issue to worker-1",
                |i| i.status == IssueStatus::Open,
                |i| {
                    i.status = IssueStatus::Assigned;
                    i.assigned_to = Some("worker-1".to_string());
                },
            )
            .await
            .unwrap();
        let won = first.applied().unwrap();
        assert_eq!(won.assigned_to.as_deref(), Some("worker-1"));

        // A different claimant now finds the guard false.
        let second = ledger
            .transition(
                id,
                "Assign issue to worker-2",
                |i| i.status == IssueStatus::Open,
                |i| {
                    i.status = IssueStatus::Assigned;
                    i.assigned_to = Some("worker-2".to_string());
                },
            )
            .await
            .unwrap();
        assert!(!second.is_applied());

        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_transition_unknown_id_refused() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let out = ledger
            .transition(Uuid::new_v4(), "Assign issue", |_| true, |_| {})
            .await
            .unwrap();
        assert!(matches!(out, Transition::Refused));
    }

    #[tokio::test]
    async fn test_retried_transition_detects_own_persisted_mutation() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let issue = Issue::new("Repeat", "same mutation twice");
        let id = ledger.create(&issue, "Create issue: Repeat").await.unwrap();

        // Same claimant applying the identical mutation twice stays Applied;
        // this is what a retry after a failed commit looks like.
        for _ in 0..2 {
            let out = ledger
                .transition(
                    id,
                    "Assign issue to worker-1",
                    |i| i.status == IssueStatus::Open,
                    |i| {
                        i.status = IssueStatus::Assigned;
                        i.assigned_to = Some("worker-1".to_string());
                    },
                )
                .await
                .unwrap();
            assert!(out.is_applied());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_concurrent_claim_wins() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(test_ledger(&dir).await);

        let issue = Issue::new("Contended", "eight claimants");
        let id = ledger
            .create(&issue, "Create issue: Contended")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let ledger = Arc::clone(&ledger);
            let worker = format!("worker-{n}");
            handles.push(tokio::spawn(async move {
                let message = format!("Assign issue to {worker}");
                ledger
                    .transition(
                        id,
                        &message,
                        |i| i.status == IssueStatus::Open,
                        move |i| {
                            i.status = IssueStatus::Assigned;
                            i.assigned_to = Some(worker.clone());
                        },
                    )
                    .await
                    .unwrap()
                    .is_applied()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);

        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, IssueStatus::Assigned);
        assert!(stored.assigned_to.is_some());
    }

    #[tokio::test]
    async fn test_stray_temp_file_does_not_corrupt_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = test_ledger(&dir).await;

        let issue = Issue::new("Durable", "survives stray temp files");
        ledger.create(&issue, "Create issue: Durable").await.unwrap();

        // A temp file left behind by an interrupted writer sits alongside the
        // ledger; the ledger file itself stays a complete document.
        std::fs::write(dir.path().join(".tmpXYZ123"), "{ \"issues\": [ tru").unwrap();
        let all = ledger.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Durable");
    }
}
