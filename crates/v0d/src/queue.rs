//! Merge Queue (C3): the ordered, file-backed set of merge requests that
//! the Merge Daemon drains.
//!
//! Persisted as `<merge_queue_dir>/queue.json`; every mutation takes
//! `.queue.lock` (see [`crate::lock`]) and goes through
//! [`v0_core::atomic::atomic_write`], matching the crash-safety
//! guarantee the State Store gives operation state.

use crate::lock::{FileLock, LockError};
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use v0_core::atomic::atomic_write;
use v0_core::phase::{is_merge_ready, ReadyChecks};
use v0_core::state::{StateError, StateStore};
use v0_core::types::{MergeType, QueueEntry, QueueFile, QueueStatus};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed queue.json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no queue entry for operation {0}")]
    NotFound(String),
    #[error(transparent)]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Why a queue entry was swept to `completed` without ever running the
/// executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    AlreadyMerged,
    OperationMissing,
    Recreated,
    BranchGone,
}

impl StaleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyMerged => "already_merged",
            Self::OperationMissing => "operation_missing",
            Self::Recreated => "recreated",
            Self::BranchGone => "branch_gone",
        }
    }
}

pub struct MergeQueue {
    dir: PathBuf,
    lock_max_retries: u32,
}

impl MergeQueue {
    pub fn new(dir: impl Into<PathBuf>, lock_max_retries: u32) -> Self {
        Self {
            dir: dir.into(),
            lock_max_retries,
        }
    }

    fn queue_path(&self) -> PathBuf {
        self.dir.join("queue.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".queue.lock")
    }

    fn acquire_lock(&self, holder: &str) -> Result<FileLock> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        Ok(FileLock::acquire(&self.lock_path(), holder, self.lock_max_retries)?)
    }

    fn read(&self) -> Result<QueueFile> {
        match std::fs::read(self.queue_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueFile::default()),
            Err(e) => Err(io_err(&self.queue_path(), e)),
        }
    }

    fn write(&self, queue: &QueueFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(queue)?;
        atomic_write(&self.dir, "queue.json", &bytes).map_err(|e| io_err(&self.queue_path(), e))?;
        Ok(())
    }

    /// Idempotent: a duplicate enqueue of an entry already `pending` or
    /// `processing` is a no-op; a terminal entry is reopened.
    pub fn enqueue(&self, operation: &str, priority: i32, issue_id: Option<String>) -> Result<()> {
        let _lock = self.acquire_lock("enqueue")?;
        let mut queue = self.read()?;
        let now = Utc::now();

        if let Some(entry) = queue.entries.iter_mut().find(|e| e.operation == operation) {
            if entry.status.is_active() {
                return Ok(());
            }
            entry.status = QueueStatus::Pending;
            entry.enqueued_at = now;
            entry.updated_at = now;
            entry.priority = priority;
            if issue_id.is_some() {
                entry.issue_id = issue_id;
            }
        } else {
            let mut entry = QueueEntry::new(operation, priority, now);
            entry.issue_id = issue_id;
            queue.entries.push(entry);
        }

        self.write(&queue)
    }

    /// Same idempotent contract as [`Self::enqueue`], but for a
    /// branch-only entry that has no backing operation state (§4.4.2).
    pub fn enqueue_branch(&self, branch: &str, priority: i32, issue_id: Option<String>) -> Result<()> {
        let _lock = self.acquire_lock("enqueue_branch")?;
        let mut queue = self.read()?;
        let now = Utc::now();

        if let Some(entry) = queue.entries.iter_mut().find(|e| e.operation == branch) {
            if entry.status.is_active() {
                return Ok(());
            }
            entry.status = QueueStatus::Pending;
            entry.enqueued_at = now;
            entry.updated_at = now;
            entry.priority = priority;
        } else {
            let mut entry = QueueEntry::new(branch, priority, now);
            entry.merge_type = MergeType::Branch;
            entry.issue_id = issue_id;
            queue.entries.push(entry);
        }

        self.write(&queue)
    }

    pub fn update_status(&self, operation: &str, status: QueueStatus) -> Result<()> {
        let _lock = self.acquire_lock("update_status")?;
        let mut queue = self.read()?;
        let entry = queue
            .entries
            .iter_mut()
            .find(|e| e.operation == operation)
            .ok_or_else(|| QueueError::NotFound(operation.to_string()))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        self.write(&queue)
    }

    pub fn get_all(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        let queue = self.read()?;
        Ok(queue
            .entries
            .into_iter()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .collect())
    }

    /// Detects the three staleness conditions from §4.3: the operation is
    /// already merged; the entry predates the operation's own
    /// `created_at` (a re-created operation reusing a name); or (for
    /// branch-only entries) the branch no longer exists on the remote.
    pub fn is_stale(
        &self,
        entry: &QueueEntry,
        store: &StateStore,
        branch_exists_remote: impl FnOnce(&str) -> bool,
    ) -> Result<Option<StaleReason>> {
        match entry.merge_type {
            MergeType::Operation => match store.load(&entry.operation) {
                Ok(op) => {
                    if op.merged_at.is_some() && op.merge_commit.is_some() {
                        return Ok(Some(StaleReason::AlreadyMerged));
                    }
                    if entry.enqueued_at < op.created_at {
                        return Ok(Some(StaleReason::Recreated));
                    }
                    Ok(None)
                }
                Err(StateError::NotFound(_)) => Ok(Some(StaleReason::OperationMissing)),
                Err(e) => Err(e.into()),
            },
            MergeType::Branch => {
                if branch_exists_remote(&entry.operation) {
                    Ok(None)
                } else {
                    Ok(Some(StaleReason::BranchGone))
                }
            }
        }
    }

    /// Moves every stale pending/conflict entry to `completed`, logging
    /// the reason, and returns the operations swept.
    pub fn sweep_stale(
        &self,
        store: &StateStore,
        mut branch_exists_remote: impl FnMut(&str) -> bool,
    ) -> Result<Vec<(String, StaleReason)>> {
        let _lock = self.acquire_lock("sweep_stale")?;
        let mut queue = self.read()?;
        let mut swept = Vec::new();

        for entry in &mut queue.entries {
            if !entry.status.is_active() {
                continue;
            }
            let reason = match entry.merge_type {
                MergeType::Operation => match store.load(&entry.operation) {
                    Ok(op) => {
                        if op.merged_at.is_some() && op.merge_commit.is_some() {
                            Some(StaleReason::AlreadyMerged)
                        } else if entry.enqueued_at < op.created_at {
                            Some(StaleReason::Recreated)
                        } else {
                            None
                        }
                    }
                    Err(StateError::NotFound(_)) => Some(StaleReason::OperationMissing),
                    Err(e) => return Err(e.into()),
                },
                MergeType::Branch => (!branch_exists_remote(&entry.operation)).then_some(StaleReason::BranchGone),
            };
            if let Some(reason) = reason {
                entry.status = QueueStatus::Completed;
                entry.updated_at = Utc::now();
                tracing::info!(operation = %entry.operation, reason = reason.as_str(), "stale queue entry swept");
                swept.push((entry.operation.clone(), reason));
            }
        }

        if !swept.is_empty() {
            self.write(&queue)?;
        }
        Ok(swept)
    }

    /// Top candidate ordered by `(priority asc, enqueued_at asc)` whose
    /// readiness check passes. Branch-only entries have no operation
    /// state to check readiness against, so they are always considered
    /// ready once pending.
    pub fn get_next_ready(
        &self,
        store: &StateStore,
        checks: &dyn ReadyChecks,
        enforce_issue_policy: bool,
    ) -> Result<Option<QueueEntry>> {
        let mut pending: Vec<QueueEntry> = self.get_all(Some(QueueStatus::Pending))?;
        pending.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));

        for entry in pending {
            match entry.merge_type {
                MergeType::Branch => return Ok(Some(entry)),
                MergeType::Operation => {
                    let op = match store.load_with_migration(&entry.operation, None) {
                        Ok(op) => op,
                        Err(StateError::NotFound(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if is_merge_ready(&op, checks, enforce_issue_policy) {
                        return Ok(Some(entry));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn io_err(path: &std::path::Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use v0_core::phase::ReadyChecks as _;
    use v0_core::types::{Operation, OperationType, Phase};

    struct AlwaysReady;
    impl ReadyChecks for AlwaysReady {
        fn worktree_exists(&self, _worktree: &str) -> bool {
            true
        }
        fn branch_resolvable(&self, _op: &Operation) -> bool {
            true
        }
        fn session_active(&self, _session: &str) -> bool {
            false
        }
        fn open_plan_issue_count(&self, _op_name: &str) -> u32 {
            0
        }
    }

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("build"), 1_048_576, 5)
    }

    #[test]
    fn enqueue_then_dequeue_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = MergeQueue::new(dir.path().join("mergeq"), 5);

        queue.enqueue("auth", 0, None).unwrap();
        queue.enqueue("auth", 0, None).unwrap();

        let all = queue.get_all(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, QueueStatus::Pending);
    }

    #[test]
    fn reenqueue_of_terminal_entry_reopens_it() {
        let dir = TempDir::new().unwrap();
        let queue = MergeQueue::new(dir.path().join("mergeq"), 5);

        queue.enqueue("auth", 0, None).unwrap();
        queue.update_status("auth", QueueStatus::Completed).unwrap();
        queue.enqueue("auth", 1, None).unwrap();

        let all = queue.get_all(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, QueueStatus::Pending);
        assert_eq!(all[0].priority, 1);
    }

    #[test]
    fn get_next_ready_orders_by_priority_then_enqueued_at() {
        let dir = TempDir::new().unwrap();
        let state = store(&dir);
        let queue = MergeQueue::new(dir.path().join("mergeq"), 5);

        for name in ["low", "high"] {
            let mut op = Operation::new(name, OperationType::Feature, Utc::now());
            op.phase = Phase::Completed;
            op.merge_queued = true;
            op.branch = Some(format!("feature/{name}"));
            state.create(&op).unwrap();
        }
        queue.enqueue("low", 5, None).unwrap();
        queue.enqueue("high", 0, None).unwrap();

        let next = queue.get_next_ready(&state, &AlwaysReady, false).unwrap().unwrap();
        assert_eq!(next.operation, "high");
    }

    #[test]
    fn get_next_ready_skips_not_ready_operations() {
        let dir = TempDir::new().unwrap();
        let state = store(&dir);
        let queue = MergeQueue::new(dir.path().join("mergeq"), 5);

        let op = Operation::new("auth", OperationType::Feature, Utc::now());
        state.create(&op).unwrap();
        queue.enqueue("auth", 0, None).unwrap();

        assert!(queue.get_next_ready(&state, &AlwaysReady, false).unwrap().is_none());
    }

    #[test]
    fn sweep_stale_completes_already_merged_operation() {
        let dir = TempDir::new().unwrap();
        let state = store(&dir);
        let queue = MergeQueue::new(dir.path().join("mergeq"), 5);

        let mut op = Operation::new("auth", OperationType::Feature, Utc::now());
        op.phase = Phase::Merged;
        op.merged_at = Some(Utc::now());
        op.merge_commit = Some("deadbeef".to_string());
        state.create(&op).unwrap();
        queue.enqueue("auth", 0, None).unwrap();

        let swept = queue.sweep_stale(&state, |_| true).unwrap();
        assert_eq!(swept, vec![("auth".to_string(), StaleReason::AlreadyMerged)]);

        let all = queue.get_all(Some(QueueStatus::Completed)).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn sweep_stale_completes_branch_entry_with_missing_remote_branch() {
        let dir = TempDir::new().unwrap();
        let state = store(&dir);
        let queue = MergeQueue::new(dir.path().join("mergeq"), 5);

        queue.enqueue_branch("fix/leftover", 0, None).unwrap();
        let swept = queue.sweep_stale(&state, |_| false).unwrap();
        assert_eq!(swept, vec![("fix/leftover".to_string(), StaleReason::BranchGone)]);
    }
}
