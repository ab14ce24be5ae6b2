//! Merge Executor (C4): performs one merge end-to-end in the workspace
//! (§4.4). Preconditions: the workspace exists and is checked out on the
//! target branch; the queue lock is NOT held while this runs, since a
//! merge (and especially a conflict-resolution session) is long-running
//! and must never block other queue operations.

use crate::dependency::{notify_dependents, notify_dependents_by_issue, IssueTracker};
use crate::git::{self, GitError, MergeOutcome};
use crate::queue::{MergeQueue, QueueError};
use crate::session::{self, SessionController, SessionError};
use crate::workspace::{Workspace, WorkspaceError};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v0_core::phase::{self, PhaseError, PhaseHooks};
use v0_core::state::{StateError, StateStore};
use v0_core::types::{MergeStatus, QueueStatus};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("merge left conflict markers or no new commit after conflict resolution")]
    VerificationFailed,
}

pub type Result<T> = std::result::Result<T, MergeError>;

pub struct MergeExecutor<'a> {
    pub workspace: &'a Workspace,
    pub queue: &'a MergeQueue,
    pub store: &'a StateStore,
    pub tracker: &'a dyn IssueTracker,
    pub sessions: &'a dyn SessionController,
    pub hooks: &'a dyn PhaseHooks,
    pub remote: String,
    pub target_branch: String,
    pub resolve_enabled: bool,
    pub conflict_timeout: Duration,
}

impl<'a> MergeExecutor<'a> {
    /// Full algorithm for a tracked operation (§4.4, steps 1-9). The
    /// queue entry's status is always left in a terminal-for-this-pass
    /// state (`completed`, `failed`, or `conflict`) by the time this
    /// returns `Ok(())`; only lock/IO errors escape as `Err`.
    pub fn process_operation(&self, operation: &str, source_branch: &str) -> Result<()> {
        if let Err(e) = self.run_operation(operation, source_branch) {
            self.store.emit_event(operation, "merge:error", &e.to_string())?;
            return Err(e);
        }
        Ok(())
    }

    fn run_operation(&self, operation: &str, source_branch: &str) -> Result<()> {
        self.store
            .update(operation, "merge_status", json!(MergeStatus::Merging.as_str()))?;

        match self.merge_branch_into_target(source_branch) {
            Ok(()) => {}
            Err(MergeError::VerificationFailed) => {
                self.store
                    .update(operation, "merge_status", json!(MergeStatus::VerificationFailed.as_str()))?;
                phase::transition_to_failed(self.store, operation, "conflict resolution left the workspace unverified".to_string(), self.hooks)?;
                self.queue.update_status(operation, QueueStatus::Failed)?;
                return Ok(());
            }
            Err(MergeError::Git(GitError::MergeConflict(detail))) => {
                phase::transition_to_conflict(self.store, operation, self.hooks)?;
                self.queue.update_status(operation, QueueStatus::Conflict)?;
                self.store.emit_event(operation, "merge:conflict", &detail)?;
                return Ok(());
            }
            Err(MergeError::Session(SessionError::Timeout(ref session_name))) => {
                let _ = self.sessions.kill(session_name);
                git::abort_any_in_progress(self.workspace.path());
                phase::transition_to_conflict(self.store, operation, self.hooks)?;
                self.queue.update_status(operation, QueueStatus::Conflict)?;
                self.store
                    .emit_event(operation, "merge:conflict", "conflict-resolution session timed out")?;
                return Ok(());
            }
            Err(e) => {
                phase::transition_to_failed(self.store, operation, e.to_string(), self.hooks)?;
                self.queue.update_status(operation, QueueStatus::Failed)?;
                return Ok(());
            }
        }

        let merge_commit = git::head_commit(self.workspace.path())?;
        git::push(self.workspace.path(), &self.remote, &format!("HEAD:{}", self.target_branch))?;

        if !git::is_ancestor(self.workspace.path(), &merge_commit, &self.target_branch)? {
            phase::transition_to_failed(
                self.store,
                operation,
                "push did not land merge_commit on the target branch".to_string(),
                self.hooks,
            )?;
            self.queue.update_status(operation, QueueStatus::Failed)?;
            return Ok(());
        }

        let _ = git::delete_remote_branch(self.workspace.path(), &self.remote, source_branch);

        phase::transition_to_merged(self.store, operation, merge_commit, self.hooks)?;
        self.queue.update_status(operation, QueueStatus::Completed)?;
        self.store.emit_event(operation, "merge:success", source_branch)?;

        if let Err(e) = notify_dependents(self.tracker, self.store, operation) {
            tracing::warn!(operation, error = %e, "failed to notify dependents after merge");
        }

        Ok(())
    }

    /// §4.4.2: an entry may name a branch with no operation state (a
    /// worker-produced fix branch). Simplified path: fetch, merge, push,
    /// delete-remote, then notify dependents by issue ID directly.
    pub fn process_branch_only(&self, branch: &str, issue_id: Option<&str>) -> Result<()> {
        match self.merge_branch_into_target(branch) {
            Ok(()) => {}
            Err(MergeError::Git(GitError::MergeConflict(detail))) => {
                self.queue.update_status(branch, QueueStatus::Conflict)?;
                tracing::warn!(branch, detail, "branch-only merge conflicted");
                return Ok(());
            }
            Err(e) => {
                self.queue.update_status(branch, QueueStatus::Failed)?;
                return Err(e);
            }
        }

        let merge_commit = git::head_commit(self.workspace.path())?;
        git::push(self.workspace.path(), &self.remote, &format!("HEAD:{}", self.target_branch))?;
        if !git::is_ancestor(self.workspace.path(), &merge_commit, &self.target_branch)? {
            self.queue.update_status(branch, QueueStatus::Failed)?;
            return Ok(());
        }
        let _ = git::delete_remote_branch(self.workspace.path(), &self.remote, branch);
        self.queue.update_status(branch, QueueStatus::Completed)?;

        if let Some(issue_id) = issue_id {
            if let Err(e) = notify_dependents_by_issue(self.tracker, self.store, issue_id) {
                tracing::warn!(branch, error = %e, "failed to notify dependents after branch-only merge");
            }
        }
        Ok(())
    }

    /// Steps 1-4 of §4.4: get current on the target branch, attempt the
    /// three-tier strategy chain, and fall back to a conflict-resolution
    /// session if enabled.
    fn merge_branch_into_target(&self, source_branch: &str) -> Result<()> {
        self.workspace.sync_to_target_branch()?;
        git::fetch_source_branch(self.workspace.path(), &self.remote, source_branch)?;

        match git::merge_with_fallback_chain(self.workspace.path(), source_branch, &self.remote, &self.target_branch) {
            Ok(_outcome) => Ok(()),
            Err(GitError::MergeConflict(detail)) if self.resolve_enabled => {
                self.run_conflict_resolution(source_branch, &detail)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn run_conflict_resolution(&self, source_branch: &str, conflict_detail: &str) -> Result<()> {
        let repo = self.workspace.path();
        let pre_merge_head = git::head_commit(repo)?;

        let base = git::merge_base(repo, &self.target_branch, source_branch).unwrap_or_default();
        let ours = if base.is_empty() {
            String::new()
        } else {
            git::log_summary(repo, &format!("{base}..{}", self.target_branch)).unwrap_or_default()
        };
        let theirs = if base.is_empty() {
            String::new()
        } else {
            git::log_summary(repo, &format!("{base}..{source_branch}")).unwrap_or_default()
        };

        session::write_conflict_prompt(repo, source_branch, &self.target_branch, &ours, &theirs)?;
        session::write_stop_hook_settings(repo, session::SessionContext::Merge)?;
        if let Some(parent) = repo.parent() {
            // agent pid is unknown until the session is launched by the
            // caller's agent-launcher; 0 is a harmless placeholder here
            // since `done.sh` is regenerated once the real pid is known.
            session::write_done_script(parent, std::process::id())?;
        }

        let session_name = format!("conflict-{source_branch}", source_branch = sanitize(source_branch));
        self.sessions.launch(&session_name, repo, "claude")?;
        self.sessions.wait(&session_name, Duration::from_secs(2), self.conflict_timeout)?;

        let no_conflicts = !git::has_conflict_markers(repo)?;
        let new_head = git::head_commit(repo)?;
        let clean = no_conflicts && new_head != pre_merge_head;

        if !clean {
            return Err(MergeError::VerificationFailed);
        }
        let _ = conflict_detail;
        Ok(())
    }
}

fn sanitize(branch: &str) -> String {
    v0_core::naming::sanitize_branch_name(branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::MockTracker;
    use crate::session::MockController;
    use chrono::Utc;
    use std::process::Command;
    use tempfile::TempDir;
    use v0_core::phase::NullHooks;
    use v0_core::types::{Operation, OperationType, Phase};

    fn run_git(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn commit_file(dir: &Path, file: &str, contents: &str, message: &str) {
        std::fs::write(dir.join(file), contents).unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-m", message]);
    }

    /// A main repo + bare remote + feature branch with one commit ahead
    /// of main, fully pushed - the common fixture for executor tests.
    struct Fixture {
        main: TempDir,
        remote: TempDir,
        state_dir: TempDir,
    }

    fn setup() -> Fixture {
        let main = TempDir::new().unwrap();
        run_git(main.path(), &["init", "-b", "main"]);
        run_git(main.path(), &["config", "user.email", "test@example.com"]);
        run_git(main.path(), &["config", "user.name", "test"]);
        commit_file(main.path(), "base.txt", "base", "init");

        let remote = TempDir::new().unwrap();
        run_git(remote.path(), &["init", "--bare", "-b", "main"]);
        run_git(main.path(), &["remote", "add", "origin", remote.path().to_str().unwrap()]);
        run_git(main.path(), &["push", "origin", "main"]);

        run_git(main.path(), &["checkout", "-b", "feature/auth"]);
        commit_file(main.path(), "feature.txt", "feature", "add feature");
        run_git(main.path(), &["push", "origin", "feature/auth"]);
        run_git(main.path(), &["checkout", "main"]);

        Fixture {
            main,
            remote,
            state_dir: TempDir::new().unwrap(),
        }
    }

    fn workspace(fx: &Fixture) -> Workspace {
        let ws = Workspace::new(
            fx.state_dir.path(),
            fx.main.path().to_path_buf(),
            "main".to_string(),
            "origin".to_string(),
            v0_core::types::WorkspaceMode::Clone,
        );
        ws.ensure().unwrap();
        ws
    }

    #[test]
    fn process_operation_fast_forwards_pushes_and_marks_merged() {
        let fx = setup();
        let ws = workspace(&fx);
        let store = StateStore::new(fx.state_dir.path().join("build"), 1_048_576, 5);
        let queue = MergeQueue::new(fx.state_dir.path().join("mergeq"), 5);
        let tracker = MockTracker::new();
        let sessions = MockController::new();

        let mut op = Operation::new("auth", OperationType::Feature, Utc::now());
        op.phase = Phase::Completed;
        op.branch = Some("feature/auth".to_string());
        store.create(&op).unwrap();
        queue.enqueue("auth", 0, None).unwrap();
        queue.update_status("auth", QueueStatus::Processing).unwrap();

        let executor = MergeExecutor {
            workspace: &ws,
            queue: &queue,
            store: &store,
            tracker: &tracker,
            sessions: &sessions,
            hooks: &NullHooks,
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
            resolve_enabled: false,
            conflict_timeout: Duration::from_secs(1),
        };

        executor.process_operation("auth", "feature/auth").unwrap();

        let reloaded = store.load("auth").unwrap();
        assert_eq!(reloaded.phase, Phase::Merged);
        assert!(reloaded.merge_commit.is_some());

        let entries = queue.get_all(Some(QueueStatus::Completed)).unwrap();
        assert_eq!(entries.len(), 1);

        run_git(fx.remote.path(), &["log", "main", "--oneline"]);
    }

    #[test]
    fn process_operation_records_conflict_when_resolve_disabled() {
        let fx = setup();
        let ws = workspace(&fx);
        let store = StateStore::new(fx.state_dir.path().join("build"), 1_048_576, 5);
        let queue = MergeQueue::new(fx.state_dir.path().join("mergeq"), 5);
        let tracker = MockTracker::new();
        let sessions = MockController::new();

        // Create a genuine conflict: main and feature both touch base.txt.
        run_git(fx.main.path(), &["checkout", "main"]);
        commit_file(fx.main.path(), "base.txt", "main changed it", "main edits base");
        run_git(fx.main.path(), &["push", "origin", "main"]);

        run_git(fx.main.path(), &["checkout", "feature/auth"]);
        commit_file(fx.main.path(), "base.txt", "feature changed it too", "feature edits base");
        run_git(fx.main.path(), &["push", "origin", "feature/auth", "--force"]);
        run_git(fx.main.path(), &["checkout", "main"]);

        let mut op = Operation::new("auth", OperationType::Feature, Utc::now());
        op.phase = Phase::Completed;
        op.branch = Some("feature/auth".to_string());
        store.create(&op).unwrap();
        queue.enqueue("auth", 0, None).unwrap();

        let executor = MergeExecutor {
            workspace: &ws,
            queue: &queue,
            store: &store,
            tracker: &tracker,
            sessions: &sessions,
            hooks: &NullHooks,
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
            resolve_enabled: false,
            conflict_timeout: Duration::from_secs(1),
        };

        executor.process_operation("auth", "feature/auth").unwrap();

        let reloaded = store.load("auth").unwrap();
        assert_eq!(reloaded.phase, Phase::Conflict);
        let entries = queue.get_all(Some(QueueStatus::Conflict)).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn conflict_resolution_reports_verification_failed_when_session_finishes_without_resolving() {
        let fx = setup();
        let ws = workspace(&fx);
        let store = StateStore::new(fx.state_dir.path().join("build"), 1_048_576, 5);
        let queue = MergeQueue::new(fx.state_dir.path().join("mergeq"), 5);
        let tracker = MockTracker::new();
        let sessions = std::sync::Arc::new(MockController::new());

        // Create a genuine conflict: main and feature both touch base.txt.
        run_git(fx.main.path(), &["checkout", "main"]);
        commit_file(fx.main.path(), "base.txt", "main changed it", "main edits base");
        run_git(fx.main.path(), &["push", "origin", "main"]);

        run_git(fx.main.path(), &["checkout", "feature/auth"]);
        commit_file(fx.main.path(), "base.txt", "feature changed it too", "feature edits base");
        run_git(fx.main.path(), &["push", "origin", "feature/auth", "--force"]);
        run_git(fx.main.path(), &["checkout", "main"]);

        let mut op = Operation::new("auth", OperationType::Feature, Utc::now());
        op.phase = Phase::Completed;
        op.branch = Some("feature/auth".to_string());
        store.create(&op).unwrap();
        queue.enqueue("auth", 0, None).unwrap();

        // The session "finishes" on its own without the agent making any
        // new commit - the same shape as an agent giving up silently.
        let session_name = format!("conflict-{}", v0_core::naming::sanitize_branch_name("feature/auth"));
        let sessions_for_finisher = sessions.clone();
        let finisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            sessions_for_finisher.finish(&session_name);
        });

        let executor = MergeExecutor {
            workspace: &ws,
            queue: &queue,
            store: &store,
            tracker: &tracker,
            sessions: sessions.as_ref(),
            hooks: &NullHooks,
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
            resolve_enabled: true,
            conflict_timeout: Duration::from_secs(5),
        };

        executor.process_operation("auth", "feature/auth").unwrap();
        finisher.join().unwrap();

        let reloaded = store.load("auth").unwrap();
        assert_eq!(reloaded.phase, Phase::Failed);
        assert_eq!(reloaded.merge_status, MergeStatus::VerificationFailed);
        let entries = queue.get_all(Some(QueueStatus::Failed)).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn timed_out_conflict_resolution_kills_session_and_marks_conflict() {
        let fx = setup();
        let ws = workspace(&fx);
        let store = StateStore::new(fx.state_dir.path().join("build"), 1_048_576, 5);
        let queue = MergeQueue::new(fx.state_dir.path().join("mergeq"), 5);
        let tracker = MockTracker::new();
        let sessions = MockController::new();

        // Create a genuine conflict: main and feature both touch base.txt.
        run_git(fx.main.path(), &["checkout", "main"]);
        commit_file(fx.main.path(), "base.txt", "main changed it", "main edits base");
        run_git(fx.main.path(), &["push", "origin", "main"]);

        run_git(fx.main.path(), &["checkout", "feature/auth"]);
        commit_file(fx.main.path(), "base.txt", "feature changed it too", "feature edits base");
        run_git(fx.main.path(), &["push", "origin", "feature/auth", "--force"]);
        run_git(fx.main.path(), &["checkout", "main"]);

        let mut op = Operation::new("auth", OperationType::Feature, Utc::now());
        op.phase = Phase::Completed;
        op.branch = Some("feature/auth".to_string());
        store.create(&op).unwrap();
        queue.enqueue("auth", 0, None).unwrap();

        let executor = MergeExecutor {
            workspace: &ws,
            queue: &queue,
            store: &store,
            tracker: &tracker,
            sessions: &sessions,
            hooks: &NullHooks,
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
            resolve_enabled: true,
            conflict_timeout: Duration::from_millis(20),
        };

        // Nobody ever calls `sessions.finish(...)`, so `wait` times out.
        executor.process_operation("auth", "feature/auth").unwrap();

        let session_name = format!("conflict-{}", v0_core::naming::sanitize_branch_name("feature/auth"));
        assert!(!sessions.exists(&session_name).unwrap(), "timed-out session should have been killed");

        let reloaded = store.load("auth").unwrap();
        assert_eq!(reloaded.phase, Phase::Conflict);
        let entries = queue.get_all(Some(QueueStatus::Conflict)).unwrap();
        assert_eq!(entries.len(), 1);

        let repo = ws.path();
        assert!(!repo.join(".git/MERGE_HEAD").exists());
        assert!(!repo.join(".git/rebase-merge").exists());
        assert!(!repo.join(".git/rebase-apply").exists());
    }

    #[test]
    fn process_branch_only_merges_without_operation_state() {
        let fx = setup();
        let ws = workspace(&fx);
        let store = StateStore::new(fx.state_dir.path().join("build"), 1_048_576, 5);
        let queue = MergeQueue::new(fx.state_dir.path().join("mergeq"), 5);
        let tracker = MockTracker::new();
        let sessions = MockController::new();

        queue.enqueue_branch("feature/auth", 0, None).unwrap();

        let executor = MergeExecutor {
            workspace: &ws,
            queue: &queue,
            store: &store,
            tracker: &tracker,
            sessions: &sessions,
            hooks: &NullHooks,
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
            resolve_enabled: false,
            conflict_timeout: Duration::from_secs(1),
        };

        executor.process_branch_only("feature/auth", None).unwrap();
        let entries = queue.get_all(Some(QueueStatus::Completed)).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
