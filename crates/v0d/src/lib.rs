//! Merge Daemon (C5): the long-running process that drains the merge
//! queue against a dedicated workspace, one merge at a time.
//!
//! Generalizes the teacher's `Daemon` (run/step scheduler over SQLite) to
//! the watch-loop shape this project needs: no scheduler, no server, no
//! storage engine - just the queue, the executor, and the collaborators
//! that make readiness and merging possible, polled in a loop.

pub mod dependency;
pub mod executor;
pub mod git;
pub mod hooks;
pub mod lock;
pub mod pidfile;
pub mod queue;
pub mod session;
pub mod workspace;

use crate::dependency::{IssueTracker, MockTracker};
use crate::executor::{MergeError, MergeExecutor};
use crate::hooks::{GitReadyChecks, TrackerHooks};
use crate::queue::MergeQueue;
use crate::session::{MockController, SessionController};
use crate::workspace::{Workspace, WorkspaceError};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use v0_core::config::Config;
use v0_core::phase::{merge_ready_reason, PhaseError, CONVENTIONAL_BRANCH_PREFIXES};
use v0_core::state::{StateError, StateStore};
use v0_core::types::{MergeType, Operation, QueueEntry, QueueStatus, ReadyReason, ResumedBy};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error("no conventional branch could be resolved for operation {0}")]
    BranchUnresolvable(String),
}

/// The on-disk locations a daemon instance operates against, all derived
/// from a project root and a state-directory override.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub project_root: PathBuf,
    pub build_dir: PathBuf,
    pub mergeq_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl DaemonPaths {
    /// `build_dir`/`mergeq_dir` live under the project itself (`.v0/build`,
    /// per the on-disk layout); `state_dir` is the daemon's own dedicated
    /// directory, defaulting to an XDG state path scoped by project name
    /// so two projects never collide.
    pub fn discover(project_root: PathBuf, state_dir_override: Option<PathBuf>, project_name: &str) -> Self {
        let build_dir = project_root.join(".v0").join("build");
        let mergeq_dir = build_dir.join("mergeq");
        let state_dir = state_dir_override.unwrap_or_else(|| default_state_dir(project_name));
        Self {
            project_root,
            build_dir,
            mergeq_dir,
            state_dir,
        }
    }
}

fn default_state_dir(project_name: &str) -> PathBuf {
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".local").join("state"));
    base.join("v0").join(project_name)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

pub struct MergeDaemonConfig {
    pub paths: DaemonPaths,
    pub config: Config,
    pub poll_interval: Duration,
    pub conflict_timeout: Duration,
    /// Whether `merge_ready_reason` enforces the "all plan issues closed"
    /// check; off by default since not every project runs the optional
    /// plan-issue workflow (§5, open-issues policy).
    pub enforce_issue_policy: bool,
}

/// Drains the merge queue against a dedicated workspace, one merge at a
/// time (§4.5). Built from real collaborators by [`MergeDaemon::new`];
/// tests construct it directly with [`MockTracker`]/[`MockController`].
pub struct MergeDaemon {
    cfg: MergeDaemonConfig,
    store: StateStore,
    queue: MergeQueue,
    workspace: Workspace,
    tracker: Box<dyn IssueTracker>,
    sessions: Box<dyn SessionController>,
    shutdown: Arc<AtomicBool>,
}

impl MergeDaemon {
    pub fn new(
        cfg: MergeDaemonConfig,
        tracker: Box<dyn IssueTracker>,
        sessions: Box<dyn SessionController>,
    ) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(&cfg.paths.build_dir)?;
        std::fs::create_dir_all(&cfg.paths.mergeq_dir)?;

        let store = StateStore::new(
            cfg.paths.build_dir.clone(),
            cfg.config.events_log_max_bytes,
            cfg.config.events_log_rotate_keep,
        );
        let queue = MergeQueue::new(cfg.paths.mergeq_dir.clone(), cfg.config.lock_max_retries);
        let mode = cfg.config.effective_workspace_mode();
        let workspace = Workspace::new(
            &cfg.paths.state_dir,
            cfg.paths.project_root.clone(),
            cfg.config.develop_branch.clone(),
            cfg.config.git_remote.clone(),
            mode,
        );

        Ok(Self {
            cfg,
            store,
            queue,
            workspace,
            tracker,
            sessions,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Test-only constructor wiring in-memory fakes for the tracker and
    /// the session controller, avoiding any `wk`/`tmux` subprocess calls.
    #[doc(hidden)]
    pub fn new_for_test(cfg: MergeDaemonConfig) -> Result<Self, DaemonError> {
        Self::new(cfg, Box::new(MockTracker::new()), Box::new(MockController::new()))
    }

    /// Shared flag the caller can set to stop the watch loop at the next
    /// safe point (between passes or, if idle, between poll sleeps).
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn log_merges(&self, line: &str) {
        let dir = self.cfg.paths.mergeq_dir.join("logs");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, "failed to create merge log directory");
            return;
        }
        let ts = chrono::Utc::now().to_rfc3339();
        let formatted = format!("[{ts}] {line}\n");
        if let Err(e) = append(&dir.join("merges.log"), &formatted) {
            tracing::warn!(error = %e, "failed to append to merges.log");
        }
    }

    /// Resets any entry left `processing` by a daemon that crashed
    /// mid-merge (§4.5), so the next pass retries it from scratch.
    pub fn recover_from_crash(&self) -> Result<usize, DaemonError> {
        let orphaned = self.queue.get_all(Some(QueueStatus::Processing))?;
        for entry in &orphaned {
            self.queue.update_status(&entry.operation, QueueStatus::Pending)?;
            self.log_merges(&format!("recovery:{} processing->pending", entry.operation));
        }
        Ok(orphaned.len())
    }

    /// Drives the watch loop until `shutdown_flag()` is set. Each pass is
    /// synchronous (git/tmux/lock I/O); the only await points are the
    /// sleeps between passes, which is where a pending signal actually
    /// gets a chance to resolve - a long conflict-resolution session
    /// blocking the daemon is intentional (§5: at most one merge in
    /// flight at a time).
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.workspace.ensure()?;
        self.log_merges("daemon:start");

        let recovered = self.recover_from_crash()?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered in-flight merges left over from a crash");
        }

        let mut retried_conflicts: HashSet<String> = HashSet::new();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("shutdown requested, exiting watch loop");
                break;
            }

            let found_ready = match self.watch_loop_pass(&mut retried_conflicts) {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!(error = %e, "watch loop pass failed");
                    false
                }
            };

            let sleep_for = if found_ready {
                Duration::from_secs(2)
            } else {
                self.cfg.poll_interval
            };
            tokio::time::sleep(sleep_for).await;
        }

        self.log_merges("daemon:stop");
        Ok(())
    }

    /// One iteration of §4.5's pseudocode: fetch, retry conflicts once per
    /// pass, sweep stale entries, then process at most one ready entry.
    /// Returns whether an entry was processed.
    fn watch_loop_pass(&self, retried_conflicts: &mut HashSet<String>) -> Result<bool, DaemonError> {
        let _ = git::fetch(self.workspace.path(), &self.cfg.config.git_remote, &self.cfg.config.develop_branch);

        for entry in self.queue.get_all(Some(QueueStatus::Conflict))? {
            if retried_conflicts.insert(entry.operation.clone()) {
                self.queue.update_status(&entry.operation, QueueStatus::Pending)?;
                self.log_merges(&format!("conflict:{} retried", entry.operation));
            }
        }

        let remote = self.cfg.config.git_remote.clone();
        let main_repo = self.cfg.paths.project_root.clone();
        let swept = self.queue.sweep_stale(&self.store, |branch| {
            git::branch_exists_remote(&main_repo, &remote, branch).unwrap_or(false)
        })?;
        for (operation, reason) in &swept {
            self.log_merges(&format!("stale:{operation} reason={}", reason.as_str()));
        }

        let checks = GitReadyChecks {
            main_repo: &self.cfg.paths.project_root,
            remote: &self.cfg.config.git_remote,
            sessions: self.sessions.as_ref(),
            tracker: self.tracker.as_ref(),
        };

        let mut pending: Vec<QueueEntry> = self.queue.get_all(Some(QueueStatus::Pending))?;
        pending.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));

        for entry in pending {
            match entry.merge_type {
                MergeType::Branch => {
                    self.workspace.ensure()?;
                    self.queue.update_status(&entry.operation, QueueStatus::Processing)?;
                    self.log_merges(&format!("start:{} (branch-only)", entry.operation));
                    self.process_branch_entry(&entry)?;
                    return Ok(true);
                }
                MergeType::Operation => {
                    let op = match self.store.load_with_migration(&entry.operation, None) {
                        Ok(op) => op,
                        Err(StateError::NotFound(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };

                    let reason = merge_ready_reason(&op, &checks, self.cfg.enforce_issue_policy);
                    if reason == ReadyReason::Ready {
                        self.workspace.ensure()?;
                        self.queue.update_status(&entry.operation, QueueStatus::Processing)?;
                        self.log_merges(&format!("start:{}", entry.operation));
                        self.process_operation_entry(&op)?;
                        return Ok(true);
                    }
                    self.handle_not_ready(&op, &reason)?;
                }
            }
        }
        Ok(false)
    }

    /// §4.5's `handle_not_ready`: `open_issues` auto-resumes and spawns a
    /// finishing session once; missing worktree/branch is flagged for
    /// manual recovery; an active session or a non-terminal phase is
    /// simply transient and needs no action.
    fn handle_not_ready(&self, op: &Operation, reason: &ReadyReason) -> Result<(), DaemonError> {
        match reason {
            ReadyReason::OpenIssues(open) => {
                if op.resumed {
                    return Ok(());
                }
                self.store.update(&op.name, "resumed", serde_json::json!(true))?;
                self.store
                    .update(&op.name, "resumed_at", serde_json::json!(chrono::Utc::now()))?;
                self.store
                    .update(&op.name, "resumed_by", serde_json::json!(ResumedBy::Auto.as_str()))?;
                self.queue.update_status(&op.name, QueueStatus::Resumed)?;

                let session_name = format!("resume-{}", op.name);
                let workdir = op
                    .worktree
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.workspace.path().to_path_buf());
                if let Err(e) = self.sessions.launch(&session_name, &workdir, "claude") {
                    tracing::warn!(operation = %op.name, error = %e, "failed to launch resume session");
                }
                self.log_merges(&format!("resume:{} open_issues={open}", op.name));
            }
            ReadyReason::WorktreeMissing | ReadyReason::BranchMissing => {
                if !op.worktree_missing {
                    self.store.update(&op.name, "worktree_missing", serde_json::json!(true))?;
                    self.log_merges(&format!("worktree_missing:{}", op.name));
                }
            }
            ReadyReason::SessionActive | ReadyReason::Phase(_) => {}
            ReadyReason::Ready => unreachable!("handle_not_ready called with ReadyReason::Ready"),
        }
        Ok(())
    }

    fn process_operation_entry(&self, op: &Operation) -> Result<(), DaemonError> {
        let source_branch = self.resolve_branch(op).ok_or_else(|| DaemonError::BranchUnresolvable(op.name.clone()))?;
        let hooks = TrackerHooks { tracker: self.tracker.as_ref() };
        let executor = MergeExecutor {
            workspace: &self.workspace,
            queue: &self.queue,
            store: &self.store,
            tracker: self.tracker.as_ref(),
            sessions: self.sessions.as_ref(),
            hooks: &hooks,
            remote: self.cfg.config.git_remote.clone(),
            target_branch: self.cfg.config.develop_branch.clone(),
            resolve_enabled: self.cfg.config.resolve,
            conflict_timeout: self.cfg.conflict_timeout,
        };
        executor.process_operation(&op.name, &source_branch)?;
        self.log_merges(&format!("done:{}", op.name));
        Ok(())
    }

    fn process_branch_entry(&self, entry: &QueueEntry) -> Result<(), DaemonError> {
        let hooks = TrackerHooks { tracker: self.tracker.as_ref() };
        let executor = MergeExecutor {
            workspace: &self.workspace,
            queue: &self.queue,
            store: &self.store,
            tracker: self.tracker.as_ref(),
            sessions: self.sessions.as_ref(),
            hooks: &hooks,
            remote: self.cfg.config.git_remote.clone(),
            target_branch: self.cfg.config.develop_branch.clone(),
            resolve_enabled: self.cfg.config.resolve,
            conflict_timeout: self.cfg.conflict_timeout,
        };
        executor.process_branch_only(&entry.operation, entry.issue_id.as_deref())?;
        self.log_merges(&format!("done:{} (branch-only)", entry.operation));
        Ok(())
    }

    /// Resolves the branch an operation's source work lives on: the
    /// recorded branch if one was set, otherwise the first conventional
    /// `<prefix>/<name>` branch that actually exists, local or remote.
    fn resolve_branch(&self, op: &Operation) -> Option<String> {
        if let Some(branch) = &op.branch {
            return Some(branch.clone());
        }
        let repo = &self.cfg.paths.project_root;
        let remote = &self.cfg.config.git_remote;
        CONVENTIONAL_BRANCH_PREFIXES.iter().map(|prefix| format!("{prefix}/{}", op.name)).find(|candidate| {
            git::branch_exists_local(repo, candidate).unwrap_or(false)
                || git::branch_exists_remote(repo, remote, candidate).unwrap_or(false)
        })
    }
}

fn append(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}
