//! Workspace Manager (C6): the merge daemon's dedicated per-project
//! checkout at `<state_dir>/workspace/<repo_name>/`, distinct from the
//! user's own working directory.
//!
//! Generalizes the teacher's per-run `WorktreeProviderTrait`/`GitProvider`
//! (`worktree.rs`) from one worktree per run to a single, long-lived
//! workspace per project, and adds the clone-mode path the teacher's
//! worktree-only provider never needed.

use crate::git::{self, GitError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use v0_core::naming::sanitize_name;
use v0_core::WorkspaceMode;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("branch {0} is already checked out elsewhere; cannot create a worktree for it")]
    BranchCheckedOutElsewhere(String),
    #[error("workspace at {path} is not a valid git working copy")]
    NotAGitRepo { path: PathBuf },
    #[error("workspace mode mismatch: expected {expected:?}, found {actual:?}")]
    ModeMismatch {
        expected: WorkspaceMode,
        actual: WorkspaceMode,
    },
    #[error("workspace branch mismatch: expected {expected}, found {actual}")]
    BranchMismatch { expected: String, actual: String },
    #[error("workspace remote mismatch: expected {expected}, found {actual}")]
    RemoteMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

fn io_err(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A dedicated checkout of `main_repo` at `target_branch`, used only by
/// the merge daemon.
pub struct Workspace {
    main_repo: PathBuf,
    path: PathBuf,
    mode: WorkspaceMode,
    target_branch: String,
    remote: String,
}

impl Workspace {
    /// `state_dir` is the daemon's state directory; the workspace lives at
    /// `<state_dir>/workspace/<sanitized main_repo dir name>`.
    pub fn new(
        state_dir: &Path,
        main_repo: PathBuf,
        target_branch: String,
        remote: String,
        mode: WorkspaceMode,
    ) -> Self {
        let repo_name = main_repo
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let path = state_dir.join("workspace").join(sanitize_name(&repo_name));
        Self {
            main_repo,
            path,
            mode,
            target_branch,
            remote,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The only entry point callers outside this module should use.
    /// Idempotent: safe to call on every daemon watch-loop pass.
    pub fn ensure(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "creating workspace");
            return self.create();
        }
        if !git::is_git_repo(&self.path) {
            return self.destroy_and_recreate("workspace directory exists but is not a git repo");
        }
        match self.validate() {
            Ok(()) => self.sync_to_target_branch(),
            Err(_) => self.destroy_and_recreate("workspace drifted from configured mode/branch/remote"),
        }
    }

    /// Checks existence, git validity, on-disk mode, current branch, and
    /// (clone mode only) remote URL match.
    pub fn validate(&self) -> Result<()> {
        if !self.path.exists() || !git::is_git_repo(&self.path) {
            return Err(WorkspaceError::NotAGitRepo {
                path: self.path.clone(),
            });
        }

        let actual_mode = mode_on_disk(&self.path);
        if actual_mode != self.mode {
            return Err(WorkspaceError::ModeMismatch {
                expected: self.mode,
                actual: actual_mode,
            });
        }

        let current = git::current_branch(&self.path)?;
        if current != self.target_branch {
            return Err(WorkspaceError::BranchMismatch {
                expected: self.target_branch.clone(),
                actual: current,
            });
        }

        if self.mode == WorkspaceMode::Clone {
            let actual_url = git::get_remote_url(&self.path, &self.remote)?;
            let expected_url = git::get_remote_url(&self.main_repo, &self.remote)?;
            if actual_url != expected_url {
                return Err(WorkspaceError::RemoteMismatch {
                    expected: expected_url,
                    actual: actual_url,
                });
            }
        }

        Ok(())
    }

    /// Brings the workspace to the target branch and current with the
    /// remote, aborting any leftover rebase/merge state first. The
    /// workspace has no commits of its own, so a hard reset to the fetched
    /// remote ref is always safe, whether local was behind or had
    /// diverged (e.g. after a force push elsewhere).
    pub fn sync_to_target_branch(&self) -> Result<()> {
        git::abort_any_in_progress(&self.path);

        let current = git::current_branch(&self.path)?;
        if current != self.target_branch {
            git::checkout_branch(&self.path, &self.target_branch)?;
        }

        git::fetch(&self.path, &self.remote, &self.target_branch)?;
        let remote_ref = format!("{}/{}", self.remote, self.target_branch);
        git::hard_reset_to(&self.path, &remote_ref)?;
        Ok(())
    }

    /// Deletes the workspace directory; unregisters a worktree first.
    pub fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        match self.mode {
            WorkspaceMode::Worktree => git::remove_worktree_force(&self.main_repo, &self.path)?,
            WorkspaceMode::Clone => {
                std::fs::remove_dir_all(&self.path).map_err(|e| io_err(&self.path, e))?;
            }
        }
        Ok(())
    }

    fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        match self.mode {
            WorkspaceMode::Worktree => {
                if git::is_branch_checked_out_elsewhere(&self.main_repo, &self.target_branch)? {
                    return Err(WorkspaceError::BranchCheckedOutElsewhere(
                        self.target_branch.clone(),
                    ));
                }
                git::create_worktree(&self.main_repo, &self.path, &self.target_branch)?;
            }
            WorkspaceMode::Clone => {
                git::clone_local(&self.main_repo, &self.path)?;
                let remote_url = git::get_remote_url(&self.main_repo, &self.remote)?;
                git::set_remote_url(&self.path, &self.remote, &remote_url)?;
                git::checkout_branch(&self.path, &self.target_branch)?;
            }
        }
        Ok(())
    }

    fn destroy_and_recreate(&self, reason: &str) -> Result<()> {
        tracing::warn!(reason, path = %self.path.display(), "recreating workspace");
        self.remove()?;
        self.create()
    }
}

/// A worktree's `.git` entry is a file pointing at the shared object
/// database; a clone's `.git` is an ordinary directory.
fn mode_on_disk(path: &Path) -> WorkspaceMode {
    if path.join(".git").is_file() {
        WorkspaceMode::Worktree
    } else {
        WorkspaceMode::Clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn setup_main_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run(dir.path(), &["init", "-b", "main"]);
        run(dir.path(), &["config", "user.email", "test@example.com"]);
        run(dir.path(), &["config", "user.name", "test"]);
        std::fs::write(dir.path().join("f.txt"), "hello").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "init"]);
        run(dir.path(), &["checkout", "-b", "feature/auth"]);
        run(dir.path(), &["checkout", "main"]);
        dir
    }

    fn add_bare_remote(main: &Path, remote_path: &Path) {
        run(remote_path, &["init", "--bare", "-b", "main"]);
        run(main, &["remote", "add", "origin", remote_path.to_str().unwrap()]);
        run(main, &["push", "origin", "main"]);
        run(main, &["push", "origin", "feature/auth"]);
    }

    #[test]
    fn worktree_mode_creates_and_validates() {
        let main = setup_main_repo();
        let state_dir = TempDir::new().unwrap();
        let ws = Workspace::new(
            state_dir.path(),
            main.path().to_path_buf(),
            "feature/auth".to_string(),
            "origin".to_string(),
            WorkspaceMode::Worktree,
        );

        ws.ensure().unwrap();
        assert!(ws.path().join(".git").is_file());
        assert_eq!(git::current_branch(ws.path()).unwrap(), "feature/auth");
        ws.validate().unwrap();
    }

    #[test]
    fn clone_mode_creates_and_rewrites_remote() {
        let main = setup_main_repo();
        let remote = TempDir::new().unwrap();
        add_bare_remote(main.path(), remote.path());
        let state_dir = TempDir::new().unwrap();

        let ws = Workspace::new(
            state_dir.path(),
            main.path().to_path_buf(),
            "main".to_string(),
            "origin".to_string(),
            WorkspaceMode::Clone,
        );

        ws.ensure().unwrap();
        assert!(ws.path().join(".git").is_dir());
        assert_eq!(
            git::get_remote_url(ws.path(), "origin").unwrap(),
            git::get_remote_url(main.path(), "origin").unwrap()
        );
        ws.validate().unwrap();
    }

    #[test]
    fn ensure_is_idempotent() {
        let main = setup_main_repo();
        let state_dir = TempDir::new().unwrap();
        let ws = Workspace::new(
            state_dir.path(),
            main.path().to_path_buf(),
            "feature/auth".to_string(),
            "origin".to_string(),
            WorkspaceMode::Worktree,
        );

        ws.ensure().unwrap();
        ws.ensure().unwrap();
        assert_eq!(git::current_branch(ws.path()).unwrap(), "feature/auth");
    }

    #[test]
    fn wrong_branch_checked_out_triggers_recreate() {
        let main = setup_main_repo();
        let state_dir = TempDir::new().unwrap();
        let ws = Workspace::new(
            state_dir.path(),
            main.path().to_path_buf(),
            "feature/auth".to_string(),
            "origin".to_string(),
            WorkspaceMode::Worktree,
        );
        ws.ensure().unwrap();

        run(ws.path(), &["checkout", "main"]);
        assert_eq!(git::current_branch(ws.path()).unwrap(), "main");

        ws.ensure().unwrap();
        assert_eq!(git::current_branch(ws.path()).unwrap(), "feature/auth");
    }

    #[test]
    fn remove_on_worktree_unregisters_it() {
        let main = setup_main_repo();
        let state_dir = TempDir::new().unwrap();
        let ws = Workspace::new(
            state_dir.path(),
            main.path().to_path_buf(),
            "feature/auth".to_string(),
            "origin".to_string(),
            WorkspaceMode::Worktree,
        );
        ws.ensure().unwrap();
        let path = ws.path().to_path_buf();

        ws.remove().unwrap();
        assert!(!path.exists());
        assert!(!git::is_branch_checked_out_elsewhere(main.path(), "feature/auth").unwrap());
    }
}
