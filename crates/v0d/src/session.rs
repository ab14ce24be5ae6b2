//! Conflict-resolution sub-session (§4.4.1): when all three merge
//! strategies fail, the executor hands the workspace to an agent running
//! in a detached terminal-multiplexer session and waits for it to finish
//! by presence polling - there is no process handle to join, unlike the
//! teacher's `Runner::execute_step`, which owns the child directly.
//!
//! [`SessionController`] is the seam: `TmuxController` shells out to the
//! real `tmux` binary; tests use `MockController`, an in-memory fake,
//! the same way `dependency.rs` separates `WkCliTracker` from
//! `MockTracker`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tmux command failed: {0}")]
    CommandFailed(String),
    #[error("session {0} did not terminate within the conflict timeout")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Abstraction over a detached terminal-multiplexer session, so the
/// executor's conflict-resolution path never shells to `tmux` directly.
pub trait SessionController: Send + Sync {
    /// Start a detached session named `name`, rooted at `workdir`,
    /// running `command`.
    fn launch(&self, name: &str, workdir: &Path, command: &str) -> Result<()>;
    /// Whether the named session is still present.
    fn exists(&self, name: &str) -> Result<bool>;
    /// Force-terminate the named session (used on daemon shutdown).
    fn kill(&self, name: &str) -> Result<()>;
    /// Poll until the session disappears or `timeout` elapses.
    fn wait(&self, name: &str, poll_interval: Duration, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if !self.exists(name)? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SessionError::Timeout(name.to_string()));
            }
            std::thread::sleep(poll_interval);
        }
    }
}

/// Real adapter over the `tmux` binary.
pub struct TmuxController;

impl SessionController for TmuxController {
    fn launch(&self, name: &str, workdir: &Path, command: &str) -> Result<()> {
        let status = Command::new("tmux")
            .args(["new-session", "-d", "-s", name, "-c"])
            .arg(workdir)
            .arg(command)
            .status()?;
        if !status.success() {
            return Err(SessionError::CommandFailed(format!(
                "tmux new-session -s {name}"
            )));
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let status = Command::new("tmux").args(["has-session", "-t", name]).status()?;
        Ok(status.success())
    }

    fn kill(&self, name: &str) -> Result<()> {
        let status = Command::new("tmux").args(["kill-session", "-t", name]).status()?;
        if !status.success() && self.exists(name)? {
            return Err(SessionError::CommandFailed(format!("tmux kill-session -t {name}")));
        }
        Ok(())
    }
}

/// In-memory fake for tests: sessions "exist" until explicitly killed or
/// marked finished.
#[derive(Default)]
pub struct MockController {
    live: Mutex<std::collections::HashSet<String>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: simulate the session finishing on its own.
    pub fn finish(&self, name: &str) {
        self.live.lock().unwrap().remove(name);
    }
}

impl SessionController for MockController {
    fn launch(&self, name: &str, _workdir: &Path, _command: &str) -> Result<()> {
        self.live.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.live.lock().unwrap().contains(name))
    }

    fn kill(&self, name: &str) -> Result<()> {
        self.live.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Writes the shell `done` script in the workspace's parent directory.
/// Walks the process tree under `agent_pid` to find and signal the
/// running agent once conflicts are believed resolved.
pub fn write_done_script(parent_dir: &Path, agent_pid: u32) -> Result<PathBuf> {
    std::fs::create_dir_all(parent_dir)?;
    let path = parent_dir.join("done.sh");
    let script = format!(
        "#!/bin/sh\n\
         # Signals the conflict-resolution agent (pid {agent_pid}) to stop.\n\
         pid={agent_pid}\n\
         for child in $(pgrep -P \"$pid\" 2>/dev/null); do\n\
         \tkill -TERM \"$child\" 2>/dev/null || true\n\
         done\n\
         kill -TERM \"$pid\" 2>/dev/null || true\n"
    );
    std::fs::write(&path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}

/// Which workflow launched this session. The source system has a
/// `stop-build.sh` and a `stop-feature.sh`, near-duplicate scripts that
/// auto-approve slightly different subsets of stop reasons (§9 Design
/// Notes open question). This core only ever launches `Merge` sessions
/// (conflict resolution); the other variants exist so the auto-approval
/// rules live in one data table (`blocking_reasons`) instead of being
/// re-forked into a second near-identical script the day a build- or
/// feature-context session is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionContext {
    Merge,
    Build,
    Feature,
}

/// A condition that, while true, blocks the agent from stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    ConflictMarkersPresent,
    RebaseOrMergeInProgress,
    UncommittedChanges,
}

impl StopReason {
    /// Shell predicate that exits non-zero while this reason still blocks.
    fn holds_command(self) -> &'static str {
        match self {
            Self::ConflictMarkersPresent => "git diff --quiet --diff-filter=U",
            Self::RebaseOrMergeInProgress => {
                "! ( test -d .git/rebase-merge -o -d .git/rebase-apply -o -f .git/MERGE_HEAD )"
            }
            Self::UncommittedChanges => "git diff --quiet && git diff --cached --quiet",
        }
    }
}

/// Stop reasons enforced per session context. `Merge`/`Build` share the
/// conflict-resolution reasons (no markers left, no rebase/merge still in
/// progress); `Feature` additionally requires a clean tree before
/// stopping. Declared as data precisely so a new context is a new table
/// row, not a new shell script.
fn blocking_reasons(context: SessionContext) -> &'static [StopReason] {
    match context {
        SessionContext::Merge | SessionContext::Build => {
            &[StopReason::ConflictMarkersPresent, StopReason::RebaseOrMergeInProgress]
        }
        SessionContext::Feature => &[StopReason::UncommittedChanges],
    }
}

/// Installs a Stop hook in `<workspace>/.claude/settings.local.json` that
/// blocks session termination while any of `context`'s blocking reasons
/// still hold.
pub fn write_stop_hook_settings(workspace: &Path, context: SessionContext) -> Result<PathBuf> {
    let claude_dir = workspace.join(".claude");
    std::fs::create_dir_all(&claude_dir)?;
    let path = claude_dir.join("settings.local.json");

    let check = blocking_reasons(context)
        .iter()
        .map(|reason| reason.holds_command())
        .collect::<Vec<_>>()
        .join(" && ");
    let command = format!("{check} || exit 2");

    let settings = serde_json::json!({
        "hooks": {
            "Stop": [{
                "hooks": [{
                    "type": "command",
                    "command": command
                }]
            }]
        }
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&settings).expect("static json"))?;
    Ok(path)
}

/// Writes the prompt handed to the conflict-resolution agent, embedding
/// both sides' commit summaries since the merge base.
pub fn write_conflict_prompt(
    workspace: &Path,
    source_branch: &str,
    target_branch: &str,
    ours_summary: &str,
    theirs_summary: &str,
) -> Result<PathBuf> {
    let path = workspace.join(".merge-conflict-prompt.md");
    let prompt = format!(
        "# Merge conflict: {source_branch} -> {target_branch}\n\n\
         Resolve the conflict markers in this working copy, then commit.\n\n\
         ## Commits on {target_branch} since the merge base\n{ours_summary}\n\n\
         ## Commits on {source_branch} since the merge base\n{theirs_summary}\n"
    );
    std::fs::write(&path, prompt)?;
    Ok(path)
}
