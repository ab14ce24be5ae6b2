//! Git subprocess wrapper.
//!
//! Every call takes an explicit working directory rather than relying on
//! the current process's cwd, since the daemon and the workspaces it
//! manages never share a directory with each other or with the caller.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(GitError::from)
}

fn run_ok(dir: &Path, args: &[&str]) -> Result<()> {
    let output = run(dir, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr
        )));
    }
    Ok(())
}

fn stdout_trimmed(dir: &Path, args: &[&str]) -> Result<String> {
    let output = run(dir, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

pub fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = stdout_trimmed(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }
    if run(repo, &["rev-parse", "--verify", "refs/heads/main"])?
        .status
        .success()
    {
        return Ok("main".to_string());
    }
    if run(repo, &["rev-parse", "--verify", "refs/heads/master"])?
        .status
        .success()
    {
        return Ok("master".to_string());
    }
    Ok("main".to_string())
}

pub fn current_branch(repo: &Path) -> Result<String> {
    stdout_trimmed(repo, &["branch", "--show-current"])
}

pub fn branch_exists_local(repo: &Path, branch: &str) -> Result<bool> {
    Ok(run(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?
        .status
        .success())
}

pub fn branch_exists_remote(repo: &Path, remote: &str, branch: &str) -> Result<bool> {
    let output = stdout_trimmed(repo, &["ls-remote", "--heads", remote, branch])?;
    Ok(!output.is_empty())
}

pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    run_ok(repo, &["branch", branch, base])
}

pub fn checkout_branch(repo: &Path, branch: &str) -> Result<()> {
    run_ok(repo, &["checkout", branch])
}

pub fn is_working_tree_clean(repo: &Path) -> Result<bool> {
    Ok(stdout_trimmed(repo, &["status", "--porcelain"])?.is_empty())
}

/// Fetches `branch` from `remote` directly into a same-named local branch
/// (`+branch:branch`), so merge/rebase commands can refer to it by its
/// bare name even in a workspace that never had it checked out locally
/// (e.g. a freshly cloned clone-mode workspace, which otherwise only
/// knows the branch as `<remote>/<branch>`).
pub fn fetch_source_branch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    run_ok(repo, &["fetch", remote, &format!("+{branch}:{branch}")])
}

pub fn fetch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    run_ok(repo, &["fetch", remote, branch])
}

pub fn push(repo: &Path, remote: &str, refspec: &str) -> Result<()> {
    run_ok(repo, &["push", remote, refspec])
}

pub fn delete_remote_branch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    run_ok(repo, &["push", remote, "--delete", branch])
}

pub fn head_commit(repo: &Path) -> Result<String> {
    stdout_trimmed(repo, &["rev-parse", "HEAD"])
}

pub fn merge_base(repo: &Path, a: &str, b: &str) -> Result<String> {
    stdout_trimmed(repo, &["merge-base", a, b])
}

/// One-line-per-commit summary of `range`, for conflict-resolution prompts.
pub fn log_summary(repo: &Path, range: &str) -> Result<String> {
    stdout_trimmed(repo, &["log", "--oneline", range])
}

pub fn is_ancestor(repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    Ok(run(repo, &["merge-base", "--is-ancestor", ancestor, descendant])?
        .status
        .success())
}

pub fn abort_merge(repo: &Path) {
    let _ = run(repo, &["merge", "--abort"]);
}

pub fn abort_rebase(repo: &Path) {
    let _ = run(repo, &["rebase", "--abort"]);
}

/// Abort any leftover merge or rebase state left by a previous crashed
/// attempt. Best-effort: both are no-ops when no such state exists.
pub fn abort_any_in_progress(repo: &Path) {
    abort_merge(repo);
    abort_rebase(repo);
}

pub fn has_conflict_markers(repo: &Path) -> Result<bool> {
    let output = stdout_trimmed(repo, &["diff", "--check"]);
    match output {
        Ok(_) => Ok(false),
        Err(GitError::CommandFailed(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Outcome of a single merge strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    FastForward,
    RebaseThenFastForward,
    NoFastForward,
}

/// Attempt a pure fast-forward merge of `source` into the checked-out
/// branch. Returns `Err` (without leaving state behind - ff-only merges
/// never touch the tree on failure) if a fast-forward isn't possible.
pub fn try_fast_forward_merge(repo: &Path, source: &str) -> Result<MergeOutcome> {
    run_ok(repo, &["merge", "--ff-only", source])?;
    Ok(MergeOutcome::FastForward)
}

/// Rebase `source` onto `onto`, then fast-forward merge the rebased
/// branch in. Aborts and cleans up the rebase on conflict.
pub fn try_rebase_then_ff(repo: &Path, source: &str, onto: &str) -> Result<MergeOutcome> {
    checkout_branch(repo, source)?;
    let output = run(repo, &["rebase", onto])?;
    if !output.status.success() {
        abort_rebase(repo);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::MergeConflict(format!(
            "rebase {source} onto {onto} failed: {stderr}"
        )));
    }
    let target = current_target_branch(repo, onto)?;
    checkout_branch(repo, &target)?;
    try_fast_forward_merge(repo, source)
}

/// `onto` is `<remote>/<branch>`; the local branch to return to after
/// rebasing is the part after the slash.
fn current_target_branch(_repo: &Path, onto: &str) -> Result<String> {
    Ok(onto
        .rsplit_once('/')
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| onto.to_string()))
}

/// Regular (non-fast-forward) merge, producing a merge commit. Aborts and
/// cleans up on conflict.
pub fn try_no_ff_merge(repo: &Path, source: &str) -> Result<MergeOutcome> {
    let output = run(repo, &["merge", "--no-ff", "--no-edit", source])?;
    if !output.status.success() {
        abort_merge(repo);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::MergeConflict(format!(
            "merge {source} failed: {stderr}"
        )));
    }
    Ok(MergeOutcome::NoFastForward)
}

/// Run the three-tier merge strategy chain: fast-forward, then
/// rebase-then-fast-forward, then a regular merge commit. Each tier
/// cleans up its own failure before the next is attempted.
pub fn merge_with_fallback_chain(
    repo: &Path,
    source: &str,
    remote: &str,
    target_branch: &str,
) -> Result<MergeOutcome> {
    if let Ok(outcome) = try_fast_forward_merge(repo, source) {
        return Ok(outcome);
    }
    abort_merge(repo);

    let onto = format!("{remote}/{target_branch}");
    if let Ok(outcome) = try_rebase_then_ff(repo, source, &onto) {
        return Ok(outcome);
    }
    abort_rebase(repo);
    checkout_branch(repo, target_branch)?;

    try_no_ff_merge(repo, source)
}

// --- Worktree mode ---

pub fn create_worktree(repo: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run_ok(
        repo,
        &["worktree", "add", worktree_path.to_string_lossy().as_ref(), branch],
    )
}

pub fn remove_worktree(repo: &Path, worktree_path: &Path) -> Result<()> {
    run_ok(repo, &["worktree", "remove", worktree_path.to_string_lossy().as_ref()])
}

pub fn remove_worktree_force(repo: &Path, worktree_path: &Path) -> Result<()> {
    run_ok(
        repo,
        &["worktree", "remove", "--force", worktree_path.to_string_lossy().as_ref()],
    )
}

pub fn is_branch_checked_out_elsewhere(repo: &Path, branch: &str) -> Result<bool> {
    let output = stdout_trimmed(repo, &["worktree", "list", "--porcelain"])?;
    Ok(output
        .lines()
        .any(|l| l == format!("branch refs/heads/{branch}")))
}

// --- Clone mode ---

pub fn clone_local(source_repo: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run_ok(
        Path::new("."),
        &["clone", source_repo.to_string_lossy().as_ref(), dest.to_string_lossy().as_ref()],
    )
}

pub fn set_remote_url(repo: &Path, remote: &str, url: &str) -> Result<()> {
    run_ok(repo, &["remote", "set-url", remote, url])
}

pub fn get_remote_url(repo: &Path, remote: &str) -> Result<String> {
    stdout_trimmed(repo, &["remote", "get-url", remote])
}

pub fn is_git_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

pub fn hard_reset_to(repo: &Path, refspec: &str) -> Result<()> {
    run_ok(repo, &["reset", "--hard", refspec])
}
