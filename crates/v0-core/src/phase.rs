//! Phase State Machine (C2): validates transitions, persists them through
//! the State Store (C1), and runs post-transition hooks.
//!
//! The transition table is the literal one from the specification, encoded
//! as a `match` over `(Phase, Phase)` pairs - mirroring the shape of the
//! teacher's `Scheduler::determine_next_phase` match, but here the table
//! *is* the spec rather than a derived linear pipeline.
//!
//! Side effects that reach outside this crate (the issue tracker, the
//! Dependency Resolver) are not implemented here: `v0d` owns those
//! collaborators, so this module only defines the [`PhaseHooks`] and
//! [`ReadyChecks`] seams it calls through.

use crate::state::{StateError, StateStore};
use crate::types::{MergeStatus, Operation, Phase, ReadyReason, ResumedBy};
use chrono::Utc;
use thiserror::Error;

/// Conventional branch name prefixes tried, in order, when an operation has
/// no recorded branch: `<prefix>/<op_name>`.
pub const CONVENTIONAL_BRANCH_PREFIXES: &[&str] = &["feature", "fix", "chore", "bugfix", "hotfix"];

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("operation {operation}: cannot transition from {from:?} to {to:?}")]
    BadTransition {
        operation: String,
        from: Phase,
        to: Phase,
    },
    #[error(transparent)]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, PhaseError>;

/// Whether `(from, to)` is a legal named transition per the spec table.
/// Self-transitions are deliberately absent: callers short-circuit those
/// before consulting this table (see [`transition`]).
fn allowed(from: Phase, to: Phase) -> bool {
    use Phase::{
        Completed, Conflict, Executing, Failed, Init, Interrupted, Merged, PendingMerge, Planned,
        Queued,
    };
    matches!(
        (from, to),
        (Init, Planned)
            | (Init, Failed)
            | (Planned, Queued)
            | (Planned, Executing)
            | (Planned, Failed)
            | (Queued, Executing)
            | (Queued, Failed)
            | (Executing, Completed)
            | (Executing, Failed)
            | (Executing, Interrupted)
            | (Completed, PendingMerge)
            | (Completed, Merged)
            | (Completed, Failed)
            | (PendingMerge, Merged)
            | (PendingMerge, Conflict)
            | (PendingMerge, Failed)
            | (Failed, Init)
            | (Failed, Planned)
            | (Failed, Queued)
            | (Conflict, PendingMerge)
            | (Conflict, Failed)
            | (Interrupted, Init)
            | (Interrupted, Planned)
            | (Interrupted, Queued)
    )
    // `Cancelled` has no outgoing table entries; it falls through to `false`.
}

/// Side effects run after a successful transition, implemented by `v0d`
/// against the real issue tracker; tests use [`NullHooks`].
pub trait PhaseHooks {
    /// `executing`: mark the root issue `in_progress` (advancing from
    /// `todo` first if needed). Idempotent.
    fn on_executing(&self, _op: &Operation) {}
    /// `merged`: mark the root issue `done`, close remaining
    /// plan-labelled issues, and notify dependents.
    fn on_merged(&self, _op: &Operation) {}
    /// `cancelled`: hold fields were already cleared by the time this
    /// runs; hook exists for callers that want to react to cancellation.
    fn on_cancelled(&self, _op: &Operation) {}
}

/// No-op hooks for tests and standalone use of the state machine.
pub struct NullHooks;
impl PhaseHooks for NullHooks {}

fn event_detail(from: Phase, to: Phase) -> String {
    format!("{}->{}", from.as_str(), to.as_str())
}

/// Shared transition core: load (migrating if needed), validate, mutate,
/// persist, log, and run the phase-specific hook. `field_setter` applies
/// any transition-specific fields (e.g. `merge_commit` for `merged`)
/// before the phase itself is flipped.
fn transition(
    store: &StateStore,
    name: &str,
    to: Phase,
    field_setter: impl FnOnce(&mut Operation),
    hooks: &dyn PhaseHooks,
) -> Result<Operation> {
    let mut op = store.load_with_migration(name, None)?;

    // Idempotence law: re-transitioning to the phase already held is a
    // no-op success (covers `transition_to_merged` on an already-merged
    // operation, and any other trivially-repeated call).
    if op.phase == to {
        return Ok(op);
    }

    if !allowed(op.phase, to) {
        return Err(PhaseError::BadTransition {
            operation: name.to_string(),
            from: op.phase,
            to,
        });
    }

    let from = op.phase;
    field_setter(&mut op);
    op.phase = to;
    op.updated_at = Utc::now();
    store.save(&op)?;
    store.emit_event(name, "phase:transition", &event_detail(from, to))?;

    match to {
        Phase::Executing => hooks.on_executing(&op),
        Phase::Merged => hooks.on_merged(&op),
        Phase::Cancelled => hooks.on_cancelled(&op),
        _ => {}
    }

    Ok(op)
}

pub fn transition_to_planned(
    store: &StateStore,
    name: &str,
    plan_file: String,
    hooks: &dyn PhaseHooks,
) -> Result<Operation> {
    transition(
        store,
        name,
        Phase::Planned,
        |op| op.plan_file = Some(plan_file),
        hooks,
    )
}

pub fn transition_to_queued(store: &StateStore, name: &str, hooks: &dyn PhaseHooks) -> Result<Operation> {
    transition(store, name, Phase::Queued, |_| {}, hooks)
}

pub fn transition_to_executing(store: &StateStore, name: &str, hooks: &dyn PhaseHooks) -> Result<Operation> {
    transition(store, name, Phase::Executing, |_| {}, hooks)
}

pub fn transition_to_completed(store: &StateStore, name: &str, hooks: &dyn PhaseHooks) -> Result<Operation> {
    transition(
        store,
        name,
        Phase::Completed,
        |op| op.completed_at = Some(Utc::now()),
        hooks,
    )
}

pub fn transition_to_pending_merge(
    store: &StateStore,
    name: &str,
    hooks: &dyn PhaseHooks,
) -> Result<Operation> {
    transition(store, name, Phase::PendingMerge, |_| {}, hooks)
}

pub fn transition_to_merged(
    store: &StateStore,
    name: &str,
    merge_commit: String,
    hooks: &dyn PhaseHooks,
) -> Result<Operation> {
    transition(
        store,
        name,
        Phase::Merged,
        |op| {
            op.merged_at = Some(Utc::now());
            op.merge_commit = Some(merge_commit);
            op.merge_status = MergeStatus::Merged;
        },
        hooks,
    )
}

pub fn transition_to_failed(
    store: &StateStore,
    name: &str,
    error: String,
    hooks: &dyn PhaseHooks,
) -> Result<Operation> {
    transition(store, name, Phase::Failed, |op| op.error = Some(error), hooks)
}

pub fn transition_to_conflict(store: &StateStore, name: &str, hooks: &dyn PhaseHooks) -> Result<Operation> {
    transition(
        store,
        name,
        Phase::Conflict,
        |op| op.merge_status = MergeStatus::Conflict,
        hooks,
    )
}

pub fn transition_to_interrupted(store: &StateStore, name: &str, hooks: &dyn PhaseHooks) -> Result<Operation> {
    transition(store, name, Phase::Interrupted, |_| {}, hooks)
}

/// Allowed from any non-terminal phase, bypassing the table (cancellation
/// is an escape hatch, not a named edge).
pub fn transition_to_cancelled(store: &StateStore, name: &str, hooks: &dyn PhaseHooks) -> Result<Operation> {
    let mut op = store.load_with_migration(name, None)?;
    if op.phase == Phase::Cancelled {
        return Ok(op);
    }
    if op.phase.is_terminal() {
        return Err(PhaseError::BadTransition {
            operation: name.to_string(),
            from: op.phase,
            to: Phase::Cancelled,
        });
    }
    let from = op.phase;
    op.phase = Phase::Cancelled;
    op.cancelled_at = Some(Utc::now());
    op.held = false;
    op.updated_at = Utc::now();
    store.save(&op)?;
    store.emit_event(name, "phase:transition", &event_detail(from, Phase::Cancelled))?;
    hooks.on_cancelled(&op);
    Ok(op)
}

/// Set the hold flag. Orthogonal to phase; callers about to advance a
/// phase should consult [`is_held`] first.
pub fn set_hold(store: &StateStore, name: &str) -> Result<Operation> {
    let mut op = store.load_with_migration(name, None)?;
    op.held = true;
    op.held_at = Some(Utc::now());
    op.updated_at = Utc::now();
    store.save(&op)?;
    store.emit_event(name, "hold:set", "")?;
    Ok(op)
}

pub fn clear_hold(store: &StateStore, name: &str) -> Result<Operation> {
    let mut op = store.load_with_migration(name, None)?;
    op.held = false;
    op.held_at = None;
    op.updated_at = Utc::now();
    store.save(&op)?;
    store.emit_event(name, "hold:cleared", "")?;
    Ok(op)
}

pub fn is_held(op: &Operation) -> bool {
    op.held
}

/// Pure computation of the phase a `resume` should land on, given an
/// operation's current phase and history. Only meaningful when the
/// current phase is one of the three recoverable phases; any other phase
/// resumes to itself (no-op).
///
/// `cancelled` is included here even though it is otherwise terminal
/// (invariant 8.1 governs the *named* transition table, not this
/// out-of-band recovery path) - see DESIGN.md for the reasoning.
pub fn resume_target(op: &Operation) -> Phase {
    match op.phase {
        Phase::Failed | Phase::Interrupted | Phase::Cancelled => {
            if op.epic_id.is_some() {
                Phase::Queued
            } else if op.plan_file.is_some() {
                Phase::Planned
            } else {
                Phase::Init
            }
        }
        other => other,
    }
}

/// Apply a resume: clear the error state, record who triggered it, and
/// land on [`resume_target`]'s phase. Bypasses the named-transition table
/// deliberately - resume is a recovery path, not a table edge - so it can
/// also pull an operation back out of `cancelled`.
pub fn resume(store: &StateStore, name: &str, by: ResumedBy) -> Result<Operation> {
    let mut op = store.load_with_migration(name, None)?;
    let target = resume_target(&op);
    let from = op.phase;
    op.error = None;
    op.phase = target;
    op.resumed = true;
    op.resumed_at = Some(Utc::now());
    op.resumed_by = Some(by);
    op.worktree_missing = false;
    op.updated_at = Utc::now();
    store.save(&op)?;
    store.emit_event(
        name,
        "resume",
        &format!("{} (by {}) -> {}", event_detail(from, target), by.as_str(), target.as_str()),
    )?;
    Ok(op)
}

/// Filesystem/git/tracker checks that [`merge_ready_reason`] needs but
/// this crate has no business performing directly; implemented by `v0d`
/// against real workspaces, the issue tracker, and the session
/// controller.
pub trait ReadyChecks {
    fn worktree_exists(&self, worktree: &str) -> bool;
    /// True if the operation's recorded branch (or, absent one, a
    /// conventional `<prefix>/<name>` branch) exists locally or remotely.
    fn branch_resolvable(&self, op: &Operation) -> bool;
    fn session_active(&self, session: &str) -> bool;
    /// Count of still-open plan-labelled issues for this operation.
    fn open_plan_issue_count(&self, op_name: &str) -> u32;
}

/// Diagnostic form of the merge-readiness predicate. `enforce_issue_policy`
/// toggles the optional "all plan-labelled issues closed" check.
pub fn merge_ready_reason(
    op: &Operation,
    checks: &dyn ReadyChecks,
    enforce_issue_policy: bool,
) -> ReadyReason {
    if !matches!(op.phase, Phase::Completed | Phase::PendingMerge) {
        return ReadyReason::Phase(op.phase);
    }

    if let Some(worktree) = &op.worktree {
        if !checks.worktree_exists(worktree) {
            return ReadyReason::WorktreeMissing;
        }
    } else if !checks.branch_resolvable(op) {
        return ReadyReason::BranchMissing;
    }

    if let Some(session) = &op.tmux_session {
        if checks.session_active(session) {
            return ReadyReason::SessionActive;
        }
    }

    if enforce_issue_policy {
        let open = checks.open_plan_issue_count(&op.name);
        if open > 0 {
            return ReadyReason::OpenIssues(open);
        }
    }

    ReadyReason::Ready
}

pub fn is_merge_ready(op: &Operation, checks: &dyn ReadyChecks, enforce_issue_policy: bool) -> bool {
    op.merge_queued && merge_ready_reason(op, checks, enforce_issue_policy) == ReadyReason::Ready
}
