//! Core data types for the operation orchestration core.
//!
//! Field names and enum values match the on-disk schemas for `state.json`
//! and `queue.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk schema version for `state.json` and `queue.json`.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Phase of an [`Operation`]'s lifecycle.
///
/// Allowed transitions are enforced by `v0d::phase`, not by this type; the
/// type itself only carries the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Planned,
    Queued,
    Executing,
    Completed,
    PendingMerge,
    Merged,
    Failed,
    Conflict,
    Interrupted,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planned => "planned",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::PendingMerge => "pending_merge",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal phases never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Cancelled)
    }
}

/// The kind of work an [`Operation`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    #[default]
    Feature,
    Roadmap,
    Goal,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Roadmap => "roadmap",
            Self::Goal => "goal",
        }
    }
}

/// Merge outcome recorded on the operation itself, distinct from the
/// queue entry's own `status` (an operation can be `merge_status=absent`
/// while unqueued, then track the executor's progress once queued).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Absent,
    Merging,
    Merged,
    Conflict,
    VerificationFailed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Conflict => "conflict",
            Self::VerificationFailed => "verification_failed",
        }
    }
}

/// Who triggered a resume: the daemon's open-issues auto-resume policy,
/// or an explicit user `--resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumedBy {
    Auto,
    User,
}

impl ResumedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::User => "user",
        }
    }
}

/// Physical realization of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    Worktree,
    Clone,
}

impl WorkspaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worktree => "worktree",
            Self::Clone => "clone",
        }
    }

    /// Infer workspace mode from a target branch name: `main`/`master`/
    /// `develop` force clone mode (they may already be checked out in the
    /// user's own working directory); anything else defaults to worktree
    /// mode.
    pub fn infer(target_branch: &str) -> Self {
        match target_branch {
            "main" | "master" | "develop" => Self::Clone,
            _ => Self::Worktree,
        }
    }
}

/// A unit of tracked work driven through plan -> decompose -> execute ->
/// merge. Persisted at `operations/<name>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Operation {
    pub name: String,
    pub phase: Phase,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub tmux_session: Option<String>,
    pub epic_id: Option<String>,
    pub plan_file: Option<String>,
    pub merge_queued: bool,
    pub merge_status: MergeStatus,
    pub merge_commit: Option<String>,
    pub merge_error: Option<String>,
    /// Diagnostic set by `transition_to_failed`; distinct from
    /// `merge_error`, which is specific to merge-executor failures.
    pub error: Option<String>,
    pub held: bool,
    pub held_at: Option<DateTime<Utc>>,
    pub resumed: bool,
    pub resumed_at: Option<DateTime<Utc>>,
    pub resumed_by: Option<ResumedBy>,
    pub worktree_missing: bool,
    #[serde(rename = "_schema_version")]
    pub schema_version: u32,
}

impl Operation {
    /// A freshly created operation: phase `init`, no merge activity yet.
    pub fn new(name: impl Into<String>, op_type: OperationType, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Init,
            op_type,
            created_at: now,
            updated_at: now,
            completed_at: None,
            merged_at: None,
            cancelled_at: None,
            worktree: None,
            branch: None,
            tmux_session: None,
            epic_id: None,
            plan_file: None,
            merge_queued: false,
            merge_status: MergeStatus::Absent,
            merge_commit: None,
            merge_error: None,
            error: None,
            held: false,
            held_at: None,
            resumed: false,
            resumed_at: None,
            resumed_by: None,
            worktree_missing: false,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new("unnamed", OperationType::default(), Utc::now())
    }
}

/// Status of a single [`QueueEntry`] as tracked by the merge queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Conflict,
    Resumed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
            Self::Resumed => "resumed",
        }
    }

    /// Non-terminal statuses are still live: a duplicate enqueue targeting
    /// one of these is a no-op rather than a fresh entry.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Resumed)
    }
}

/// Whether a queue entry names a tracked [`Operation`] or a bare branch
/// with no operation state behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    Operation,
    Branch,
}

impl MergeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::Branch => "branch",
        }
    }
}

/// One row of the merge queue's `queue.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub operation: String,
    pub worktree: Option<String>,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub merge_type: MergeType,
    pub issue_id: Option<String>,
}

impl QueueEntry {
    pub fn new(operation: impl Into<String>, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            operation: operation.into(),
            worktree: None,
            priority,
            enqueued_at: now,
            updated_at: now,
            status: QueueStatus::Pending,
            merge_type: MergeType::Operation,
            issue_id: None,
        }
    }
}

/// The `queue.json` document: a version tag plus the ordered entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueFile {
    pub version: u32,
    pub entries: Vec<QueueEntry>,
}

impl Default for QueueFile {
    fn default() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }
}

/// Diagnostic reason a queue entry is not yet ready to process, returned
/// by `phase::merge_ready_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyReason {
    Ready,
    Phase(Phase),
    WorktreeMissing,
    BranchMissing,
    SessionActive,
    OpenIssues(u32),
}

impl std::fmt::Display for ReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Phase(p) => write!(f, "phase:{}", p.as_str()),
            Self::WorktreeMissing => write!(f, "worktree:missing"),
            Self::BranchMissing => write!(f, "branch:missing"),
            Self::SessionActive => write!(f, "session:active"),
            Self::OpenIssues(n) => write!(f, "open_issues:{n}"),
        }
    }
}
