//! Concrete [`PhaseHooks`] and [`ReadyChecks`] implementations, wiring
//! `v0-core`'s pure phase-transition and merge-readiness logic to the
//! real issue tracker, git, and terminal-multiplexer collaborators that
//! crate cannot depend on directly.

use crate::dependency::{self, IssueTracker};
use crate::git;
use crate::session::SessionController;
use std::path::Path;
use v0_core::phase::{PhaseHooks, ReadyChecks, CONVENTIONAL_BRANCH_PREFIXES};
use v0_core::types::Operation;

/// Drives the issue tracker side of each phase transition. Notifying
/// dependents is not done here: it needs the State Store and Merge Queue,
/// which this trait's methods are not given, so the executor calls
/// `dependency::notify_dependents` itself right after a merge transition.
pub struct TrackerHooks<'a> {
    pub tracker: &'a dyn IssueTracker,
}

impl PhaseHooks for TrackerHooks<'_> {
    fn on_executing(&self, op: &Operation) {
        let Some(epic) = &op.epic_id else { return };
        match self.tracker.show(epic) {
            Ok(issue) if issue.status == "todo" => {
                if let Err(e) = self.tracker.mark_in_progress(epic) {
                    tracing::warn!(operation = %op.name, epic, error = %e, "failed to mark epic in_progress");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(operation = %op.name, epic, error = %e, "failed to read epic status"),
        }
    }

    fn on_merged(&self, op: &Operation) {
        if let Some(epic) = &op.epic_id {
            if let Err(e) = self.tracker.mark_done(epic) {
                tracing::warn!(operation = %op.name, epic, error = %e, "failed to mark epic done");
            }
        }
        let label = format!("plan:{}", op.name);
        match self.tracker.list_by_label(&label) {
            Ok(issues) => {
                for issue in issues.iter().filter(|i| !i.is_done()) {
                    if let Err(e) = self.tracker.mark_done(&issue.id) {
                        tracing::warn!(operation = %op.name, issue = %issue.id, error = %e, "failed to close plan issue");
                    }
                }
            }
            Err(e) => tracing::warn!(operation = %op.name, error = %e, "failed to list plan issues"),
        }
    }
}

/// Merge-readiness checks backed by the real main repository, the
/// terminal multiplexer, and the issue tracker.
pub struct GitReadyChecks<'a> {
    pub main_repo: &'a Path,
    pub remote: &'a str,
    pub sessions: &'a dyn SessionController,
    pub tracker: &'a dyn IssueTracker,
}

impl ReadyChecks for GitReadyChecks<'_> {
    fn worktree_exists(&self, worktree: &str) -> bool {
        Path::new(worktree).exists()
    }

    fn branch_resolvable(&self, op: &Operation) -> bool {
        if let Some(branch) = &op.branch {
            return self.exists_anywhere(branch);
        }
        CONVENTIONAL_BRANCH_PREFIXES
            .iter()
            .any(|prefix| self.exists_anywhere(&format!("{prefix}/{}", op.name)))
    }

    fn session_active(&self, session: &str) -> bool {
        self.sessions.exists(session).unwrap_or(false)
    }

    fn open_plan_issue_count(&self, op_name: &str) -> u32 {
        dependency::open_plan_issue_count(self.tracker, op_name).unwrap_or(0)
    }
}

impl GitReadyChecks<'_> {
    fn exists_anywhere(&self, branch: &str) -> bool {
        git::branch_exists_local(self.main_repo, branch).unwrap_or(false)
            || git::branch_exists_remote(self.main_repo, self.remote, branch).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{Issue, MockTracker};
    use crate::session::MockController;
    use v0_core::types::{Operation, OperationType};

    #[test]
    fn on_executing_advances_todo_epic_to_in_progress() {
        let tracker = MockTracker::new();
        tracker.insert(Issue {
            id: "EPIC-1".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        let hooks = TrackerHooks { tracker: &tracker };
        let mut op = Operation::new("auth", OperationType::Feature, chrono::Utc::now());
        op.epic_id = Some("EPIC-1".to_string());

        hooks.on_executing(&op);
        assert_eq!(tracker.show("EPIC-1").unwrap().status, "in_progress");
    }

    #[test]
    fn on_merged_closes_epic_and_plan_issues() {
        let tracker = MockTracker::new();
        tracker.insert(Issue {
            id: "EPIC-1".to_string(),
            status: "in_progress".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "PLAN-1".to_string(),
            status: "todo".to_string(),
            labels: vec!["plan:auth".to_string()],
            blocked_by: vec![],
        });
        let hooks = TrackerHooks { tracker: &tracker };
        let mut op = Operation::new("auth", OperationType::Feature, chrono::Utc::now());
        op.epic_id = Some("EPIC-1".to_string());

        hooks.on_merged(&op);
        assert!(tracker.show("EPIC-1").unwrap().is_done());
        assert!(tracker.show("PLAN-1").unwrap().is_done());
    }

    #[test]
    fn session_active_reflects_controller_state() {
        let tracker = MockTracker::new();
        let sessions = MockController::new();
        sessions.launch("conflict-auth", Path::new("/tmp"), "claude").unwrap();

        let checks = GitReadyChecks {
            main_repo: Path::new("/tmp"),
            remote: "origin",
            sessions: &sessions,
            tracker: &tracker,
        };
        assert!(checks.session_active("conflict-auth"));
        assert!(!checks.session_active("conflict-other"));
    }
}
