//! Dependency Resolver (C7): a thin adapter over the external issue
//! tracker, wrapped behind a trait so callers and tests never depend on
//! the `wk` binary directly.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use thiserror::Error;
use v0_core::state::StateStore;
use v0_core::types::ResumedBy;

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("failed to execute tracker command: {0}")]
    Execution(#[from] std::io::Error),
    #[error("tracker command failed: {0}")]
    CommandFailed(String),
    #[error("failed to parse tracker output: {0}")]
    Parse(String),
    #[error("issue not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, DependencyError>;

#[derive(Debug, Clone)]
pub struct Issue {
    pub id: String,
    pub status: String,
    pub labels: Vec<String>,
    pub blocked_by: Vec<String>,
}

impl Issue {
    pub fn is_done(&self) -> bool {
        matches!(self.status.as_str(), "done" | "closed")
    }
}

/// Abstraction over the external issue tracker. Implementations shell out
/// to a real CLI or, in tests, simulate one in memory.
pub trait IssueTracker: Send + Sync {
    fn new_issue(&self, title: &str, labels: &[String]) -> Result<String>;
    fn show(&self, issue_id: &str) -> Result<Issue>;
    fn mark_done(&self, issue_id: &str) -> Result<()>;
    fn list_by_label(&self, label: &str) -> Result<Vec<Issue>>;
    fn blocking(&self, issue_id: &str) -> Result<Vec<String>>;
    fn blocked_by(&self, issue_id: &str) -> Result<Vec<String>>;
}

/// Real adapter shelling out to the `wk` issue-tracker CLI, parsing its
/// JSON stdout.
pub struct WkCliTracker {
    pub binary: String,
}

impl Default for WkCliTracker {
    fn default() -> Self {
        Self {
            binary: "wk".to_string(),
        }
    }
}

impl WkCliTracker {
    fn run_json(&self, args: &[&str]) -> Result<serde_json::Value> {
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            return Err(DependencyError::CommandFailed(format!(
                "{} {}: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| DependencyError::Parse(e.to_string()))
    }
}

impl IssueTracker for WkCliTracker {
    fn new_issue(&self, title: &str, labels: &[String]) -> Result<String> {
        let mut args = vec!["new", title];
        for label in labels {
            args.push("--label");
            args.push(label);
        }
        let value = self.run_json(&args)?;
        value["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DependencyError::Parse("missing id in wk new output".to_string()))
    }

    fn show(&self, issue_id: &str) -> Result<Issue> {
        let value = self.run_json(&["show", issue_id, "--json"])?;
        Ok(Issue {
            id: issue_id.to_string(),
            status: value["status"].as_str().unwrap_or("todo").to_string(),
            labels: value["labels"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            blocked_by: value["blocked_by"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        })
    }

    fn mark_done(&self, issue_id: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["done", issue_id])
            .output()?;
        if !output.status.success() {
            return Err(DependencyError::CommandFailed(format!(
                "wk done {issue_id}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn list_by_label(&self, label: &str) -> Result<Vec<Issue>> {
        let value = self.run_json(&["list", "--label", label, "--json"])?;
        let array = value
            .as_array()
            .ok_or_else(|| DependencyError::Parse("expected array from wk list".to_string()))?;
        array
            .iter()
            .filter_map(|v| v["id"].as_str())
            .map(|id| self.show(id))
            .collect()
    }

    fn blocking(&self, issue_id: &str) -> Result<Vec<String>> {
        let value = self.run_json(&["blocking", issue_id, "--json"])?;
        Ok(value
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    fn blocked_by(&self, issue_id: &str) -> Result<Vec<String>> {
        Ok(self.show(issue_id)?.blocked_by)
    }
}

/// In-memory tracker used by unit tests for C2/C3/C7.
#[derive(Default)]
pub struct MockTracker {
    issues: Mutex<HashMap<String, Issue>>,
    next_id: Mutex<u32>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, issue: Issue) {
        self.issues.lock().unwrap().insert(issue.id.clone(), issue);
    }
}

impl IssueTracker for MockTracker {
    fn new_issue(&self, title: &str, labels: &[String]) -> Result<String> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("ISSUE-{next_id}");
        self.issues.lock().unwrap().insert(
            id.clone(),
            Issue {
                id: id.clone(),
                status: "todo".to_string(),
                labels: labels.to_vec(),
                blocked_by: Vec::new(),
            },
        );
        let _ = title;
        Ok(id)
    }

    fn show(&self, issue_id: &str) -> Result<Issue> {
        self.issues
            .lock()
            .unwrap()
            .get(issue_id)
            .cloned()
            .ok_or_else(|| DependencyError::NotFound(issue_id.to_string()))
    }

    fn mark_done(&self, issue_id: &str) -> Result<()> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(issue_id)
            .ok_or_else(|| DependencyError::NotFound(issue_id.to_string()))?;
        issue.status = "done".to_string();
        Ok(())
    }

    fn list_by_label(&self, label: &str) -> Result<Vec<Issue>> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.labels.iter().any(|l| l == label))
            .cloned()
            .collect())
    }

    fn blocking(&self, issue_id: &str) -> Result<Vec<String>> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.blocked_by.iter().any(|b| b == issue_id))
            .map(|i| i.id.clone())
            .collect())
    }

    fn blocked_by(&self, issue_id: &str) -> Result<Vec<String>> {
        Ok(self.show(issue_id)?.blocked_by)
    }
}

/// True if any of `issue_id`'s `blocked_by` issues is not yet done.
pub fn is_blocked(tracker: &dyn IssueTracker, issue_id: &str) -> Result<bool> {
    Ok(first_open_blocker(tracker, issue_id)?.is_some())
}

/// The first blocker of `issue_id` that is not yet done, if any.
pub fn first_open_blocker(tracker: &dyn IssueTracker, issue_id: &str) -> Result<Option<String>> {
    for blocker_id in tracker.blocked_by(issue_id)? {
        let blocker = tracker.show(&blocker_id)?;
        if !blocker.is_done() {
            return Ok(Some(blocker_id));
        }
    }
    Ok(None)
}

/// Count of still-open issues labelled `plan:<op>`.
pub fn open_plan_issue_count(tracker: &dyn IssueTracker, op_name: &str) -> Result<u32> {
    let label = format!("plan:{op_name}");
    let issues = tracker.list_by_label(&label)?;
    Ok(issues.iter().filter(|i| !i.is_done()).count() as u32)
}

/// Issues whose `blocked_by` lists `issue_id` - i.e. its dependents.
/// Blocking is tracked authoritatively by the tracker, so this is a
/// direct pass-through.
pub fn dependents(tracker: &dyn IssueTracker, issue_id: &str) -> Result<Vec<String>> {
    tracker.blocking(issue_id)
}

/// Best-effort map from an issue ID back to a known operation name, by
/// scanning operation state files for a matching `epic_id`.
pub fn resolve_to_op_name(
    store: &StateStore,
    issue_id: &str,
) -> std::result::Result<Option<String>, v0_core::state::StateError> {
    for name in store.list_names()? {
        let op = store.load(&name)?;
        if op.epic_id.as_deref() == Some(issue_id) {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

/// After `merged_op` lands, re-run the resumption path for each dependent
/// that maps to a known, non-held operation.
pub fn notify_dependents(
    tracker: &dyn IssueTracker,
    store: &StateStore,
    merged_op: &str,
) -> std::result::Result<(), NotifyError> {
    let op = store.load(merged_op)?;
    let Some(issue_id) = op.epic_id else {
        return Ok(());
    };
    notify_dependents_by_issue(tracker, store, &issue_id)
}

/// Identical notification path, entered directly from an issue ID - used
/// by branch-only merges, which have no operation record of their own.
pub fn notify_dependents_by_issue(
    tracker: &dyn IssueTracker,
    store: &StateStore,
    issue_id: &str,
) -> std::result::Result<(), NotifyError> {
    for dependent_id in dependents(tracker, issue_id)? {
        let Some(name) = resolve_to_op_name(store, &dependent_id)? else {
            continue;
        };
        let op = store.load(&name)?;
        if op.held {
            continue;
        }
        v0_core::phase::resume(store, &name, ResumedBy::Auto)?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    State(#[from] v0_core::state::StateError),
    #[error(transparent)]
    Phase(#[from] v0_core::phase::PhaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_by_open_issue_is_detected() {
        let tracker = MockTracker::new();
        tracker.insert(Issue {
            id: "BLOCKER-1".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "EPIC-1".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec!["BLOCKER-1".to_string()],
        });

        assert!(is_blocked(&tracker, "EPIC-1").unwrap());
        assert_eq!(
            first_open_blocker(&tracker, "EPIC-1").unwrap(),
            Some("BLOCKER-1".to_string())
        );
    }

    #[test]
    fn blocked_by_done_issue_unblocks() {
        let tracker = MockTracker::new();
        tracker.insert(Issue {
            id: "BLOCKER-1".to_string(),
            status: "done".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "EPIC-1".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec!["BLOCKER-1".to_string()],
        });

        assert!(!is_blocked(&tracker, "EPIC-1").unwrap());
    }

    #[test]
    fn open_plan_issue_count_excludes_done() {
        let tracker = MockTracker::new();
        tracker.insert(Issue {
            id: "P-1".to_string(),
            status: "todo".to_string(),
            labels: vec!["plan:auth".to_string()],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "P-2".to_string(),
            status: "done".to_string(),
            labels: vec!["plan:auth".to_string()],
            blocked_by: vec![],
        });

        assert_eq!(open_plan_issue_count(&tracker, "auth").unwrap(), 1);
    }

    #[test]
    fn mark_done_transitions_status() {
        let tracker = MockTracker::new();
        let id = tracker.new_issue("epic", &[]).unwrap();
        assert!(!tracker.show(&id).unwrap().is_done());
        tracker.mark_done(&id).unwrap();
        assert!(tracker.show(&id).unwrap().is_done());
    }

    #[test]
    fn blocking_finds_dependents() {
        let tracker = MockTracker::new();
        tracker.insert(Issue {
            id: "A".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "B".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec!["A".to_string()],
        });
        assert_eq!(tracker.blocking("A").unwrap(), vec!["B".to_string()]);
    }

    fn seeded_store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("build"), 1_048_576, 5)
    }

    #[test]
    fn resolve_to_op_name_finds_operation_by_epic_id() {
        use chrono::Utc;
        use v0_core::types::{Operation, OperationType};

        let dir = tempfile::TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let mut op = Operation::new("auth", OperationType::Feature, Utc::now());
        op.epic_id = Some("EPIC-1".to_string());
        store.create(&op).unwrap();

        assert_eq!(
            resolve_to_op_name(&store, "EPIC-1").unwrap(),
            Some("auth".to_string())
        );
        assert_eq!(resolve_to_op_name(&store, "EPIC-404").unwrap(), None);
    }

    #[test]
    fn notify_dependents_resumes_unheld_dependent_operations() {
        use chrono::Utc;
        use v0_core::types::{Operation, OperationType, Phase};

        let dir = tempfile::TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let tracker = MockTracker::new();

        tracker.insert(Issue {
            id: "EPIC-ROOT".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "EPIC-DEP".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec!["EPIC-ROOT".to_string()],
        });

        let mut root = Operation::new("root", OperationType::Feature, Utc::now());
        root.epic_id = Some("EPIC-ROOT".to_string());
        store.create(&root).unwrap();

        let mut dependent = Operation::new("dependent", OperationType::Feature, Utc::now());
        dependent.phase = Phase::Failed;
        dependent.epic_id = Some("EPIC-DEP".to_string());
        store.create(&dependent).unwrap();

        notify_dependents(&tracker, &store, "root").unwrap();

        let reloaded = store.load("dependent").unwrap();
        assert_eq!(reloaded.phase, Phase::Queued);
        assert!(reloaded.resumed);
    }

    #[test]
    fn notify_dependents_skips_held_operations() {
        use chrono::Utc;
        use v0_core::types::{Operation, OperationType, Phase};

        let dir = tempfile::TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let tracker = MockTracker::new();

        tracker.insert(Issue {
            id: "EPIC-ROOT".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec![],
        });
        tracker.insert(Issue {
            id: "EPIC-DEP".to_string(),
            status: "todo".to_string(),
            labels: vec![],
            blocked_by: vec!["EPIC-ROOT".to_string()],
        });

        let mut root = Operation::new("root", OperationType::Feature, Utc::now());
        root.epic_id = Some("EPIC-ROOT".to_string());
        store.create(&root).unwrap();

        let mut dependent = Operation::new("dependent", OperationType::Feature, Utc::now());
        dependent.phase = Phase::Failed;
        dependent.epic_id = Some("EPIC-DEP".to_string());
        dependent.held = true;
        store.create(&dependent).unwrap();

        notify_dependents(&tracker, &store, "root").unwrap();

        let reloaded = store.load("dependent").unwrap();
        assert_eq!(reloaded.phase, Phase::Failed);
    }
}
