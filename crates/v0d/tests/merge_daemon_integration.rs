//! End-to-end tests for the Merge Daemon's watch loop against a real git
//! fixture: unlike `lib.rs`'s own unit tests, which call `watch_loop_pass`
//! directly, these drive the actual async `run()` loop in a background
//! task and tear it down through `request_shutdown`, the way `v0d`'s
//! binary and `v0ctl` actually use it.

use std::process::Command;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use v0_core::config::Config;
use v0_core::state::{StateError, StateStore};
use v0_core::types::{Operation, OperationType, Phase, QueueStatus};
use v0d::queue::MergeQueue;
use v0d::{DaemonPaths, MergeDaemon, MergeDaemonConfig};

fn run_git(dir: &std::path::Path, args: &[&str]) {
    let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn commit_file(dir: &std::path::Path, file: &str, contents: &str, message: &str) {
    std::fs::write(dir.join(file), contents).unwrap();
    run_git(dir, &["add", "."]);
    run_git(dir, &["commit", "-m", message]);
}

struct Fixture {
    main: TempDir,
    daemon_state: TempDir,
    state_dir: TempDir,
}

/// A main repo with a bare remote and a `feature/auth` branch one commit
/// ahead, fully pushed - scenario A of the end-to-end behaviours: a clean
/// fast-forward merge (§8.4).
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
        daemon_state: TempDir::new().unwrap(),
        state_dir: TempDir::new().unwrap(),
    }
}

fn daemon_config(fx: &Fixture) -> MergeDaemonConfig {
    let mut config = Config::default();
    config.develop_branch = "main".to_string();
    config.git_remote = "origin".to_string();
    config.resolve = false;

    let paths = DaemonPaths {
        project_root: fx.main.path().to_path_buf(),
        build_dir: fx.daemon_state.path().join("build"),
        mergeq_dir: fx.daemon_state.path().join("mergeq"),
        state_dir: fx.state_dir.path().to_path_buf(),
    };
    MergeDaemonConfig {
        paths,
        config,
        poll_interval: Duration::from_millis(20),
        conflict_timeout: Duration::from_secs(1),
        enforce_issue_policy: false,
    }
}

fn state_store(fx: &Fixture) -> StateStore {
    StateStore::new(fx.daemon_state.path().join("build"), 1_048_576, 5)
}

fn merge_queue(fx: &Fixture) -> MergeQueue {
    MergeQueue::new(fx.daemon_state.path().join("mergeq"), 8)
}

fn load(fx: &Fixture, name: &str) -> Result<Operation, StateError> {
    state_store(fx).load(name)
}

#[tokio::test]
async fn run_merges_a_ready_operation_and_stops_cleanly_on_shutdown() {
    let fx = setup();
    let store = state_store(&fx);
    let queue = merge_queue(&fx);

    let mut op = Operation::new("auth", OperationType::Feature, chrono::Utc::now());
    op.phase = Phase::Completed;
    op.branch = Some("feature/auth".to_string());
    op.merge_queued = true;
    store.create(&op).unwrap();
    queue.enqueue("auth", 0, None).unwrap();

    let daemon = MergeDaemon::new_for_test(daemon_config(&fx)).unwrap();
    let shutdown = daemon.shutdown_flag();
    let handle = tokio::spawn(async move { daemon.run().await });

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(op) = load(&fx, "auth") {
            if op.phase == Phase::Merged {
                break;
            }
        }
        assert!(Instant::now() < deadline, "operation never reached merged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.store(true, Ordering::SeqCst);
    handle.await.unwrap().unwrap();

    let reloaded = load(&fx, "auth").unwrap();
    assert_eq!(reloaded.phase, Phase::Merged);
    assert!(reloaded.merge_commit.is_some());

    let completed = queue.get_all(Some(QueueStatus::Completed)).unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].operation, "auth");

    run_git(fx.main.path(), &["fetch", "origin"]);
    let remote_branches = Command::new("git").args(["branch", "-r"]).current_dir(fx.main.path()).output().unwrap();
    let remote_branches = String::from_utf8_lossy(&remote_branches.stdout);
    assert!(
        !remote_branches.contains("feature/auth"),
        "merged branch should have been deleted on the remote"
    );
}

#[tokio::test]
async fn run_recovers_a_processing_entry_left_by_a_crashed_daemon_before_looping() {
    let fx = setup();
    let store = state_store(&fx);
    let queue = merge_queue(&fx);

    let mut op = Operation::new("auth", OperationType::Feature, chrono::Utc::now());
    op.phase = Phase::Completed;
    op.branch = Some("feature/auth".to_string());
    store.create(&op).unwrap();
    queue.enqueue("auth", 0, None).unwrap();
    queue.update_status("auth", QueueStatus::Processing).unwrap();

    let daemon = MergeDaemon::new_for_test(daemon_config(&fx)).unwrap();
    let shutdown = daemon.shutdown_flag();
    let handle = tokio::spawn(async move { daemon.run().await });

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(op) = load(&fx, "auth") {
            if op.phase == Phase::Merged {
                break;
            }
        }
        assert!(Instant::now() < deadline, "crashed entry was never recovered and re-merged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.store(true, Ordering::SeqCst);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_leaves_an_unready_operation_pending_without_error() {
    let fx = setup();
    let store = state_store(&fx);
    let queue = merge_queue(&fx);

    let op = Operation::new("auth", OperationType::Feature, chrono::Utc::now());
    store.create(&op).unwrap();
    queue.enqueue("auth", 0, None).unwrap();

    let daemon = MergeDaemon::new_for_test(daemon_config(&fx)).unwrap();
    let shutdown = daemon.shutdown_flag();
    let handle = tokio::spawn(async move { daemon.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.store(true, Ordering::SeqCst);
    handle.await.unwrap().unwrap();

    let reloaded = load(&fx, "auth").unwrap();
    assert_eq!(reloaded.phase, Phase::Init);
    let pending = queue.get_all(Some(QueueStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
}
