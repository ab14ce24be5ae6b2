//! v0ctl - thin CLI surface over the operation orchestration core.
//!
//! Operates directly on the same on-disk files the Merge Daemon consumes
//! (`state.json`, `queue.json`) rather than through a network API: there is
//! no server to be a client of. Exists to exercise the core end-to-end, not
//! to be a polished CLI product - no colorized output, no shell completions.

use clap::{Parser, Subcommand};
use eyre::{bail, eyre, Result, WrapErr};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use v0_core::config::Config;
use v0_core::phase;
use v0_core::state::StateStore;
use v0_core::types::{Phase, ResumedBy};
use v0d::queue::MergeQueue;
use v0d::DaemonPaths;

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "v0ctl", about = "Operate the merge queue and operation state directly")]
struct Cli {
    /// Root of the project (defaults to the current directory).
    #[arg(long, env = "V0_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Override the daemon's state directory (must match the running v0d).
    #[arg(long, env = "V0_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue an operation for merging. Starts the daemon if it isn't running.
    Enqueue {
        name: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        issue: Option<String>,
    },
    /// Print an operation's current state.
    Status {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Block until an operation reaches a terminal merge outcome.
    Wait {
        name: String,
        #[arg(long, default_value_t = 300)]
        timeout_sec: u64,
        #[arg(long, default_value_t = 2)]
        poll_sec: u64,
    },
    /// Prevent an operation's phase from advancing until resumed.
    Hold { name: String },
    /// Clear a hold, or recover a failed/interrupted/cancelled operation.
    Resume { name: String },
    /// Cancel an operation.
    Cancel { name: String },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("v0ctl: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let project_root = cli
        .project_root
        .unwrap_or_else(|| std::env::current_dir().expect("failed to read current directory"));
    let project_root = project_root.canonicalize().unwrap_or(project_root);

    let config = Config::load(&project_root).wrap_err("loading configuration")?;
    config.require_essentials().wrap_err("configuration incomplete")?;

    let project_name = config.project.clone().unwrap_or_else(|| "default".to_string());
    let paths = DaemonPaths::discover(project_root, cli.state_dir, &project_name);
    let store = StateStore::new(paths.build_dir.clone(), config.events_log_max_bytes, config.events_log_rotate_keep);
    let queue = MergeQueue::new(paths.mergeq_dir.clone(), config.lock_max_retries);

    match cli.command {
        Command::Enqueue { name, priority, issue } => enqueue(&store, &queue, &paths, &name, priority, issue),
        Command::Status { name, json } => status(&store, &name, json),
        Command::Wait { name, timeout_sec, poll_sec } => {
            wait(&store, &name, Duration::from_secs(timeout_sec), Duration::from_secs(poll_sec))
        }
        Command::Hold { name } => hold(&store, &name),
        Command::Resume { name } => resume(&store, &name),
        Command::Cancel { name } => cancel(&store, &name),
    }
}

fn enqueue(store: &StateStore, queue: &MergeQueue, paths: &DaemonPaths, name: &str, priority: i32, issue: Option<String>) -> Result<i32> {
    if !store.exists(name) {
        bail!("no operation named {name}");
    }
    store.update(name, "merge_queued", serde_json::json!(true)).wrap_err("marking operation merge_queued")?;
    queue.enqueue(name, priority, issue).wrap_err("enqueueing operation")?;
    ensure_daemon_running(paths)?;
    println!("enqueued {name}");
    Ok(0)
}

fn status(store: &StateStore, name: &str, json: bool) -> Result<i32> {
    let op = store.load(name).map_err(|e| eyre!(e)).wrap_err_with(|| format!("no operation named {name}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&op)?);
    } else {
        println!(
            "{}\tphase={}\tmerge_queued={}\theld={}\tmerge_status={}",
            op.name,
            op.phase.as_str(),
            op.merge_queued,
            op.held,
            op.merge_status.as_str(),
        );
    }
    Ok(0)
}

/// Polls `state.json` until the operation reaches a terminal merge outcome
/// or `timeout` elapses. Exit codes follow §6.6: 0 merged, 1 failed or
/// cancelled, 2 timeout, 3 target not found.
fn wait(store: &StateStore, name: &str, timeout: Duration, poll_interval: Duration) -> Result<i32> {
    if !store.exists(name) {
        eprintln!("v0ctl: no operation named {name}");
        return Ok(3);
    }

    let deadline = Instant::now() + timeout;
    loop {
        let op = store.load(name).wrap_err_with(|| format!("reading operation {name}"))?;
        match op.phase {
            Phase::Merged => return Ok(0),
            Phase::Cancelled => return Ok(1),
            Phase::Failed if op.held || !op.resumed => return Ok(1),
            _ => {}
        }
        if Instant::now() >= deadline {
            return Ok(2);
        }
        std::thread::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())).max(Duration::from_millis(1)));
    }
}

fn hold(store: &StateStore, name: &str) -> Result<i32> {
    phase::set_hold(store, name).map_err(|e| eyre!(e)).wrap_err_with(|| format!("holding {name}"))?;
    println!("held {name}");
    Ok(0)
}

fn resume(store: &StateStore, name: &str) -> Result<i32> {
    let op = store.load(name).map_err(|e| eyre!(e)).wrap_err_with(|| format!("no operation named {name}"))?;
    if op.held {
        phase::clear_hold(store, name).map_err(|e| eyre!(e))?;
    }
    let resumed = phase::resume(store, name, ResumedBy::User).map_err(|e| eyre!(e)).wrap_err_with(|| format!("resuming {name}"))?;
    println!("resumed {name} -> phase={}", resumed.phase.as_str());
    Ok(0)
}

fn cancel(store: &StateStore, name: &str) -> Result<i32> {
    let before = store.load(name).map_err(|e| eyre!(e)).wrap_err_with(|| format!("no operation named {name}"))?;
    phase::transition_to_cancelled(store, name, &phase::NullHooks)
        .map_err(|e| eyre!(e))
        .wrap_err_with(|| format!("cancelling {name}"))?;
    println!("cancelled {name} (was {})", before.phase.as_str());
    Ok(0)
}

/// Every enqueue ensures the daemon is running (§8.3): check the PID file
/// for a live `v0d` and, if absent, spawn one detached against the same
/// project root and state directory.
fn ensure_daemon_running(paths: &DaemonPaths) -> Result<()> {
    let pid_path = paths.mergeq_dir.join(".daemon.pid");
    if pid_file_is_live(&pid_path, "v0d") {
        return Ok(());
    }

    let exe = locate_v0d()?;
    std::process::Command::new(exe)
        .arg("--project-root")
        .arg(&paths.project_root)
        .arg("--state-dir")
        .arg(&paths.state_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .wrap_err("spawning v0d")?;
    Ok(())
}

fn pid_file_is_live(path: &std::path::Path, identity_substr: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return false;
    };
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
        return false;
    }
    std::fs::read(format!("/proc/{pid}/cmdline"))
        .map(|raw| raw.split(|&b| b == 0).any(|s| String::from_utf8_lossy(s).contains(identity_substr)))
        .unwrap_or(false)
}

/// Resolve the `v0d` binary: a sibling of the currently-running `v0ctl`
/// executable, falling back to `PATH`.
fn locate_v0d() -> Result<PathBuf> {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join("v0d");
            if sibling.exists() {
                return Ok(sibling);
            }
        }
    }
    Ok(PathBuf::from("v0d"))
}
