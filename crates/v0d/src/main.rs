//! v0d - merge queue daemon for the operation orchestration core.
//!
//! Drains `.v0/build/mergeq/queue.json` against a dedicated workspace,
//! one merge at a time. See [`v0d::MergeDaemon`].

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use v0_core::config::Config;
use v0d::dependency::WkCliTracker;
use v0d::pidfile::{reap_orphans, PidFile};
use v0d::session::TmuxController;
use v0d::{DaemonPaths, MergeDaemon, MergeDaemonConfig};

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "v0d", about = "Merge queue daemon for the operation orchestration core")]
struct Cli {
    /// Root of the project this daemon serves (defaults to the current directory).
    #[arg(long, env = "V0_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Override the directory the daemon uses for its dedicated workspace,
    /// PID file, and orphan-reaping identity. Defaults to an XDG state
    /// directory scoped by project name.
    #[arg(long, env = "V0_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let project_root = cli
        .project_root
        .unwrap_or_else(|| std::env::current_dir().expect("failed to read current directory"));
    let project_root = project_root.canonicalize().unwrap_or(project_root);

    let config = match Config::load(&project_root) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.require_essentials() {
        error!("configuration error: {e}");
        std::process::exit(1);
    }

    let project_name = config.project.clone().unwrap_or_else(|| "default".to_string());
    let paths = DaemonPaths::discover(project_root, cli.state_dir, &project_name);

    let pid_path = paths.mergeq_dir.join(".daemon.pid");
    let pid_guard = match PidFile::acquire(&pid_path, "v0d") {
        Ok(guard) => guard,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    reap_orphans("v0d", &paths.state_dir.to_string_lossy(), std::process::id() as i32);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let poll_interval = Duration::from_secs(config.merge_queue_poll_sec);
        let conflict_timeout = Duration::from_secs(config.conflict_timeout_sec);
        let daemon_cfg = MergeDaemonConfig {
            paths,
            config,
            poll_interval,
            conflict_timeout,
            enforce_issue_policy: false,
        };

        let daemon = match MergeDaemon::new(daemon_cfg, Box::new(WkCliTracker::default()), Box::new(TmuxController)) {
            Ok(d) => d,
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        };

        let shutdown = daemon.shutdown_flag();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            result = daemon.run() => {
                if let Err(e) = result {
                    error!("daemon error: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                shutdown.store(true, Ordering::SeqCst);
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                shutdown.store(true, Ordering::SeqCst);
            }
        }
    });

    drop(pid_guard);
}
