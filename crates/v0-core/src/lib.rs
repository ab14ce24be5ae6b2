pub mod atomic;
pub mod config;
pub mod events;
pub mod naming;
pub mod phase;
pub mod state;
pub mod types;

pub use config::Config;
pub use phase::{
    PhaseError, PhaseHooks, ReadyChecks, CONVENTIONAL_BRANCH_PREFIXES,
};
pub use state::{StateError, StateStore};
pub use types::{
    MergeStatus, MergeType, Operation, OperationType, Phase, QueueEntry, QueueFile, QueueStatus,
    ReadyReason, ResumedBy, WorkspaceMode, CURRENT_SCHEMA_VERSION,
};
