//! Core engine - task store, cron triggers, sandboxed execution, log fan-out

mod broadcast;
mod cron;
mod drafts;
mod run;
mod sandbox;
mod scheduler;
mod store;
mod transpile;

pub use broadcast::{LogBroadcaster, Observer, ObserverHandle, DEFAULT_OBSERVER_CAPACITY};
pub use cron::{CronError, CronSchedule};
pub use drafts::{Draft, DraftStore};
pub use run::{ExecutionRun, RunOutcome};
pub use sandbox::{Runner, Sandbox, SandboxConfig, DEFAULT_TIMEOUT, ERROR_TAG, TASK_LOG_TARGET};
pub use scheduler::Scheduler;
pub use store::{
    extract_body, normalize_id, parse_metadata, render_artifact, TaskDefinition, TaskKind, TaskMetadata,
    TaskStore, DEFAULT_SCHEDULE, TASK_EXTENSION,
};
pub use transpile::{transpile, TranspileError};
