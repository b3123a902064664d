//! easytask - cron-driven script runner
//!
//! Register tasks (scheduled or utility), bind scheduled tasks to cron
//! expressions, and run them in a time-boxed interpreter sandbox whose
//! output streams live to any number of observers.

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod server;

// Re-exports
pub use app::{App, TaskSummary};
pub use config::Config;
pub use crate::core::{
    CronSchedule, ExecutionRun, LogBroadcaster, Observer, RunOutcome, Runner, Sandbox, SandboxConfig, Scheduler,
    TaskDefinition, TaskKind, TaskStore,
};
pub use error::TaskError;

/// Result type alias
pub type Result<T> = std::result::Result<T, TaskError>;
