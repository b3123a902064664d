//! Sandbox runner - executes one task body in an isolated interpreter process
//!
//! Each run gets a private temporary directory holding the normalized task
//! body, normalized copies of every utility task and the bootstrap script.
//! The interpreter is started there with a cleared environment, no stdin and
//! a wall-clock budget. Output arrives as line records on stdout (see
//! `bootstrap.js`) and is relayed to the process log and to the task's
//! observers as it happens.

use super::broadcast::LogBroadcaster;
use super::run::{ExecutionRun, RunOutcome};
use super::transpile::transpile;
use crate::error::TaskError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Log target for lines produced by sandboxed code
pub const TASK_LOG_TARGET: &str = "easytask::task";

/// Tag prefixed to error lines on the observer channel
pub const ERROR_TAG: &str = "[ERROR]";

/// Default time budget per run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const BOOTSTRAP: &str = include_str!("bootstrap.js");
const BOOTSTRAP_FILE: &str = "__bootstrap.js";
const ENTRY_FILE: &str = "main.js";

/// Anything that can execute a task body and report an outcome.
///
/// Implementations must never fail past this boundary: every error is
/// folded into the returned run's outcome.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn execute(&self, task_id: &str, source: &str, timeout: Duration) -> ExecutionRun;

    /// Budget used when the caller has no specific one
    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }
}

/// Sandbox settings
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter executable, looked up on `PATH` if not a path
    pub interpreter: String,
    /// Directory whose `node_modules` holds installed packages
    pub module_root: PathBuf,
    /// Utility task directory
    pub utils_dir: PathBuf,
    /// Where utilities appear inside the run directory (relative)
    pub utils_mount: PathBuf,
    pub timeout: Duration,
    /// Host variables copied into the sandbox environment
    pub env_passthrough: Vec<String>,
    /// Extra variables set in the sandbox environment
    pub env: HashMap<String, String>,
    /// Builtin modules tasks may load; `*` allows all
    pub allowed_builtins: Vec<String>,
    /// Launch the interpreter with its permission model, limiting file reads
    /// to the run directory and the module root
    pub restrict_fs: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "node".to_string(),
            module_root: PathBuf::from("."),
            utils_dir: PathBuf::from("scripts/common"),
            utils_mount: PathBuf::from("common"),
            timeout: DEFAULT_TIMEOUT,
            env_passthrough: ["PATH", "HOME", "LANG", "TZ"].iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            allowed_builtins: vec!["*".to_string()],
            restrict_fs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Stream {
    Log,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Record {
    stream: Stream,
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

impl Record {
    /// Decode one stdout line; anything that is not a record is plain output
    fn parse(line: &str) -> Self {
        if line.starts_with('{') {
            if let Ok(record) = serde_json::from_str::<Record>(line) {
                return record;
            }
        }
        Record {
            stream: Stream::Log,
            message: line.to_string(),
            stack: None,
        }
    }
}

/// Interpreter-process sandbox
pub struct Sandbox {
    config: SandboxConfig,
    broadcaster: Arc<LogBroadcaster>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, broadcaster: Arc<LogBroadcaster>) -> Self {
        Self { config, broadcaster }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Send a line to the diagnostic log and to the task's observers
    fn emit(&self, task_id: &str, stream: Stream, message: &str) {
        match stream {
            Stream::Log => {
                log::info!(target: TASK_LOG_TARGET, "[{}] {}", task_id, message);
                self.broadcaster.publish(task_id, message);
            }
            Stream::Error | Stream::Fatal => {
                log::warn!(target: TASK_LOG_TARGET, "[{}] {} {}", task_id, ERROR_TAG, message);
                self.broadcaster
                    .publish(task_id, &format!("{} {}", ERROR_TAG, message));
            }
        }
    }

    /// Build the private run directory
    fn stage(&self, source: &str) -> Result<TempDir, TaskError> {
        let dir = tempfile::Builder::new().prefix("easytask-run-").tempdir()?;
        fs::write(dir.path().join(BOOTSTRAP_FILE), BOOTSTRAP)?;
        fs::write(dir.path().join(ENTRY_FILE), transpile(source)?)?;

        let mount = dir.path().join(&self.config.utils_mount);
        fs::create_dir_all(&mount)?;

        if self.config.utils_dir.is_dir() {
            for entry in fs::read_dir(&self.config.utils_dir)? {
                let path = entry?.path();
                let Some(name) = path.file_name() else { continue };
                if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("js") {
                    continue;
                }

                let code = match fs::read_to_string(&path).map(|raw| transpile(&raw)) {
                    Ok(Ok(code)) => code,
                    Ok(Err(e)) => {
                        log::warn!("Utility {} cannot be staged: {}", path.display(), e);
                        format!("throw new Error({});\n", serde_json::to_string(&e.to_string()).unwrap_or_default())
                    }
                    Err(e) => {
                        log::warn!("Failed to read utility {}: {}", path.display(), e);
                        continue;
                    }
                };
                fs::write(mount.join(name), code)?;
            }
        }

        Ok(dir)
    }

    fn command(&self, run_dir: &Path) -> Result<Command, TaskError> {
        let interpreter = which::which(&self.config.interpreter).map_err(|e| {
            TaskError::SandboxFailure(format!("interpreter '{}' not found: {}", self.config.interpreter, e))
        })?;
        let module_root = self
            .config
            .module_root
            .canonicalize()
            .unwrap_or_else(|_| self.config.module_root.clone());

        let mut cmd = Command::new(interpreter);
        if self.config.restrict_fs {
            cmd.arg("--permission")
                .arg(format!("--allow-fs-read={}", run_dir.display()))
                .arg(format!("--allow-fs-read={}", module_root.display()));
        }
        cmd.arg(run_dir.join(BOOTSTRAP_FILE));

        cmd.env_clear();
        for key in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&self.config.env)
            .env("EASYTASK_RUN_DIR", run_dir)
            .env("EASYTASK_MODULE_ROOT", &module_root)
            .env("EASYTASK_ENTRY", ENTRY_FILE)
            .env("EASYTASK_BUILTINS", self.config.allowed_builtins.join(","))
            .current_dir(run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(cmd)
    }

    async fn run(&self, task_id: &str, source: &str, timeout: Duration) -> Result<RunOutcome, TaskError> {
        let run_dir = self.stage(source)?;
        let mut child = self.command(run_dir.path())?.spawn().map_err(|e| {
            TaskError::SandboxFailure(format!("failed to launch {}: {}", self.config.interpreter, e))
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(TaskError::SandboxFailure("interpreter output is not captured".to_string()));
        };

        let mut failure: Option<String> = None;
        let pump = async {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);

            while out_open || err_open {
                tokio::select! {
                    line = out.next_line(), if out_open => match line {
                        Ok(Some(line)) => {
                            let record = Record::parse(&line);
                            if record.stream == Stream::Fatal {
                                if let Some(stack) = &record.stack {
                                    log::debug!(target: TASK_LOG_TARGET, "[{}] {}", task_id, stack);
                                }
                                failure = Some(record.message);
                            } else {
                                self.emit(task_id, record.stream, &record.message);
                            }
                        }
                        _ => out_open = false,
                    },
                    line = err.next_line(), if err_open => match line {
                        Ok(Some(line)) => self.emit(task_id, Stream::Error, &line),
                        _ => err_open = false,
                    },
                }
            }

            child.wait().await
        };

        let result = tokio::time::timeout(timeout, pump).await;
        let outcome = match result {
            Ok(Ok(status)) if status.success() => RunOutcome::Succeeded,
            Ok(Ok(status)) => RunOutcome::Failed {
                reason: failure.unwrap_or_else(|| format!("interpreter exited with {}", status)),
            },
            Ok(Err(e)) => RunOutcome::Failed { reason: e.to_string() },
            Err(_) => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill timed out run of {}: {}", task_id, e);
                }
                RunOutcome::TimedOut
            }
        };

        drop(run_dir);
        Ok(outcome)
    }
}

#[async_trait]
impl Runner for Sandbox {
    async fn execute(&self, task_id: &str, source: &str, timeout: Duration) -> ExecutionRun {
        let run = ExecutionRun::start(task_id, timeout);
        log::info!("Executing {} (budget {}ms)", task_id, timeout.as_millis());

        let outcome = match self.run(task_id, source, timeout).await {
            Ok(outcome) => outcome,
            Err(TaskError::SandboxFailure(reason)) => RunOutcome::Failed { reason },
            Err(e) => RunOutcome::Failed { reason: e.to_string() },
        };

        match &outcome {
            RunOutcome::Failed { reason } => {
                log::error!("Task {} failed: {}", task_id, reason);
                self.emit(task_id, Stream::Fatal, &format!("Script execution failed: {}", reason));
            }
            RunOutcome::TimedOut => {
                log::error!("Task {} timed out after {}ms", task_id, timeout.as_millis());
                self.emit(
                    task_id,
                    Stream::Fatal,
                    &format!("Script execution timed out after {}ms", timeout.as_millis()),
                );
            }
            _ => log::info!("Task {} completed", task_id),
        }

        run.finish(outcome)
    }

    fn default_timeout(&self) -> Duration {
        self.config.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_parse() {
        let record = Record::parse(r#"{"stream":"error","message":"bad"}"#);
        assert_eq!(record.stream, Stream::Error);
        assert_eq!(record.message, "bad");

        let fatal = Record::parse(r#"{"stream":"fatal","message":"boom","stack":"Error: boom\n  at main.js:1"}"#);
        assert_eq!(fatal.stream, Stream::Fatal);
        assert!(fatal.stack.is_some());

        let raw = Record::parse("{ not a record");
        assert_eq!(raw.stream, Stream::Log);
        assert_eq!(raw.message, "{ not a record");
    }

    #[test]
    fn test_stage_mounts_normalized_utilities() {
        let utils = TempDir::new().unwrap();
        fs::write(utils.path().join("notify.js"), "export default function notify() {}\n").unwrap();
        fs::write(utils.path().join("broken.js"), "export const { a } = b;\n").unwrap();
        fs::write(utils.path().join("README.md"), "skip").unwrap();

        let sandbox = Sandbox::new(
            SandboxConfig {
                utils_dir: utils.path().to_path_buf(),
                ..SandboxConfig::default()
            },
            Arc::new(LogBroadcaster::default()),
        );

        let run_dir = sandbox.stage("import notify from './common/notify';\nnotify();").unwrap();
        let main = fs::read_to_string(run_dir.path().join(ENTRY_FILE)).unwrap();
        assert!(main.contains("__esDefault(require(\"./common/notify\"))"));

        let notify = fs::read_to_string(run_dir.path().join("common/notify.js")).unwrap();
        assert!(notify.contains("exports.default = notify;"));

        let broken = fs::read_to_string(run_dir.path().join("common/broken.js")).unwrap();
        assert!(broken.starts_with("throw new Error("));

        assert!(!run_dir.path().join("common/README.md").exists());
        assert!(run_dir.path().join(BOOTSTRAP_FILE).exists());
    }

    #[test]
    fn test_stage_rejects_unsupported_entry() {
        let sandbox = Sandbox::new(SandboxConfig::default(), Arc::new(LogBroadcaster::default()));
        assert!(matches!(
            sandbox.stage("export const { a } = b;"),
            Err(TaskError::SandboxFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_without_panicking() {
        let hub = Arc::new(LogBroadcaster::default());
        let mut observer = hub.attach("a.js");
        let sandbox = Sandbox::new(
            SandboxConfig {
                interpreter: "easytask-no-such-interpreter".to_string(),
                ..SandboxConfig::default()
            },
            hub.clone(),
        );

        let run = sandbox.execute("a.js", "console.log(1)", Duration::from_secs(1)).await;
        assert!(matches!(run.outcome, RunOutcome::Failed { .. }));

        let line = observer.try_recv().unwrap();
        assert!(line.starts_with("[ERROR] Script execution failed: interpreter"));
    }
}
