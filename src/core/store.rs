//! Task store - task definitions persisted as self-describing source files
//!
//! Scheduled tasks live in one directory and carry a leading comment block
//! with a JSON metadata object:
//!
//! ```text
//! /*
//! {
//!   "schedule": "*/5 * * * *",
//!   "enabled": true,
//!   "name": "ping.js"
//! }
//! */
//!
//! console.log("pong");
//! ```
//!
//! Utility tasks live in a separate directory and store only the body.

use super::cron::CronSchedule;
use crate::error::TaskError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// File extension every task id carries
pub const TASK_EXTENSION: &str = ".js";

/// Schedule used when the metadata header omits one
pub const DEFAULT_SCHEDULE: &str = "* * * * *";

static METADATA_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*/\*\s*(\{[\s\S]*?\})\s*\*/").expect("valid regex"));

static LEADING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*/\*[\s\S]*?\*/\s*").expect("valid regex"));

/// Task kind - each kind has its own directory and id namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Cron-triggered task with a metadata header
    Scheduled,
    /// Import-only helper, never triggered
    Utility,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Utility => write!(f, "utility"),
        }
    }
}

/// Metadata header of a scheduled task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_schedule() -> String {
    DEFAULT_SCHEDULE.to_string()
}

fn default_enabled() -> bool {
    true
}

impl TaskMetadata {
    fn defaults_for(id: &str) -> Self {
        Self {
            schedule: default_schedule(),
            enabled: true,
            name: Some(id.to_string()),
        }
    }
}

/// A registered task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub kind: TaskKind,
    /// Cron expression, `None` for utility tasks
    pub schedule: Option<String>,
    pub enabled: bool,
    /// Executable text without the metadata header
    pub source_body: String,
}

/// Strip the leading metadata comment block from a raw artifact
pub fn extract_body(raw: &str) -> &str {
    if let Some(end) = header_end(raw) {
        return raw[end..].trim_start();
    }
    match LEADING_COMMENT.find(raw) {
        Some(m) => &raw[m.end()..],
        None => raw,
    }
}

/// Offset just past the leading block comment's closing `*/`.
///
/// A `*/` inside a double-quoted string (e.g. "*/5 * * * *") does not close
/// the header. Quotes never span lines, so a stray `"` in a plain comment
/// only affects its own line.
fn header_end(raw: &str) -> Option<usize> {
    let start = raw.len() - raw.trim_start().len();
    let bytes = raw[start..].strip_prefix("/*")?.as_bytes();
    let offset = start + 2;

    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'\n' => in_string = false,
            b'*' if !in_string && bytes.get(i + 1) == Some(&b'/') => return Some(offset + i + 2),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Decode the metadata header of a raw artifact.
///
/// A missing header yields `Ok(None)`; a header that is present but not a
/// valid metadata object is a `MetadataParse` error.
pub fn parse_metadata(id: &str, raw: &str) -> Result<Option<TaskMetadata>, TaskError> {
    let Some(caps) = METADATA_BLOCK.captures(raw) else {
        return Ok(None);
    };

    serde_json::from_str::<TaskMetadata>(&caps[1])
        .map(Some)
        .map_err(|e| TaskError::MetadataParse {
            file: id.to_string(),
            reason: e.to_string(),
        })
}

/// Render a scheduled task artifact (header + body)
pub fn render_artifact(meta: &TaskMetadata, body: &str) -> String {
    let header = serde_json::to_string_pretty(meta).unwrap_or_else(|_| "{}".to_string());
    format!("/*\n{}\n*/\n\n{}", header, body)
}

/// Append the task extension if it is missing
pub fn normalize_id(id: &str) -> String {
    let id = id.trim();
    if id.ends_with(TASK_EXTENSION) {
        id.to_string()
    } else {
        format!("{}{}", id, TASK_EXTENSION)
    }
}

fn validate_id(id: &str) -> Result<(), TaskError> {
    let stem = id.strip_suffix(TASK_EXTENSION).unwrap_or(id);
    if stem.is_empty() {
        return Err(TaskError::InvalidInput("task id must not be empty".to_string()));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.starts_with('.') {
        return Err(TaskError::InvalidInput(format!(
            "task id '{}' must be a plain file name",
            id
        )));
    }
    Ok(())
}

fn validate_schedule(schedule: &str) -> Result<(), TaskError> {
    CronSchedule::parse(schedule)?;
    Ok(())
}

/// Directory-backed task store
#[derive(Debug, Clone)]
pub struct TaskStore {
    scripts_dir: PathBuf,
    utils_dir: PathBuf,
}

impl TaskStore {
    /// Open a store, creating both directories if needed
    pub fn open(scripts_dir: impl Into<PathBuf>, utils_dir: impl Into<PathBuf>) -> Result<Self, TaskError> {
        let store = Self {
            scripts_dir: scripts_dir.into(),
            utils_dir: utils_dir.into(),
        };
        fs::create_dir_all(&store.scripts_dir)?;
        fs::create_dir_all(&store.utils_dir)?;
        Ok(store)
    }

    /// Directory backing a kind's namespace
    pub fn dir(&self, kind: TaskKind) -> &Path {
        match kind {
            TaskKind::Scheduled => &self.scripts_dir,
            TaskKind::Utility => &self.utils_dir,
        }
    }

    /// Location of `id`; ids that are not plain file names are rejected
    fn path(&self, kind: TaskKind, id: &str) -> Result<PathBuf, TaskError> {
        validate_id(id)?;
        Ok(self.dir(kind).join(id))
    }

    /// Whether `id` exists in a kind's namespace
    pub fn exists(&self, kind: TaskKind, id: &str) -> bool {
        self.path(kind, &normalize_id(id))
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Enumerate all definitions of a kind, sorted by id.
    ///
    /// A file whose metadata cannot be decoded is listed with defaults.
    pub fn list(&self, kind: TaskKind) -> Result<Vec<TaskDefinition>, TaskError> {
        let mut tasks = Vec::new();

        for entry in fs::read_dir(self.dir(kind))? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !id.ends_with(TASK_EXTENSION) {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(raw) => tasks.push(Self::decode(kind, id, &raw)),
                Err(e) => log::warn!("Failed to read task {}: {}", path.display(), e),
            }
        }

        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Load one definition
    pub fn get(&self, kind: TaskKind, id: &str) -> Result<TaskDefinition, TaskError> {
        let id = normalize_id(id);
        let raw = self.read_raw(kind, &id)?;
        Ok(Self::decode(kind, &id, &raw))
    }

    /// Raw artifact text, header included
    pub fn read_raw(&self, kind: TaskKind, id: &str) -> Result<String, TaskError> {
        let id = normalize_id(id);
        let path = self.path(kind, &id)?;
        if !path.is_file() {
            return Err(TaskError::NotFound(id));
        }
        Ok(fs::read_to_string(path)?)
    }

    /// Register a new task
    pub fn create(
        &self,
        kind: TaskKind,
        id: &str,
        body: &str,
        schedule: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<TaskDefinition, TaskError> {
        let id = normalize_id(id);
        if body.trim().is_empty() {
            return Err(TaskError::InvalidInput("task body must not be empty".to_string()));
        }
        if self.path(kind, &id)?.exists() {
            return Err(TaskError::AlreadyExists(id));
        }

        let meta = TaskMetadata {
            schedule: schedule.map(str::to_string).unwrap_or_else(default_schedule),
            enabled: enabled.unwrap_or(true),
            name: Some(id.clone()),
        };
        if kind == TaskKind::Scheduled {
            validate_schedule(&meta.schedule)?;
        }

        self.write(kind, &id, &meta, body, false)?;
        log::info!("Created {} task {}", kind, id);
        Ok(Self::definition(kind, id, meta, body.to_string()))
    }

    /// Rewrite an existing task. Omitted schedule/enabled keep their stored values.
    pub fn update(
        &self,
        kind: TaskKind,
        id: &str,
        body: &str,
        schedule: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<TaskDefinition, TaskError> {
        let current = self.get(kind, id)?;
        if body.trim().is_empty() {
            return Err(TaskError::InvalidInput("task body must not be empty".to_string()));
        }

        let meta = TaskMetadata {
            schedule: schedule
                .map(str::to_string)
                .or(current.schedule)
                .unwrap_or_else(default_schedule),
            enabled: enabled.unwrap_or(current.enabled),
            name: Some(current.id.clone()),
        };
        if kind == TaskKind::Scheduled {
            validate_schedule(&meta.schedule)?;
        }

        self.write(kind, &current.id, &meta, body, true)?;
        log::info!("Updated {} task {}", kind, current.id);
        Ok(Self::definition(kind, current.id, meta, body.to_string()))
    }

    /// Remove a task
    pub fn delete(&self, kind: TaskKind, id: &str) -> Result<(), TaskError> {
        let id = normalize_id(id);
        let path = self.path(kind, &id)?;
        if !path.is_file() {
            return Err(TaskError::NotFound(id));
        }
        fs::remove_file(path)?;
        log::info!("Deleted {} task {}", kind, id);
        Ok(())
    }

    /// Write-then-rename so readers never observe a partial artifact.
    ///
    /// Without `replace` an artifact that appeared in the meantime is kept
    /// and the write fails with `AlreadyExists`.
    fn write(
        &self,
        kind: TaskKind,
        id: &str,
        meta: &TaskMetadata,
        body: &str,
        replace: bool,
    ) -> Result<(), TaskError> {
        let content = match kind {
            TaskKind::Scheduled => render_artifact(meta, body),
            TaskKind::Utility => body.to_string(),
        };

        let dir = self.dir(kind);
        let mut tmp = tempfile::Builder::new()
            .prefix(".easytask-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let target = self.path(kind, id)?;
        if replace {
            tmp.persist(target).map_err(|e| e.error)?;
        } else {
            tmp.persist_noclobber(target).map_err(|e| match e.error.kind() {
                io::ErrorKind::AlreadyExists => TaskError::AlreadyExists(id.to_string()),
                _ => TaskError::Io(e.error),
            })?;
        }
        Ok(())
    }

    fn decode(kind: TaskKind, id: &str, raw: &str) -> TaskDefinition {
        match kind {
            TaskKind::Utility => TaskDefinition {
                id: id.to_string(),
                kind,
                schedule: None,
                enabled: false,
                source_body: raw.to_string(),
            },
            TaskKind::Scheduled => {
                let meta = match parse_metadata(id, raw) {
                    Ok(Some(meta)) => meta,
                    Ok(None) => TaskMetadata::defaults_for(id),
                    Err(e) => {
                        log::error!("{}; using defaults", e);
                        TaskMetadata::defaults_for(id)
                    }
                };
                Self::definition(kind, id.to_string(), meta, extract_body(raw).to_string())
            }
        }
    }

    fn definition(kind: TaskKind, id: String, meta: TaskMetadata, body: String) -> TaskDefinition {
        match kind {
            TaskKind::Scheduled => TaskDefinition {
                id,
                kind,
                schedule: Some(meta.schedule),
                enabled: meta.enabled,
                source_body: body,
            },
            TaskKind::Utility => TaskDefinition {
                id,
                kind,
                schedule: None,
                enabled: false,
                source_body: body,
            },
        }
    }
}
