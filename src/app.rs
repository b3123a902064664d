//! Application façade - task registry operations wired to the scheduler
//!
//! `App` owns one instance of every core component and keeps them
//! consistent: registry mutations install, replace or remove the matching
//! trigger and evict stale drafts before returning.

use crate::config::Config;
use crate::core::{
    normalize_id, Draft, DraftStore, ExecutionRun, LogBroadcaster, Observer, ObserverHandle, Runner, Sandbox,
    Scheduler, TaskDefinition, TaskKind, TaskStore, DEFAULT_SCHEDULE,
};
use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A task definition plus its trigger state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    #[serde(flatten)]
    pub task: TaskDefinition,
    /// An active trigger exists for the task
    pub running: bool,
}

/// Application state
pub struct App {
    store: Arc<TaskStore>,
    drafts: Arc<DraftStore>,
    broadcaster: Arc<LogBroadcaster>,
    scheduler: Scheduler,
}

impl App {
    /// Build the app from configuration, running tasks in the interpreter sandbox
    pub fn new(config: &Config) -> Result<Self, TaskError> {
        let store = Arc::new(TaskStore::open(&config.scripts_dir, config.utils_dir())?);
        let broadcaster = Arc::new(LogBroadcaster::new(config.broadcast.observer_capacity));
        let runner = Arc::new(Sandbox::new(config.sandbox_config(), broadcaster.clone()));
        Ok(Self::with_runner(store, runner, broadcaster))
    }

    /// Build the app around a custom runner
    pub fn with_runner(store: Arc<TaskStore>, runner: Arc<dyn Runner>, broadcaster: Arc<LogBroadcaster>) -> Self {
        let drafts = Arc::new(DraftStore::new());
        let scheduler = Scheduler::new(store.clone(), runner, drafts.clone());
        Self {
            store,
            drafts,
            broadcaster,
            scheduler,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.broadcaster
    }

    /// Install triggers for every enabled scheduled task
    pub fn reload(&self) -> Result<usize, TaskError> {
        self.scheduler.reload()
    }

    pub fn list_tasks(&self, kind: TaskKind) -> Result<Vec<TaskSummary>, TaskError> {
        Ok(self
            .store
            .list(kind)?
            .into_iter()
            .map(|task| self.summarize(task))
            .collect())
    }

    pub fn get_task(&self, kind: TaskKind, id: &str) -> Result<TaskSummary, TaskError> {
        self.store.get(kind, id).map(|task| self.summarize(task))
    }

    pub fn create_task(
        &self,
        kind: TaskKind,
        id: &str,
        body: &str,
        schedule: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<TaskSummary, TaskError> {
        let task = self.store.create(kind, id, body, schedule, enabled)?;
        self.sync_trigger(&task)?;
        Ok(self.summarize(task))
    }

    /// Commit new content for a task; any draft for it is discarded
    pub fn update_task(
        &self,
        kind: TaskKind,
        id: &str,
        body: &str,
        schedule: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<TaskSummary, TaskError> {
        let task = self.store.update(kind, id, body, schedule, enabled)?;
        if kind == TaskKind::Scheduled {
            self.drafts.clear(&task.id);
        }
        self.sync_trigger(&task)?;
        Ok(self.summarize(task))
    }

    pub fn delete_task(&self, kind: TaskKind, id: &str) -> Result<(), TaskError> {
        self.store.delete(kind, id)?;
        if kind == TaskKind::Scheduled {
            self.scheduler.stop(id);
            self.drafts.clear(&normalize_id(id));
        }
        Ok(())
    }

    /// Flip a scheduled task's enabled flag and install or remove its trigger
    pub fn toggle_task(&self, id: &str) -> Result<TaskSummary, TaskError> {
        let current = self.store.get(TaskKind::Scheduled, id)?;
        let task = self.store.update(
            TaskKind::Scheduled,
            &current.id,
            &current.source_body,
            None,
            Some(!current.enabled),
        )?;
        log::info!("Toggled {} -> {}", task.id, if task.enabled { "enabled" } else { "disabled" });
        self.sync_trigger(&task)?;
        Ok(self.summarize(task))
    }

    /// Save unsaved edits for a trial run
    pub fn set_draft(&self, id: &str, body: &str, schedule: Option<&str>, enabled: Option<bool>) -> Result<(), TaskError> {
        if body.trim().is_empty() {
            return Err(TaskError::InvalidInput("draft body must not be empty".to_string()));
        }
        self.drafts
            .set_draft(&normalize_id(id), body, schedule, enabled);
        Ok(())
    }

    pub fn get_draft(&self, id: &str) -> Option<Draft> {
        self.drafts.get_draft(&normalize_id(id))
    }

    /// Run a task now, preferring its draft, and wait for the outcome
    pub async fn run_now(&self, id: &str) -> Result<ExecutionRun, TaskError> {
        self.scheduler.run_now(id).await
    }

    /// Attach a live observer to a task's output
    pub fn subscribe(&self, id: &str) -> Observer {
        self.broadcaster.attach(&normalize_id(id))
    }

    pub fn unsubscribe(&self, handle: &ObserverHandle) -> bool {
        self.broadcaster.detach(handle)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    fn sync_trigger(&self, task: &TaskDefinition) -> Result<(), TaskError> {
        if task.kind != TaskKind::Scheduled {
            return Ok(());
        }
        if task.enabled {
            let schedule = task.schedule.as_deref().unwrap_or(DEFAULT_SCHEDULE);
            self.scheduler.start(&task.id, schedule, &task.source_body)
        } else {
            self.scheduler.stop(&task.id);
            Ok(())
        }
    }

    fn summarize(&self, task: TaskDefinition) -> TaskSummary {
        let running = task.kind == TaskKind::Scheduled && self.scheduler.is_active(&task.id);
        TaskSummary { task, running }
    }
}
