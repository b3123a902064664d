//! Task Scheduler - one cron trigger per enabled scheduled task
//!
//! Each active trigger is a tokio task that sleeps until the next fire time
//! of its schedule (local time) and then spawns a run of the task's
//! persisted body. Fires are independent tasks, so a slow run never delays
//! the next tick or another task's trigger.

use super::cron::CronSchedule;
use super::drafts::DraftStore;
use super::run::ExecutionRun;
use super::sandbox::Runner;
use super::store::{extract_body, normalize_id, TaskKind, TaskStore, DEFAULT_SCHEDULE};
use crate::error::TaskError;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Live cron binding for one task; aborted when dropped
struct ActiveTrigger {
    schedule: CronSchedule,
    handle: JoinHandle<()>,
}

impl Drop for ActiveTrigger {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Cron scheduler with manual-run support
pub struct Scheduler {
    store: Arc<TaskStore>,
    runner: Arc<dyn Runner>,
    drafts: Arc<DraftStore>,
    triggers: Mutex<HashMap<String, ActiveTrigger>>,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, runner: Arc<dyn Runner>, drafts: Arc<DraftStore>) -> Self {
        Self {
            store,
            runner,
            drafts,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or replace) the trigger for `id`.
    ///
    /// The schedule is validated before anything changes, so a bad
    /// expression leaves an existing trigger untouched. `body` is used only
    /// when the persisted artifact cannot be read at fire time.
    pub fn start(&self, id: &str, schedule: &str, body: &str) -> Result<(), TaskError> {
        let id = normalize_id(id);
        let schedule = CronSchedule::parse(schedule)?;

        let mut triggers = self.triggers.lock();
        if let Some(old) = triggers.remove(&id) {
            log::debug!("Replacing trigger for {} ({})", id, old.schedule);
            drop(old);
        }

        let handle = tokio::spawn(trigger_loop(
            id.clone(),
            schedule.clone(),
            body.to_string(),
            self.store.clone(),
            self.runner.clone(),
        ));
        log::info!("Scheduled {} with \"{}\"", id, schedule);
        triggers.insert(id, ActiveTrigger { schedule, handle });
        Ok(())
    }

    /// Remove the trigger for `id`. Returns false if none was active.
    pub fn stop(&self, id: &str) -> bool {
        let id = normalize_id(id);
        match self.triggers.lock().remove(&id) {
            Some(_) => {
                log::info!("Stopped trigger for {}", id);
                true
            }
            None => false,
        }
    }

    /// Re-derive every trigger from the task store.
    ///
    /// Returns the number of triggers installed. A task whose schedule does
    /// not parse is logged and skipped.
    pub fn reload(&self) -> Result<usize, TaskError> {
        let tasks = self.store.list(TaskKind::Scheduled)?;
        self.shutdown();

        let mut installed = 0;
        for task in tasks.iter().filter(|t| t.enabled) {
            let schedule = task.schedule.as_deref().unwrap_or(DEFAULT_SCHEDULE);
            match self.start(&task.id, schedule, &task.source_body) {
                Ok(()) => installed += 1,
                Err(e) => log::error!("Failed to schedule {}: {}", task.id, e),
            }
        }

        log::info!("Loaded {} scheduled tasks, {} active", tasks.len(), installed);
        Ok(installed)
    }

    /// Run a task immediately and wait for it.
    ///
    /// Source resolution: the draft for `id`, then the persisted scheduled
    /// task, then the utility task of the same id.
    pub async fn run_now(&self, id: &str) -> Result<ExecutionRun, TaskError> {
        let id = normalize_id(id);
        let source = self.resolve_source(&id)?;
        log::info!("Manual run of {}", id);
        Ok(self
            .runner
            .execute(&id, &source, self.runner.default_timeout())
            .await)
    }

    fn resolve_source(&self, id: &str) -> Result<String, TaskError> {
        if let Some(draft) = self.drafts.get_draft(id) {
            log::debug!("Using draft for {}", id);
            return Ok(draft.source_body);
        }
        match self.store.read_raw(TaskKind::Scheduled, id) {
            Ok(raw) => Ok(extract_body(&raw).to_string()),
            Err(TaskError::NotFound(_)) => self.store.read_raw(TaskKind::Utility, id),
            Err(e) => Err(e),
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.triggers.lock().contains_key(&normalize_id(id))
    }

    /// Ids with an active trigger, sorted
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.triggers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Next fire time of an active trigger
    pub fn next_fire(&self, id: &str) -> Option<DateTime<Local>> {
        self.triggers
            .lock()
            .get(&normalize_id(id))
            .and_then(|t| t.schedule.next_after(&Local::now()))
    }

    /// Stop every trigger
    pub fn shutdown(&self) {
        let stopped: Vec<ActiveTrigger> = self.triggers.lock().drain().map(|(_, t)| t).collect();
        if !stopped.is_empty() {
            log::info!("Stopped {} triggers", stopped.len());
        }
    }
}

async fn trigger_loop(
    id: String,
    schedule: CronSchedule,
    fallback_body: String,
    store: Arc<TaskStore>,
    runner: Arc<dyn Runner>,
) {
    let mut last: Option<DateTime<Local>> = None;

    loop {
        let now = Local::now();
        let cursor = match last {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = schedule.next_after(&cursor) else {
            log::warn!("Schedule \"{}\" of {} never fires again", schedule, id);
            return;
        };

        let delay = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;
        last = Some(next);

        log::debug!("Trigger fired for {} at {}", id, next.format("%Y-%m-%d %H:%M"));
        let body = match store.read_raw(TaskKind::Scheduled, &id) {
            Ok(raw) => extract_body(&raw).to_string(),
            Err(e) => {
                log::warn!("Failed to read {} at fire time, using last known body: {}", id, e);
                fallback_body.clone()
            }
        };

        let runner = runner.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let run = runner.execute(&task_id, &body, runner.default_timeout()).await;
            if !run.succeeded() {
                log::error!("Scheduled run of {} {}", task_id, run.outcome);
            }
        });
    }
}
