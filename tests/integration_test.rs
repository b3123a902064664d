use async_trait::async_trait;
use chrono::Timelike;
use easytask::core::{ExecutionRun, LogBroadcaster, RunOutcome, Runner, TaskKind, TaskStore};
use easytask::{App, TaskError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Records every execution and publishes the source as one output line
struct RecordingRunner {
    broadcaster: Arc<LogBroadcaster>,
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Runner for RecordingRunner {
    async fn execute(&self, task_id: &str, source: &str, timeout: Duration) -> ExecutionRun {
        self.calls.lock().push((task_id.to_string(), source.to_string()));
        self.broadcaster.publish(task_id, source);
        ExecutionRun::start(task_id, timeout).finish(RunOutcome::Succeeded)
    }
}

fn app() -> (TempDir, Arc<RecordingRunner>, App) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path().join("scripts"), dir.path().join("scripts/common")).unwrap());
    let broadcaster = Arc::new(LogBroadcaster::default());
    let runner = Arc::new(RecordingRunner {
        broadcaster: broadcaster.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let app = App::with_runner(store, runner.clone(), broadcaster);
    (dir, runner, app)
}

#[tokio::test]
async fn test_reload_installs_one_trigger_per_enabled_task() {
    let (dir, _runner, app) = app();
    app.create_task(TaskKind::Scheduled, "ping", "console.log('pong')", Some("*/5 * * * *"), Some(true))
        .unwrap();
    app.create_task(TaskKind::Scheduled, "off", "1", None, Some(false)).unwrap();
    app.shutdown();
    assert!(app.scheduler().active_ids().is_empty());

    assert_eq!(app.reload().unwrap(), 1);
    assert_eq!(app.scheduler().active_ids(), vec!["ping.js".to_string()]);

    // a fresh process over the same directory sees the same state
    let store = Arc::new(TaskStore::open(dir.path().join("scripts"), dir.path().join("scripts/common")).unwrap());
    let broadcaster = Arc::new(LogBroadcaster::default());
    let runner = Arc::new(RecordingRunner {
        broadcaster: broadcaster.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let restarted = App::with_runner(store, runner, broadcaster);
    assert_eq!(restarted.reload().unwrap(), 1);
    assert!(restarted.scheduler().is_active("ping.js"));
}

#[tokio::test]
async fn test_toggle_twice_restores_trigger_state() {
    let (_dir, _runner, app) = app();
    app.create_task(TaskKind::Scheduled, "job", "1", None, None).unwrap();
    assert!(app.get_task(TaskKind::Scheduled, "job").unwrap().running);

    let off = app.toggle_task("job").unwrap();
    assert!(!off.task.enabled);
    assert!(!off.running);

    let on = app.toggle_task("job.js").unwrap();
    assert!(on.task.enabled);
    assert!(on.running);
    assert_eq!(app.scheduler().active_ids().len(), 1);
}

#[tokio::test]
async fn test_update_and_delete_manage_triggers_and_drafts() {
    let (_dir, runner, app) = app();
    app.create_task(TaskKind::Scheduled, "job", "v1", Some("* * * * *"), None).unwrap();
    app.set_draft("job", "trial", None, None).unwrap();

    let updated = app
        .update_task(TaskKind::Scheduled, "job", "v2", Some("0 3 * * *"), None)
        .unwrap();
    assert_eq!(updated.task.schedule.as_deref(), Some("0 3 * * *"));
    assert!(updated.running);
    assert!(app.get_draft("job").is_none());

    app.run_now("job").await.unwrap();
    assert_eq!(runner.calls.lock().last().unwrap().1, "v2");

    app.delete_task(TaskKind::Scheduled, "job").unwrap();
    assert!(!app.scheduler().is_active("job.js"));
    assert!(matches!(
        app.delete_task(TaskKind::Scheduled, "job"),
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_schedule_change_retires_old_trigger() {
    let (_dir, runner, app) = app();
    app.create_task(TaskKind::Scheduled, "job", "v1", Some("* * * * *"), None).unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(runner.calls.lock().iter().any(|(_, src)| src == "v1"));

    let hour = (chrono::Local::now().hour() + 12) % 24;
    app.update_task(TaskKind::Scheduled, "job", "v2", Some(&format!("0 {} * * *", hour)), None)
        .unwrap();
    let fired = runner.calls.lock().len();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(runner.calls.lock().len(), fired);
    assert!(app.scheduler().is_active("job.js"));
}

#[tokio::test]
async fn test_invalid_schedule_is_rejected() {
    let (_dir, _runner, app) = app();
    assert!(matches!(
        app.create_task(TaskKind::Scheduled, "bad", "1", Some("every minute"), None),
        Err(TaskError::InvalidInput(_))
    ));
    assert!(app.list_tasks(TaskKind::Scheduled).unwrap().is_empty());
}

#[tokio::test]
async fn test_run_now_streams_to_observer() {
    let (_dir, _runner, app) = app();
    app.create_task(TaskKind::Scheduled, "ping", "pong", Some("*/5 * * * *"), Some(true))
        .unwrap();

    let mut observer = app.subscribe("ping");
    let run = app.run_now("ping.js").await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert_eq!(observer.try_recv().as_deref(), Some("pong"));
    assert!(observer.try_recv().is_none());

    assert!(app.unsubscribe(observer.handle()));
    assert!(!app.unsubscribe(observer.handle()));
}

#[tokio::test(start_paused = true)]
async fn test_draft_used_by_manual_run_only() {
    let (_dir, runner, app) = app();
    app.create_task(TaskKind::Scheduled, "tick", "persisted", Some("* * * * *"), None)
        .unwrap();
    app.set_draft("tick", "draft", None, None).unwrap();

    app.run_now("tick").await.unwrap();
    assert_eq!(runner.calls.lock()[0].1, "draft");

    // the draft is retained until replaced or committed
    app.run_now("tick").await.unwrap();
    assert_eq!(runner.calls.lock()[1].1, "draft");

    tokio::time::sleep(Duration::from_secs(61)).await;
    let calls = runner.calls.lock().clone();
    assert!(calls.len() > 2);
    assert!(calls[2..].iter().all(|(_, src)| src == "persisted"));
}

#[tokio::test]
async fn test_utility_namespace_is_separate() {
    let (_dir, runner, app) = app();
    app.create_task(TaskKind::Utility, "shared", "module.exports = 1", None, None)
        .unwrap();
    app.create_task(TaskKind::Scheduled, "shared", "scheduled body", None, Some(false))
        .unwrap();

    assert_eq!(app.list_tasks(TaskKind::Utility).unwrap().len(), 1);
    assert!(!app.get_task(TaskKind::Utility, "shared").unwrap().running);

    // manual runs prefer the scheduled namespace
    app.run_now("shared").await.unwrap();
    assert_eq!(runner.calls.lock()[0].1, "scheduled body");

    app.delete_task(TaskKind::Scheduled, "shared").unwrap();
    app.run_now("shared").await.unwrap();
    assert_eq!(runner.calls.lock()[1].1, "module.exports = 1");
}
