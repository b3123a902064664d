//! Log broadcaster - per-task fan-out of run output to live observers
//!
//! Every observer owns a bounded channel. Publishing never waits: when an
//! observer's channel is full the line is dropped for that observer only,
//! and observers whose receiving side is gone are pruned. There is no
//! replay - an observer only sees lines published after it attached.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Default per-observer channel capacity (lines)
pub const DEFAULT_OBSERVER_CAPACITY: usize = 256;

/// Identifies one attachment; used to detach
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    pub task_id: String,
    id: u64,
}

/// A live subscription to a task's output
#[derive(Debug)]
pub struct Observer {
    handle: ObserverHandle,
    rx: mpsc::Receiver<String>,
}

impl Observer {
    pub fn handle(&self) -> &ObserverHandle {
        &self.handle
    }

    /// Next line, or `None` once detached
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next line if one is already queued
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Split into the handle (for detaching) and the raw receiver
    pub fn into_parts(self) -> (ObserverHandle, mpsc::Receiver<String>) {
        (self.handle, self.rx)
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Publish/subscribe hub keyed by task id
pub struct LogBroadcaster {
    capacity: usize,
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a new observer to `task_id`
    pub fn attach(&self, task_id: &str) -> Observer {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.channels
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        log::debug!("Observer {} attached to {}", id, task_id);
        Observer {
            handle: ObserverHandle {
                task_id: task_id.to_string(),
                id,
            },
            rx,
        }
    }

    /// Detach an observer. Returns false if it was already gone.
    pub fn detach(&self, handle: &ObserverHandle) -> bool {
        let mut channels = self.channels.lock();
        let Some(subs) = channels.get_mut(&handle.task_id) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|s| s.id != handle.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            channels.remove(&handle.task_id);
        }

        if removed {
            log::debug!("Observer {} detached from {}", handle.id, handle.task_id);
        }
        removed
    }

    /// Deliver `line` to every observer of `task_id`; returns how many got it
    pub fn publish(&self, task_id: &str, line: &str) -> usize {
        let mut channels = self.channels.lock();
        let Some(subs) = channels.get_mut(task_id) else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|sub| match sub.tx.try_send(line.to_string()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Observer {} of {} is saturated, dropping line", sub.id, task_id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if subs.is_empty() {
            channels.remove(task_id);
        }
        delivered
    }

    /// Number of observers currently attached to `task_id`
    pub fn observer_count(&self, task_id: &str) -> usize {
        self.channels.lock().get(task_id).map_or(0, Vec::len)
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_CAPACITY)
    }
}
