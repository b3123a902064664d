//! Draft overrides - unsaved task edits used by manual trial runs
//!
//! Drafts live only in memory. A draft stays until the next `set_draft` for
//! the same id replaces it, or until the task is committed or deleted.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unsaved (body, schedule, enabled) tuple for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub source_body: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// In-memory draft table keyed by task id
#[derive(Debug, Default)]
pub struct DraftStore {
    drafts: RwLock<HashMap<String, Draft>>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the draft for `id` (last write wins)
    pub fn set_draft(&self, id: &str, body: &str, schedule: Option<&str>, enabled: Option<bool>) {
        let draft = Draft {
            source_body: body.to_string(),
            schedule: schedule.map(str::to_string),
            enabled,
        };
        self.drafts.write().insert(id.to_string(), draft);
        log::debug!("Saved draft for {}", id);
    }

    pub fn get_draft(&self, id: &str) -> Option<Draft> {
        self.drafts.read().get(id).cloned()
    }

    /// Evict the draft for `id`, returning it if present
    pub fn clear(&self, id: &str) -> Option<Draft> {
        self.drafts.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.drafts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let drafts = DraftStore::new();
        assert!(drafts.get_draft("a.js").is_none());

        drafts.set_draft("a.js", "v1", Some("* * * * *"), Some(true));
        drafts.set_draft("a.js", "v2", None, None);

        let draft = drafts.get_draft("a.js").unwrap();
        assert_eq!(draft.source_body, "v2");
        assert_eq!(draft.schedule, None);
        assert_eq!(drafts.len(), 1);
    }

    #[test]
    fn test_draft_is_retained_after_read() {
        let drafts = DraftStore::new();
        drafts.set_draft("a.js", "trial", None, None);
        assert!(drafts.get_draft("a.js").is_some());
        assert!(drafts.get_draft("a.js").is_some());

        assert_eq!(drafts.clear("a.js").map(|d| d.source_body).as_deref(), Some("trial"));
        assert!(drafts.is_empty());
    }
}
