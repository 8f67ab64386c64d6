//! Editing-conflict coordination.
//!
//! Per-task state machine keyed by task id: unclaimed (no entry) →
//! single-editor → contested (two or more editors). Edge-triggered on
//! entering or growing contention only; leaving contention is silent.
//! Every operation here is best-effort — unknown tasks and absent actors
//! are no-ops, never errors.

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory map from task id to the ordered set of actor ids currently
/// editing it. Entries exist only while at least one editor remains.
#[derive(Default)]
pub struct EditingSessions {
    // Vec keeps editor join order for the conflict payload; sets stay tiny.
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl EditingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an actor editing a task. Idempotent — re-adding a present
    /// actor changes nothing and raises nothing.
    ///
    /// Returns the full editor set when this call moved the task into (or
    /// grew) contention, i.e. the set now has two or more members and this
    /// actor is newly added. That is the `editingConflict` signal payload.
    pub fn start_editing(&self, task_id: &str, actor_id: &str) -> Option<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let editors = inner.entry(task_id.to_string()).or_default();
        if editors.iter().any(|e| e == actor_id) {
            return None;
        }
        editors.push(actor_id.to_string());
        if editors.len() >= 2 {
            Some(editors.clone())
        } else {
            None
        }
    }

    /// Withdraw an actor from a task's editor set. The last editor leaving
    /// removes the entry entirely. Never signals — the coordinator is
    /// edge-triggered on entering contention, not on exiting it.
    pub fn stop_editing(&self, task_id: &str, actor_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(editors) = inner.get_mut(task_id) {
            editors.retain(|e| e != actor_id);
            if editors.is_empty() {
                inner.remove(task_id);
            }
        }
    }

    /// Disconnect cleanup: remove the actor from every task's editor set,
    /// dropping entries that become empty. Raises no signals for the
    /// editors that remain.
    pub fn remove_actor(&self, actor_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, editors| {
            editors.retain(|e| e != actor_id);
            !editors.is_empty()
        });
    }

    /// Current editor set for a task (empty when unclaimed).
    pub fn editors(&self, task_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of tasks with at least one editor.
    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
