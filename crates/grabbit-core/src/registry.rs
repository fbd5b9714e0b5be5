//! Task registry - the single source of truth for live task state
//!
//! Tasks, public aliases and cancellation tokens live in three maps behind one
//! mutex. Every read and write goes through that lock, so a snapshot never sees
//! a half-applied update and compound operations (rename, clear) are applied as
//! one unit via [`TaskRegistry::transaction`].
//!
//! Critical sections are short and never await; the lock is a `parking_lot`
//! mutex rather than an async one.

use crate::error::GrabbitError;
use chrono::Utc;
use grabbit_types::{DownloadStatus, DownloadTask};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Progress sample published by a worker after each block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: u64,
    pub eta: Option<u64>,
}

/// Thread-safe store of task state, aliases and cancellation tokens
#[derive(Debug, Default)]
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
}

/// The maps guarded by the registry lock
#[derive(Debug, Default)]
pub struct RegistryState {
    tasks: HashMap<String, DownloadTask>,
    /// task id -> public alias
    aliases: HashMap<String, String>,
    cancel_tokens: HashMap<String, CancellationToken>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to every map
    pub fn transaction<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Insert a new task; fails if a non-terminal task already owns the id
    pub fn create(
        &self,
        task: DownloadTask,
        cancel: CancellationToken,
    ) -> Result<DownloadTask, GrabbitError> {
        self.transaction(|state| {
            if state.is_active(&task.id) {
                return Err(GrabbitError::NameConflict(task.id.clone()));
            }
            Ok(state.insert(task, cancel))
        })
    }

    /// Pick a free id derived from `candidate` and insert the task it builds
    ///
    /// Name selection and insertion happen under one lock, so two concurrent
    /// requests for the same name always end up with distinct ids. Fails if
    /// the built task claims an alias that is already in use.
    pub fn create_unique(
        &self,
        candidate: &str,
        taken_elsewhere: impl Fn(&str) -> bool,
        build: impl FnOnce(String) -> DownloadTask,
        cancel: CancellationToken,
    ) -> Result<DownloadTask, GrabbitError> {
        self.transaction(|state| {
            let id = crate::filename::unique_name(candidate, |name| {
                state.tasks.contains_key(name) || taken_elsewhere(name)
            });
            let task = build(id);
            if let Some(alias) = task.alias.as_deref().filter(|a| state.alias_in_use(a)) {
                return Err(GrabbitError::NameConflict(alias.to_string()));
            }
            Ok(state.insert(task, cancel))
        })
    }

    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        self.state.lock().tasks.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().tasks.contains_key(id)
    }

    /// Consistent copy of every task, oldest first
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self.state.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Apply a forward status transition
    ///
    /// Returns the updated task, or `None` if the task is unknown or the
    /// transition is not allowed (terminal states are absorbing). Entering a
    /// terminal state stamps the completion time and drops the cancel token.
    pub fn transition(
        &self,
        id: &str,
        next: DownloadStatus,
        apply: impl FnOnce(&mut DownloadTask),
    ) -> Option<DownloadTask> {
        self.transaction(|state| state.transition(id, next, apply))
    }

    /// Publish one progress sample; only downloading tasks accept progress
    ///
    /// Byte counts and percentages never move backwards.
    pub fn publish_progress(&self, id: &str, update: ProgressUpdate) -> bool {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(id) else {
            return false;
        };
        if task.status != DownloadStatus::Downloading {
            return false;
        }

        task.downloaded = task.downloaded.max(update.downloaded);
        if update.total.is_some() {
            task.total_size = update.total;
        }
        if let Some(total) = task.total_size.filter(|t| *t > 0) {
            let percent = (task.downloaded as f64 / total as f64 * 100.0).min(100.0);
            task.progress = task.progress.max(percent);
        }
        task.speed = update.speed;
        task.eta = update.eta;
        true
    }

    /// Trigger the task's cancellation token
    ///
    /// Unknown and terminal tasks are ignored. Returns whether a signal was sent.
    pub fn cancel(&self, id: &str) -> bool {
        let state = self.state.lock();
        let active = state.is_active(id);
        match state.cancel_tokens.get(id) {
            Some(token) if active => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Remove a task with its alias and token, cancelling it if still running
    pub fn remove(&self, id: &str) -> Option<DownloadTask> {
        self.transaction(|state| state.remove(id))
    }

    /// Remove every terminal task, returning what was removed
    pub fn clear_finished(&self) -> Vec<DownloadTask> {
        self.transaction(RegistryState::clear_finished)
    }

    pub fn alias_of(&self, id: &str) -> Option<String> {
        self.state.lock().aliases.get(id).cloned()
    }

    /// Map a public alias back to its task id
    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        self.state
            .lock()
            .aliases
            .iter()
            .find(|(_, a)| a.as_str() == alias)
            .map(|(id, _)| id.clone())
    }
}

impl RegistryState {
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Present and not yet terminal
    pub fn is_active(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|t| !t.is_terminal())
    }

    pub fn alias_in_use(&self, alias: &str) -> bool {
        self.aliases.values().any(|a| a == alias)
    }

    /// Apply a forward status transition under an already held lock
    ///
    /// See [`TaskRegistry::transition`].
    pub fn transition(
        &mut self,
        id: &str,
        next: DownloadStatus,
        apply: impl FnOnce(&mut DownloadTask),
    ) -> Option<DownloadTask> {
        let task = self.tasks.get_mut(id)?;
        if !task.status.can_transition_to(next) {
            warn!(task = %id, from = %task.status, to = %next, "Rejected status transition");
            return None;
        }

        task.status = next;
        apply(task);

        if next.is_terminal() {
            task.completed_at = Some(Utc::now());
            task.eta = None;
            self.cancel_tokens.remove(id);
        }

        debug!(task = %id, status = %next, "Status changed");
        self.tasks.get(id).cloned()
    }

    /// Move a task and everything keyed by it from `from` to `to`
    pub fn rekey(&mut self, from: &str, to: &str) -> Option<DownloadTask> {
        if let Some(alias) = self.aliases.remove(from) {
            self.aliases.insert(to.to_string(), alias);
        }
        if let Some(token) = self.cancel_tokens.remove(from) {
            self.cancel_tokens.insert(to.to_string(), token);
        }

        let mut task = self.tasks.remove(from)?;
        task.id = to.to_string();
        if task.alias.is_none() {
            task.display_name = to.to_string();
        }
        self.tasks.insert(to.to_string(), task.clone());
        Some(task)
    }

    /// Move an alias whose task entry is already gone (stored file renamed after a clear)
    pub fn move_alias(&mut self, from: &str, to: &str) {
        if let Some(alias) = self.aliases.remove(from) {
            self.aliases.insert(to.to_string(), alias);
        }
    }

    /// Remove every terminal task; in-flight tasks are untouched
    pub fn clear_finished(&mut self) -> Vec<DownloadTask> {
        let finished: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        finished.iter().filter_map(|id| self.remove(id)).collect()
    }

    fn insert(&mut self, task: DownloadTask, cancel: CancellationToken) -> DownloadTask {
        let id = task.id.clone();
        if let Some(previous) = self.tasks.get(&id) {
            debug!(task = %id, status = %previous.status, "Replacing finished task");
        }
        match &task.alias {
            Some(alias) => {
                self.aliases.insert(id.clone(), alias.clone());
            }
            None => {
                self.aliases.remove(&id);
            }
        }
        self.cancel_tokens.insert(id.clone(), cancel);
        self.tasks.insert(id, task.clone());
        task
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<DownloadTask> {
        if let Some(token) = self.cancel_tokens.remove(id) {
            token.cancel();
        }
        self.aliases.remove(id);
        self.tasks.remove(id)
    }
}
