//! Append-only log of terminal outcomes, most recent first

use grabbit_types::HistoryEntry;
use parking_lot::RwLock;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: RwLock<VecDeque<HistoryEntry>>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: HistoryEntry) {
        tracing::debug!(task = %entry.id, status = %entry.status, "History entry recorded");
        self.entries.write().push_front(entry);
    }

    /// Consistent copy, newest entry first
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Bulk removal; individual entries are never edited or dropped
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }
}
