//! Session history for a page.
//!
//! Entries whose content failed to load are marked invalid and skipped by
//! back/forward traversal.

use std::time::Instant;
use url::Url;

/// Navigation type indicating how a navigation occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NavigationType {
    /// Link click, `NAVIGATE_TO` or programmatic navigation.
    #[default]
    Navigate,
    /// Re-render after the worker was replaced.
    Reload,
    /// Back/forward navigation.
    Traverse,
}

/// A history entry representing a point in the session history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Unique ID for this entry.
    pub id: u64,

    /// The URL of this entry.
    pub url: Url,

    /// Set when the entry's content could not be loaded.
    pub invalid: bool,

    /// Timestamp when this entry was created.
    pub created_at: Instant,
}

impl HistoryEntry {
    /// Create a new history entry.
    pub fn new(url: Url) -> Self {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        Self {
            id: COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            url,
            invalid: false,
            created_at: Instant::now(),
        }
    }
}

/// The session history for a page.
#[derive(Debug, Default)]
pub struct SessionHistory {
    entries: Vec<HistoryEntry>,
    current_index: usize,
}

impl SessionHistory {
    /// Create a new session history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of entries.
    pub fn length(&self) -> usize {
        self.entries.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Get the current entry.
    pub fn current_entry(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.current_index)
    }

    /// Get the current URL.
    pub fn current_url(&self) -> Option<&Url> {
        self.current_entry().map(|e| &e.url)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Push a new entry, truncating forward history. Returns its id.
    pub fn push(&mut self, url: Url) -> u64 {
        if self.current_index + 1 < self.entries.len() {
            self.entries.truncate(self.current_index + 1);
        }

        let entry = HistoryEntry::new(url);
        let id = entry.id;
        self.entries.push(entry);
        self.current_index = self.entries.len() - 1;
        id
    }

    /// Flag an entry as unloadable.
    pub fn mark_invalid(&mut self, id: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.invalid = true;
                true
            }
            None => false,
        }
    }

    /// Check if can go back.
    pub fn can_go_back(&self) -> bool {
        self.target_index(-1).is_some()
    }

    /// Check if can go forward.
    pub fn can_go_forward(&self) -> bool {
        self.target_index(1).is_some()
    }

    /// Go back one entry.
    pub fn back(&mut self) -> Option<&HistoryEntry> {
        self.go(-1)
    }

    /// Go forward one entry.
    pub fn forward(&mut self) -> Option<&HistoryEntry> {
        self.go(1)
    }

    /// Go by delta valid entries (negative = back, positive = forward).
    pub fn go(&mut self, delta: i32) -> Option<&HistoryEntry> {
        let index = self.target_index(delta)?;
        self.current_index = index;
        self.current_entry()
    }

    fn target_index(&self, delta: i32) -> Option<usize> {
        if delta == 0 {
            return self.current_entry().map(|_| self.current_index);
        }

        let step: isize = if delta > 0 { 1 } else { -1 };
        let mut remaining = delta.unsigned_abs();
        let mut index = self.current_index as isize;

        while remaining > 0 {
            index += step;
            let entry = self.entries.get(usize::try_from(index).ok()?)?;
            if !entry.invalid {
                remaining -= 1;
            }
        }
        usize::try_from(index).ok()
    }
}
