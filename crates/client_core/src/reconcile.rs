use shared::{
    domain::{CommentId, MessageId},
    protocol::{CommentPayload, PrivateMessagePayload},
};

/// An entry with a stable identity. Pending entries are local placeholders
/// that have not been confirmed by the server yet.
pub trait Keyed {
    type Key: Ord + Copy;

    fn key(&self) -> Self::Key;

    fn is_pending(&self) -> bool {
        false
    }
}

impl Keyed for CommentPayload {
    type Key = CommentId;

    fn key(&self) -> CommentId {
        self.comment_id
    }
}

impl Keyed for PrivateMessagePayload {
    type Key = MessageId;

    fn key(&self) -> MessageId {
        self.message_id
    }

    fn is_pending(&self) -> bool {
        self.message_id.is_sentinel()
    }
}

/// Id-deduplicated list: confirmed entries sorted by server id, followed by
/// pending entries in the order they were added.
#[derive(Debug, Clone)]
pub struct Timeline<T> {
    entries: Vec<T>,
}

impl<T> Default for Timeline<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Keyed> Timeline<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_confirmed(entries: impl IntoIterator<Item = T>) -> Self {
        let mut timeline = Self::new();
        for entry in entries {
            timeline.insert(entry);
        }
        timeline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn contains(&self, key: T::Key) -> bool {
        self.entries.iter().any(|entry| entry.key() == key)
    }

    pub fn last_confirmed_key(&self) -> Option<T::Key> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_pending())
            .map(Keyed::key)
            .max()
    }

    /// Adds the entry unless one with the same key is present. Returns whether
    /// the timeline changed.
    pub fn insert(&mut self, entry: T) -> bool {
        if self.contains(entry.key()) {
            return false;
        }
        if entry.is_pending() {
            self.entries.push(entry);
            return true;
        }
        let key = entry.key();
        let position = self
            .entries
            .iter()
            .position(|existing| existing.is_pending() || existing.key() > key)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
        true
    }

    /// Swaps a pending entry for its confirmed counterpart. If the confirmed
    /// entry already arrived some other way the placeholder simply goes away.
    pub fn confirm(&mut self, pending: T::Key, confirmed: T) {
        self.remove(pending);
        self.insert(confirmed);
    }

    pub fn remove(&mut self, key: T::Key) -> Option<T> {
        let index = self.entries.iter().position(|entry| entry.key() == key)?;
        Some(self.entries.remove(index))
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.entries.retain(keep);
    }

    /// Replaces every confirmed entry with `confirmed` and keeps pending ones.
    pub fn replace_confirmed(&mut self, confirmed: impl IntoIterator<Item = T>) {
        self.entries.retain(Keyed::is_pending);
        for entry in confirmed {
            self.insert(entry);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> Timeline<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.clone()
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
