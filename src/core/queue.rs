use crate::models::ids::ModId;
use crate::models::work::WorkItem;
use std::collections::VecDeque;
use std::time::Instant;

/// Pending mod work, at most one item per mod.
#[derive(Debug, Default)]
pub struct PendingWorkQueue {
    items: VecDeque<WorkItem>,
}

impl PendingWorkQueue {
    /// Appends unless the mod is already queued. Returns whether the item was added.
    pub fn push_back(&mut self, item: WorkItem) -> bool {
        if self.contains(item.mod_id) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Puts the item at the front, replacing any queued item for the same mod.
    pub fn push_front(&mut self, item: WorkItem) {
        self.remove(item.mod_id);
        self.items.push_front(item);
    }

    /// Moves a queued mod to the front and makes it runnable immediately.
    pub fn prioritize(&mut self, id: ModId) -> bool {
        match self.remove(id) {
            Some(mut item) => {
                item.retry_after = None;
                self.items.push_front(item);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ModId) -> bool {
        self.items.iter().any(|item| item.mod_id == id)
    }

    pub fn get(&self, id: ModId) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.mod_id == id)
    }

    pub fn remove(&mut self, id: ModId) -> Option<WorkItem> {
        let index = self.items.iter().position(|item| item.mod_id == id)?;
        self.items.remove(index)
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&WorkItem) -> bool,
    {
        self.items.retain(keep);
    }

    /// Takes the first item that is not waiting for a retry delay.
    pub fn pop_ready(&mut self, now: Instant) -> Option<WorkItem> {
        let index = self.items.iter().position(|item| item.is_ready(now))?;
        self.items.remove(index)
    }

    /// Earliest moment a delayed item becomes runnable.
    pub fn next_retry(&self) -> Option<Instant> {
        self.items.iter().filter_map(|item| item.retry_after).min()
    }

    pub fn ids(&self) -> Vec<ModId> {
        self.items.iter().map(|item| item.mod_id).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
