use std::collections::HashSet;

use crate::model::SlotKey;

/// Slots already claimed in the current run. Lives for one run only and is
/// never persisted.
#[derive(Debug, Default)]
pub struct SessionTracker {
    slots: HashSet<SlotKey>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn contains(&self, slot: &SlotKey) -> bool {
        self.slots.contains(slot)
    }

    /// Returns `false` if the slot was already claimed.
    pub fn insert(&mut self, slot: SlotKey) -> bool {
        self.slots.insert(slot)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
