// sched/edf.rs - deadline-ordered queue with stable keys for eviction

use std::collections::BTreeMap;
use std::time::Instant;

/// Position of an entry: deadline first, insertion order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub deadline: Instant,
    order: u64,
}

/// Earliest-deadline-first queue whose entries can be removed from anywhere.
#[derive(Debug)]
pub struct DeadlineQueue<T> {
    entries: BTreeMap<QueueKey, T>,
    counter: u64,
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            counter: 0,
        }
    }
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts behind every entry with the same deadline.
    pub fn push(&mut self, deadline: Instant, payload: T) -> QueueKey {
        let key = QueueKey {
            deadline,
            order: self.counter,
        };
        self.counter = self.counter.wrapping_add(1);
        self.entries.insert(key, payload);
        key
    }

    pub fn remove(&mut self, key: &QueueKey) -> Option<T> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QueueKey, &T)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&QueueKey, &mut T)> {
        self.entries.iter_mut()
    }

    /// Removes every entry matching `pred`, returned in deadline order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&QueueKey, &T) -> bool,
    {
        let keys: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(key, value)| pred(key, value))
            .map(|(key, _)| *key)
            .collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    /// Removes and returns every entry, earliest deadline first.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|key| key.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
