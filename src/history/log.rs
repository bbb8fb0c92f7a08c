//! Capacity-bounded, newest-first log

use std::collections::VecDeque;

/// Insertion-ordered log capped at `capacity`.
///
/// New entries go to the head; once full, the oldest-inserted entry is
/// evicted. Eviction is by insertion order, never by timestamp.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Insert at the head, returning the evicted entry if any
    pub fn push(&mut self, entry: T) -> Option<T> {
        self.entries.push_front(entry);
        if self.entries.len() > self.capacity {
            self.evicted += 1;
            self.entries.pop_back()
        } else {
            None
        }
    }

    /// Newest-first iteration
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut()
    }

    pub fn newest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Replace the contents with `entries` given newest first, keeping at
    /// most `capacity` of the newest.
    pub fn replace(&mut self, entries: Vec<T>) {
        self.entries = entries.into_iter().take(self.capacity).collect();
    }
}

impl<T: Clone> BoundedLog<T> {
    /// Newest-first copy of the contents
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_never_exceeded() {
        let mut log = BoundedLog::new(5);
        for i in 0..50 {
            log.push(i);
            assert!(log.len() <= 5);
        }
        assert_eq!(log.evicted(), 45);
    }

    #[test]
    fn test_oldest_inserted_evicted_first() {
        let mut log = BoundedLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.to_vec(), vec![4, 3, 2]);
        assert_eq!(log.newest(), Some(&4));
    }

    #[test]
    fn test_push_returns_evicted() {
        let mut log = BoundedLog::new(2);
        assert_eq!(log.push("a"), None);
        assert_eq!(log.push("b"), None);
        assert_eq!(log.push("c"), Some("a"));
    }

    #[test]
    fn test_replace_truncates_to_newest() {
        let mut log = BoundedLog::new(2);
        log.replace(vec![9, 8, 7]);
        assert_eq!(log.to_vec(), vec![9, 8]);
    }
}
