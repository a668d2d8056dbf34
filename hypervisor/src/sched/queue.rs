// =============================================================================
// raspvisor - Ready Queue
// =============================================================================
// Bounded FIFO of task handles. Fixed storage so it can sit in a static and
// be used from the trap path without touching the heap.
// =============================================================================

use crate::config::MAX_TASKS;
use crate::task::TaskId;

/// Queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

pub struct ReadyQueue {
    slots: [Option<TaskId>; MAX_TASKS],
    head: usize,
    len: usize,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_TASKS],
            head: 0,
            len: 0,
        }
    }

    /// Append at the tail.
    pub fn push(&mut self, id: TaskId) -> Result<(), QueueFull> {
        if self.len == MAX_TASKS {
            return Err(QueueFull);
        }
        let tail = (self.head + self.len) % MAX_TASKS;
        self.slots[tail] = Some(id);
        self.len += 1;
        Ok(())
    }

    /// Remove from the head.
    pub fn pop(&mut self) -> Option<TaskId> {
        if self.len == 0 {
            return None;
        }
        let id = self.slots[self.head].take();
        self.head = (self.head + 1) % MAX_TASKS;
        self.len -= 1;
        id
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.iter().any(|queued| queued == id)
    }

    /// Number of times `id` is queued.
    pub fn count(&self, id: TaskId) -> usize {
        self.iter().filter(|&queued| queued == id).count()
    }

    /// Head to tail.
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % MAX_TASKS])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> TaskId {
        TaskId::from_raw(raw)
    }

    #[test]
    fn fifo_order_across_wraparound() {
        let mut q = ReadyQueue::new();
        for round in 0..3u64 {
            for i in 0..MAX_TASKS as u64 {
                q.push(id(round * 100 + i)).unwrap();
            }
            assert_eq!(q.push(id(999)), Err(QueueFull));
            // Leave one behind so head moves off zero
            for i in 0..MAX_TASKS as u64 - 1 {
                assert_eq!(q.pop(), Some(id(round * 100 + i)));
            }
            assert_eq!(q.pop(), Some(id(round * 100 + MAX_TASKS as u64 - 1)));
            assert!(q.is_empty());
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn iter_runs_head_to_tail() {
        let mut q = ReadyQueue::new();
        q.push(id(1)).unwrap();
        q.push(id(2)).unwrap();
        q.pop();
        q.push(id(3)).unwrap();

        let order: Vec<_> = q.iter().collect();
        assert_eq!(order, vec![id(2), id(3)]);
        assert!(q.contains(id(3)));
        assert!(!q.contains(id(1)));
        assert_eq!(q.count(id(2)), 1);
    }
}
