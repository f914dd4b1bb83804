//! A queue of "wake this task's device model at this cycle" entries,
//! keyed so each task has at most one due time.
use keyed_priority_queue::KeyedPriorityQueue;
use std::cmp::Reverse;

use base::Task;

#[derive(Debug)]
pub struct PollQueue {
    items: KeyedPriorityQueue<Task, Reverse<u64>>,
}

impl Default for PollQueue {
    fn default() -> PollQueue {
        PollQueue::new()
    }
}

impl PollQueue {
    pub fn new() -> PollQueue {
        PollQueue {
            items: KeyedPriorityQueue::new(),
        }
    }

    /// Earliest due entry, if any.
    pub fn peek(&self) -> Option<(Task, u64)> {
        self.items.peek().map(|(task, due)| (*task, due.0))
    }

    pub fn pop(&mut self) -> Option<(Task, u64)> {
        self.items.pop().map(|(task, due)| (task, due.0))
    }

    /// Schedules (or reschedules) a task's next device event.
    pub fn push(&mut self, task: Task, due_cycle: u64) {
        self.items.push(task, Reverse(due_cycle));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_due_order() {
        let mut q = PollQueue::new();
        q.push(Task::DiskSector, 300);
        q.push(Task::DisplayVertical, 100);
        q.push(Task::Ethernet, 200);
        assert_eq!(q.pop(), Some((Task::DisplayVertical, 100)));
        assert_eq!(q.pop(), Some((Task::Ethernet, 200)));
        assert_eq!(q.pop(), Some((Task::DiskSector, 300)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn pushing_again_reschedules() {
        let mut q = PollQueue::new();
        q.push(Task::DiskSector, 300);
        q.push(Task::DiskSector, 100);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some((Task::DiskSector, 100)));
    }
}
