//! Lock-free ready queue
//!
//! The fast path is a bounded MPMC queue with a pre-allocated slot array;
//! a mutex-guarded spillover keeps correctness when a very wide graph
//! produces more simultaneously-ready nodes than the bound. Ordering
//! between the two is irrelevant: batch dispatch re-sorts by priority.

use crate::graph::TargetId;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default slot count for the fast path
pub const DEFAULT_CAPACITY: usize = 1024;

/// MPMC queue of ready-to-build target ids
pub struct ReadyQueue {
    fast: ArrayQueue<TargetId>,
    overflow: Mutex<VecDeque<TargetId>>,
}

impl ReadyQueue {
    /// Create a queue with the given fast-path bound
    pub fn new(capacity: usize) -> Self {
        Self {
            fast: ArrayQueue::new(capacity.max(1)),
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a ready node; never fails, never blocks producers on
    /// consumers
    pub fn push(&self, id: TargetId) {
        if let Err(id) = self.fast.push(id) {
            self.overflow.lock().push_back(id);
        }
    }

    /// Dequeue one ready node
    pub fn pop(&self) -> Option<TargetId> {
        if let Some(id) = self.fast.pop() {
            // Backfill the fast path from the spillover.
            let mut overflow = self.overflow.lock();
            while let Some(spilled) = overflow.pop_front() {
                if let Err(spilled) = self.fast.push(spilled) {
                    overflow.push_front(spilled);
                    break;
                }
            }
            return Some(id);
        }
        self.overflow.lock().pop_front()
    }

    /// Nodes currently queued across both paths
    pub fn len(&self) -> usize {
        self.fast.len() + self.overflow.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.overflow.lock().is_empty()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
