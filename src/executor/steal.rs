//! Work-stealing scheduler
//!
//! One lock-free deque per worker plus a shared injector. An idle worker
//! drains its own deque, then the injector, then steals from the victim
//! with the highest advertised critical-path cost, breaking ties by queue
//! depth. The per-deque cost advertisement is advisory: it tracks the best
//! priority pushed since the deque last ran dry, which is cheap to maintain
//! and close enough for victim ranking.

use crossbeam::deque::{Injector, Steal, Stealer, Worker as Deque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared<T> {
    injector: Injector<T>,
    stealers: Vec<Stealer<T>>,
    depths: Vec<AtomicUsize>,
    peaks: Vec<AtomicU64>,
}

/// The worker-local handle onto the stealing scheduler
pub struct WorkerQueue<T> {
    index: usize,
    local: Deque<T>,
    shared: Arc<Shared<T>>,
}

/// The shared injection side of the stealing scheduler
pub struct StealScheduler<T> {
    shared: Arc<Shared<T>>,
}

/// Build a scheduler for `workers` threads
pub fn steal_scheduler<T>(workers: usize) -> (StealScheduler<T>, Vec<WorkerQueue<T>>) {
    let locals: Vec<Deque<T>> = (0..workers).map(|_| Deque::new_fifo()).collect();
    let shared = Arc::new(Shared {
        injector: Injector::new(),
        stealers: locals.iter().map(Deque::stealer).collect(),
        depths: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        peaks: (0..workers).map(|_| AtomicU64::new(0)).collect(),
    });

    let queues = locals
        .into_iter()
        .enumerate()
        .map(|(index, local)| WorkerQueue {
            index,
            local,
            shared: shared.clone(),
        })
        .collect();

    (StealScheduler { shared }, queues)
}

impl<T> StealScheduler<T> {
    /// Hand a task to whichever worker picks it up first
    pub fn inject(&self, task: T) {
        self.shared.injector.push(task);
    }

    /// Tasks waiting in the injector (excludes worker-local deques)
    pub fn backlog(&self) -> usize {
        self.shared.injector.len()
    }
}

impl<T> WorkerQueue<T> {
    /// Push onto this worker's own deque, advertising its priority
    pub fn push(&self, task: T, priority: f64) {
        let shared = &self.shared;
        shared.depths[self.index].fetch_add(1, Ordering::SeqCst);
        let bits = priority.to_bits();
        shared.peaks[self.index].fetch_max(bits, Ordering::SeqCst);
        self.local.push(task);
    }

    /// Take the next task: local deque, injector, then stealing
    pub fn next(&self) -> Option<T> {
        if let Some(task) = self.local.pop() {
            self.note_pop();
            return Some(task);
        }
        self.shared.peaks[self.index].store(0, Ordering::SeqCst);

        loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }

        self.steal_from_victim()
    }

    fn note_pop(&self) {
        let depths = &self.shared.depths[self.index];
        let _ = depths.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }

    /// Victims ranked by advertised critical-path cost, then depth
    fn steal_from_victim(&self) -> Option<T> {
        let shared = &self.shared;
        let mut victims: Vec<usize> = (0..shared.stealers.len())
            .filter(|&i| i != self.index)
            .collect();
        victims.sort_by(|&a, &b| {
            let peak_a = f64::from_bits(shared.peaks[a].load(Ordering::SeqCst));
            let peak_b = f64::from_bits(shared.peaks[b].load(Ordering::SeqCst));
            peak_b
                .partial_cmp(&peak_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    shared.depths[b]
                        .load(Ordering::SeqCst)
                        .cmp(&shared.depths[a].load(Ordering::SeqCst))
                })
        });

        for victim in victims {
            loop {
                match shared.stealers[victim].steal() {
                    Steal::Success(task) => {
                        let _ = shared.depths[victim].fetch_update(
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            |d| d.checked_sub(1),
                        );
                        return Some(task);
                    }
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }
}
