//! Fan-out of one stream into independently paced branches

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::pipeline::ringbuf::BranchQueue;

/// One producer writing into N bounded queues. Items are cheap handles, so
/// every branch receives a clone that shares the same storage.
pub struct Tee<T> {
    branches: Vec<Arc<BranchQueue<T>>>,
    eos_sent: AtomicBool,
}

impl<T: Clone> Tee<T> {
    pub fn new(branches: Vec<Arc<BranchQueue<T>>>) -> Self {
        Self {
            branches,
            eos_sent: AtomicBool::new(false),
        }
    }

    pub fn branches(&self) -> &[Arc<BranchQueue<T>>] {
        &self.branches
    }

    /// Hands `item` to every branch without blocking. Returns how many
    /// branches accepted it.
    pub fn push(&self, item: T) -> usize {
        let Some((last, rest)) = self.branches.split_last() else {
            return 0;
        };
        let mut accepted = rest.iter().filter(|q| q.push(item.clone())).count();
        if last.push(item) {
            accepted += 1;
        }
        accepted
    }

    /// Propagates end of stream to all branches. Only the first call has an
    /// effect until the tee is flushed.
    pub fn end_of_stream(&self) -> bool {
        if self.eos_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        for branch in &self.branches {
            branch.end_of_stream();
        }
        debug!(branches = self.branches.len(), "end of stream propagated");
        true
    }

    /// Discards every queued item in every branch. Returns the total dropped.
    pub fn flush(&self) -> usize {
        self.eos_sent.store(false, Ordering::Release);
        self.branches.iter().map(|q| q.flush()).sum()
    }

    pub fn close(&self) {
        for branch in &self.branches {
            branch.close();
        }
    }
}
