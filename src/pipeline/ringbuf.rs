//! Bounded per-branch queue with drop-oldest semantics

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::trace;

/// What a consumer gets back from [`BranchQueue::pop_timeout`].
#[derive(Debug)]
pub enum Pop<T> {
    Item(T),
    /// End of stream, delivered once after the queue drained
    Eos,
    /// The queue was closed; no further items will arrive
    Closed,
    Timeout,
}

/// Queue feeding one fan-out branch. The producer never blocks: pushing into
/// a full queue evicts the oldest unconsumed item.
pub struct BranchQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    ready: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct QueueState<T> {
    ring: HeapRb<T>,
    eos: bool,
    eos_delivered: bool,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
    dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl<T> BranchQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                ring: HeapRb::new(capacity.max(1)),
                eos: false,
                eos_delivered: false,
                closed: false,
            }),
            ready: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Producer: enqueue `item`, dropping the oldest one if full. Returns
    /// false if the stream already ended and the item was discarded.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.lock();
            if state.eos || state.closed {
                return false;
            }
            state.ring.push_overwrite(item)
        };
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("vrcast_frames_dropped", "branch" => self.name.clone()).increment(1);
            trace!(branch = %self.name, "queue full, dropped oldest");
        }
        // evicted item is released outside the lock
        drop(evicted);
        self.ready.notify_one();
        true
    }

    /// Marks the end of stream. Returns true the first time only.
    pub fn end_of_stream(&self) -> bool {
        let first = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.eos, true)
        };
        self.ready.notify_all();
        first
    }

    /// Consumer: wait up to `timeout` for the next item.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.ring.try_pop() {
                self.stats.read.fetch_add(1, Ordering::Relaxed);
                return Pop::Item(item);
            }
            if state.eos && !state.eos_delivered {
                state.eos_delivered = true;
                return Pop::Eos;
            }
            if state.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Timeout;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Pop<T> {
        self.pop_timeout(Duration::ZERO)
    }

    /// Drops every queued item and re-arms end of stream. Returns how many
    /// items were discarded.
    pub fn flush(&self) -> usize {
        let drained: Vec<T> = {
            let mut state = self.lock();
            state.eos = false;
            state.eos_delivered = false;
            std::iter::from_fn(|| state.ring.try_pop()).collect()
        };
        drained.len()
    }

    /// Wakes the consumer for good; pending items are still delivered first.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity().get()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.written.load(Ordering::Relaxed),
            read: self.stats.read.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
