//! Bounded blocking frame queues

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::debug;

use crate::capture::SharedFrame;
use crate::error::{Error, Result};
use crate::stats::SharedStats;

/// Outcome of a blocking pop or peek.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Delivery<T> {
    Delivered(T),
    TimedOut,
}

impl<T> Delivery<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Delivered(item) => Some(item),
            Self::TimedOut => None,
        }
    }

    pub fn into_result(self) -> Result<T> {
        self.into_option().ok_or(Error::Timeout)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Anything a capture loop can push frames into.
pub trait FrameSink: Send + Sync {
    fn push(&self, frame: SharedFrame);
}

/// Anything a recorder can pop frames from.
pub trait FrameSource: Send + Sync {
    fn pop(&self, timeout: Option<Duration>) -> Delivery<SharedFrame>;
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    popped: AtomicU64,
    peeked: AtomicU64,
    evicted: AtomicU64,
}

/// Snapshot of a queue's lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounters {
    pub pushed: u64,
    pub popped: u64,
    pub peeked: u64,
    pub evicted: u64,
}

struct QueueKeys {
    push: String,
    pop: String,
    peek: String,
    evicted: String,
    depth: String,
}

/// Fixed-capacity FIFO shared between threads.
///
/// Producers never block: pushing into a full queue evicts the oldest item.
/// Consumers block in [`pop`](Self::pop) or [`peek`](Self::peek) until an
/// item arrives or the timeout elapses. Peeking never changes queue state.
pub struct BoundedQueue<T> {
    name: String,
    ring: Mutex<HeapRb<T>>,
    /// One waiter per push; each pop removes a distinct item
    poppers: Condvar,
    /// Every peeker can proceed on the same item
    peekers: Condvar,
    counters: CachePadded<Counters>,
    stats: SharedStats,
    keys: QueueKeys,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize, stats: SharedStats) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(Error::Config(format!(
                "queue '{name}' needs a capacity of at least 1"
            )));
        }
        let keys = QueueKeys {
            push: format!("queue.{name}.push"),
            pop: format!("queue.{name}.pop"),
            peek: format!("queue.{name}.peek"),
            evicted: format!("queue.{name}.evicted"),
            depth: format!("queue.{name}.depth"),
        };
        Ok(Self {
            name,
            ring: Mutex::new(HeapRb::new(capacity)),
            poppers: Condvar::new(),
            peekers: Condvar::new(),
            counters: CachePadded::new(Counters::default()),
            stats,
            keys,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity().get()
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an item, evicting the oldest one when full. Returns whether an eviction happened.
    pub fn push(&self, item: T) -> bool {
        let (evicted, depth) = {
            let mut ring = self.lock();
            let evicted = ring.push_overwrite(item).is_some();
            (evicted, ring.occupied_len())
        };
        if evicted {
            debug!(queue = %self.name, "queue full, dropped oldest item");
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            self.stats.incr(&self.keys.evicted, 1);
        }
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        self.stats.incr(&self.keys.push, 1);
        self.stats.gauge(&self.keys.depth, depth as f64);

        self.poppers.notify_one();
        self.peekers.notify_all();
        evicted
    }

    /// Remove and return the oldest item, waiting up to `timeout` (forever if `None`).
    pub fn pop(&self, timeout: Option<Duration>) -> Delivery<T> {
        let mut ring = self.wait_for_item(&self.poppers, timeout);
        let Some(item) = ring.try_pop() else {
            return Delivery::TimedOut;
        };
        let depth = ring.occupied_len();
        let more = depth > 0;
        drop(ring);

        // Pass the wakeup on if another popper can be served
        if more {
            self.poppers.notify_one();
        }
        self.counters.popped.fetch_add(1, Ordering::Relaxed);
        self.stats.incr(&self.keys.pop, 1);
        self.stats.gauge(&self.keys.depth, depth as f64);
        Delivery::Delivered(item)
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            popped: self.counters.popped.load(Ordering::Relaxed),
            peeked: self.counters.peeked.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_item(&self, condvar: &Condvar, timeout: Option<Duration>) -> MutexGuard<'_, HeapRb<T>> {
        let ring = self.lock();
        match timeout {
            Some(timeout) => {
                condvar
                    .wait_timeout_while(ring, timeout, |ring| ring.is_empty())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => condvar
                .wait_while(ring, |ring| ring.is_empty())
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Return the oldest item without removing it, waiting up to `timeout`.
    pub fn peek(&self, timeout: Option<Duration>) -> Delivery<T> {
        let ring = self.wait_for_item(&self.peekers, timeout);
        let Some(item) = ring.try_peek().cloned() else {
            return Delivery::TimedOut;
        };
        drop(ring);

        self.counters.peeked.fetch_add(1, Ordering::Relaxed);
        self.stats.incr(&self.keys.peek, 1);
        Delivery::Delivered(item)
    }
}

impl FrameSink for BoundedQueue<SharedFrame> {
    fn push(&self, frame: SharedFrame) {
        BoundedQueue::push(self, frame);
    }
}

impl FrameSource for BoundedQueue<SharedFrame> {
    fn pop(&self, timeout: Option<Duration>) -> Delivery<SharedFrame> {
        BoundedQueue::pop(self, timeout)
    }
}

/// Broadcasts every pushed item to each target queue, in order.
///
/// Targets are independent: a full target evicts its own oldest item and
/// never holds up the others.
pub struct QueueFan<T> {
    targets: Vec<Arc<BoundedQueue<T>>>,
}

impl<T: Clone> QueueFan<T> {
    pub fn new(targets: Vec<Arc<BoundedQueue<T>>>) -> Self {
        Self { targets }
    }

    pub fn push(&self, item: T) {
        for target in &self.targets {
            target.push(item.clone());
        }
    }

    pub fn targets(&self) -> &[Arc<BoundedQueue<T>>] {
        &self.targets
    }
}

impl FrameSink for QueueFan<SharedFrame> {
    fn push(&self, frame: SharedFrame) {
        QueueFan::push(self, frame);
    }
}
